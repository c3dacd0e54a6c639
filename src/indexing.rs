//! Raw-index projection.
//!
//! [`IndexingProjector`] listens to record events and keeps one document
//! per record in the raw index of its harvest model:
//!
//! ```text
//! PUT {raw_index}/_doc/{identifier}   { "raw_data": … }
//! ```
//!
//! A save is projected when the record was just created, when `raw_data`
//! differs from the pre-save snapshot, or when the caller declared
//! `raw_data` as changed. Records with empty `raw_data` are never indexed.
//! A delete removes the raw document and the curated document written by
//! the model's active transformation script.
//!
//! Projection failures set `index_status = failed` and append a `raw_data`
//! error log to the record's current attempt; the harvest status of the
//! record is left alone.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

use crate::config::IndicesConfig;
use crate::error::HarvestError;
use crate::error_context::error_entry;
use crate::events::{RecordEvent, RecordListener, SavedRecord};
use crate::models::{HarvestedRecord, RecordSource, Status};
use crate::search_backend::SearchBackend;
use crate::store::RecordStore;

/// Counts of a bulk projection run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexSummary {
    pub attempted: u64,
    pub indexed: u64,
    pub failed: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexAction {
    Created,
    Recreated,
    AlreadyExists,
}

/// Settings every raw index is created with.
pub fn raw_index_settings() -> Value {
    json!({ "number_of_shards": 1, "number_of_replicas": 0 })
}

/// `raw_data` is stored but not indexed field by field.
pub fn raw_index_mappings() -> Value {
    json!({
        "properties": {
            "raw_data": { "type": "object", "enabled": false }
        }
    })
}

pub struct IndexingProjector {
    backend: Arc<dyn SearchBackend>,
    indices: IndicesConfig,
}

impl IndexingProjector {
    pub fn new(backend: Arc<dyn SearchBackend>, indices: IndicesConfig) -> Self {
        Self { backend, indices }
    }

    fn raw_index_for(&self, record: &HarvestedRecord) -> Option<&str> {
        record
            .harvest_model()
            .map(|model| self.indices.raw_index_for(model))
    }

    fn should_project(saved: &SavedRecord) -> bool {
        if !saved.record.has_raw_data() {
            if saved.created {
                tracing::debug!(
                    identifier = %saved.record.identifier,
                    "record created without raw_data; not indexed"
                );
            }
            return false;
        }
        saved.created || saved.raw_data_changed() || saved.declares("raw_data")
    }

    /// Writes `record` into its raw index and updates its index bookkeeping.
    ///
    /// Returns whether the document was indexed. On success an `Indexed`
    /// event is published.
    pub async fn project(&self, store: &RecordStore, record: &mut HarvestedRecord) -> Result<bool> {
        let index = match self.raw_index_for(record) {
            Some(index) => index.to_string(),
            None => {
                tracing::warn!(
                    identifier = %record.identifier,
                    source = %record.source,
                    "record has no harvest model; not indexed"
                );
                return Ok(false);
            }
        };
        if !record.has_raw_data() {
            return Ok(false);
        }

        let body = json!({ "raw_data": record.raw_data });
        match self
            .backend
            .index(&index, &record.identifier, &body, false)
            .await
        {
            Ok(()) => {
                store.mark_indexed(record, &index).await?;
                tracing::debug!(identifier = %record.identifier, index = %index, "indexed");
                store
                    .events()
                    .publish(
                        store,
                        RecordEvent::Indexed {
                            record: record.clone(),
                            index_name: index,
                        },
                    )
                    .await;
                Ok(true)
            }
            Err(e) => {
                tracing::error!(
                    identifier = %record.identifier,
                    index = %index,
                    field = "raw_data",
                    error = %format!("{:#}", e),
                    "indexing failed"
                );
                let error = anyhow::Error::new(HarvestError::Projection {
                    index: index.clone(),
                    id: record.identifier.clone(),
                    message: format!("{:#}", e),
                });
                let entry = error_entry(
                    &error,
                    "raw_data",
                    json!({ "identifier": record.identifier, "index": index }),
                );
                store
                    .append_error_logs(&record.id, record.harvest_attempt, &[entry])
                    .await?;
                store.mark_index_failed(record).await?;
                Ok(false)
            }
        }
    }

    /// Removes the raw document and the active script's curated document.
    pub async fn remove(&self, store: &RecordStore, record: &HarvestedRecord) -> Result<()> {
        let model = match record.harvest_model() {
            Some(model) => model,
            None => return Ok(()),
        };

        let raw_index = self.indices.raw_index_for(model);
        let removed = self.backend.delete(raw_index, &record.identifier).await?;
        tracing::debug!(identifier = %record.identifier, index = raw_index, removed, "raw document deleted");

        if let Some(script) = store.active_script(model).await? {
            let removed = self
                .backend
                .delete(&script.dest_index, &record.identifier)
                .await?;
            tracing::debug!(
                identifier = %record.identifier,
                index = %script.dest_index,
                removed,
                "curated document deleted"
            );
        }
        Ok(())
    }

    async fn project_all(
        &self,
        store: &RecordStore,
        records: Vec<HarvestedRecord>,
    ) -> Result<IndexSummary> {
        let mut summary = IndexSummary::default();
        for mut record in records {
            if !record.has_raw_data() {
                summary.skipped += 1;
                continue;
            }
            summary.attempted += 1;
            store.mark_index_in_progress(&mut record).await?;
            if self.project(store, &mut record).await? {
                summary.indexed += 1;
            } else {
                summary.failed += 1;
            }
        }
        Ok(summary)
    }

    /// Re-projects every record of `source` whose last projection failed.
    pub async fn reindex_failed(
        &self,
        store: &RecordStore,
        source: RecordSource,
    ) -> Result<IndexSummary> {
        let records = store.list_by_index_status(source, Status::Failed).await?;
        self.project_all(store, records).await
    }

    /// Projects every stored record of `source`.
    pub async fn index_all(
        &self,
        store: &RecordStore,
        source: RecordSource,
        only_success: bool,
    ) -> Result<IndexSummary> {
        let records = store.list_all(source, only_success).await?;
        self.project_all(store, records).await
    }

    /// Creates the raw index of every harvest model. With `force` existing
    /// indices are dropped and recreated.
    pub async fn create_raw_indices(&self, force: bool) -> Result<Vec<(String, IndexAction)>> {
        let mut names: Vec<String> = self
            .indices
            .all()
            .into_iter()
            .map(|(_, name)| name.to_string())
            .collect();
        names.dedup();

        let mut actions = Vec::with_capacity(names.len());
        for name in names {
            let action = create_index(
                self.backend.as_ref(),
                &name,
                &raw_index_settings(),
                &raw_index_mappings(),
                force,
            )
            .await?;
            tracing::info!(index = %name, action = ?action, "raw index");
            actions.push((name, action));
        }
        Ok(actions)
    }
}

async fn create_index(
    backend: &dyn SearchBackend,
    name: &str,
    settings: &Value,
    mappings: &Value,
    force: bool,
) -> Result<IndexAction> {
    let exists = backend.exists(name).await?;
    if exists && !force {
        return Ok(IndexAction::AlreadyExists);
    }
    if exists {
        backend.delete_index(name).await?;
    }
    backend.create_index(name, settings, mappings).await?;
    Ok(if exists {
        IndexAction::Recreated
    } else {
        IndexAction::Created
    })
}

/// Creates a curated index from a JSON file holding either
/// `{"settings": …, "mappings": …}` or a bare mappings object.
pub async fn create_index_from_file(
    backend: &dyn SearchBackend,
    name: &str,
    path: &Path,
    force: bool,
) -> Result<IndexAction> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read mapping file: {}", path.display()))?;
    let definition: Value = serde_json::from_str(&content)
        .with_context(|| format!("Mapping file is not valid JSON: {}", path.display()))?;

    let (settings, mappings) = if definition.get("mappings").is_some() {
        (
            definition.get("settings").cloned().unwrap_or_else(|| json!({})),
            definition["mappings"].clone(),
        )
    } else {
        (json!({}), definition)
    };
    create_index(backend, name, &settings, &mappings, force).await
}

#[async_trait]
impl RecordListener for IndexingProjector {
    fn name(&self) -> &str {
        "indexing_projector"
    }

    async fn on_event(&self, store: &RecordStore, event: &RecordEvent) -> Result<()> {
        match event {
            RecordEvent::Saved(saved) => {
                if Self::should_project(saved) {
                    let mut record = saved.record.clone();
                    self.project(store, &mut record).await?;
                }
                Ok(())
            }
            RecordEvent::Deleted(record) => self.remove(store, record).await,
            RecordEvent::Indexed { .. } => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use crate::search_backend::InMemorySearchBackend;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (RecordStore, Arc<InMemorySearchBackend>, Arc<IndexingProjector>) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        let store = RecordStore::new(pool);
        let backend = Arc::new(InMemorySearchBackend::new());
        let projector = Arc::new(IndexingProjector::new(
            backend.clone(),
            IndicesConfig::default(),
        ));
        store.events().subscribe(projector.clone());
        (store, backend, projector)
    }

    #[tokio::test]
    async fn test_save_projects_raw_data() {
        let (store, backend, _) = setup().await;
        let (mut rec, _) = store.get_or_create(RecordSource::Preprint, "oai:1").await.unwrap();
        assert_eq!(backend.doc_count("raw_preprint"), 0);

        store
            .set_attrs_from_parsed(&mut rec, json!({"title": [{"text": "T"}]}), None)
            .await
            .unwrap();

        let doc = backend.document("raw_preprint", "oai:1").unwrap();
        assert_eq!(doc["raw_data"]["title"][0]["text"], "T");
        let stored = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.index_status, Status::Success);
        assert_eq!(stored.index_name.as_deref(), Some("raw_preprint"));
    }

    #[tokio::test]
    async fn test_unchanged_raw_data_is_not_reprojected() {
        let (store, backend, _) = setup().await;
        let (mut rec, _) = store.get_or_create(RecordSource::Book, "B1").await.unwrap();
        rec.raw_data = json!({"title": "Livro"});
        store.save(&mut rec, None).await.unwrap();
        backend.fail_indexing("raw_book");

        // Same payload, other column changed: no projection attempted.
        rec.last_seq = Some(4);
        store.save(&mut rec, Some(&["last_seq"])).await.unwrap();
        let stored = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.index_status, Status::Success);

        // Declaring raw_data forces a projection, which now fails.
        store.save(&mut rec, Some(&["raw_data"])).await.unwrap();
        let stored = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.index_status, Status::Failed);
        assert_eq!(stored.harvest_status, Status::Pending);
    }

    #[tokio::test]
    async fn test_index_failure_is_logged_on_record() {
        let (store, backend, _) = setup().await;
        backend.fail_indexing("raw_book");
        let (mut rec, _) = store.get_or_create(RecordSource::Book, "B5").await.unwrap();
        rec.raw_data = json!({"title": "Livro B5"});
        store.save(&mut rec, None).await.unwrap();

        let stored = store.get(&rec.id).await.unwrap().unwrap();
        assert_eq!(stored.index_status, Status::Failed);
        assert_eq!(stored.harvest_status, Status::Pending);

        let logs = store.error_logs(&rec.id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].field_name, "raw_data");
        assert_eq!(logs[0].exception_type, "ProjectionError");
        assert_eq!(logs[0].attempt, stored.harvest_attempt);
        assert_eq!(logs[0].context_data["index"], "raw_book");
        assert_eq!(logs[0].context_data["identifier"], "B5");
    }

    #[tokio::test]
    async fn test_reindex_failed_recovers() {
        let (store, backend, projector) = setup().await;
        backend.fail_indexing("raw_book");
        let (mut rec, _) = store.get_or_create(RecordSource::Book, "B2").await.unwrap();
        rec.raw_data = json!({"title": "X"});
        store.save(&mut rec, None).await.unwrap();
        assert_eq!(backend.doc_count("raw_book"), 0);

        backend.clear_failures();
        let summary = projector
            .reindex_failed(&store, RecordSource::Book)
            .await
            .unwrap();
        assert_eq!(summary.indexed, 1);
        assert_eq!(backend.doc_count("raw_book"), 1);
    }

    #[tokio::test]
    async fn test_projection_is_idempotent() {
        let (store, backend, projector) = setup().await;
        let (mut rec, _) = store.get_or_create(RecordSource::Preprint, "oai:7").await.unwrap();
        rec.raw_data = json!({"language": "pt"});
        store.save(&mut rec, None).await.unwrap();
        projector.project(&store, &mut rec).await.unwrap();
        projector
            .index_all(&store, RecordSource::Preprint, false)
            .await
            .unwrap();

        assert_eq!(backend.doc_count("raw_preprint"), 1);
        assert_eq!(
            backend.document("raw_preprint", "oai:7").unwrap()["raw_data"],
            json!({"language": "pt"})
        );
    }

    #[tokio::test]
    async fn test_create_raw_indices_respects_force() {
        let (_, backend, projector) = setup().await;
        let first = projector.create_raw_indices(false).await.unwrap();
        assert_eq!(first.len(), 4);
        assert!(first.iter().all(|(_, a)| *a == IndexAction::Created));

        let (settings, mappings) = backend.index_definition("raw_book").unwrap();
        assert_eq!(settings["number_of_replicas"], 0);
        assert_eq!(mappings["properties"]["raw_data"]["enabled"], false);

        let again = projector.create_raw_indices(false).await.unwrap();
        assert!(again.iter().all(|(_, a)| *a == IndexAction::AlreadyExists));
        let forced = projector.create_raw_indices(true).await.unwrap();
        assert!(forced.iter().all(|(_, a)| *a == IndexAction::Recreated));
    }
}
