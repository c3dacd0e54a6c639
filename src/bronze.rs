//! Raw → curated ("bronze") transformation.
//!
//! A [`TransformationScript`] names a source index, a destination index,
//! an optional query template and an engine-side painless script. Running
//! it issues one server-side reindex:
//!
//! ```json
//! {
//!   "source": { "index": "raw_preprint", "query": { "term": { "_id": "oai:1" } } },
//!   "dest":   { "index": "bronze_preprint" },
//!   "script": { "lang": "painless", "source": "<transform_script>" }
//! }
//! ```
//!
//! The transformer runs automatically after a record has been projected
//! into its raw index (restricted to that record) and on demand from the
//! CLI or the HTTP API (whole index, or one identifier). Failures are
//! returned as [`TransformOutcome::Error`] and never touch the record.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::RequestError;
use crate::events::{RecordEvent, RecordListener};
use crate::models::TransformationScript;
use crate::search_backend::SearchBackend;
use crate::store::RecordStore;

pub const IDENTIFIER_PLACEHOLDER: &str = "{{identifier}}";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TransformOutcome {
    Success { total: u64, created: u64, updated: u64 },
    Error { message: String },
}

impl TransformOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransformOutcome::Success { .. })
    }
}

/// Substitutes `identifier` into a query template. The result must be a
/// JSON object.
pub fn render_query(template: &str, identifier: &str) -> Result<Value> {
    // Escaped as JSON string content so quotes in identifiers stay valid.
    let encoded = serde_json::to_string(identifier)?;
    let escaped = &encoded[1..encoded.len() - 1];
    let rendered = template.replace(IDENTIFIER_PLACEHOLDER, escaped);
    let query: Value = serde_json::from_str(&rendered)
        .map_err(|e| anyhow!("query_script is not valid JSON after substitution: {}", e))?;
    if !query.is_object() {
        bail!("query_script must resolve to a JSON object");
    }
    Ok(query)
}

/// Builds the reindex request for `script`, limited to `identifier` when given.
pub fn build_reindex_body(script: &TransformationScript, identifier: Option<&str>) -> Result<Value> {
    let mut source = json!({ "index": script.source_index });
    if let Some(identifier) = identifier {
        let query = match script.query_script.as_deref().filter(|q| !q.trim().is_empty()) {
            Some(template) => render_query(template, identifier)?,
            None => json!({ "term": { "_id": identifier } }),
        };
        source["query"] = query;
    }
    Ok(json!({
        "source": source,
        "dest": { "index": script.dest_index },
        "script": { "lang": "painless", "source": script.transform_script },
    }))
}

pub struct BronzeTransformer {
    backend: Arc<dyn SearchBackend>,
}

impl BronzeTransformer {
    pub fn new(backend: Arc<dyn SearchBackend>) -> Self {
        Self { backend }
    }

    async fn try_transform(
        &self,
        script: &TransformationScript,
        identifier: Option<&str>,
    ) -> Result<TransformOutcome> {
        for index in [&script.source_index, &script.dest_index] {
            if !self.backend.exists(index).await? {
                bail!("index {} does not exist", index);
            }
        }

        let body = build_reindex_body(script, identifier)?;
        let response = self.backend.reindex(&body, true).await?;
        let count = |key: &str| response.get(key).and_then(|v| v.as_u64()).unwrap_or(0);
        Ok(TransformOutcome::Success {
            total: count("total"),
            created: count("created"),
            updated: count("updated"),
        })
    }

    /// Runs `script`, restricted to `identifier` when given.
    pub async fn transform(
        &self,
        script: &TransformationScript,
        identifier: Option<&str>,
    ) -> TransformOutcome {
        match self.try_transform(script, identifier).await {
            Ok(outcome) => outcome,
            Err(e) => TransformOutcome::Error {
                message: format!("{:#}", e),
            },
        }
    }

    /// Loads script `script_id` and runs it.
    pub async fn transform_by_id(
        &self,
        store: &RecordStore,
        script_id: i64,
        identifier: Option<&str>,
    ) -> Result<TransformOutcome> {
        let script = store
            .get_script(script_id)
            .await?
            .ok_or_else(|| RequestError::NotFound(format!("transformation script {}", script_id)))?;
        Ok(self.transform(&script, identifier).await)
    }
}

#[async_trait]
impl RecordListener for BronzeTransformer {
    fn name(&self) -> &str {
        "bronze_transformer"
    }

    async fn on_event(&self, store: &RecordStore, event: &RecordEvent) -> Result<()> {
        let record = match event {
            RecordEvent::Indexed { record, .. } => record,
            _ => return Ok(()),
        };
        let model = match record.harvest_model() {
            Some(model) => model,
            None => return Ok(()),
        };
        let script = match store.active_script(model).await? {
            Some(script) => script,
            None => {
                tracing::debug!(model = %model, "no active transformation script");
                return Ok(());
            }
        };

        match self.transform(&script, Some(&record.identifier)).await {
            TransformOutcome::Success { total, created, updated } => {
                tracing::debug!(
                    identifier = %record.identifier,
                    dest = %script.dest_index,
                    total,
                    created,
                    updated,
                    "transformed"
                );
            }
            TransformOutcome::Error { message } => {
                tracing::warn!(
                    identifier = %record.identifier,
                    script = %script.name,
                    error = %message,
                    "transformation failed"
                );
            }
        }
        Ok(())
    }
}
