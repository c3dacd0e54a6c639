//! Harvest orchestration shared by every source.
//!
//! Each protocol lives in its own `harvest_*` module and implements
//! [`Harvester`]. They all follow the same shape:
//!
//! ```text
//! resolve cursor ─► fetch page ─► per record: ErrorContext ─► save ─► finalize
//!                       ▲                                      │
//!                       └──────────── next page ◄──────────────┘
//! ```
//!
//! A failure that belongs to one record is written to that record's error
//! log and the batch goes on. A failure listing a page aborts the batch.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error_context::ErrorContext;
use crate::harvest_books::BooksHarvester;
use crate::harvest_datasets::DatasetHarvester;
use crate::harvest_preprints::PreprintHarvester;
use crate::models::{ErrorEntry, ErrorLog, HarvestedRecord, RecordSource, Status};
use crate::pipeline::Pipeline;
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter};
use crate::store::RecordStore;

/// Per-run overrides of the stored cursors.
#[derive(Debug, Clone, Default)]
pub struct HarvestOptions {
    /// Preprints: OAI `from` (YYYY-MM-DD).
    pub from: Option<String>,
    /// Preprints: OAI `until` (YYYY-MM-DD).
    pub until: Option<String>,
    /// Books: `_changes` since-cursor.
    pub since: Option<i64>,
    /// Datasets: search offset.
    pub start: Option<u64>,
    /// Datasets: stop after this many pages.
    pub max_pages: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarvestSummary {
    pub source: String,
    pub pages: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub deleted: u64,
    pub skipped: u64,
    /// Cursor value the run ended on (datestamp, seq, or offset).
    pub cursor: Option<String>,
}

impl HarvestSummary {
    pub fn new(source: RecordSource) -> Self {
        Self {
            source: source.to_string(),
            ..Self::default()
        }
    }

    pub fn record(&mut self, status: Status) {
        self.processed += 1;
        match status {
            Status::Success => self.succeeded += 1,
            _ => self.failed += 1,
        }
    }

    pub fn report(&self, progress: &dyn HarvestProgressReporter, total: Option<u64>) {
        progress.report(HarvestProgressEvent::Processed {
            source: self.source.clone(),
            n: self.processed,
            total,
            failed: self.failed,
        });
    }

    pub fn print(&self, verb: &str) {
        println!("{} {}", verb, self.source);
        println!("  pages: {}", self.pages);
        println!("  processed: {}", self.processed);
        println!("  succeeded: {}", self.succeeded);
        println!("  failed: {}", self.failed);
        if self.deleted > 0 {
            println!("  deleted: {}", self.deleted);
        }
        if self.skipped > 0 {
            println!("  skipped: {}", self.skipped);
        }
        if let Some(cursor) = &self.cursor {
            println!("  cursor: {}", cursor);
        }
        println!("ok");
    }
}

/// A protocol-specific collector.
#[async_trait]
pub trait Harvester: Send + Sync {
    fn source(&self) -> RecordSource;

    fn description(&self) -> &str;

    /// Pulls everything new since the stored cursor.
    async fn harvest(
        &self,
        options: &HarvestOptions,
        progress: &dyn HarvestProgressReporter,
    ) -> Result<HarvestSummary>;

    /// Re-fetches every record whose last attempt failed.
    async fn retry_failed(&self, progress: &dyn HarvestProgressReporter) -> Result<HarvestSummary>;
}

/// Builds the harvester for `source`. Fails when its base URL is not configured.
pub fn harvester_for(pipeline: &Pipeline, source: RecordSource) -> Result<Box<dyn Harvester>> {
    Ok(match source {
        RecordSource::Preprint => Box::new(PreprintHarvester::new(pipeline)?),
        RecordSource::Book => Box::new(BooksHarvester::new(pipeline)?),
        RecordSource::Dataset => Box::new(DatasetHarvester::new(pipeline)?),
    })
}

pub async fn run_harvest(
    pipeline: &Pipeline,
    source: RecordSource,
    options: &HarvestOptions,
    progress: &dyn HarvestProgressReporter,
) -> Result<HarvestSummary> {
    let harvester = harvester_for(pipeline, source)?;
    tracing::info!(source = %source, "{}", harvester.description());
    let summary = harvester.harvest(options, progress).await?;
    tracing::info!(
        source = %source,
        processed = summary.processed,
        failed = summary.failed,
        "harvest finished"
    );
    Ok(summary)
}

pub async fn run_retry_failed(
    pipeline: &Pipeline,
    source: RecordSource,
    progress: &dyn HarvestProgressReporter,
) -> Result<HarvestSummary> {
    let harvester = harvester_for(pipeline, source)?;
    harvester.retry_failed(progress).await
}

/// Payload columns written by a harvester for one record.
#[derive(Debug, Clone, Default)]
pub struct RecordUpdate {
    pub source_url: Option<String>,
    pub raw_data: Value,
    pub type_data: Option<String>,
    pub parent_id: Option<String>,
    pub last_seq: Option<i64>,
}

const UPDATE_FIELDS: [&str; 6] = [
    "source_url",
    "type_data",
    "parent_id",
    "last_seq",
    "raw_data",
    "last_harvest_attempt",
];

/// Runs one attempt that stores `update` on `(source, identifier)`.
///
/// `field_errors` were collected while the payload was built; any of them
/// makes the attempt fail even though the payload is saved.
pub async fn persist_record(
    store: &RecordStore,
    source: RecordSource,
    identifier: &str,
    update: RecordUpdate,
    field_errors: Vec<ErrorEntry>,
) -> Result<(HarvestedRecord, Status)> {
    let (mut record, _) = store.get_or_create(source, identifier).await?;
    let mut ctx = ErrorContext::begin(store, &mut record).await?;
    ctx.extend(field_errors);

    record.source_url = update.source_url;
    record.raw_data = update.raw_data;
    record.type_data = update.type_data;
    record.parent_id = update.parent_id;
    record.last_seq = update.last_seq;
    record.last_harvest_attempt = Some(Utc::now().timestamp());

    if let Err(e) = store.save(&mut record, Some(&UPDATE_FIELDS)).await {
        ctx.add(&e, "raw_data", json!({ "identifier": identifier }));
    }

    let status = ctx.mark_status(&mut record).await?;
    Ok((record, status))
}

/// Runs one attempt on `record` that fails with `error` on `field_name`.
pub async fn fail_record(
    store: &RecordStore,
    record: &mut HarvestedRecord,
    error: &anyhow::Error,
    field_name: &str,
    context_data: Value,
) -> Result<Status> {
    let mut ctx = ErrorContext::begin(store, record).await?;
    ctx.add(error, field_name, context_data);
    ctx.mark_status(record).await
}

/// A failed record with the error logs of its latest attempt.
#[derive(Debug, Clone, Serialize)]
pub struct FailedRecord {
    #[serde(flatten)]
    pub record: HarvestedRecord,
    pub errors: Vec<ErrorLog>,
}

pub async fn failed_records(store: &RecordStore, source: RecordSource) -> Result<Vec<FailedRecord>> {
    let records = store.list_by_harvest_status(source, Status::Failed).await?;
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let errors = store.latest_attempt_errors(&record).await?;
        out.push(FailedRecord { record, errors });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> RecordStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        RecordStore::new(pool)
    }

    #[tokio::test]
    async fn test_persist_record_success() {
        let store = memory_store().await;
        let (record, status) = persist_record(
            &store,
            RecordSource::Dataset,
            "dv-1",
            RecordUpdate {
                source_url: Some("https://data/api/dataverses/dv-1".into()),
                raw_data: json!({"name": "DV"}),
                type_data: Some("dataverse".into()),
                ..RecordUpdate::default()
            },
            Vec::new(),
        )
        .await
        .unwrap();

        assert_eq!(status, Status::Success);
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.harvest_status, Status::Success);
        assert_eq!(stored.type_data.as_deref(), Some("dataverse"));
        assert_eq!(stored.raw_data["name"], "DV");
        assert!(stored.last_harvest_attempt.is_some());
    }

    #[tokio::test]
    async fn test_persist_record_with_field_errors_fails() {
        let store = memory_store().await;
        let mut errors: Vec<ErrorEntry> = Vec::new();
        crate::error_context::FieldErrorSink::add_field_error(
            &mut errors,
            anyhow::anyhow!("Part without monograph"),
            "monograph",
            json!({}),
        );
        let (record, status) = persist_record(
            &store,
            RecordSource::Book,
            "P9",
            RecordUpdate {
                raw_data: json!({"TYPE": "Part"}),
                ..RecordUpdate::default()
            },
            errors,
        )
        .await
        .unwrap();

        assert_eq!(status, Status::Failed);
        let logs = store.latest_attempt_errors(&record).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].field_name, "monograph");
        // The payload is kept even though the attempt failed.
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.raw_data["TYPE"], "Part");
    }

    #[tokio::test]
    async fn test_fail_record_logs_field() {
        let store = memory_store().await;
        let (mut record, _) = store.get_or_create(RecordSource::Book, "B7").await.unwrap();
        let status = fail_record(
            &store,
            &mut record,
            &anyhow::anyhow!("connection refused"),
            "fetch_doc",
            json!({"doc_id": "B7", "db_name": "books"}),
        )
        .await
        .unwrap();
        assert_eq!(status, Status::Failed);
        let logs = store.error_logs(&record.id).await.unwrap();
        assert_eq!(logs[0].context_data["db_name"], "books");

        let failed = failed_records(&store, RecordSource::Book).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].errors[0].field_name, "fetch_doc");
        let json = serde_json::to_value(&failed[0]).unwrap();
        assert_eq!(json["identifier"], "B7");
        assert_eq!(json["errors"][0]["exception_type"], "Error");
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = HarvestSummary::new(RecordSource::Preprint);
        summary.record(Status::Success);
        summary.record(Status::Failed);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.source, "preprint");
    }
}
