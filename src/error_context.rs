//! Per-record error accounting.
//!
//! An [`ErrorContext`] is opened when a harvester starts working on a
//! record and closed when it is done. Opening moves the record to
//! `in_progress` and starts a new attempt; closing writes every collected
//! error as an error-log row and moves the record to `success` (no errors)
//! or `failed` (at least one), in one transaction.
//!
//! ```text
//! let mut ctx = ErrorContext::begin(&store, &mut record).await?;
//! if let Err(e) = parse_date(..) {
//!     ctx.add(&e, "date", json!({}));
//! }
//! ctx.mark_status(&mut record).await?;   // success | failed
//! ```
//!
//! If the context is dropped without being closed (a `?` returned early or
//! the task was cancelled between awaits) the pending errors plus an
//! `interrupted` entry are written from a background task, so the attempt
//! still ends in `failed`.

use anyhow::Result;
use chrono::Utc;
use serde_json::Value;

use crate::error::error_kind;
use crate::models::{ErrorEntry, HarvestedRecord, Status};
use crate::store::RecordStore;

/// Anything that can collect per-field failures while a record is parsed.
pub trait FieldErrorSink {
    fn add_field_error(&mut self, error: anyhow::Error, field_name: &str, context_data: Value);
}

/// Builds the error-log entry for `error` on `field_name`.
pub fn error_entry(error: &anyhow::Error, field_name: &str, context_data: Value) -> ErrorEntry {
    ErrorEntry {
        field_name: field_name.to_string(),
        exception_type: error_kind(error),
        message: format!("{:#}", error),
        traceback: format!("{:?}", error),
        context_data,
        occurred_at: Utc::now().timestamp(),
    }
}

impl FieldErrorSink for Vec<ErrorEntry> {
    fn add_field_error(&mut self, error: anyhow::Error, field_name: &str, context_data: Value) {
        self.push(error_entry(&error, field_name, context_data));
    }
}

pub struct ErrorContext {
    store: RecordStore,
    record_id: String,
    identifier: String,
    attempt: i64,
    errors: Vec<ErrorEntry>,
    finished: bool,
}

impl ErrorContext {
    /// Starts a new attempt on `record`.
    pub async fn begin(store: &RecordStore, record: &mut HarvestedRecord) -> Result<Self> {
        store.mark_in_progress(record).await?;
        Ok(Self {
            store: store.clone(),
            record_id: record.id.clone(),
            identifier: record.identifier.clone(),
            attempt: record.harvest_attempt,
            errors: Vec::new(),
            finished: false,
        })
    }

    /// Records a failure on `field_name`. Processing of other fields goes on.
    pub fn add(&mut self, error: &anyhow::Error, field_name: &str, context_data: Value) {
        tracing::debug!(
            identifier = %self.identifier,
            field = field_name,
            error = %format!("{:#}", error),
            "field error"
        );
        self.errors.push(error_entry(error, field_name, context_data));
    }

    /// Convenience for callers holding a concrete error type.
    pub fn add_error<E>(&mut self, error: E, field_name: &str, context_data: Value)
    where
        E: Into<anyhow::Error>,
    {
        let error = error.into();
        self.add(&error, field_name, context_data);
    }

    /// Appends entries collected before the context was opened.
    pub fn extend(&mut self, entries: Vec<ErrorEntry>) {
        self.errors.extend(entries);
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[ErrorEntry] {
        &self.errors
    }

    pub fn errors_by_field(&self, field_name: &str) -> Vec<&ErrorEntry> {
        self.errors
            .iter()
            .filter(|e| e.field_name == field_name)
            .collect()
    }

    pub fn attempt(&self) -> i64 {
        self.attempt
    }

    /// Writes the collected errors and transitions the record.
    ///
    /// This is the only way to close a context; consuming `self` makes the
    /// transition happen once per attempt.
    pub async fn mark_status(mut self, record: &mut HarvestedRecord) -> Result<Status> {
        // On a store failure the context stays open and Drop retries.
        let status = self
            .store
            .finalize_attempt(&self.record_id, self.attempt, &self.errors)
            .await?;
        self.finished = true;
        let errors = std::mem::take(&mut self.errors);
        if record.id == self.record_id {
            record.harvest_status = status;
        }
        if status == Status::Failed {
            tracing::warn!(
                identifier = %self.identifier,
                attempt = self.attempt,
                errors = errors.len(),
                "record harvest failed"
            );
        }
        Ok(status)
    }
}

impl FieldErrorSink for ErrorContext {
    fn add_field_error(&mut self, error: anyhow::Error, field_name: &str, context_data: Value) {
        self.add(&error, field_name, context_data);
    }
}

impl Drop for ErrorContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let mut errors = std::mem::take(&mut self.errors);
        errors.push(ErrorEntry {
            field_name: "attempt".to_string(),
            exception_type: "Interrupted".to_string(),
            message: "processing stopped before the record was finalized".to_string(),
            traceback: String::new(),
            context_data: Value::Null,
            occurred_at: Utc::now().timestamp(),
        });

        let store = self.store.clone();
        let record_id = std::mem::take(&mut self.record_id);
        let identifier = std::mem::take(&mut self.identifier);
        let attempt = self.attempt;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.finalize_attempt(&record_id, attempt, &errors).await {
                        tracing::error!(
                            identifier = %identifier,
                            error = %format!("{:#}", e),
                            "failed to finalize interrupted attempt"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    identifier = %identifier,
                    "error context dropped outside a runtime; record left in progress"
                );
            }
        }
    }
}
