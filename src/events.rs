//! Record lifecycle events.
//!
//! Every write that changes a record's payload publishes a [`RecordEvent`]
//! on the store's [`EventBus`]. Listeners run in subscription order, one
//! after another, after the write has committed:
//!
//! ```text
//! RecordStore::save ──► Saved ──► IndexingProjector ──► Indexed ──► BronzeTransformer
//! RecordStore::delete ─► Deleted ─► IndexingProjector (raw + curated delete)
//! ```
//!
//! `Indexed` is only published by the projector after a successful index
//! call, so the transformer never sees a record whose projection failed.
//! Listener failures are logged and do not reach the harvester.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, RwLock};

use crate::models::HarvestedRecord;
use crate::store::RecordStore;

#[derive(Debug, Clone)]
pub enum RecordEvent {
    Saved(SavedRecord),
    Deleted(HarvestedRecord),
    Indexed {
        record: HarvestedRecord,
        index_name: String,
    },
}

/// Payload of a save: the record after the write plus the pre-save snapshot.
#[derive(Debug, Clone)]
pub struct SavedRecord {
    pub record: HarvestedRecord,
    pub created: bool,
    /// `raw_data` as stored before this write; `None` on create.
    pub previous_raw: Option<Value>,
    /// Columns the caller declared as changed; `None` means a full save.
    pub update_fields: Option<Vec<String>>,
}

impl SavedRecord {
    pub fn raw_data_changed(&self) -> bool {
        match &self.previous_raw {
            Some(prev) => prev != &self.record.raw_data,
            None => true,
        }
    }

    pub fn declares(&self, field: &str) -> bool {
        self.update_fields
            .as_ref()
            .map(|fields| fields.iter().any(|f| f == field))
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait RecordListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_event(&self, store: &RecordStore, event: &RecordEvent) -> Result<()>;
}

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn RecordListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn RecordListener>) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(listener),
            Err(poisoned) => poisoned.into_inner().push(listener),
        }
    }

    pub fn listener_count(&self) -> usize {
        match self.listeners.read() {
            Ok(listeners) => listeners.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Delivers `event` to every listener in subscription order.
    pub async fn publish(&self, store: &RecordStore, event: RecordEvent) {
        let listeners: Vec<Arc<dyn RecordListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };

        for listener in listeners {
            if let Err(e) = listener.on_event(store, &event).await {
                tracing::error!(
                    listener = listener.name(),
                    error = %format!("{:#}", e),
                    "record listener failed"
                );
            }
        }
    }
}
