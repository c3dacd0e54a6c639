//! Search engine abstraction.
//!
//! Everything above this module talks to the engine through the
//! [`SearchBackend`] trait, using Elasticsearch/OpenSearch JSON bodies.
//!
//! | Implementation | Use |
//! |----------------|-----|
//! | [`OpenSearchBackend`] | production, over the REST API via `reqwest` |
//! | [`InMemorySearchBackend`] | tests and dry runs; evaluates a subset of the query DSL |
//!
//! Search and reindex responses are returned as engine JSON; the helpers
//! below read the parts the pipeline needs.

pub mod memory;
pub mod opensearch;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::config::Config;

pub use memory::InMemorySearchBackend;
pub use opensearch::OpenSearchBackend;

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Creates or replaces document `id` in `index`.
    async fn index(&self, index: &str, id: &str, body: &Value, refresh: bool) -> Result<()>;

    /// Deletes document `id`. Returns `false` if it did not exist.
    async fn delete(&self, index: &str, id: &str) -> Result<bool>;

    async fn exists(&self, index: &str) -> Result<bool>;

    async fn create_index(&self, index: &str, settings: &Value, mappings: &Value) -> Result<()>;

    /// Drops `index`. Missing indices are not an error.
    async fn delete_index(&self, index: &str) -> Result<()>;

    async fn search(&self, index: &str, body: &Value) -> Result<Value>;

    /// Server-side reindex. The response carries `total`, `created`, `updated`.
    async fn reindex(&self, body: &Value, refresh: bool) -> Result<Value>;

    async fn refresh(&self, index: &str) -> Result<()>;

    /// Whether the engine answers at all.
    async fn ping(&self) -> Result<bool>;
}

/// Builds the production backend from `[search]`.
pub fn connect(config: &Config) -> Result<Arc<dyn SearchBackend>> {
    Ok(Arc::new(OpenSearchBackend::new(&config.search)?))
}

/// `hits.total.value`, accepting the older bare-number form.
pub fn total_hits(response: &Value) -> u64 {
    let total = &response["hits"]["total"];
    total
        .get("value")
        .and_then(|v| v.as_u64())
        .or_else(|| total.as_u64())
        .unwrap_or(0)
}

pub fn hits(response: &Value) -> &[Value] {
    response["hits"]["hits"]
        .as_array()
        .map(|v| v.as_slice())
        .unwrap_or(&[])
}

/// Buckets of a terms aggregation, looking through a wrapping `filter`
/// aggregation when the terms live one level down.
pub fn agg_buckets<'a>(aggs: &'a Value, name: &str) -> &'a [Value] {
    let agg = &aggs[name];
    if let Some(buckets) = agg["buckets"].as_array() {
        return buckets;
    }
    if let Some(obj) = agg.as_object() {
        for (_, inner) in obj {
            if let Some(buckets) = inner["buckets"].as_array() {
                return buckets;
            }
        }
    }
    &[]
}

/// A bucket key as a string; numeric keys are rendered without decoration.
pub fn bucket_key(bucket: &Value) -> String {
    if let Some(s) = bucket["key_as_string"].as_str() {
        return s.to_string();
    }
    match &bucket["key"] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

pub fn bucket_count(bucket: &Value) -> u64 {
    bucket["doc_count"].as_u64().unwrap_or(0)
}
