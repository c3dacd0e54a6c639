//! Faceted query gateway over the curated indices.
//!
//! One search request carries the free-text query, the selected filters,
//! pagination and one aggregation per registered field:
//!
//! ```text
//! query        = q                       (hits and facets both start here)
//! post_filter  = all selected filters    (hits only)
//! aggs.F       = filter(q ∧ selections except F) → terms(F)
//! ```
//!
//! Each facet therefore counts as if its own selection were cleared, so
//! picking `publication_year = 2024` leaves the other years visible.
//! Facet-only requests (`/filters`) are cached by request fingerprint.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::RequestError;
use crate::field_registry::FieldRegistry;
use crate::filter_cache::{FilterCache, FilterCacheKey};
use crate::gateway_query::{
    aggregation_field, field_filter_clauses, filter_query, parse_facets, parse_suggestions,
    search_as_you_type_body, term_search_body, terms_agg, text_query, FacetBucket, Facets,
    Operator, Suggestion, SUGGESTION_SIZE,
};
use crate::search_backend::{hits, total_hits, SearchBackend};

/// Accepts a scalar or a list per field; nulls and empty strings are dropped.
fn one_or_many<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Value> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(field, value)| {
            let values = match value {
                Value::Array(items) => items,
                other => vec![other],
            };
            let values: Vec<Value> = values
                .into_iter()
                .filter(|v| !v.is_null() && v.as_str().map_or(true, |s| !s.trim().is_empty()))
                .collect();
            (field, values)
        })
        .filter(|(_, values)| !values.is_empty())
        .collect())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub data_source: String,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub filters: BTreeMap<String, Vec<Value>>,
    /// Per-field `and`/`or`; honoured only for fields that support it.
    #[serde(default)]
    pub operators: BTreeMap<String, String>,
    #[serde(default)]
    pub from: Option<u32>,
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub search_after: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FacetsRequest {
    pub data_source: String,
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub filters: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub operators: BTreeMap<String, String>,
    #[serde(default)]
    pub include_fields: Vec<String>,
    #[serde(default)]
    pub exclude_fields: Vec<String>,
    #[serde(default)]
    pub force_refresh: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuggestRequest {
    pub data_source: String,
    pub field_name: String,
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub score: Option<f64>,
    pub source: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub total: u64,
    pub hits: Vec<SearchHit>,
    /// Sort values of the last hit when a further page may exist.
    pub next_search_after: Option<Vec<Value>>,
    pub facets: Facets,
}

#[derive(Debug, Clone, Serialize)]
pub struct FacetsResponse {
    pub data_source: String,
    pub facets: Facets,
    pub cached: bool,
}

fn normalized_q(q: &Option<String>) -> Option<&str> {
    q.as_deref().map(str::trim).filter(|q| !q.is_empty())
}

/// Selected filter clauses keyed by logical field name.
fn selection_clauses(
    registry: &FieldRegistry<'_>,
    filters: &BTreeMap<String, Vec<Value>>,
    operators: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, Vec<Value>>> {
    let mut out = BTreeMap::new();
    for (logical, values) in filters {
        let field = registry.require_field(logical)?;
        let operator = if field.supports_query_operator {
            operators
                .get(logical)
                .and_then(|op| op.parse::<Operator>().ok())
                .unwrap_or_default()
        } else {
            Operator::Or
        };
        let clauses = field_filter_clauses(&aggregation_field(field), values, operator);
        if !clauses.is_empty() {
            out.insert(logical.clone(), clauses);
        }
    }
    Ok(out)
}

/// Operators that change the clauses of a selection: `and` on fields that
/// support operators. Everything else behaves as the default `or`.
fn effective_operators(
    registry: &FieldRegistry<'_>,
    operators: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    operators
        .iter()
        .filter(|(logical, _)| {
            registry
                .field(logical)
                .is_some_and(|field| field.supports_query_operator)
        })
        .filter(|(_, op)| op.parse::<Operator>().ok() == Some(Operator::And))
        .map(|(logical, _)| (logical.clone(), "and".to_string()))
        .collect()
}

fn all_clauses(selection: &BTreeMap<String, Vec<Value>>) -> Vec<Value> {
    selection.values().flatten().cloned().collect()
}

/// One filter-wrapped terms aggregation per field, each excluding the
/// field's own selection.
fn excluded_facet_aggs(
    registry: &FieldRegistry<'_>,
    selection: &BTreeMap<String, Vec<Value>>,
    include: &[String],
    exclude: &[String],
) -> Value {
    let mut aggs = Map::new();
    for (name, field) in registry.selected_fields(include, exclude) {
        let others: Vec<Value> = selection
            .iter()
            .filter(|(selected, _)| *selected != name)
            .flat_map(|(_, clauses)| clauses.iter().cloned())
            .collect();
        aggs.insert(
            name.clone(),
            json!({
                "filter": filter_query(others),
                "aggs": { name.clone(): terms_agg(field) }
            }),
        );
    }
    Value::Object(aggs)
}

fn base_query(registry: &FieldRegistry<'_>, q: Option<&str>) -> Value {
    match q {
        Some(q) => text_query(q, registry.text_fields()),
        None => json!({ "match_all": {} }),
    }
}

pub struct SearchGateway {
    backend: Arc<dyn SearchBackend>,
    config: Arc<Config>,
    cache: FilterCache,
}

impl SearchGateway {
    pub fn new(backend: Arc<dyn SearchBackend>, config: Arc<Config>) -> Self {
        let ttl = Duration::from_secs(config.gateway.cache_ttl_secs);
        Self {
            backend,
            config,
            cache: FilterCache::new(ttl),
        }
    }

    pub fn cache(&self) -> &FilterCache {
        &self.cache
    }

    fn page_size(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.config.gateway.default_page_size)
            .min(self.config.gateway.max_page_size)
    }

    pub fn build_search_body(&self, request: &SearchRequest) -> Result<Value> {
        let registry = FieldRegistry::lookup(&self.config, &request.data_source)?;
        let q = normalized_q(&request.q);
        let selection = selection_clauses(&registry, &request.filters, &request.operators)?;

        let mut body = json!({
            "query": base_query(&registry, q),
            "size": self.page_size(request.size),
            "sort": if q.is_some() { json!(["_score", "_doc"]) } else { json!(["_doc"]) },
            "track_total_hits": true,
            "aggs": excluded_facet_aggs(&registry, &selection, &[], &[]),
        });
        if !selection.is_empty() {
            body["post_filter"] = filter_query(all_clauses(&selection));
        }
        match &request.search_after {
            Some(after) if !after.is_empty() => body["search_after"] = json!(after),
            _ => body["from"] = json!(request.from.unwrap_or(0)),
        }
        Ok(body)
    }

    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let registry = FieldRegistry::lookup(&self.config, &request.data_source)?;
        let body = self.build_search_body(request)?;
        let response = self
            .backend
            .search(registry.index_name(), &body)
            .await
            .with_context(|| format!("search on {} failed", registry.index_name()))?;

        let page: Vec<SearchHit> = hits(&response)
            .iter()
            .map(|hit| SearchHit {
                id: hit["_id"].as_str().unwrap_or_default().to_string(),
                score: hit["_score"].as_f64(),
                source: hit["_source"].clone(),
            })
            .collect();

        let size = body["size"].as_u64().unwrap_or(0) as usize;
        let next_search_after = if size > 0 && page.len() == size {
            hits(&response)
                .last()
                .and_then(|hit| hit["sort"].as_array())
                .cloned()
        } else {
            None
        };

        let names: Vec<String> = registry.fields().map(|(name, _)| name.clone()).collect();
        let facets = parse_facets(&response["aggregations"], &names);

        tracing::debug!(
            data_source = %request.data_source,
            total = total_hits(&response),
            returned = page.len(),
            "search"
        );
        Ok(SearchResponse {
            total: total_hits(&response),
            hits: page,
            next_search_after,
            facets,
        })
    }

    pub fn build_facets_body(&self, request: &FacetsRequest) -> Result<Value> {
        let registry = FieldRegistry::lookup(&self.config, &request.data_source)?;
        let selection = selection_clauses(&registry, &request.filters, &request.operators)?;
        Ok(json!({
            "size": 0,
            "query": base_query(&registry, normalized_q(&request.q)),
            "aggs": excluded_facet_aggs(
                &registry,
                &selection,
                &request.include_fields,
                &request.exclude_fields,
            ),
        }))
    }

    /// Facet buckets only, served from the cache when fresh.
    pub async fn facets(&self, request: &FacetsRequest) -> Result<FacetsResponse> {
        let registry = FieldRegistry::lookup(&self.config, &request.data_source)?;
        let operators = effective_operators(&registry, &request.operators);
        let key = FilterCacheKey {
            data_source: registry.name(),
            index_name: registry.index_name(),
            include_fields: &request.include_fields,
            exclude_fields: &request.exclude_fields,
            q: normalized_q(&request.q),
            filters: &request.filters,
            operators: &operators,
            registry_fingerprint: registry.fingerprint(),
        }
        .fingerprint();

        if let Some(cached) = self.cache.get(&key, request.force_refresh) {
            if let Ok(facets) = serde_json::from_value::<BTreeMap<String, Vec<FacetBucket>>>(cached) {
                return Ok(FacetsResponse {
                    data_source: request.data_source.clone(),
                    facets,
                    cached: true,
                });
            }
        }

        let body = self.build_facets_body(request)?;
        let response = self
            .backend
            .search(registry.index_name(), &body)
            .await
            .with_context(|| format!("facets on {} failed", registry.index_name()))?;
        let names: Vec<String> = registry
            .selected_fields(&request.include_fields, &request.exclude_fields)
            .into_iter()
            .map(|(name, _)| name.clone())
            .collect();
        let facets = parse_facets(&response["aggregations"], &names);

        self.cache.insert(key, serde_json::to_value(&facets)?);
        Ok(FacetsResponse {
            data_source: request.data_source.clone(),
            facets,
            cached: false,
        })
    }

    /// Suggestions for one field: search-as-you-type where the field
    /// supports it, phrase-prefix otherwise.
    pub async fn suggest(&self, request: &SuggestRequest) -> Result<Vec<Suggestion>> {
        let registry = FieldRegistry::lookup(&self.config, &request.data_source)?;
        let field = registry.require_field(&request.field_name)?;
        let q = request.q.trim();
        if q.is_empty() {
            return Ok(Vec::new());
        }
        if q.len() > 256 {
            return Err(RequestError::Invalid("q is longer than 256 bytes".into()).into());
        }

        let body = if field.supports_search_as_you_type {
            search_as_you_type_body(&field.index_field_name, q, SUGGESTION_SIZE)
        } else {
            term_search_body(&field.index_field_name, q, SUGGESTION_SIZE)
        };
        let response = self.backend.search(registry.index_name(), &body).await?;
        Ok(parse_suggestions(&response))
    }
}
