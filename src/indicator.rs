//! Indicator engine.
//!
//! An [`IndicatorSpec`] describes a chart declaratively: a list of filter
//! contexts, a `facet_by` field whose buckets become the x-axis, and
//! optional `context_by` fields that multiply the contexts. Each context is
//! one count query grouped by `facet_by`, producing one series.
//!
//! Filter values follow a small Lucene-like convention:
//!
//! | Value | Clause |
//! |-------|--------|
//! | `"[2012 TO 2023]"` | `range` with `gte`/`lte` (`*` leaves a side open) |
//! | `["a", "b"]` | `terms` |
//! | `"a"`, `"\"a\""`, `42`, `true` | `term` (surrounding quotes stripped) |

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::config::{Config, DataSourceConfig};
use crate::error::RequestError;
use crate::search_backend::{agg_buckets, bucket_count, bucket_key, SearchBackend};

/// Bucket cap for context and facet enumeration.
const MAX_BUCKETS: u32 = 1000;

/// Largest number of x-axis keys a range filter may produce.
pub const MAX_RANGE_BUCKETS: u64 = 1000;

/// Ordered `(field, value)` pairs. Order drives the series slug.
pub type FilterSet = Vec<(String, Value)>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeFilter {
    pub field: String,
    pub start: i64,
    pub end: i64,
}

impl RangeFilter {
    pub fn to_lucene(&self) -> String {
        format!("[{} TO {}]", self.start, self.end)
    }

    /// Number of integer keys in `[start, end]`; 0 when inverted or too
    /// wide to count.
    pub fn len(&self) -> usize {
        self.end
            .checked_sub(self.start)
            .and_then(|span| usize::try_from(span).ok())
            .and_then(|span| span.checked_add(1))
            .unwrap_or(0)
    }

    /// Rejects inverted ranges and ranges wider than [`MAX_RANGE_BUCKETS`].
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.end < self.start {
            return Err(RequestError::Invalid(format!(
                "range_filter end {} is before start {}",
                self.end, self.start
            )));
        }
        match self.end.checked_sub(self.start) {
            Some(span) if (span as u64) < MAX_RANGE_BUCKETS => Ok(()),
            _ => Err(RequestError::Invalid(format!(
                "range_filter {} spans more than {} keys",
                self.to_lucene(),
                MAX_RANGE_BUCKETS
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// Accepts `{field, start, end}` and the nested
// `{filter_name, range: {start, end}}` form.
impl<'de> Deserialize<'de> for RangeFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Bounds {
            start: i64,
            end: i64,
        }

        #[derive(Deserialize)]
        struct Repr {
            #[serde(alias = "filter_name")]
            field: String,
            start: Option<i64>,
            end: Option<i64>,
            range: Option<Bounds>,
        }

        let repr = Repr::deserialize(deserializer)?;
        let (start, end) = match (repr.range, repr.start, repr.end) {
            (Some(bounds), _, _) => (bounds.start, bounds.end),
            (None, Some(start), Some(end)) => (start, end),
            _ => return Err(serde::de::Error::custom("range_filter needs start and end")),
        };
        Ok(RangeFilter {
            field: repr.field,
            start,
            end,
        })
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct IndicatorSpec {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Data source from `[data_sources]`; its registry maps field names.
    #[serde(default)]
    pub data_source: Option<String>,
    /// Explicit index; overrides the data source's index.
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub filters: Vec<Map<String, Value>>,
    pub facet_by: String,
    #[serde(default)]
    pub context_by: Vec<String>,
    #[serde(default)]
    pub default_filter: Map<String, Value>,
    #[serde(default)]
    pub range_filter: Option<RangeFilter>,
    #[serde(default = "default_true")]
    pub fill_range: bool,
    #[serde(default)]
    pub fill_range_value: u64,
    #[serde(default)]
    pub include_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSeries {
    pub slug: String,
    pub items: Vec<String>,
    pub counts: Vec<u64>,
    /// The engine query that produced the series.
    pub query: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndicatorResult {
    pub title: String,
    pub description: Option<String>,
    pub range: Option<RangeFilter>,
    pub fill_range_value: u64,
    pub series: Vec<IndicatorSeries>,
}

impl IndicatorResult {
    /// `[{slug: {items, counts}}, ...]`
    pub fn to_output(&self) -> Value {
        Value::Array(
            self.series
                .iter()
                .map(|s| json!({ s.slug.clone(): { "items": s.items, "counts": s.counts } }))
                .collect(),
        )
    }

    /// Chart payload: one stacked bar series per context over a shared x-axis.
    pub fn to_chart(&self) -> Value {
        let keys: Vec<Value> = match &self.range {
            Some(range) => (range.start..=range.end).map(Value::from).collect(),
            None => {
                let mut union: Vec<String> = self
                    .series
                    .iter()
                    .flat_map(|s| s.items.iter().cloned())
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                union.sort_by(|a, b| compare_keys(a, b));
                union.into_iter().map(Value::from).collect()
            }
        };

        let series: Vec<Value> = self
            .series
            .iter()
            .map(|s| {
                let by_key: HashMap<&str, u64> = s
                    .items
                    .iter()
                    .map(String::as_str)
                    .zip(s.counts.iter().copied())
                    .collect();
                let data: Vec<u64> = keys
                    .iter()
                    .map(|key| {
                        let key = match key {
                            Value::String(k) => k.clone(),
                            other => other.to_string(),
                        };
                        by_key
                            .get(key.as_str())
                            .copied()
                            .unwrap_or(self.fill_range_value)
                    })
                    .collect();
                json!({
                    "name": s.slug,
                    "type": "bar",
                    "stack": stack_for(&s.slug),
                    "emphasis": { "focus": "series" },
                    "data": data,
                    "label": { "show": true },
                })
            })
            .collect();

        json!({ "keys": keys, "series": series })
    }
}

fn stack_for(slug: &str) -> String {
    let parts: Vec<&str> = slug.split('-').collect();
    if parts.len() > 1 {
        parts[1..].join(" ")
    } else {
        "total".to_string()
    }
}

/// Numeric keys compare numerically, anything else lexically.
fn compare_keys(a: &str, b: &str) -> Ordering {
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) => items.iter().map(value_text).collect::<Vec<_>>().join("-"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Hyphen-joined, lowercased filter values. An empty filter is `total`.
pub fn slug(filter: &FilterSet) -> String {
    if filter.is_empty() {
        return "total".to_string();
    }
    filter
        .iter()
        .map(|(_, v)| value_text(v).replace('"', "").to_lowercase().trim().to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// `[a TO b]` bounds, with `*` as an open side.
fn parse_lucene_range(text: &str) -> Option<(Option<Value>, Option<Value>)> {
    let inner = text.trim().strip_prefix('[')?.strip_suffix(']')?;
    let (lo, hi) = inner.split_once(" TO ")?;
    let bound = |s: &str| -> Option<Value> {
        let s = s.trim();
        if s == "*" {
            None
        } else if let Ok(n) = s.parse::<i64>() {
            Some(Value::from(n))
        } else if let Ok(f) = s.parse::<f64>() {
            Some(Value::from(f))
        } else {
            Some(Value::from(s))
        }
    };
    Some((bound(lo), bound(hi)))
}

fn unquote(text: &str) -> &str {
    let t = text.trim();
    t.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(t)
}

/// Translates one filter entry into an engine clause.
pub fn filter_clause(field: &str, value: &Value) -> Value {
    match value {
        Value::String(text) => {
            if let Some((lo, hi)) = parse_lucene_range(text) {
                let mut bounds = Map::new();
                if let Some(lo) = lo {
                    bounds.insert("gte".to_string(), lo);
                }
                if let Some(hi) = hi {
                    bounds.insert("lte".to_string(), hi);
                }
                json!({ "range": { field: bounds } })
            } else {
                json!({ "term": { field: unquote(text) } })
            }
        }
        Value::Array(items) => {
            let values: Vec<Value> = items
                .iter()
                .map(|v| match v {
                    Value::String(s) => Value::from(unquote(s)),
                    other => other.clone(),
                })
                .collect();
            json!({ "terms": { field: values } })
        }
        other => json!({ "term": { field: other } }),
    }
}

/// `filter`, then `default_filter`, then the range; later entries win.
pub fn merge_filters(
    filter: &FilterSet,
    default_filter: &Map<String, Value>,
    range: Option<&RangeFilter>,
) -> FilterSet {
    let mut merged: FilterSet = Vec::new();
    let mut put = |field: &str, value: Value| {
        match merged.iter_mut().find(|(f, _)| f == field) {
            Some(entry) => entry.1 = value,
            None => merged.push((field.to_string(), value)),
        }
    };
    for (field, value) in filter {
        put(field, value.clone());
    }
    for (field, value) in default_filter {
        put(field, value.clone());
    }
    if let Some(range) = range {
        put(&range.field, Value::from(range.to_lucene()));
    }
    merged
}

/// Cartesian product of the value lists, one tuple per context.
pub fn cartesian_product(axes: &[(String, Vec<String>)]) -> Vec<FilterSet> {
    let mut out: Vec<FilterSet> = vec![Vec::new()];
    for (field, values) in axes {
        let mut next = Vec::with_capacity(out.len() * values.len());
        for prefix in &out {
            for value in values {
                let mut tuple = prefix.clone();
                tuple.push((field.clone(), Value::from(value.clone())));
                next.push(tuple);
            }
        }
        out = next;
    }
    out
}

pub struct IndicatorEngine {
    backend: Arc<dyn SearchBackend>,
    config: Arc<Config>,
}

/// Field resolution against an optional registry.
struct FieldResolver<'a> {
    registry: Option<&'a DataSourceConfig>,
}

impl FieldResolver<'_> {
    fn query_field(&self, name: &str) -> String {
        self.registry
            .and_then(|ds| ds.fields.get(name))
            .map(|f| f.index_field_name.clone())
            .unwrap_or_else(|| name.to_string())
    }

    fn agg_field(&self, name: &str) -> String {
        match self.registry.and_then(|ds| ds.fields.get(name)) {
            Some(field) => crate::gateway_query::aggregation_field(field),
            None => name.to_string(),
        }
    }
}

impl IndicatorEngine {
    pub fn new(backend: Arc<dyn SearchBackend>, config: Arc<Config>) -> Self {
        Self { backend, config }
    }

    fn resolve_index<'a>(
        &'a self,
        spec: &IndicatorSpec,
    ) -> Result<(String, Option<&'a DataSourceConfig>)> {
        let registry = match &spec.data_source {
            Some(name) => Some(
                self.config
                    .data_sources
                    .get(name)
                    .ok_or_else(|| RequestError::UnknownDataSource(name.clone()))?,
            ),
            None => None,
        };
        let index = match (&spec.index, registry) {
            (Some(index), _) => index.clone(),
            (None, Some(ds)) => ds.index_name.clone(),
            (None, None) => {
                return Err(
                    RequestError::Invalid("indicator needs an index or a data_source".into()).into(),
                )
            }
        };
        Ok((index, registry))
    }

    async fn distinct_values(&self, index: &str, field: &str) -> Result<Vec<String>> {
        let body = json!({
            "size": 0,
            "query": { "match_all": {} },
            "aggs": { "values": { "terms": {
                "field": field,
                "size": MAX_BUCKETS,
                "order": { "_key": "asc" }
            } } }
        });
        let response = self.backend.search(index, &body).await?;
        let aggs = &response["aggregations"];
        Ok(agg_buckets(aggs, "values").iter().map(bucket_key).collect())
    }

    fn count_query(
        &self,
        merged: &FilterSet,
        resolver: &FieldResolver<'_>,
        facet_field: &str,
    ) -> Value {
        let clauses: Vec<Value> = merged
            .iter()
            .map(|(field, value)| filter_clause(&resolver.query_field(field), value))
            .collect();
        let query = if clauses.is_empty() {
            json!({ "match_all": {} })
        } else {
            json!({ "bool": { "filter": clauses } })
        };
        json!({
            "size": 0,
            "query": query,
            "aggs": { "facet": { "terms": { "field": facet_field, "size": MAX_BUCKETS } } }
        })
    }

    pub async fn generate(&self, spec: &IndicatorSpec) -> Result<IndicatorResult> {
        if let Some(range) = &spec.range_filter {
            range.validate()?;
        }
        let (index, registry) = self.resolve_index(spec)?;
        let resolver = FieldResolver { registry };
        let facet_field = resolver.agg_field(&spec.facet_by);

        let mut filters: Vec<FilterSet> = spec
            .filters
            .iter()
            .map(|f| f.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .collect();

        if !spec.context_by.is_empty() {
            let mut axes = Vec::with_capacity(spec.context_by.len());
            for field in &spec.context_by {
                let values = self
                    .distinct_values(&index, &resolver.agg_field(field))
                    .await?;
                axes.push((field.clone(), values));
            }
            let contexts = cartesian_product(&axes);
            tracing::debug!(contexts = contexts.len(), "context filters generated");
            filters.extend(contexts);
        }
        if filters.is_empty() {
            filters.push(Vec::new());
        }

        let mut observed_keys: Option<Vec<String>> = None;
        let mut series = Vec::with_capacity(filters.len());

        for filter in &filters {
            let merged = merge_filters(filter, &spec.default_filter, spec.range_filter.as_ref());
            let query = self.count_query(&merged, &resolver, &facet_field);
            let response = self.backend.search(&index, &query).await?;

            let mut counts: Vec<(String, u64)> = agg_buckets(&response["aggregations"], "facet")
                .iter()
                .map(|b| (bucket_key(b), bucket_count(b)))
                .collect();

            if spec.fill_range {
                let fill: Vec<String> = match &spec.range_filter {
                    Some(range) => (range.start..=range.end).map(|y| y.to_string()).collect(),
                    None => {
                        if observed_keys.is_none() {
                            observed_keys = Some(self.distinct_values(&index, &facet_field).await?);
                        }
                        observed_keys.clone().unwrap_or_default()
                    }
                };
                let present: HashSet<String> = counts.iter().map(|(k, _)| k.clone()).collect();
                for key in fill {
                    if !present.contains(&key) {
                        counts.push((key, spec.fill_range_value));
                    }
                }
            }
            counts.sort_by(|a, b| compare_keys(&a.0, &b.0));

            if !spec.include_all && counts.iter().all(|(_, c)| *c == 0) {
                continue;
            }

            let (items, counts): (Vec<String>, Vec<u64>) = counts.into_iter().unzip();
            series.push(IndicatorSeries {
                slug: slug(filter),
                items,
                counts,
                query: query["query"].clone(),
            });
        }

        tracing::info!(title = %spec.title, index = %index, series = series.len(), "indicator generated");
        Ok(IndicatorResult {
            title: spec.title.clone(),
            description: spec.description.clone(),
            range: spec.range_filter.clone(),
            fill_range_value: spec.fill_range_value,
            series,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search_backend::InMemorySearchBackend;

    fn engine(backend: Arc<InMemorySearchBackend>) -> IndicatorEngine {
        IndicatorEngine::new(backend, Arc::new(Config::with_db_path(":memory:")))
    }

    fn spec(value: Value) -> IndicatorSpec {
        serde_json::from_value(value).unwrap()
    }

    async fn seeded() -> Arc<InMemorySearchBackend> {
        let backend = Arc::new(InMemorySearchBackend::new());
        let docs = [
            ("a1", json!({"year": 2013, "states": "SP", "license": "cc-by", "record_type": "article"})),
            ("a2", json!({"year": 2013, "states": "RJ", "license": "cc-by", "record_type": "article"})),
            ("a3", json!({"year": 2015, "states": "SP", "license": "cc-by-nc", "record_type": "article"})),
            ("b1", json!({"year": 2015, "states": "SP", "license": "cc-by", "record_type": "book"})),
        ];
        for (id, doc) in docs {
            backend.index("articles", id, &doc, true).await.unwrap();
        }
        backend
    }

    #[test]
    fn test_filter_clause_translation() {
        assert_eq!(
            filter_clause("year", &json!("[2012 TO 2023]")),
            json!({"range": {"year": {"gte": 2012, "lte": 2023}}})
        );
        assert_eq!(
            filter_clause("year", &json!("[2012 TO *]")),
            json!({"range": {"year": {"gte": 2012}}})
        );
        assert_eq!(
            filter_clause("states", &json!("\"SP\"")),
            json!({"term": {"states": "SP"}})
        );
        assert_eq!(
            filter_clause("states", &json!(["SP", "RJ"])),
            json!({"terms": {"states": ["SP", "RJ"]}})
        );
        assert_eq!(filter_clause("oa", &json!(true)), json!({"term": {"oa": true}}));
    }

    #[test]
    fn test_merge_order_and_override() {
        let filter: FilterSet = vec![
            ("record_type".to_string(), json!("book")),
            ("states".to_string(), json!("SP")),
        ];
        let mut default_filter = Map::new();
        default_filter.insert("record_type".to_string(), json!("article"));
        let range = RangeFilter { field: "year".to_string(), start: 2012, end: 2014 };

        let merged = merge_filters(&filter, &default_filter, Some(&range));
        assert_eq!(
            merged,
            vec![
                ("record_type".to_string(), json!("article")),
                ("states".to_string(), json!("SP")),
                ("year".to_string(), json!("[2012 TO 2014]")),
            ]
        );
    }

    #[test]
    fn test_cartesian_product_and_slug() {
        let axes = vec![
            ("states".to_string(), vec!["SP".to_string(), "RJ".to_string()]),
            ("license".to_string(), vec!["cc-by".to_string(), "cc0".to_string(), "x".to_string()]),
        ];
        let product = cartesian_product(&axes);
        assert_eq!(product.len(), 6);
        assert_eq!(slug(&product[0]), "sp-cc-by");
        assert_eq!(slug(&product[5]), "rj-x");
        assert_eq!(slug(&Vec::new()), "total");
        assert!(cartesian_product(&[("s".to_string(), Vec::new())]).is_empty());
    }

    #[test]
    fn test_range_filter_accepts_both_forms() {
        let flat: RangeFilter =
            serde_json::from_value(json!({"field": "year", "start": 2012, "end": 2023})).unwrap();
        let nested: RangeFilter = serde_json::from_value(
            json!({"filter_name": "year", "range": {"start": 2012, "end": 2023}}),
        )
        .unwrap();
        assert_eq!(flat, nested);
        assert_eq!(flat.len(), 12);
        assert!(serde_json::from_value::<RangeFilter>(json!({"field": "year"})).is_err());
    }

    #[test]
    fn test_range_bounds_are_checked() {
        let range = |start: i64, end: i64| RangeFilter {
            field: "year".to_string(),
            start,
            end,
        };
        assert!(range(2012, 2023).validate().is_ok());
        assert!(range(2023, 2023).validate().is_ok());
        assert!(range(0, MAX_RANGE_BUCKETS as i64 - 1).validate().is_ok());

        assert!(range(2023, 2012).validate().is_err());
        assert!(range(0, MAX_RANGE_BUCKETS as i64).validate().is_err());
        assert!(range(0, 5_000_000_000).validate().is_err());
        assert!(range(i64::MIN, i64::MAX).validate().is_err());

        assert_eq!(range(2023, 2012).len(), 0);
        assert_eq!(range(i64::MIN, i64::MAX).len(), 0);
    }

    #[tokio::test]
    async fn test_oversized_range_is_rejected_before_querying() {
        let backend = seeded().await;
        let searches = backend.search_count();
        let engine = engine(backend.clone());

        for (start, end) in [(0_i64, 5_000_000_000_i64), (2023, 2012), (i64::MIN, i64::MAX)] {
            let err = engine
                .generate(&spec(json!({
                    "index": "articles",
                    "facet_by": "year",
                    "range_filter": {"field": "year", "start": start, "end": end}
                })))
                .await
                .unwrap_err();
            assert!(matches!(
                crate::error::request_error(&err),
                Some(RequestError::Invalid(_))
            ));
        }
        assert_eq!(backend.search_count(), searches);
    }

    #[tokio::test]
    async fn test_fill_range_without_matches() {
        let backend = Arc::new(InMemorySearchBackend::new());
        backend
            .create_index("articles", &json!({}), &json!({}))
            .await
            .unwrap();
        let engine = engine(backend);

        let result = engine
            .generate(&spec(json!({
                "index": "articles",
                "facet_by": "year",
                "range_filter": {"field": "year", "start": 2012, "end": 2023},
                "fill_range": true,
                "fill_range_value": 0,
                "include_all": true
            })))
            .await
            .unwrap();

        assert_eq!(result.series.len(), 1);
        let series = &result.series[0];
        assert_eq!(series.items.len(), 12);
        assert_eq!(series.items.first().map(String::as_str), Some("2012"));
        assert_eq!(series.items.last().map(String::as_str), Some("2023"));
        assert!(series.counts.iter().all(|c| *c == 0));
    }

    #[tokio::test]
    async fn test_empty_series_dropped_unless_include_all() {
        let backend = seeded().await;
        let engine = engine(backend);
        let result = engine
            .generate(&spec(json!({
                "index": "articles",
                "facet_by": "year",
                "filters": [{"states": "MG"}, {"states": "SP"}],
                "range_filter": {"field": "year", "start": 2012, "end": 2016}
            })))
            .await
            .unwrap();
        assert_eq!(result.series.len(), 1);
        assert_eq!(result.series[0].slug, "sp");
        assert_eq!(result.series[0].counts, vec![0, 1, 0, 2, 0]);
    }

    #[tokio::test]
    async fn test_context_by_generates_series_per_combination() {
        let backend = seeded().await;
        let engine = engine(backend);
        let result = engine
            .generate(&spec(json!({
                "title": "States X License",
                "index": "articles",
                "facet_by": "year",
                "context_by": ["states", "license"],
                "default_filter": {"record_type": "article"},
                "range_filter": {"filter_name": "year", "range": {"start": 2013, "end": 2015}}
            })))
            .await
            .unwrap();

        let slugs: Vec<&str> = result.series.iter().map(|s| s.slug.as_str()).collect();
        assert_eq!(slugs, vec!["rj-cc-by", "sp-cc-by", "sp-cc-by-nc"]);
        assert!(result.series.iter().all(|s| s.items.len() == 3));
        let sp = &result.series[1];
        assert_eq!(sp.counts, vec![1, 0, 0]);

        let chart = result.to_chart();
        assert_eq!(chart["keys"], json!([2013, 2014, 2015]));
        assert_eq!(chart["series"][1]["stack"], "cc by");
        assert_eq!(chart["series"][1]["type"], "bar");
        assert_eq!(chart["series"][1]["data"], json!([1, 0, 0]));
    }

    #[tokio::test]
    async fn test_fill_from_observed_keys_without_range() {
        let backend = seeded().await;
        let engine = engine(backend);
        let result = engine
            .generate(&spec(json!({
                "index": "articles",
                "facet_by": "year",
                "filters": [{"record_type": "book"}]
            })))
            .await
            .unwrap();
        assert_eq!(result.series[0].items, vec!["2013", "2015"]);
        assert_eq!(result.series[0].counts, vec![0, 1]);

        let chart = result.to_chart();
        assert_eq!(chart["keys"], json!(["2013", "2015"]));
        assert_eq!(chart["series"][0]["stack"], "total");
    }

    #[tokio::test]
    async fn test_unknown_data_source_is_an_error() {
        let engine = engine(Arc::new(InMemorySearchBackend::new()));
        let err = engine
            .generate(&spec(json!({"data_source": "nope", "facet_by": "year"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
