//! Query-body builders and response parsers for the faceted gateway.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::config::FieldConfig;
use crate::search_backend::{agg_buckets, bucket_count, bucket_key};

pub const KEYWORD_SUFFIX: &str = ".keyword";

/// Default bucket count for suggestion aggregations.
pub const SUGGESTION_SIZE: u32 = 20;

/// Exact-match variant of `name`: keyword-typed and already-suffixed
/// fields are used as-is, anything else gets `.keyword`.
pub fn keyword_field(name: &str, field_type: Option<&str>) -> String {
    if name.ends_with(KEYWORD_SUFFIX) || field_type == Some("keyword") {
        name.to_string()
    } else {
        format!("{}{}", name, KEYWORD_SUFFIX)
    }
}

pub fn aggregation_field(field: &FieldConfig) -> String {
    keyword_field(&field.index_field_name, field.field_type.as_deref())
}

/// `{"terms": {field, size, order?}}` for one registered field.
pub fn terms_agg(field: &FieldConfig) -> Value {
    let mut terms = Map::new();
    terms.insert("field".to_string(), Value::from(aggregation_field(field)));
    terms.insert("size".to_string(), Value::from(field.size));
    if let Some(order) = &field.order {
        terms.insert("order".to_string(), order.clone());
    }
    json!({ "terms": terms })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operator {
    And,
    #[default]
    Or,
}

impl FromStr for Operator {
    type Err = std::convert::Infallible;

    /// Anything but `and` is `or`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(if s.trim().eq_ignore_ascii_case("and") {
            Operator::And
        } else {
            Operator::Or
        })
    }
}

/// Clauses for one selected field. `and` requires every value (one
/// `term` per value); `or` accepts any (a single `terms`).
pub fn field_filter_clauses(field: &str, values: &[Value], operator: Operator) -> Vec<Value> {
    if values.is_empty() {
        return Vec::new();
    }
    match operator {
        Operator::And => values
            .iter()
            .map(|v| json!({ "term": { field: v } }))
            .collect(),
        Operator::Or => vec![json!({ "terms": { field: values } })],
    }
}

/// Best-fields free-text query over `fields` (which may carry `^boost`).
pub fn text_query(q: &str, fields: &[String]) -> Value {
    json!({
        "multi_match": {
            "query": q,
            "type": "best_fields",
            "fields": fields,
        }
    })
}

/// `bool.filter` of `clauses`, or `match_all` when there are none.
pub fn filter_query(clauses: Vec<Value>) -> Value {
    if clauses.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "filter": clauses } })
    }
}

/// Search-as-you-type body over a `search_as_you_type` mapped field.
pub fn search_as_you_type_body(field_name: &str, query: &str, size: u32) -> Value {
    let base = field_name.trim_end_matches(KEYWORD_SUFFIX);
    json!({
        "size": 0,
        "query": {
            "multi_match": {
                "query": query,
                "type": "bool_prefix",
                "fields": [base, format!("{}._2gram", base), format!("{}._3gram", base)],
            }
        },
        "aggs": {
            "unique_items": { "terms": { "field": format!("{}{}", base, KEYWORD_SUFFIX), "size": size } }
        }
    })
}

/// Prefix suggestion body for plain text fields.
pub fn term_search_body(field_name: &str, query: &str, size: u32) -> Value {
    let base = field_name.trim_end_matches(KEYWORD_SUFFIX);
    json!({
        "size": 0,
        "query": { "match_phrase_prefix": { base: query } },
        "aggs": {
            "unique_items": { "terms": { "field": format!("{}{}", base, KEYWORD_SUFFIX), "size": size } }
        }
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacetBucket {
    pub key: String,
    pub count: u64,
}

pub type Facets = BTreeMap<String, Vec<FacetBucket>>;

/// `{field: [{key, count}]}` for each of `names` present in `aggs`.
pub fn parse_facets<'a>(aggs: &Value, names: impl IntoIterator<Item = &'a String>) -> Facets {
    names
        .into_iter()
        .filter(|name| aggs.get(name.as_str()).is_some())
        .map(|name| {
            let buckets = agg_buckets(aggs, name)
                .iter()
                .map(|b| FacetBucket {
                    key: bucket_key(b),
                    count: bucket_count(b),
                })
                .collect();
            (name.clone(), buckets)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    pub id: String,
    pub text: String,
}

pub fn parse_suggestions(response: &Value) -> Vec<Suggestion> {
    agg_buckets(&response["aggregations"], "unique_items")
        .iter()
        .map(|b| {
            let key = bucket_key(b);
            Suggestion {
                id: key.clone(),
                text: key,
            }
        })
        .collect()
}
