//! In-memory search backend.
//!
//! Keeps indices in a map and evaluates the part of the query DSL the
//! pipeline emits: `match_all`, `term`, `terms`, `range`, `exists`, `ids`,
//! `bool`, `match`, `match_phrase_prefix`, `multi_match`, and `prefix`
//! queries; `terms`, `filter`, and `cardinality` aggregations; `post_filter`,
//! `sort` on `_score` / `_doc` / fields, `search_after`, `from` / `size`.
//!
//! Sub-fields produced by analyzers (`.keyword`, `._2gram`, `._3gram`) are
//! read from their parent field. Reindex copies matching documents as-is;
//! transformation scripts are recorded but not executed.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::SearchBackend;
use crate::error::HarvestError;

#[derive(Default)]
pub struct InMemorySearchBackend {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    indices: BTreeMap<String, MemIndex>,
    next_seq: u64,
    failing: HashSet<String>,
    reindex_requests: Vec<Value>,
    search_count: usize,
}

struct MemIndex {
    settings: Value,
    mappings: Value,
    docs: HashMap<String, StoredDoc>,
}

impl MemIndex {
    fn new(settings: Value, mappings: Value) -> Self {
        Self {
            settings,
            mappings,
            docs: HashMap::new(),
        }
    }
}

#[derive(Clone)]
struct StoredDoc {
    seq: u64,
    source: Value,
}

#[derive(Clone, Copy)]
struct Hit<'a> {
    id: &'a str,
    seq: u64,
    source: &'a Value,
    score: f64,
}

impl InMemorySearchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory search state poisoned"))
    }

    /// Makes every `index` call against `index` fail until cleared.
    pub fn fail_indexing(&self, index: &str) {
        if let Ok(mut state) = self.state() {
            state.failing.insert(index.to_string());
        }
    }

    pub fn clear_failures(&self) {
        if let Ok(mut state) = self.state() {
            state.failing.clear();
        }
    }

    pub fn document(&self, index: &str, id: &str) -> Option<Value> {
        let state = self.state().ok()?;
        state
            .indices
            .get(index)
            .and_then(|i| i.docs.get(id))
            .map(|d| d.source.clone())
    }

    pub fn doc_count(&self, index: &str) -> usize {
        self.state()
            .ok()
            .and_then(|s| s.indices.get(index).map(|i| i.docs.len()))
            .unwrap_or(0)
    }

    /// `(settings, mappings)` the index was created with.
    pub fn index_definition(&self, index: &str) -> Option<(Value, Value)> {
        let state = self.state().ok()?;
        state
            .indices
            .get(index)
            .map(|i| (i.settings.clone(), i.mappings.clone()))
    }

    pub fn reindex_requests(&self) -> Vec<Value> {
        self.state()
            .map(|s| s.reindex_requests.clone())
            .unwrap_or_default()
    }

    pub fn search_count(&self) -> usize {
        self.state().map(|s| s.search_count).unwrap_or(0)
    }
}

#[async_trait]
impl SearchBackend for InMemorySearchBackend {
    async fn index(&self, index: &str, id: &str, body: &Value, _refresh: bool) -> Result<()> {
        let mut state = self.state()?;
        if state.failing.contains(index) {
            return Err(HarvestError::Projection {
                index: index.to_string(),
                id: id.to_string(),
                message: "injected failure".to_string(),
            }
            .into());
        }
        state.next_seq += 1;
        let seq = state.next_seq;
        let idx = state
            .indices
            .entry(index.to_string())
            .or_insert_with(|| MemIndex::new(json!({}), json!({})));
        // Replacing a document keeps its position in `_doc` order.
        let seq = idx.docs.get(id).map(|d| d.seq).unwrap_or(seq);
        idx.docs.insert(
            id.to_string(),
            StoredDoc {
                seq,
                source: body.clone(),
            },
        );
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool> {
        let mut state = self.state()?;
        Ok(state
            .indices
            .get_mut(index)
            .map(|i| i.docs.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn exists(&self, index: &str) -> Result<bool> {
        Ok(self.state()?.indices.contains_key(index))
    }

    async fn create_index(&self, index: &str, settings: &Value, mappings: &Value) -> Result<()> {
        let mut state = self.state()?;
        if state.indices.contains_key(index) {
            bail!("resource_already_exists_exception: index [{}] already exists", index);
        }
        state.indices.insert(
            index.to_string(),
            MemIndex::new(settings.clone(), mappings.clone()),
        );
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        self.state()?.indices.remove(index);
        Ok(())
    }

    async fn search(&self, index: &str, body: &Value) -> Result<Value> {
        let mut state = self.state()?;
        state.search_count += 1;
        let idx = state
            .indices
            .get(index)
            .ok_or_else(|| anyhow!("index_not_found_exception: no such index [{}]", index))?;
        run_search(index, idx, body)
    }

    async fn reindex(&self, body: &Value, _refresh: bool) -> Result<Value> {
        let mut state = self.state()?;
        state.reindex_requests.push(body.clone());

        let source_index = body["source"]["index"]
            .as_str()
            .ok_or_else(|| anyhow!("reindex body missing source.index"))?;
        let dest_index = body["dest"]["index"]
            .as_str()
            .ok_or_else(|| anyhow!("reindex body missing dest.index"))?
            .to_string();
        let query = body["source"]
            .get("query")
            .cloned()
            .unwrap_or_else(|| json!({"match_all": {}}));

        let source = state
            .indices
            .get(source_index)
            .ok_or_else(|| anyhow!("index_not_found_exception: no such index [{}]", source_index))?;
        let mut selected: Vec<(String, StoredDoc)> = Vec::new();
        for (id, doc) in &source.docs {
            if eval(&query, &doc.source, id)?.is_some() {
                selected.push((id.clone(), doc.clone()));
            }
        }
        selected.sort_by_key(|(_, d)| d.seq);

        let dest = state
            .indices
            .entry(dest_index)
            .or_insert_with(|| MemIndex::new(json!({}), json!({})));
        let (mut created, mut updated) = (0u64, 0u64);
        for (id, doc) in &selected {
            let previous = dest.docs.insert(id.clone(), doc.clone());
            if previous.is_some() {
                updated += 1;
            } else {
                created += 1;
            }
        }

        Ok(json!({
            "took": 0,
            "timed_out": false,
            "total": selected.len(),
            "created": created,
            "updated": updated,
            "deleted": 0,
            "failures": []
        }))
    }

    async fn refresh(&self, _index: &str) -> Result<()> {
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        Ok(true)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Search execution
// ═══════════════════════════════════════════════════════════════════════

struct SortKey {
    field: String,
    desc: bool,
}

fn parse_sort(body: &Value) -> Result<Vec<SortKey>> {
    let spec = match body.get("sort") {
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
        None => {
            return Ok(vec![
                SortKey {
                    field: "_score".to_string(),
                    desc: true,
                },
                SortKey {
                    field: "_doc".to_string(),
                    desc: false,
                },
            ])
        }
    };

    spec.iter()
        .map(|item| match item {
            Value::String(field) => Ok(SortKey {
                desc: field == "_score",
                field: field.clone(),
            }),
            Value::Object(map) => {
                let (field, order) = map
                    .iter()
                    .next()
                    .ok_or_else(|| anyhow!("empty sort clause"))?;
                let order = order
                    .as_str()
                    .or_else(|| order["order"].as_str())
                    .unwrap_or(if field == "_score" { "desc" } else { "asc" });
                Ok(SortKey {
                    field: field.clone(),
                    desc: order == "desc",
                })
            }
            other => bail!("unsupported sort clause {}", other),
        })
        .collect()
}

fn sort_values(keys: &[SortKey], hit: &Hit) -> Vec<Value> {
    keys.iter()
        .map(|k| match k.field.as_str() {
            "_score" => json!(hit.score),
            "_doc" => json!(hit.seq),
            field => field_values(hit.source, field)
                .into_iter()
                .next()
                .cloned()
                .unwrap_or(Value::Null),
        })
        .collect()
}

fn compare_sort(keys: &[SortKey], a: &[Value], b: &[Value]) -> Ordering {
    for (i, key) in keys.iter().enumerate() {
        let ord = cmp_values(&a[i], &b[i]);
        let ord = if key.desc { ord.reverse() } else { ord };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

fn run_search(index_name: &str, index: &MemIndex, body: &Value) -> Result<Value> {
    let query = body
        .get("query")
        .cloned()
        .unwrap_or_else(|| json!({"match_all": {}}));

    let mut matched: Vec<Hit> = Vec::new();
    for (id, doc) in &index.docs {
        if let Some(score) = eval(&query, &doc.source, id)? {
            matched.push(Hit {
                id,
                seq: doc.seq,
                source: &doc.source,
                score,
            });
        }
    }
    matched.sort_by_key(|h| h.seq);

    let aggregations = match body.get("aggs").or_else(|| body.get("aggregations")) {
        Some(aggs) => Some(run_aggs(aggs, &matched)?),
        None => None,
    };

    if let Some(post_filter) = body.get("post_filter") {
        let mut kept = Vec::with_capacity(matched.len());
        for hit in matched {
            if eval(post_filter, hit.source, hit.id)?.is_some() {
                kept.push(hit);
            }
        }
        matched = kept;
    }
    let total = matched.len();

    let keys = parse_sort(body)?;
    let mut sorted: Vec<(Vec<Value>, Hit)> = matched
        .into_iter()
        .map(|h| (sort_values(&keys, &h), h))
        .collect();
    sorted.sort_by(|a, b| compare_sort(&keys, &a.0, &b.0));

    if let Some(after) = body.get("search_after").and_then(|v| v.as_array()) {
        if after.len() != keys.len() {
            bail!(
                "search_after has {} values but sort has {} keys",
                after.len(),
                keys.len()
            );
        }
        sorted.retain(|(values, _)| compare_sort(&keys, values, after) == Ordering::Greater);
    }

    let from = if body.get("search_after").is_some() {
        0
    } else {
        body["from"].as_u64().unwrap_or(0) as usize
    };
    let size = body["size"].as_u64().unwrap_or(10) as usize;

    let max_score = sorted
        .iter()
        .map(|(_, h)| h.score)
        .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));

    let hits: Vec<Value> = sorted
        .into_iter()
        .skip(from)
        .take(size)
        .map(|(values, h)| {
            json!({
                "_index": index_name,
                "_id": h.id,
                "_score": h.score,
                "_source": h.source,
                "sort": values,
            })
        })
        .collect();

    let mut response = json!({
        "took": 0,
        "timed_out": false,
        "hits": {
            "total": {"value": total, "relation": "eq"},
            "max_score": max_score,
            "hits": hits,
        }
    });
    if let Some(aggs) = aggregations {
        response["aggregations"] = aggs;
    }
    Ok(response)
}

fn run_aggs(aggs: &Value, docs: &[Hit]) -> Result<Value> {
    let specs = aggs
        .as_object()
        .ok_or_else(|| anyhow!("aggregations must be an object"))?;
    let mut out = Map::new();

    for (name, spec) in specs {
        let sub_aggs = spec.get("aggs").or_else(|| spec.get("aggregations"));

        let result = if let Some(terms) = spec.get("terms") {
            terms_agg(terms, sub_aggs, docs)?
        } else if let Some(filter) = spec.get("filter") {
            let mut subset: Vec<Hit> = Vec::new();
            for hit in docs {
                if eval(filter, hit.source, hit.id)?.is_some() {
                    subset.push(*hit);
                }
            }
            let mut obj = Map::new();
            obj.insert("doc_count".to_string(), json!(subset.len()));
            if let Some(sub) = sub_aggs {
                if let Value::Object(inner) = run_aggs(sub, &subset)? {
                    obj.extend(inner);
                }
            }
            Value::Object(obj)
        } else if let Some(card) = spec.get("cardinality") {
            let field = card["field"]
                .as_str()
                .ok_or_else(|| anyhow!("cardinality aggregation needs a field"))?;
            let distinct: HashSet<String> = docs
                .iter()
                .flat_map(|h| field_values(h.source, field))
                .map(value_key)
                .collect();
            json!({ "value": distinct.len() })
        } else {
            bail!("unsupported aggregation '{}': {}", name, spec);
        };

        out.insert(name.clone(), result);
    }

    Ok(Value::Object(out))
}

fn terms_agg(terms: &Value, sub_aggs: Option<&Value>, docs: &[Hit]) -> Result<Value> {
    let field = terms["field"]
        .as_str()
        .ok_or_else(|| anyhow!("terms aggregation needs a field"))?;
    let size = terms["size"].as_u64().unwrap_or(10) as usize;

    // key repr -> (key value, member doc positions)
    let mut buckets: HashMap<String, (Value, Vec<usize>)> = HashMap::new();
    for (pos, hit) in docs.iter().enumerate() {
        let mut seen = HashSet::new();
        for value in field_values(hit.source, field) {
            let key = value_key(value);
            if seen.insert(key.clone()) {
                buckets
                    .entry(key)
                    .or_insert_with(|| (value.clone(), Vec::new()))
                    .1
                    .push(pos);
            }
        }
    }

    let mut ordered: Vec<(Value, Vec<usize>)> = buckets.into_values().collect();
    let order = terms.get("order");
    let (by_key, desc) = match order.and_then(|o| o.as_object()).and_then(|o| o.iter().next()) {
        Some((k, v)) => (k == "_key", v.as_str() == Some("desc")),
        None => (false, true),
    };
    ordered.sort_by(|a, b| {
        let primary = if by_key {
            cmp_values(&a.0, &b.0)
        } else {
            a.1.len().cmp(&b.1.len())
        };
        let primary = if desc { primary.reverse() } else { primary };
        primary.then_with(|| cmp_values(&a.0, &b.0))
    });

    let other: usize = ordered.iter().skip(size).map(|(_, d)| d.len()).sum();
    let mut out = Vec::new();
    for (key, members) in ordered.into_iter().take(size) {
        let mut bucket = Map::new();
        bucket.insert("key".to_string(), key);
        bucket.insert("doc_count".to_string(), json!(members.len()));
        if let Some(sub) = sub_aggs {
            let subset: Vec<Hit> = members.iter().map(|&i| docs[i]).collect();
            if let Value::Object(inner) = run_aggs(sub, &subset)? {
                bucket.extend(inner);
            }
        }
        out.push(Value::Object(bucket));
    }

    Ok(json!({
        "doc_count_error_upper_bound": 0,
        "sum_other_doc_count": other,
        "buckets": out,
    }))
}

// ═══════════════════════════════════════════════════════════════════════
// Query evaluation
// ═══════════════════════════════════════════════════════════════════════

/// Returns `Some(score)` when `doc` matches `query`.
fn eval(query: &Value, doc: &Value, id: &str) -> Result<Option<f64>> {
    let obj = query
        .as_object()
        .ok_or_else(|| anyhow!("query clause must be an object: {}", query))?;
    let (kind, body) = obj
        .iter()
        .next()
        .ok_or_else(|| anyhow!("empty query clause"))?;

    let matched = match kind.as_str() {
        "match_all" => Some(1.0),
        "match_none" => None,
        "term" => {
            let (field, value) = field_clause(body)?;
            let value = value.get("value").unwrap_or(value);
            bool_score(field_matches(doc, id, field, |v| value_eq(v, value)))
        }
        "terms" => {
            let (field, values) = field_clause(body)?;
            let values = values
                .as_array()
                .ok_or_else(|| anyhow!("terms clause on '{}' needs an array", field))?;
            bool_score(field_matches(doc, id, field, |v| {
                values.iter().any(|q| value_eq(v, q))
            }))
        }
        "ids" => {
            let values = body["values"].as_array().cloned().unwrap_or_default();
            bool_score(values.iter().any(|v| v.as_str() == Some(id)))
        }
        "range" => {
            let (field, bounds) = field_clause(body)?;
            bool_score(field_matches(doc, id, field, |v| in_range(v, bounds)))
        }
        "exists" => {
            let field = body["field"]
                .as_str()
                .ok_or_else(|| anyhow!("exists clause needs a field"))?;
            bool_score(!field_values(doc, field).is_empty())
        }
        "prefix" => {
            let (field, value) = field_clause(body)?;
            let prefix = value
                .get("value")
                .unwrap_or(value)
                .as_str()
                .unwrap_or_default()
                .to_lowercase();
            bool_score(field_matches(doc, id, field, |v| {
                value_text(v).to_lowercase().starts_with(&prefix)
            }))
        }
        "match" | "match_phrase" | "match_phrase_prefix" => {
            let (field, value) = field_clause(body)?;
            let text = value.get("query").unwrap_or(value);
            let text = value_text(text);
            let mode = match kind.as_str() {
                "match" => TextMode::Any,
                "match_phrase" => TextMode::All,
                _ => TextMode::Prefix,
            };
            let score = field_values(doc, field)
                .into_iter()
                .map(|v| text_score(&value_text(v), &text, mode))
                .fold(0.0, f64::max);
            (score > 0.0).then_some(score)
        }
        "multi_match" => {
            let text = value_text(&body["query"]);
            let mode = match body["type"].as_str() {
                Some("bool_prefix") | Some("phrase_prefix") => TextMode::Prefix,
                Some("phrase") => TextMode::All,
                _ => TextMode::Any,
            };
            let fields: Vec<String> = body["fields"]
                .as_array()
                .map(|f| {
                    f.iter()
                        .filter_map(|x| x.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default();
            let mut best: f64 = 0.0;
            for spec in &fields {
                let (field, boost) = split_boost(spec);
                let score = field_values(doc, field)
                    .into_iter()
                    .map(|v| text_score(&value_text(v), &text, mode))
                    .fold(0.0, f64::max);
                best = best.max(score * boost);
            }
            (best > 0.0).then_some(best)
        }
        "bool" => eval_bool(body, doc, id)?,
        other => bail!("unsupported query clause '{}'", other),
    };

    Ok(matched)
}

fn eval_bool(body: &Value, doc: &Value, id: &str) -> Result<Option<f64>> {
    let clauses = |name: &str| -> Vec<Value> {
        match body.get(name) {
            Some(Value::Array(items)) => items.clone(),
            Some(v @ Value::Object(_)) => vec![v.clone()],
            _ => Vec::new(),
        }
    };

    let must = clauses("must");
    let filter = clauses("filter");
    let should = clauses("should");
    let must_not = clauses("must_not");

    let mut score = 0.0;
    for clause in &must {
        match eval(clause, doc, id)? {
            Some(s) => score += s,
            None => return Ok(None),
        }
    }
    for clause in &filter {
        if eval(clause, doc, id)?.is_none() {
            return Ok(None);
        }
    }
    for clause in &must_not {
        if eval(clause, doc, id)?.is_some() {
            return Ok(None);
        }
    }

    let min_should = body["minimum_should_match"]
        .as_u64()
        .map(|n| n as usize)
        .unwrap_or(if must.is_empty() && filter.is_empty() && !should.is_empty() {
            1
        } else {
            0
        });
    let mut should_hits = 0;
    for clause in &should {
        if let Some(s) = eval(clause, doc, id)? {
            should_hits += 1;
            score += s;
        }
    }
    if should_hits < min_should {
        return Ok(None);
    }

    Ok(Some(if score > 0.0 { score } else { 1.0 }))
}

#[derive(Clone, Copy)]
enum TextMode {
    /// Any query token matches a word.
    Any,
    /// Every query token matches a word.
    All,
    /// Every token matches; the last may be a word prefix.
    Prefix,
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

fn text_score(field_text: &str, query: &str, mode: TextMode) -> f64 {
    let field_words = words(field_text);
    let tokens = words(query);
    if tokens.is_empty() {
        return 0.0;
    }
    let last = tokens.len() - 1;
    let hits = tokens
        .iter()
        .enumerate()
        .filter(|(i, t)| {
            field_words.iter().any(|w| match mode {
                TextMode::Prefix if *i == last => w.starts_with(t.as_str()),
                _ => w == *t,
            })
        })
        .count();
    match mode {
        TextMode::Any => hits as f64,
        TextMode::All | TextMode::Prefix => {
            if hits == tokens.len() {
                hits as f64
            } else {
                0.0
            }
        }
    }
}

fn split_boost(spec: &str) -> (&str, f64) {
    match spec.split_once('^') {
        Some((field, boost)) => (field, boost.parse().unwrap_or(1.0)),
        None => (spec, 1.0),
    }
}

fn bool_score(matched: bool) -> Option<f64> {
    matched.then_some(1.0)
}

/// Splits `{ "<field>": <value> }`, ignoring a sibling `boost`.
fn field_clause(body: &Value) -> Result<(&str, &Value)> {
    body.as_object()
        .and_then(|obj| obj.iter().find(|(k, _)| k.as_str() != "boost"))
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| anyhow!("malformed field clause: {}", body))
}

fn field_matches(doc: &Value, id: &str, field: &str, pred: impl Fn(&Value) -> bool) -> bool {
    if field == "_id" {
        return pred(&Value::String(id.to_string()));
    }
    field_values(doc, field).into_iter().any(pred)
}

const ANALYZER_SUFFIXES: [&str; 4] = ["keyword", "_2gram", "_3gram", "_index_prefix"];

/// Leaf values at a dotted path, flattening arrays at every level.
fn field_values<'a>(doc: &'a Value, path: &str) -> Vec<&'a Value> {
    let mut parts: Vec<&str> = path.split('.').collect();
    if parts.len() > 1 {
        if let Some(last) = parts.last() {
            if ANALYZER_SUFFIXES.contains(last) {
                parts.pop();
            }
        }
    }
    let mut out = Vec::new();
    collect(doc, &parts, &mut out);
    out
}

fn collect<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    match value {
        Value::Array(items) => {
            for item in items {
                collect(item, parts, out);
            }
        }
        Value::Null => {}
        _ if parts.is_empty() => out.push(value),
        Value::Object(map) => {
            if let Some(next) = map.get(parts[0]) {
                collect(next, &parts[1..], out);
            }
        }
        _ => {}
    }
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn value_key(v: &Value) -> String {
    match v {
        Value::Number(n) => n
            .as_f64()
            .map(|f| f.to_string())
            .unwrap_or_else(|| n.to_string()),
        other => value_text(other),
    }
}

fn value_eq(doc_value: &Value, query_value: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(doc_value), as_number(query_value)) {
        return a == b;
    }
    value_text(doc_value) == value_text(query_value)
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn in_range(v: &Value, bounds: &Value) -> bool {
    let check = |op: &str, pred: fn(Ordering) -> bool| -> bool {
        match bounds.get(op) {
            Some(bound) if !bound.is_null() => pred(cmp_values(v, bound)),
            _ => true,
        }
    };
    check("gte", |o| o != Ordering::Less)
        && check("gt", |o| o == Ordering::Greater)
        && check("lte", |o| o != Ordering::Greater)
        && check("lt", |o| o == Ordering::Less)
}

/// Numbers (and numeric strings) compare numerically; nulls sort last.
fn cmp_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => value_text(a).cmp(&value_text(b)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> InMemorySearchBackend {
        let backend = InMemorySearchBackend::new();
        let docs = [
            ("w1", json!({"title": "Open science in Brazil", "year": 2024, "oa": true, "authors": [{"name": "Silva"}]})),
            ("w2", json!({"title": "Closed data practices", "year": 2023, "oa": false, "authors": [{"name": "Souza"}]})),
            ("w3", json!({"title": "Open access journals", "year": 2023, "oa": true, "authors": [{"name": "Silva"}, {"name": "Lima"}]})),
        ];
        for (id, doc) in docs {
            backend.index("works", id, &doc, false).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn test_term_and_bool_filters() {
        let backend = seeded().await;
        let body = json!({
            "query": {"bool": {"filter": [
                {"term": {"oa": true}},
                {"terms": {"year.keyword": ["2023"]}}
            ]}}
        });
        let res = backend.search("works", &body).await.unwrap();
        assert_eq!(super::super::total_hits(&res), 1);
        assert_eq!(res["hits"]["hits"][0]["_id"], "w3");
    }

    #[tokio::test]
    async fn test_nested_array_paths() {
        let backend = seeded().await;
        let body = json!({"query": {"term": {"authors.name": "Silva"}}, "sort": ["_doc"]});
        let res = backend.search("works", &body).await.unwrap();
        let ids: Vec<&str> = super::super::hits(&res)
            .iter()
            .filter_map(|h| h["_id"].as_str())
            .collect();
        assert_eq!(ids, vec!["w1", "w3"]);
    }

    #[tokio::test]
    async fn test_terms_agg_counts_and_post_filter() {
        let backend = seeded().await;
        let body = json!({
            "size": 10,
            "post_filter": {"term": {"year": 2024}},
            "aggs": {"year": {"terms": {"field": "year", "order": {"_key": "asc"}}}}
        });
        let res = backend.search("works", &body).await.unwrap();
        // post_filter narrows hits, not aggregations
        assert_eq!(super::super::total_hits(&res), 1);
        let buckets = res["aggregations"]["year"]["buckets"].as_array().unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0]["key"], 2023);
        assert_eq!(buckets[0]["doc_count"], 2);
    }

    #[tokio::test]
    async fn test_search_after_pages_in_doc_order() {
        let backend = seeded().await;
        let first = backend
            .search("works", &json!({"size": 2, "sort": ["_doc"]}))
            .await
            .unwrap();
        let last_sort = first["hits"]["hits"][1]["sort"].clone();
        let second = backend
            .search(
                "works",
                &json!({"size": 2, "sort": ["_doc"], "search_after": last_sort}),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = super::super::hits(&second)
            .iter()
            .filter_map(|h| h["_id"].as_str())
            .collect();
        assert_eq!(ids, vec!["w3"]);
    }

    #[tokio::test]
    async fn test_multi_match_prefix() {
        let backend = seeded().await;
        let body = json!({"query": {"multi_match": {
            "query": "open acc",
            "type": "bool_prefix",
            "fields": ["title", "title._2gram", "title._3gram"]
        }}});
        let res = backend.search("works", &body).await.unwrap();
        assert_eq!(super::super::total_hits(&res), 1);
        assert_eq!(res["hits"]["hits"][0]["_id"], "w3");
    }

    #[tokio::test]
    async fn test_range_and_reindex() {
        let backend = seeded().await;
        let res = backend
            .search(
                "works",
                &json!({"query": {"range": {"year": {"gte": 2024, "lte": 2030}}}}),
            )
            .await
            .unwrap();
        assert_eq!(super::super::total_hits(&res), 1);

        let out = backend
            .reindex(
                &json!({
                    "source": {"index": "works", "query": {"term": {"_id": "w2"}}},
                    "dest": {"index": "bronze"},
                    "script": {"lang": "painless", "source": ""}
                }),
                true,
            )
            .await
            .unwrap();
        assert_eq!(out["total"], 1);
        assert_eq!(out["created"], 1);
        assert_eq!(backend.doc_count("bronze"), 1);
        assert_eq!(backend.reindex_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_clause_is_an_error() {
        let backend = seeded().await;
        let err = backend
            .search("works", &json!({"query": {"geo_shape": {}}}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("geo_shape"));
    }
}
