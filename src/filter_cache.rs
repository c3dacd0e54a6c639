//! In-process TTL cache for facet responses.
//!
//! Keys are SHA-256 fingerprints of a canonical JSON rendering of the
//! request shape, so equal requests hit the same entry regardless of the
//! order in which filters or field lists were given. Expired entries are
//! dropped when they are looked up.

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Request shape that determines a facet response.
#[derive(Debug, Clone)]
pub struct FilterCacheKey<'a> {
    pub data_source: &'a str,
    pub index_name: &'a str,
    pub include_fields: &'a [String],
    pub exclude_fields: &'a [String],
    pub q: Option<&'a str>,
    pub filters: &'a BTreeMap<String, Vec<Value>>,
    /// Effective operator per selected field; fields using the default
    /// `or` are left out.
    pub operators: &'a BTreeMap<String, String>,
    pub registry_fingerprint: Value,
}

fn sorted(fields: &[String]) -> Vec<&String> {
    let mut out: Vec<&String> = fields.iter().collect();
    out.sort();
    out.dedup();
    out
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Filters as `{field: [sorted values]}`, dropping null and empty values
/// and fields left without any.
pub fn normalize_filters(filters: &BTreeMap<String, Vec<Value>>) -> BTreeMap<&str, Vec<String>> {
    filters
        .iter()
        .filter_map(|(field, values)| {
            let mut normalized: Vec<String> = values
                .iter()
                .filter(|v| !v.is_null())
                .map(value_text)
                .filter(|v| !v.is_empty())
                .collect();
            normalized.sort();
            normalized.dedup();
            if normalized.is_empty() {
                None
            } else {
                Some((field.as_str(), normalized))
            }
        })
        .collect()
}

impl FilterCacheKey<'_> {
    pub fn fingerprint(&self) -> String {
        // serde_json maps serialize with sorted keys.
        let canonical = json!({
            "data_source": self.data_source,
            "index_name": self.index_name,
            "include": sorted(self.include_fields),
            "exclude": sorted(self.exclude_fields),
            "q": self.q.map(str::trim).filter(|q| !q.is_empty()),
            "filters": normalize_filters(self.filters),
            "operators": self.operators,
            "registry": self.registry_fingerprint,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

struct CacheEntry {
    data: Value,
    cached_at: Instant,
}

pub struct FilterCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl FilterCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str, force_refresh: bool) -> Option<Value> {
        if force_refresh {
            return None;
        }
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<Value> {
        let mut entries = self.entries.lock().ok()?;
        let fresh = match entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.cached_at) <= self.ttl,
            None => return None,
        };
        if fresh {
            entries.get(key).map(|e| e.data.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    pub fn insert(&self, key: String, data: Value) {
        self.insert_at(key, data, Instant::now());
    }

    fn insert_at(&self, key: String, data: Value, cached_at: Instant) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, CacheEntry { data, cached_at });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filters(pairs: &[(&str, Vec<Value>)]) -> BTreeMap<String, Vec<Value>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    static NO_OPERATORS: BTreeMap<String, String> = BTreeMap::new();

    fn key<'a>(
        filters: &'a BTreeMap<String, Vec<Value>>,
        include: &'a [String],
    ) -> FilterCacheKey<'a> {
        FilterCacheKey {
            data_source: "scientific",
            index_name: "bronze_works",
            include_fields: include,
            exclude_fields: &[],
            q: None,
            filters,
            operators: &NO_OPERATORS,
            registry_fingerprint: json!({"year": ["publication_year"]}),
        }
    }

    #[test]
    fn test_fingerprint_ignores_ordering() {
        let a = filters(&[("year", vec![json!("2024"), json!(2023)]), ("oa", vec![json!("gold")])]);
        let b = filters(&[("oa", vec![json!("gold"), Value::Null]), ("year", vec![json!(2023), json!("2024")])]);
        let include_a = vec!["year".to_string(), "oa".to_string()];
        let include_b = vec!["oa".to_string(), "year".to_string()];
        assert_eq!(key(&a, &include_a).fingerprint(), key(&b, &include_b).fingerprint());

        let c = filters(&[("year", vec![json!("2024")])]);
        assert_ne!(key(&a, &include_a).fingerprint(), key(&c, &include_a).fingerprint());
    }

    #[test]
    fn test_operators_change_fingerprint() {
        let f = filters(&[("oa", vec![json!("gold"), json!("green")])]);
        let and: BTreeMap<String, String> = [("oa".to_string(), "and".to_string())].into();
        let with_and = FilterCacheKey {
            operators: &and,
            ..key(&f, &[])
        };
        assert_ne!(with_and.fingerprint(), key(&f, &[]).fingerprint());
    }

    #[test]
    fn test_empty_filter_values_are_dropped() {
        let with_empty = filters(&[("year", vec![json!("")]), ("oa", vec![])]);
        let none = filters(&[]);
        assert_eq!(key(&with_empty, &[]).fingerprint(), key(&none, &[]).fingerprint());
    }

    #[test]
    fn test_ttl_expiry_removes_entry() {
        let cache = FilterCache::new(Duration::from_secs(300));
        let start = Instant::now();
        cache.insert_at("k".to_string(), json!({"year": []}), start);

        assert!(cache.get_at("k", start + Duration::from_secs(299)).is_some());
        assert_eq!(cache.len(), 1);
        assert!(cache.get_at("k", start + Duration::from_secs(301)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_force_refresh_bypasses() {
        let cache = FilterCache::new(Duration::from_secs(300));
        cache.insert("k".to_string(), json!(1));
        assert!(cache.get("k", true).is_none());
        assert_eq!(cache.get("k", false), Some(json!(1)));
    }
}
