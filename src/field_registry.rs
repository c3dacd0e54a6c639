//! Per-data-source field registry.
//!
//! Maps the logical field names used by clients (`publication_year`,
//! `open_access`) to index field names and facet parameters, as configured
//! under `[data_sources.<name>.fields]`.

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::BTreeMap;

use crate::config::{Config, DataSourceConfig, FieldConfig};
use crate::error::RequestError;

#[derive(Debug, Clone, Copy)]
pub struct FieldRegistry<'a> {
    name: &'a str,
    source: &'a DataSourceConfig,
}

impl<'a> FieldRegistry<'a> {
    pub fn new(name: &'a str, source: &'a DataSourceConfig) -> Self {
        Self { name, source }
    }

    pub fn lookup(config: &'a Config, data_source: &str) -> Result<Self> {
        let (name, source) = config
            .data_sources
            .get_key_value(data_source)
            .ok_or_else(|| RequestError::UnknownDataSource(data_source.to_string()))?;
        Ok(Self::new(name, source))
    }

    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn index_name(&self) -> &'a str {
        &self.source.index_name
    }

    pub fn text_fields(&self) -> &'a [String] {
        &self.source.text_fields
    }

    pub fn field(&self, logical: &str) -> Option<&'a FieldConfig> {
        self.source.fields.get(logical)
    }

    pub fn require_field(&self, logical: &str) -> Result<&'a FieldConfig> {
        self.field(logical).ok_or_else(|| {
            RequestError::UnknownField {
                data_source: self.name.to_string(),
                field: logical.to_string(),
            }
            .into()
        })
    }

    pub fn fields(&self) -> impl Iterator<Item = (&'a String, &'a FieldConfig)> {
        self.source.fields.iter()
    }

    /// Registered fields after applying `include` (when non-empty) and `exclude`.
    pub fn selected_fields(
        &self,
        include: &[String],
        exclude: &[String],
    ) -> Vec<(&'a String, &'a FieldConfig)> {
        self.fields()
            .filter(|(name, _)| include.is_empty() || include.contains(*name))
            .filter(|(name, _)| !exclude.contains(*name))
            .collect()
    }

    /// Deterministic description of the registry: `(name, index field,
    /// filter settings)` per field, in name order.
    pub fn fingerprint(&self) -> Value {
        let entries: BTreeMap<&String, Value> = self
            .fields()
            .map(|(name, field)| {
                (
                    name,
                    json!([
                        field.index_field_name,
                        field.field_type,
                        field.size,
                        field.order,
                        field.filter,
                    ]),
                )
            })
            .collect();
        json!(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        let mut config = Config::with_db_path(":memory:");
        let source: DataSourceConfig = toml::from_str(
            r#"
index_name = "bronze_works"

[fields.publication_year]
index_field_name = "publication_year"
field_type = "keyword"

[fields.open_access]
index_field_name = "open_access.is_oa"
"#,
        )
        .unwrap();
        config.data_sources.insert("scientific".to_string(), source);
        config
    }

    #[test]
    fn test_lookup_and_selection() {
        let config = config();
        let registry = FieldRegistry::lookup(&config, "scientific").unwrap();
        assert_eq!(registry.index_name(), "bronze_works");
        assert_eq!(
            registry.field("open_access").map(|f| f.index_field_name.as_str()),
            Some("open_access.is_oa")
        );

        let only_year = registry.selected_fields(&["publication_year".to_string()], &[]);
        assert_eq!(only_year.len(), 1);
        let without_year = registry.selected_fields(&[], &["publication_year".to_string()]);
        assert_eq!(without_year[0].0, "open_access");

        assert!(FieldRegistry::lookup(&config, "nope").is_err());
    }

    #[test]
    fn test_fingerprint_tracks_settings() {
        let config = config();
        let before = FieldRegistry::lookup(&config, "scientific").unwrap().fingerprint();

        let mut changed = config.clone();
        if let Some(ds) = changed.data_sources.get_mut("scientific") {
            if let Some(f) = ds.fields.get_mut("publication_year") {
                f.size = 5;
            }
        }
        let after = FieldRegistry::lookup(&changed, "scientific").unwrap().fingerprint();
        assert_ne!(before, after);
        assert_eq!(before, FieldRegistry::lookup(&config, "scientific").unwrap().fingerprint());
    }
}
