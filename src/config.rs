use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::{HarvestModel, RecordSource};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub indices: IndicesConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Field registries keyed by data-source name.
    #[serde(default)]
    pub data_sources: BTreeMap<String, DataSourceConfig>,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// All defaults, with the database at `path`.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            search: SearchConfig::default(),
            indices: IndicesConfig::default(),
            retry: RetryConfig::default(),
            http: HttpConfig::default(),
            sources: SourcesConfig::default(),
            gateway: GatewayConfig::default(),
            data_sources: BTreeMap::new(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_url")]
    pub url: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: default_search_url(),
            timeout_secs: default_timeout_secs(),
            username: None,
            password: None,
        }
    }
}

fn default_search_url() -> String {
    "http://localhost:9200".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

/// Raw index names, one per harvest model.
#[derive(Debug, Deserialize, Clone)]
pub struct IndicesConfig {
    #[serde(default = "default_raw_preprint")]
    pub raw_preprint: String,
    #[serde(default = "default_raw_book")]
    pub raw_book: String,
    #[serde(default = "default_raw_dataset")]
    pub raw_dataset: String,
    #[serde(default = "default_raw_dataverse")]
    pub raw_dataverse: String,
}

impl Default for IndicesConfig {
    fn default() -> Self {
        Self {
            raw_preprint: default_raw_preprint(),
            raw_book: default_raw_book(),
            raw_dataset: default_raw_dataset(),
            raw_dataverse: default_raw_dataverse(),
        }
    }
}

fn default_raw_preprint() -> String {
    "raw_preprint".to_string()
}
fn default_raw_book() -> String {
    "raw_book".to_string()
}
fn default_raw_dataset() -> String {
    "raw_scielo_data_dataset".to_string()
}
fn default_raw_dataverse() -> String {
    "raw_scielo_data_dataverse".to_string()
}

impl IndicesConfig {
    pub fn raw_index_for(&self, model: HarvestModel) -> &str {
        match model {
            HarvestModel::Preprint => &self.raw_preprint,
            HarvestModel::Books => &self.raw_book,
            HarvestModel::DataDataset => &self.raw_dataset,
            HarvestModel::DataDataverse => &self.raw_dataverse,
        }
    }

    /// Every raw index with the model it stores.
    pub fn all(&self) -> Vec<(HarvestModel, &str)> {
        HarvestModel::ALL
            .iter()
            .map(|m| (*m, self.raw_index_for(*m)))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Statuses retried in addition to network errors. Any 5xx is always retried.
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            retry_statuses: default_retry_statuses(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    30_000
}
fn default_retry_statuses() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_user_agent() -> String {
    format!("oca-harvest/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub preprints: PreprintSourceConfig,
    #[serde(default)]
    pub books: BooksSourceConfig,
    #[serde(default)]
    pub datasets: DatasetsSourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreprintSourceConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_metadata_prefix")]
    pub metadata_prefix: String,
    #[serde(default)]
    pub set: Option<String>,
}

impl Default for PreprintSourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            metadata_prefix: default_metadata_prefix(),
            set: None,
        }
    }
}

fn default_metadata_prefix() -> String {
    "oai_dc".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BooksSourceConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_db_name")]
    pub db_name: String,
    /// Passed as `limit` to `_changes`; unset means the whole feed in one page.
    #[serde(default)]
    pub page_limit: Option<u32>,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for BooksSourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            db_name: default_db_name(),
            page_limit: None,
            workers: default_workers(),
        }
    }
}

fn default_db_name() -> String {
    "scielobooks_1a".to_string()
}
fn default_workers() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatasetsSourceConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    #[serde(default)]
    pub max_pages: Option<u32>,
}

impl Default for DatasetsSourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            per_page: default_per_page(),
            max_pages: None,
        }
    }
}

fn default_per_page() -> u32 {
    100
}

impl SourcesConfig {
    pub fn base_url(&self, source: RecordSource) -> Option<&str> {
        match source {
            RecordSource::Preprint => self.preprints.base_url.as_deref(),
            RecordSource::Book => self.books.base_url.as_deref(),
            RecordSource::Dataset => self.datasets.base_url.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
    #[serde(default = "default_max_page_size")]
    pub max_page_size: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_cache_ttl_secs() -> u64 {
    300
}
fn default_page_size() -> u32 {
    20
}
fn default_max_page_size() -> u32 {
    100
}

/// A searchable data source: one curated index plus its field registry.
#[derive(Debug, Deserialize, Clone)]
pub struct DataSourceConfig {
    pub index_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Free-text fields in priority order; a `^N` suffix boosts a field.
    #[serde(default = "default_text_fields")]
    pub text_fields: Vec<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldConfig>,
}

fn default_text_fields() -> Vec<String> {
    vec![
        "title^3".to_string(),
        "id".to_string(),
        "doi".to_string(),
        "authorships.author.display_name".to_string(),
    ]
}

#[derive(Debug, Deserialize, Clone)]
pub struct FieldConfig {
    pub index_field_name: String,
    /// `keyword` fields are aggregated as-is; anything else gets `.keyword`.
    #[serde(default)]
    pub field_type: Option<String>,
    #[serde(default = "default_facet_size")]
    pub size: u32,
    /// Terms aggregation order, e.g. `{ "_key" = "desc" }`.
    #[serde(default)]
    pub order: Option<Value>,
    #[serde(default)]
    pub supports_query_operator: bool,
    #[serde(default)]
    pub supports_search_as_you_type: bool,
    /// Extra filter settings that take part in the registry fingerprint.
    #[serde(default)]
    pub filter: Option<Value>,
}

fn default_facet_size() -> u32 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Retry policy
    if config.retry.max_attempts == 0 {
        anyhow::bail!("retry.max_attempts must be >= 1");
    }
    if config.retry.base_backoff_ms > config.retry.max_backoff_ms {
        anyhow::bail!("retry.base_backoff_ms must be <= retry.max_backoff_ms");
    }

    // Gateway
    if config.gateway.cache_ttl_secs == 0 {
        anyhow::bail!("gateway.cache_ttl_secs must be > 0");
    }
    if config.gateway.default_page_size == 0
        || config.gateway.default_page_size > config.gateway.max_page_size
    {
        anyhow::bail!("gateway.default_page_size must be in [1, gateway.max_page_size]");
    }

    // Sources
    if config.sources.datasets.per_page == 0 {
        anyhow::bail!("sources.datasets.per_page must be > 0");
    }
    if config.sources.books.workers == 0 {
        anyhow::bail!("sources.books.workers must be >= 1");
    }

    // Field registries
    for (name, ds) in &config.data_sources {
        if ds.index_name.trim().is_empty() {
            anyhow::bail!("data_sources.{}.index_name must not be empty", name);
        }
        for (field, fc) in &ds.fields {
            if fc.index_field_name.trim().is_empty() {
                anyhow::bail!(
                    "data_sources.{}.fields.{}.index_field_name must not be empty",
                    name,
                    field
                );
            }
        }
    }

    Ok(())
}
