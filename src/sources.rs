use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::models::RecordSource;
use crate::search_backend::SearchBackend;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: RecordSource,
    pub base_url: Option<String>,
    pub configured: bool,
}

pub fn source_statuses(config: &Config) -> Vec<SourceStatus> {
    RecordSource::ALL
        .iter()
        .map(|&source| {
            let base_url = config.sources.base_url(source).map(str::to_string);
            SourceStatus {
                source,
                configured: base_url.is_some(),
                base_url,
            }
        })
        .collect()
}

pub async fn list_sources(config: &Config, backend: &dyn SearchBackend) -> Result<()> {
    println!("{:<10} {:<16} BASE URL", "SOURCE", "STATUS");
    for status in source_statuses(config) {
        let label = if status.configured { "OK" } else { "NOT CONFIGURED" };
        println!(
            "{:<10} {:<16} {}",
            status.source,
            label,
            status.base_url.as_deref().unwrap_or("-")
        );
    }

    // Unreachable is reported, not fatal.
    let healthy = match backend.ping().await {
        Ok(ok) => ok,
        Err(e) => {
            tracing::warn!(error = %format!("{:#}", e), "search engine ping failed");
            false
        }
    };
    println!();
    println!("{:<10} {:<16} {}", "search", if healthy { "OK" } else { "UNREACHABLE" }, config.search.url);

    Ok(())
}
