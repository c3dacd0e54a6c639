//! HTTP fetching with retry and backoff for the harvesters.
//!
//! Retry strategy:
//! - network error or timeout → retry
//! - HTTP 429, 5xx, or any status in `retry.retry_statuses` → retry
//! - any other 4xx → fail immediately with [`HarvestError::Permanent`]
//!
//! Delays grow as `base_backoff_ms * 2^(n-1)` and are capped at
//! `max_backoff_ms`. After `max_attempts` tries the last failure is returned
//! as [`HarvestError::Transient`].

use anyhow::Result;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use std::time::Duration;

use crate::config::{Config, HttpConfig, RetryConfig};
use crate::error::HarvestError;

#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpFetcher {
    pub fn new(http: &HttpConfig, retry: &RetryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(http.timeout_secs))
            .user_agent(http.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            retry: retry.clone(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(&config.http, &config.retry)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .retry
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.retry.max_backoff_ms);
        Duration::from_millis(ms)
    }

    fn should_retry(&self, status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
            || self.retry.retry_statuses.contains(&status.as_u16())
    }

    /// GETs `url` and returns the body as text.
    pub async fn get_text(&self, url: &Url) -> Result<String> {
        let mut last_err: Option<HarvestError> = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.backoff_delay(attempt)).await;
            }

            match self.client.get(url.clone()).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        match response.text().await {
                            Ok(body) => return Ok(body),
                            Err(e) => {
                                last_err = Some(HarvestError::Transient {
                                    url: url.to_string(),
                                    status: Some(status.as_u16()),
                                    message: e.to_string(),
                                });
                                continue;
                            }
                        }
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if self.should_retry(status) {
                        tracing::debug!(%url, status = status.as_u16(), attempt, "retrying");
                        last_err = Some(HarvestError::Transient {
                            url: url.to_string(),
                            status: Some(status.as_u16()),
                            message: truncate(&body_text),
                        });
                        continue;
                    }

                    return Err(HarvestError::Permanent {
                        url: url.to_string(),
                        status: status.as_u16(),
                        message: truncate(&body_text),
                    }
                    .into());
                }
                Err(e) => {
                    tracing::debug!(%url, attempt, error = %e, "request failed, retrying");
                    last_err = Some(HarvestError::Transient {
                        url: url.to_string(),
                        status: None,
                        message: e.to_string(),
                    });
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| HarvestError::Transient {
                url: url.to_string(),
                status: None,
                message: "no attempts made".to_string(),
            })
            .into())
    }

    /// GETs `url` and parses the body as JSON.
    pub async fn get_json(&self, url: &Url) -> Result<Value> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|e| {
            HarvestError::parse("response", format!("invalid JSON from {}: {}", url, e)).into()
        })
    }
}

/// Joins `path` onto `base` and appends query parameters.
///
/// Path segments are percent-encoded individually, so document ids with
/// `/` or `:` stay inside one segment.
pub fn build_url(base: &str, segments: &[&str], params: &[(&str, String)]) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|_| HarvestError::InvalidUrl(base.to_string()))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| HarvestError::InvalidUrl(base.to_string()))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    if !params.is_empty() {
        let mut query = url.query_pairs_mut();
        for (key, value) in params {
            query.append_pair(key, value);
        }
    }
    Ok(url)
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() <= MAX {
        return body.to_string();
    }
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}
