//! REST client for OpenSearch / Elasticsearch.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use std::time::Duration;

use super::SearchBackend;
use crate::config::SearchConfig;
use crate::error::HarvestError;

pub struct OpenSearchBackend {
    client: reqwest::Client,
    base: Url,
    username: Option<String>,
    password: Option<String>,
}

impl OpenSearchBackend {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|_| HarvestError::InvalidUrl(config.url.clone()))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base,
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| HarvestError::InvalidUrl(self.base.to_string()))?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.username {
            Some(user) => builder.basic_auth(user, self.password.as_ref()),
            None => builder,
        }
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<Value> {
        let response = builder
            .send()
            .await
            .with_context(|| format!("search engine unreachable ({})", what))?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            bail!("search engine error {} on {}: {}", status, what, text);
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("invalid JSON from {}", what))
    }
}

fn refresh_param(refresh: bool) -> &'static str {
    if refresh {
        "true"
    } else {
        "false"
    }
}

#[async_trait]
impl SearchBackend for OpenSearchBackend {
    async fn index(&self, index: &str, id: &str, body: &Value, refresh: bool) -> Result<()> {
        let mut url = self.url(&[index, "_doc", id])?;
        url.query_pairs_mut()
            .append_pair("refresh", refresh_param(refresh));

        let response = self
            .request(Method::PUT, url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("search engine unreachable (index {}/{})", index, id))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HarvestError::Projection {
                index: index.to_string(),
                id: id.to_string(),
                message: format!("{}: {}", status, text),
            }
            .into());
        }
        Ok(())
    }

    async fn delete(&self, index: &str, id: &str) -> Result<bool> {
        let url = self.url(&[index, "_doc", id])?;
        let response = self.request(Method::DELETE, url).send().await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => {
                let text = response.text().await.unwrap_or_default();
                bail!("delete {}/{} failed with {}: {}", index, id, s, text)
            }
        }
    }

    async fn exists(&self, index: &str) -> Result<bool> {
        let url = self.url(&[index])?;
        let response = self.request(Method::HEAD, url).send().await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => bail!("exists check on {} failed with {}", index, s),
        }
    }

    async fn create_index(&self, index: &str, settings: &Value, mappings: &Value) -> Result<()> {
        let url = self.url(&[index])?;
        let body = json!({ "settings": settings, "mappings": mappings });
        self.send_json(
            self.request(Method::PUT, url).json(&body),
            &format!("create index {}", index),
        )
        .await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let url = self.url(&[index])?;
        let response = self.request(Method::DELETE, url).send().await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            s => {
                let text = response.text().await.unwrap_or_default();
                bail!("delete index {} failed with {}: {}", index, s, text)
            }
        }
    }

    async fn search(&self, index: &str, body: &Value) -> Result<Value> {
        let url = self.url(&[index, "_search"])?;
        self.send_json(
            self.request(Method::POST, url).json(body),
            &format!("search {}", index),
        )
        .await
    }

    async fn reindex(&self, body: &Value, refresh: bool) -> Result<Value> {
        let mut url = self.url(&["_reindex"])?;
        url.query_pairs_mut()
            .append_pair("refresh", refresh_param(refresh));
        self.send_json(self.request(Method::POST, url).json(body), "reindex")
            .await
    }

    async fn refresh(&self, index: &str) -> Result<()> {
        let url = self.url(&[index, "_refresh"])?;
        self.send_json(
            self.request(Method::POST, url),
            &format!("refresh {}", index),
        )
        .await?;
        Ok(())
    }

    async fn ping(&self) -> Result<bool> {
        let url = self.url(&[])?;
        match self.request(Method::GET, url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
