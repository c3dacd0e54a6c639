//! Dataverse search harvester (SciELO Data).
//!
//! Pages through `GET /api/search?q=*&type=dataset&type=dataverse` with
//! `per_page` / `start`. The default start resumes at the page boundary
//! below the number of stored records. The run stops on an empty page,
//! when `start` reaches `total_count`, or after `max_pages` pages.
//!
//! Every item is fetched again before it is stored: dataverses through
//! `/api/dataverses/{identifier}`, datasets through
//! `/api/datasets/:persistentId/`. The inner `data` object is stored, so a
//! first harvest and a retry keep the same shape. Datasets are stored under
//! their own `identifier` with a `publisher` block built from the search
//! item and the parent dataverse.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Url;
use serde_json::{json, Value};

use crate::error::HarvestError;
use crate::harvest::{
    fail_record, persist_record, HarvestOptions, HarvestSummary, Harvester, RecordUpdate,
};
use crate::http::{build_url, HttpFetcher};
use crate::models::{HarvestedRecord, RecordSource, Status, DATA_DATASET, DATA_DATAVERSE};
use crate::pipeline::Pipeline;
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter};
use crate::store::RecordStore;

/// Stored records are resumed from this page size, whatever `per_page` is.
const RESUME_PAGE: u64 = 100;

pub fn extract_items(payload: &Value) -> Vec<Value> {
    payload
        .pointer("/data/items")
        .or_else(|| payload.get("items"))
        .and_then(|items| items.as_array())
        .cloned()
        .unwrap_or_default()
}

pub fn extract_total_count(payload: &Value) -> Option<u64> {
    payload.pointer("/data/total_count").and_then(|t| t.as_u64())
}

/// Start offset resuming at the page boundary below `stored`.
pub fn default_start(stored: i64) -> u64 {
    let stored = stored.max(0) as u64;
    (stored / RESUME_PAGE) * RESUME_PAGE
}

fn str_field<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

pub struct DatasetHarvester {
    store: RecordStore,
    fetcher: HttpFetcher,
    base_url: String,
    per_page: u32,
    max_pages: Option<u32>,
}

impl DatasetHarvester {
    pub fn new(pipeline: &Pipeline) -> Result<Self> {
        let config = &pipeline.config().sources.datasets;
        let base_url = config
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| HarvestError::config("sources.datasets.base_url is not set"))?;
        Ok(Self {
            store: pipeline.store().clone(),
            fetcher: pipeline.fetcher().clone(),
            base_url,
            per_page: config.per_page,
            max_pages: config.max_pages,
        })
    }

    fn search_url(&self, start: u64) -> Result<Url> {
        build_url(
            &self.base_url,
            &["api", "search"],
            &[
                ("q", "*".to_string()),
                ("type", DATA_DATASET.to_string()),
                ("type", DATA_DATAVERSE.to_string()),
                ("per_page", self.per_page.to_string()),
                ("start", start.to_string()),
            ],
        )
    }

    fn dataset_url(&self, global_id: &str) -> Result<Url> {
        build_url(
            &self.base_url,
            &["api", "datasets", ":persistentId", ""],
            &[("persistentId", global_id.to_string())],
        )
    }

    fn dataverse_url(&self, identifier: &str) -> Result<Url> {
        build_url(&self.base_url, &["api", "dataverses", identifier], &[])
    }

    async fn fetch_data(&self, url: &Url) -> Result<Value> {
        let payload = self.fetcher.get_json(url).await?;
        match payload.get("data") {
            Some(data) if data.is_object() => Ok(data.clone()),
            _ => Err(HarvestError::parse("data", format!("no data object in {}", url)).into()),
        }
    }

    /// `publisher` block of a dataset: search-item name plus the parent
    /// dataverse's identifier and landing URL.
    async fn publisher_for(&self, item: &Value) -> Result<Value> {
        let dataverse_id = str_field(item, "identifier_of_dataverse");
        let url = match dataverse_id {
            Some(id) => self
                .store
                .find(RecordSource::Dataset, id)
                .await?
                .and_then(|dv| {
                    dv.raw_data
                        .pointer("/theme/linkUrl")
                        .or_else(|| dv.raw_data.get("url"))
                        .cloned()
                })
                .unwrap_or(Value::Null),
            None => Value::Null,
        };
        Ok(json!({
            "name": item.get("publisher").cloned().unwrap_or(Value::Null),
            "identifier": dataverse_id,
            "url": url,
        }))
    }

    /// Stores one search item. Returns the resulting harvest status.
    pub async fn harvest_item(&self, item: &Value) -> Result<Status> {
        match str_field(item, "type") {
            Some(DATA_DATAVERSE) => {
                let identifier = str_field(item, "identifier")
                    .ok_or_else(|| HarvestError::parse("identifier", "dataverse without identifier"))?;
                let url = self.dataverse_url(identifier)?;
                let data = match self.fetch_data(&url).await {
                    Ok(data) => data,
                    Err(e) => {
                        let (mut record, _) =
                            self.store.get_or_create(RecordSource::Dataset, identifier).await?;
                        return fail_record(
                            &self.store,
                            &mut record,
                            &e,
                            "fetch_dataverse",
                            json!({ "identifier": identifier }),
                        )
                        .await;
                    }
                };
                let (_, status) = persist_record(
                    &self.store,
                    RecordSource::Dataset,
                    identifier,
                    RecordUpdate {
                        source_url: Some(url.to_string()),
                        raw_data: data,
                        type_data: Some(DATA_DATAVERSE.to_string()),
                        ..RecordUpdate::default()
                    },
                    Vec::new(),
                )
                .await?;
                Ok(status)
            }
            Some(DATA_DATASET) => {
                let global_id = str_field(item, "global_id")
                    .ok_or_else(|| HarvestError::parse("global_id", "dataset without global_id"))?;
                let url = self.dataset_url(global_id)?;

                let mut data = match self.fetch_data(&url).await {
                    Ok(data) => data,
                    Err(e) => return self.dataset_fetch_failed(global_id, &url, e).await,
                };
                let identifier = str_field(&data, "identifier")
                    .unwrap_or(global_id)
                    .to_string();
                let publisher = self.publisher_for(item).await?;
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("publisher".to_string(), publisher);
                }

                let (_, status) = persist_record(
                    &self.store,
                    RecordSource::Dataset,
                    &identifier,
                    RecordUpdate {
                        source_url: Some(url.to_string()),
                        raw_data: data,
                        type_data: Some(DATA_DATASET.to_string()),
                        ..RecordUpdate::default()
                    },
                    Vec::new(),
                )
                .await?;
                self.drop_placeholder(global_id, &identifier).await?;
                Ok(status)
            }
            other => Err(HarvestError::parse(
                "type",
                format!("unsupported item type: {}", other.unwrap_or("<none>")),
            )
            .into()),
        }
    }

    /// A dataset whose fetch failed is attributed to the stored record
    /// with the same source URL; an unknown dataset is recorded under its
    /// `global_id` so `retry_failed` picks it up.
    async fn dataset_fetch_failed(
        &self,
        global_id: &str,
        url: &Url,
        error: anyhow::Error,
    ) -> Result<Status> {
        match self
            .store
            .find_by_source_url(RecordSource::Dataset, url.as_str())
            .await?
        {
            Some(mut record) => {
                fail_record(
                    &self.store,
                    &mut record,
                    &error,
                    "fetch_dataset",
                    json!({ "global_id": global_id }),
                )
                .await
            }
            None => {
                let (mut record, _) = self.store.get_or_create(RecordSource::Dataset, global_id).await?;
                record.source_url = Some(url.to_string());
                record.type_data = Some(DATA_DATASET.to_string());
                self.store
                    .save(&mut record, Some(&["source_url", "type_data"]))
                    .await?;
                fail_record(
                    &self.store,
                    &mut record,
                    &error,
                    "fetch_dataset",
                    json!({ "global_id": global_id }),
                )
                .await
            }
        }
    }

    /// Drops the record kept under `global_id` after a failed first fetch
    /// once the dataset is stored under its own identifier.
    async fn drop_placeholder(&self, global_id: &str, identifier: &str) -> Result<()> {
        if global_id == identifier {
            return Ok(());
        }
        if let Some(placeholder) = self.store.find(RecordSource::Dataset, global_id).await? {
            if placeholder.type_data.as_deref() == Some(DATA_DATASET) {
                self.store.delete(&placeholder).await?;
            }
        }
        Ok(())
    }

    async fn retry_record(&self, record: &mut HarvestedRecord) -> Result<Status> {
        let context = json!({
            "identifier": record.identifier,
            "type_data": record.type_data,
        });

        let (url, type_data) = match record.type_data.as_deref() {
            Some(DATA_DATAVERSE) => (self.dataverse_url(&record.identifier)?, DATA_DATAVERSE),
            Some(DATA_DATASET) => {
                let parsed = record.source_url.as_deref().and_then(|u| Url::parse(u).ok());
                match parsed {
                    Some(url) => (url, DATA_DATASET),
                    None => {
                        let err = anyhow!("dataset {} has no source URL", record.identifier);
                        return fail_record(&self.store, record, &err, "reprocess", context).await;
                    }
                }
            }
            _ => {
                let err = anyhow!("record {} has no known type", record.identifier);
                return fail_record(&self.store, record, &err, "reprocess", context).await;
            }
        };

        let mut data = match self.fetch_data(&url).await {
            Ok(data) => data,
            Err(e) => return fail_record(&self.store, record, &e, "reprocess", context).await,
        };
        // The publisher block comes from the search item; keep the stored one.
        if let (Some(publisher), Some(obj)) =
            (record.raw_data.get("publisher").cloned(), data.as_object_mut())
        {
            obj.entry("publisher").or_insert(publisher);
        }

        let identifier = match type_data {
            DATA_DATASET => str_field(&data, "identifier")
                .unwrap_or(record.identifier.as_str())
                .to_string(),
            _ => record.identifier.clone(),
        };

        let (_, status) = persist_record(
            &self.store,
            RecordSource::Dataset,
            &identifier,
            RecordUpdate {
                source_url: Some(url.to_string()),
                raw_data: data,
                type_data: Some(type_data.to_string()),
                ..RecordUpdate::default()
            },
            Vec::new(),
        )
        .await?;
        if identifier != record.identifier {
            self.store.delete(record).await?;
        }
        Ok(status)
    }
}

#[async_trait]
impl Harvester for DatasetHarvester {
    fn source(&self) -> RecordSource {
        RecordSource::Dataset
    }

    fn description(&self) -> &str {
        "Dataverse search API"
    }

    async fn harvest(
        &self,
        options: &HarvestOptions,
        progress: &dyn HarvestProgressReporter,
    ) -> Result<HarvestSummary> {
        let mut summary = HarvestSummary::new(RecordSource::Dataset);
        let mut start = match options.start {
            Some(start) => start,
            None => default_start(self.store.count(RecordSource::Dataset).await?),
        };
        let max_pages = options.max_pages.or(self.max_pages);
        tracing::info!(start, per_page = self.per_page, "harvesting datasets");

        loop {
            if let Some(max) = max_pages {
                if summary.pages >= u64::from(max) {
                    tracing::info!(max_pages = max, "page limit reached");
                    break;
                }
            }

            progress.report(HarvestProgressEvent::Listing {
                source: summary.source.clone(),
                page: summary.pages + 1,
            });
            let payload = self.fetcher.get_json(&self.search_url(start)?).await?;
            let items = extract_items(&payload);
            let total_count = extract_total_count(&payload);
            summary.pages += 1;

            if items.is_empty() {
                tracing::info!(start, "no items returned; stopping");
                break;
            }

            for item in &items {
                match self.harvest_item(item).await {
                    Ok(status) => summary.record(status),
                    Err(e) => {
                        tracing::error!(error = %format!("{:#}", e), "dataset item not stored");
                        summary.record(Status::Failed);
                    }
                }
                summary.report(progress, total_count);
            }

            start += u64::from(self.per_page);
            if total_count.is_some_and(|total| start >= total) {
                break;
            }
        }

        summary.cursor = Some(start.to_string());
        Ok(summary)
    }

    async fn retry_failed(&self, progress: &dyn HarvestProgressReporter) -> Result<HarvestSummary> {
        let mut summary = HarvestSummary::new(RecordSource::Dataset);
        let failed = self
            .store
            .list_by_harvest_status(RecordSource::Dataset, Status::Failed)
            .await?;
        let total = failed.len() as u64;

        for mut record in failed {
            match self.retry_record(&mut record).await {
                Ok(status) => summary.record(status),
                Err(e) => {
                    tracing::error!(identifier = %record.identifier, error = %format!("{:#}", e), "retry not stored");
                    summary.record(Status::Failed);
                }
            }
            summary.report(progress, Some(total));
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_start_rounds_down() {
        assert_eq!(default_start(0), 0);
        assert_eq!(default_start(99), 0);
        assert_eq!(default_start(100), 100);
        assert_eq!(default_start(257), 200);
    }

    #[test]
    fn test_extract_items_and_total() {
        let payload = json!({"status": "OK", "data": {"items": [{"type": "dataverse"}], "total_count": 7}});
        assert_eq!(extract_items(&payload).len(), 1);
        assert_eq!(extract_total_count(&payload), Some(7));
        assert!(extract_items(&json!({"data": {}})).is_empty());
    }
}
