//! OAI-PMH preprint harvester.
//!
//! Cursor: the latest `datestamp` of any successfully harvested preprint,
//! sent as the OAI `from` argument at day granularity. Records carrying
//! that same day are fetched again; saving them is idempotent.
//!
//! Deleted headers are skipped (`ignore_deleted`). Each record is parsed
//! into the raw preprint shape by [`crate::oai_dc::parse_preprint`], with
//! field failures going to the record's error context.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashSet;

use crate::error_context::ErrorContext;
use crate::harvest::{fail_record, HarvestOptions, HarvestSummary, Harvester};
use crate::models::{RecordSource, Status};
use crate::oai::{format_from_date, OaiClient, OaiRecord};
use crate::oai_dc::parse_preprint;
use crate::pipeline::Pipeline;
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter};
use crate::store::RecordStore;

pub struct PreprintHarvester {
    store: RecordStore,
    client: OaiClient,
}

impl PreprintHarvester {
    pub fn new(pipeline: &Pipeline) -> Result<Self> {
        let client = OaiClient::new(
            pipeline.fetcher().clone(),
            &pipeline.config().sources.preprints,
        )?;
        Ok(Self {
            store: pipeline.store().clone(),
            client,
        })
    }

    /// Stores one OAI record and closes its attempt.
    pub async fn harvest_record(&self, identifier: &str, oai: &OaiRecord) -> Result<Status> {
        let (mut record, _) = self
            .store
            .get_or_create(RecordSource::Preprint, identifier)
            .await?;
        let mut ctx = ErrorContext::begin(&self.store, &mut record).await?;

        let parsed = parse_preprint(&oai.metadata, &mut ctx);
        if let Err(e) = self
            .store
            .set_attrs_from_parsed(&mut record, parsed, oai.header.datestamp_ts())
            .await
        {
            ctx.add(&e, "raw_data", json!({ "identifier": identifier }));
        }

        ctx.mark_status(&mut record).await
    }

    async fn resolve_from(&self, options: &HarvestOptions) -> Result<Option<String>> {
        if options.from.is_some() {
            return Ok(options.from.clone());
        }
        Ok(self
            .store
            .max_success_datestamp(RecordSource::Preprint)
            .await?
            .and_then(format_from_date))
    }
}

#[async_trait]
impl Harvester for PreprintHarvester {
    fn source(&self) -> RecordSource {
        RecordSource::Preprint
    }

    fn description(&self) -> &str {
        "OAI-PMH ListRecords (oai_dc)"
    }

    async fn harvest(
        &self,
        options: &HarvestOptions,
        progress: &dyn HarvestProgressReporter,
    ) -> Result<HarvestSummary> {
        let mut summary = HarvestSummary::new(RecordSource::Preprint);
        let from = self.resolve_from(options).await?;
        tracing::info!(from = ?from, "harvesting preprints");

        let mut token: Option<String> = None;
        let mut seen_tokens: HashSet<String> = HashSet::new();

        loop {
            progress.report(HarvestProgressEvent::Listing {
                source: summary.source.clone(),
                page: summary.pages + 1,
            });
            let page = self
                .client
                .list_records(from.as_deref(), options.until.as_deref(), token.as_deref())
                .await?;
            summary.pages += 1;

            for oai in &page.records {
                if oai.header.deleted {
                    summary.skipped += 1;
                    continue;
                }
                let identifier = match oai.header.identifier.as_deref() {
                    Some(id) if !id.trim().is_empty() => id.trim(),
                    _ => {
                        tracing::warn!("OAI record without identifier skipped");
                        summary.skipped += 1;
                        continue;
                    }
                };

                match self.harvest_record(identifier, oai).await {
                    Ok(status) => summary.record(status),
                    Err(e) => {
                        tracing::error!(identifier, error = %format!("{:#}", e), "preprint not stored");
                        summary.record(Status::Failed);
                    }
                }
                summary.report(progress, page.complete_list_size);
            }

            match page.resumption_token {
                Some(next) if !next.is_empty() => {
                    if !seen_tokens.insert(next.clone()) {
                        tracing::warn!(token = %next, "resumption token repeated; stopping");
                        break;
                    }
                    token = Some(next);
                }
                _ => break,
            }
        }

        summary.cursor = self
            .store
            .max_success_datestamp(RecordSource::Preprint)
            .await?
            .and_then(format_from_date);
        Ok(summary)
    }

    async fn retry_failed(&self, progress: &dyn HarvestProgressReporter) -> Result<HarvestSummary> {
        let mut summary = HarvestSummary::new(RecordSource::Preprint);
        let failed = self
            .store
            .list_by_harvest_status(RecordSource::Preprint, Status::Failed)
            .await?;
        if failed.is_empty() {
            tracing::info!("no failed preprints to retry");
        }
        let total = failed.len() as u64;

        for mut record in failed {
            let identifier = record.identifier.clone();
            let result = match self.client.get_record(&identifier).await {
                Ok(Some(oai)) => self.harvest_record(&identifier, &oai).await,
                Ok(None) => {
                    let err = anyhow!("repository does not know {}", identifier);
                    fail_record(
                        &self.store,
                        &mut record,
                        &err,
                        "get_record",
                        json!({ "identifier": identifier }),
                    )
                    .await
                }
                Err(e) => {
                    tracing::warn!(identifier = %identifier, error = %format!("{:#}", e), "GetRecord failed");
                    fail_record(
                        &self.store,
                        &mut record,
                        &e,
                        "get_record",
                        json!({ "identifier": identifier }),
                    )
                    .await
                }
            };

            match result {
                Ok(status) => summary.record(status),
                Err(e) => {
                    tracing::error!(identifier = %identifier, error = %format!("{:#}", e), "retry not stored");
                    summary.record(Status::Failed);
                }
            }
            summary.report(progress, Some(total));
        }

        Ok(summary)
    }
}
