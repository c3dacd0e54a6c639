//! CouchDB `_changes` books harvester.
//!
//! Cursor: `max(last_seq)` over successfully stored books, else 0. Each
//! page of `GET /{db}/_changes?since=<seq>` is processed change by change:
//!
//! - `deleted: true` → the stored book is deleted (the projector then removes
//!   the indexed documents)
//! - otherwise `GET /{db}/{id}`, `_id` renamed to `id`, and for a `Part`
//!   the parent `Monograph` is resolved first (stored one reused, else
//!   fetched and stored) and its `title` / `doi_number` copied in
//!
//! Pagination stops on an empty page or when the cursor does not advance.
//! With `workers > 1` the documents of a page are fetched concurrently;
//! every record still carries its own change `seq`, so the global cursor
//! only moves forward.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};

use crate::error::HarvestError;
use crate::error_context::FieldErrorSink;
use crate::harvest::{
    fail_record, persist_record, HarvestOptions, HarvestSummary, Harvester, RecordUpdate,
};
use crate::http::{build_url, HttpFetcher};
use crate::models::{ErrorEntry, HarvestedRecord, RecordSource, Status, BOOK_MONOGRAPH, BOOK_PART};
use crate::pipeline::Pipeline;
use crate::progress::{HarvestProgressEvent, HarvestProgressReporter};
use crate::store::RecordStore;

/// One entry of a `_changes` page.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub id: String,
    pub seq: Option<i64>,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ChangesPage {
    pub results: Vec<Change>,
    pub last_seq: Option<i64>,
}

/// Numeric part of a CouchDB sequence. CouchDB 1.x sends integers; 2.x
/// sends `"<n>-<opaque>"` strings.
pub fn parse_seq(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => {
            let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

pub fn parse_changes(payload: &Value) -> ChangesPage {
    let results = payload
        .get("results")
        .and_then(|r| r.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let id = item.get("id")?.as_str()?.to_string();
                    Some(Change {
                        id,
                        seq: item.get("seq").and_then(parse_seq),
                        deleted: item.get("deleted").and_then(|d| d.as_bool()).unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let last_seq = payload
        .get("last_seq")
        .or_else(|| payload.get("seq"))
        .and_then(parse_seq);

    ChangesPage { results, last_seq }
}

/// Renames CouchDB's `_id` to `id`.
pub fn sanitize_raw_data(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            if let Some(id) = map.remove("_id") {
                map.insert("id".to_string(), id);
            }
            Value::Object(map)
        }
        other => other,
    }
}

/// Copies the monograph fields a Part is searched by.
fn include_monograph_data(payload: &mut Map<String, Value>, monograph: &HarvestedRecord) {
    if let Some(title) = monograph.raw_data.get("title").filter(|t| !t.is_null()) {
        payload.insert("monograph_title".to_string(), title.clone());
    }
    if let Some(doi) = monograph.raw_data.get("doi_number").filter(|d| !d.is_null()) {
        payload.insert("doi_number".to_string(), doi.clone());
    }
}

enum MonographLookup {
    Found(HarvestedRecord),
    /// The referenced document exists but is not a Monograph.
    OtherType(String),
    Unavailable,
}

pub struct BooksHarvester {
    store: RecordStore,
    fetcher: HttpFetcher,
    base_url: String,
    db_name: String,
    page_limit: Option<u32>,
    workers: usize,
}

impl BooksHarvester {
    pub fn new(pipeline: &Pipeline) -> Result<Self> {
        let config = &pipeline.config().sources.books;
        let base_url = config
            .base_url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| HarvestError::config("sources.books.base_url is not set"))?;
        Ok(Self {
            store: pipeline.store().clone(),
            fetcher: pipeline.fetcher().clone(),
            base_url,
            db_name: config.db_name.clone(),
            page_limit: config.page_limit,
            workers: config.workers.max(1),
        })
    }

    pub async fn fetch_changes(&self, since: i64) -> Result<ChangesPage> {
        let mut params = vec![("since", since.to_string())];
        if let Some(limit) = self.page_limit {
            params.push(("limit", limit.to_string()));
        }
        let url = build_url(&self.base_url, &[&self.db_name, "_changes"], &params)?;
        let payload = self.fetcher.get_json(&url).await?;
        Ok(parse_changes(&payload))
    }

    /// Fetches a document. On failure the error is logged on the document's
    /// record under `fetch_doc` and `None` is returned.
    async fn fetch_doc(&self, doc_id: &str) -> Result<Option<(Value, String)>> {
        let url = build_url(&self.base_url, &[&self.db_name, doc_id], &[])?;
        match self.fetcher.get_json(&url).await {
            Ok(payload) => Ok(Some((payload, url.to_string()))),
            Err(e) => {
                tracing::warn!(doc_id, error = %format!("{:#}", e), "book fetch failed");
                let (mut record, _) = self.store.get_or_create(RecordSource::Book, doc_id).await?;
                fail_record(
                    &self.store,
                    &mut record,
                    &e,
                    "fetch_doc",
                    json!({ "doc_id": doc_id, "db_name": self.db_name }),
                )
                .await?;
                Ok(None)
            }
        }
    }

    /// Returns the stored Monograph, fetching and storing it when unknown.
    /// A document of another type is reported, never stored here.
    async fn resolve_monograph(&self, monograph_id: &str) -> Result<MonographLookup> {
        if let Some(record) = self.store.find(RecordSource::Book, monograph_id).await? {
            if record.has_raw_data() {
                return Ok(match record.type_data.as_deref() {
                    Some(BOOK_MONOGRAPH) => MonographLookup::Found(record),
                    other => MonographLookup::OtherType(other.unwrap_or_default().to_string()),
                });
            }
        }

        let (payload, url) = match self.fetch_doc(monograph_id).await? {
            Some(fetched) => fetched,
            None => return Ok(MonographLookup::Unavailable),
        };
        let payload = sanitize_raw_data(payload);
        let type_data = payload
            .get("TYPE")
            .and_then(|t| t.as_str())
            .unwrap_or(BOOK_MONOGRAPH)
            .to_string();
        if type_data != BOOK_MONOGRAPH {
            return Ok(MonographLookup::OtherType(type_data));
        }
        let (record, _) = persist_record(
            &self.store,
            RecordSource::Book,
            monograph_id,
            RecordUpdate {
                source_url: Some(url),
                raw_data: payload,
                type_data: Some(type_data),
                parent_id: None,
                last_seq: None,
            },
            Vec::new(),
        )
        .await?;
        Ok(MonographLookup::Found(record))
    }

    /// Fetches and stores one document of the change feed.
    pub async fn harvest_document(&self, doc_id: &str, seq: Option<i64>) -> Result<Status> {
        let (payload, url) = match self.fetch_doc(doc_id).await? {
            Some(fetched) => fetched,
            None => return Ok(Status::Failed),
        };

        let mut payload = match sanitize_raw_data(payload) {
            Value::Object(map) => map,
            other => {
                let (mut record, _) = self.store.get_or_create(RecordSource::Book, doc_id).await?;
                let err: anyhow::Error =
                    HarvestError::parse("raw_data", format!("expected an object, got {}", other))
                        .into();
                return fail_record(
                    &self.store,
                    &mut record,
                    &err,
                    "raw_data",
                    json!({ "doc_id": doc_id }),
                )
                .await;
            }
        };

        let type_data = payload
            .get("TYPE")
            .and_then(|t| t.as_str())
            .map(|t| t.to_string());
        let mut field_errors: Vec<ErrorEntry> = Vec::new();
        let mut parent_id = None;

        if type_data.as_deref() == Some(BOOK_PART) {
            let monograph_id = payload
                .get("monograph")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string());
            match monograph_id {
                Some(monograph_id) => match self.resolve_monograph(&monograph_id).await? {
                    MonographLookup::Found(monograph) => {
                        include_monograph_data(&mut payload, &monograph);
                        parent_id = Some(monograph.id);
                    }
                    MonographLookup::OtherType(other) => field_errors.add_field_error(
                        HarvestError::parse(
                            "monograph",
                            format!(
                                "{} is a {}, not a Monograph",
                                monograph_id,
                                if other.is_empty() { "document without TYPE" } else { other.as_str() }
                            ),
                        )
                        .into(),
                        "monograph",
                        json!({ "monograph": monograph_id, "doc_id": doc_id }),
                    ),
                    MonographLookup::Unavailable => field_errors.add_field_error(
                        anyhow!("monograph {} could not be fetched", monograph_id),
                        "monograph",
                        json!({ "monograph": monograph_id, "db_name": self.db_name }),
                    ),
                },
                None => field_errors.add_field_error(
                    HarvestError::parse("monograph", "Part without monograph").into(),
                    "monograph",
                    json!({ "doc_id": doc_id }),
                ),
            }
        }

        let (_, status) = persist_record(
            &self.store,
            RecordSource::Book,
            doc_id,
            RecordUpdate {
                source_url: Some(url),
                raw_data: Value::Object(payload),
                type_data,
                parent_id,
                last_seq: seq,
            },
            field_errors,
        )
        .await?;
        Ok(status)
    }

    async fn process_change(&self, change: &Change) -> Result<Option<Status>> {
        if change.deleted {
            let deleted = self
                .store
                .delete_by_identifier(RecordSource::Book, &change.id)
                .await?;
            if deleted {
                tracing::info!(identifier = %change.id, "book deleted at source");
            }
            return Ok(None);
        }
        self.harvest_document(&change.id, change.seq).await.map(Some)
    }
}

#[async_trait]
impl Harvester for BooksHarvester {
    fn source(&self) -> RecordSource {
        RecordSource::Book
    }

    fn description(&self) -> &str {
        "CouchDB _changes feed"
    }

    async fn harvest(
        &self,
        options: &HarvestOptions,
        progress: &dyn HarvestProgressReporter,
    ) -> Result<HarvestSummary> {
        let mut summary = HarvestSummary::new(RecordSource::Book);
        let mut since = match options.since {
            Some(since) => since,
            None => self.store.max_last_seq().await?,
        };
        tracing::info!(since, db = %self.db_name, workers = self.workers, "harvesting books");

        loop {
            progress.report(HarvestProgressEvent::Listing {
                source: summary.source.clone(),
                page: summary.pages + 1,
            });
            let page = self.fetch_changes(since).await?;
            if page.results.is_empty() {
                break;
            }
            summary.pages += 1;

            let outcomes: Vec<(String, Result<Option<Status>>)> = stream::iter(page.results.clone())
                .map(|change: Change| async move {
                    let outcome = self.process_change(&change).await;
                    (change.id, outcome)
                })
                .buffer_unordered(self.workers)
                .collect()
                .await;

            for (doc_id, outcome) in outcomes {
                match outcome {
                    Ok(Some(status)) => summary.record(status),
                    Ok(None) => summary.deleted += 1,
                    Err(e) => {
                        tracing::error!(doc_id = %doc_id, error = %format!("{:#}", e), "change not processed");
                        summary.record(Status::Failed);
                    }
                }
            }
            summary.report(progress, None);

            let next = page
                .last_seq
                .or_else(|| page.results.iter().filter_map(|c| c.seq).max());
            match next {
                Some(next) if next > since => since = next,
                _ => break,
            }
        }

        summary.cursor = Some(since.to_string());
        Ok(summary)
    }

    async fn retry_failed(&self, progress: &dyn HarvestProgressReporter) -> Result<HarvestSummary> {
        let mut summary = HarvestSummary::new(RecordSource::Book);
        let failed = self
            .store
            .list_by_harvest_status(RecordSource::Book, Status::Failed)
            .await?;
        let total = failed.len() as u64;

        for record in failed {
            match self.harvest_document(&record.identifier, record.last_seq).await {
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
    fn test_parse_seq_forms() {
        assert_eq!(parse_seq(&json!(42)), Some(42));
        assert_eq!(parse_seq(&json!("17-g1AAAAB4eJzLYWBg")), Some(17));
        assert_eq!(parse_seq(&json!("opaque")), None);
        assert_eq!(parse_seq(&Value::Null), None);
    }

    #[test]
    fn test_parse_changes_prefers_last_seq() {
        let page = parse_changes(&json!({
            "results": [
                {"id": "P1", "seq": 3},
                {"id": "gone", "seq": 4, "deleted": true},
                {"seq": 5}
            ],
            "last_seq": 5
        }));
        assert_eq!(page.results.len(), 2);
        assert!(page.results[1].deleted);
        assert_eq!(page.last_seq, Some(5));

        let page = parse_changes(&json!({"results": [], "seq": "9-x"}));
        assert_eq!(page.last_seq, Some(9));
    }

    #[test]
    fn test_sanitize_renames_id() {
        let doc = sanitize_raw_data(json!({"_id": "M1", "_rev": "1-a", "title": "Livro"}));
        assert_eq!(doc["id"], "M1");
        assert!(doc.get("_id").is_none());
        assert_eq!(doc["_rev"], "1-a");
    }
}
