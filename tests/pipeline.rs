//! End-to-end harvest tests against fake upstream servers.
//!
//! Each test binds small axum apps on `127.0.0.1:0` that speak just enough
//! OAI-PMH, CouchDB, or Dataverse for one scenario, and runs the real
//! harvesters against a temporary SQLite database and the in-memory search
//! backend.

use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use oca_harvest::config::Config;
use oca_harvest::db;
use oca_harvest::harvest::{self, HarvestOptions};
use oca_harvest::harvest_books::parse_seq;
use oca_harvest::migrate;
use oca_harvest::models::{HarvestModel, RecordSource, Status};
use oca_harvest::pipeline::Pipeline;
use oca_harvest::progress::NoProgress;
use oca_harvest::search_backend::{InMemorySearchBackend, SearchBackend};
use oca_harvest::store::NewScript;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn open_pipeline(
    tmp: &TempDir,
    configure: impl FnOnce(&mut Config),
) -> (Pipeline, Arc<InMemorySearchBackend>) {
    let mut config = Config::with_db_path(tmp.path().join("oca.sqlite"));
    config.retry.max_attempts = 1;
    configure(&mut config);

    let pool = db::connect(&config).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let backend = Arc::new(InMemorySearchBackend::new());
    let pipeline = Pipeline::new(config, pool, backend.clone()).unwrap();
    (pipeline, backend)
}

// ============ CouchDB ============

#[derive(Clone, Default)]
struct CouchState {
    changes: Arc<Mutex<Vec<Value>>>,
    docs: Arc<Mutex<HashMap<String, Value>>>,
}

#[derive(serde::Deserialize)]
struct ChangesParams {
    since: i64,
}

async fn couch_changes(
    State(state): State<CouchState>,
    Query(params): Query<ChangesParams>,
) -> Json<Value> {
    let changes = state.changes.lock().unwrap();
    let results: Vec<Value> = changes
        .iter()
        .filter(|c| parse_seq(&c["seq"]).unwrap_or(0) > params.since)
        .cloned()
        .collect();
    let last_seq = results
        .iter()
        .filter_map(|c| parse_seq(&c["seq"]))
        .max()
        .unwrap_or(params.since);
    Json(json!({ "results": results, "last_seq": last_seq }))
}

async fn couch_doc(
    State(state): State<CouchState>,
    Path((_db, doc_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.docs.lock().unwrap().get(&doc_id) {
        Some(doc) => (StatusCode::OK, Json(doc.clone())),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "reason": "missing"})),
        ),
    }
}

fn couch_app(state: CouchState) -> Router {
    Router::new()
        .route("/{db}/_changes", get(couch_changes))
        .route("/{db}/{doc_id}", get(couch_doc))
        .with_state(state)
}

fn book_script() -> NewScript {
    NewScript {
        name: "books-v1".to_string(),
        description: None,
        harvest_model: HarvestModel::Books,
        source_index: "raw_book".to_string(),
        dest_index: "bronze_book".to_string(),
        query_script: None,
        transform_script: "ctx._source.curated = true".to_string(),
        is_active: true,
    }
}

#[tokio::test]
async fn test_books_part_fetches_unknown_monograph_first() {
    let couch = CouchState::default();
    couch
        .changes
        .lock()
        .unwrap()
        .push(json!({"id": "P1", "seq": 1}));
    {
        let mut docs = couch.docs.lock().unwrap();
        docs.insert(
            "P1".to_string(),
            json!({"_id": "P1", "_rev": "1-a", "TYPE": "Part", "monograph": "M1", "title": "Capitulo 1"}),
        );
        docs.insert(
            "M1".to_string(),
            json!({"_id": "M1", "_rev": "1-b", "TYPE": "Monograph", "title": "Livro M1", "doi_number": "10.1/m1"}),
        );
    }
    let base_url = serve(couch_app(couch.clone())).await;

    let tmp = TempDir::new().unwrap();
    let (pipeline, backend) = open_pipeline(&tmp, |c| {
        c.sources.books.base_url = Some(base_url.clone());
    })
    .await;
    let store = pipeline.store();

    let summary = harvest::run_harvest(
        &pipeline,
        RecordSource::Book,
        &HarvestOptions::default(),
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.cursor.as_deref(), Some("1"));

    let monograph = store.find(RecordSource::Book, "M1").await.unwrap().unwrap();
    assert_eq!(monograph.type_data.as_deref(), Some("Monograph"));
    assert_eq!(monograph.harvest_status, Status::Success);

    let part = store.find(RecordSource::Book, "P1").await.unwrap().unwrap();
    assert_eq!(part.harvest_status, Status::Success);
    assert_eq!(part.parent_id.as_deref(), Some(monograph.id.as_str()));
    assert_eq!(part.raw_data["monograph_title"], "Livro M1");
    assert_eq!(part.raw_data["doi_number"], "10.1/m1");
    assert_eq!(part.raw_data["id"], "P1");
    assert!(part.raw_data.get("_id").is_none());
    assert_eq!(part.last_seq, Some(1));

    assert_eq!(part.index_status, Status::Success);
    let raw = backend.document("raw_book", "P1").unwrap();
    assert_eq!(raw["raw_data"]["monograph_title"], "Livro M1");
    assert!(backend.document("raw_book", "M1").is_some());
}

#[tokio::test]
async fn test_books_delete_propagates_and_cursor_is_monotonic() {
    let couch = CouchState::default();
    {
        let mut changes = couch.changes.lock().unwrap();
        changes.push(json!({"id": "M2", "seq": 3}));
        changes.push(json!({"id": "M6", "seq": "6-g1AAAA"}));
        let mut docs = couch.docs.lock().unwrap();
        docs.insert(
            "M2".to_string(),
            json!({"_id": "M2", "TYPE": "Monograph", "title": "Livro M2"}),
        );
        docs.insert(
            "M6".to_string(),
            json!({"_id": "M6", "TYPE": "Monograph", "title": "Livro M6"}),
        );
    }
    let base_url = serve(couch_app(couch.clone())).await;

    let tmp = TempDir::new().unwrap();
    let (pipeline, backend) = open_pipeline(&tmp, |c| {
        c.sources.books.base_url = Some(base_url.clone());
    })
    .await;
    let store = pipeline.store();

    backend.create_index("raw_book", &json!({}), &json!({})).await.unwrap();
    backend.create_index("bronze_book", &json!({}), &json!({})).await.unwrap();
    store.create_script(&book_script()).await.unwrap();

    harvest::run_harvest(&pipeline, RecordSource::Book, &HarvestOptions::default(), &NoProgress)
        .await
        .unwrap();
    let before = store.max_last_seq().await.unwrap();
    assert_eq!(before, 6);
    assert!(backend.document("raw_book", "M2").is_some());
    assert!(backend.document("bronze_book", "M2").is_some());

    couch
        .changes
        .lock()
        .unwrap()
        .push(json!({"id": "M2", "seq": 7, "deleted": true}));
    let summary = harvest::run_harvest(
        &pipeline,
        RecordSource::Book,
        &HarvestOptions::default(),
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.deleted, 1);
    assert_eq!(summary.cursor.as_deref(), Some("7"));

    assert!(store.find(RecordSource::Book, "M2").await.unwrap().is_none());
    assert!(backend.document("raw_book", "M2").is_none());
    assert!(backend.document("bronze_book", "M2").is_none());
    assert!(backend.document("bronze_book", "M6").is_some());
    assert!(store.max_last_seq().await.unwrap() >= before);
}

#[tokio::test]
async fn test_books_part_pointing_at_part_is_rejected_with_workers() {
    let couch = CouchState::default();
    {
        let mut changes = couch.changes.lock().unwrap();
        changes.push(json!({"id": "X1", "seq": 1}));
        changes.push(json!({"id": "P9", "seq": 2}));
        let mut docs = couch.docs.lock().unwrap();
        docs.insert(
            "M1".to_string(),
            json!({"_id": "M1", "TYPE": "Monograph", "title": "Livro M1"}),
        );
        docs.insert(
            "X1".to_string(),
            json!({"_id": "X1", "TYPE": "Part", "monograph": "M1", "title": "Capitulo X1"}),
        );
        docs.insert(
            "P9".to_string(),
            json!({"_id": "P9", "TYPE": "Part", "monograph": "X1", "title": "Capitulo P9"}),
        );
    }
    let base_url = serve(couch_app(couch.clone())).await;

    let tmp = TempDir::new().unwrap();
    let (pipeline, _backend) = open_pipeline(&tmp, |c| {
        c.sources.books.base_url = Some(base_url.clone());
        c.sources.books.workers = 2;
    })
    .await;
    let store = pipeline.store();

    let summary = harvest::run_harvest(
        &pipeline,
        RecordSource::Book,
        &HarvestOptions::default(),
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.cursor.as_deref(), Some("2"));

    let monograph = store.find(RecordSource::Book, "M1").await.unwrap().unwrap();
    let x1 = store.find(RecordSource::Book, "X1").await.unwrap().unwrap();
    assert_eq!(x1.harvest_status, Status::Success);
    assert_eq!(x1.type_data.as_deref(), Some("Part"));
    assert_eq!(x1.parent_id.as_deref(), Some(monograph.id.as_str()));

    let p9 = store.find(RecordSource::Book, "P9").await.unwrap().unwrap();
    assert_eq!(p9.harvest_status, Status::Failed);
    assert!(p9.parent_id.is_none());
    assert_eq!(p9.raw_data["title"], "Capitulo P9");
    let errors = store.latest_attempt_errors(&p9).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_name, "monograph");
    assert!(errors[0].message.contains("not a Monograph"));
}

#[tokio::test]
async fn test_books_fetch_failure_logged_then_retried() {
    let couch = CouchState::default();
    couch
        .changes
        .lock()
        .unwrap()
        .push(json!({"id": "M3", "seq": 1}));
    let base_url = serve(couch_app(couch.clone())).await;

    let tmp = TempDir::new().unwrap();
    let (pipeline, _backend) = open_pipeline(&tmp, |c| {
        c.sources.books.base_url = Some(base_url.clone());
    })
    .await;
    let store = pipeline.store();

    let summary = harvest::run_harvest(
        &pipeline,
        RecordSource::Book,
        &HarvestOptions::default(),
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.failed, 1);

    let failed = harvest::failed_records(store, RecordSource::Book).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].record.identifier, "M3");
    assert_eq!(failed[0].errors[0].field_name, "fetch_doc");
    assert_eq!(failed[0].errors[0].context_data["db_name"], "scielobooks_1a");

    couch.docs.lock().unwrap().insert(
        "M3".to_string(),
        json!({"_id": "M3", "TYPE": "Monograph", "title": "Livro M3"}),
    );
    let summary = harvest::run_retry_failed(&pipeline, RecordSource::Book, &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);

    let record = store.find(RecordSource::Book, "M3").await.unwrap().unwrap();
    assert_eq!(record.harvest_status, Status::Success);
    assert!(store.latest_attempt_errors(&record).await.unwrap().is_empty());
    assert_eq!(record.harvest_attempt, 2);
}

// ============ Dataverse ============

#[derive(Clone, Default)]
struct DataverseState {
    starts: Arc<Mutex<Vec<u64>>>,
    datasets_down: Arc<Mutex<bool>>,
}

async fn dataverse(State(state): State<DataverseState>, uri: Uri) -> impl IntoResponse {
    let query: HashMap<String, String> = uri
        .query()
        .map(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    match uri.path() {
        "/api/search" => {
            let start: u64 = query.get("start").and_then(|s| s.parse().ok()).unwrap_or(0);
            state.starts.lock().unwrap().push(start);
            let items = match start {
                0 => vec![json!({
                    "type": "dataverse",
                    "identifier": "dv-1",
                    "name": "Dataverse Um",
                    "url": "https://data.example/dataverse/dv-1"
                })],
                1 => vec![json!({
                    "type": "dataset",
                    "global_id": "doi:10.48331/ds-1",
                    "publisher": "Dataverse Um",
                    "identifier_of_dataverse": "dv-1"
                })],
                _ => vec![],
            };
            (
                StatusCode::OK,
                Json(json!({"status": "OK", "data": {"total_count": 2, "items": items}})),
            )
        }
        "/api/dataverses/dv-1" => (
            StatusCode::OK,
            Json(json!({
                "status": "OK",
                "data": {
                    "alias": "dv-1",
                    "name": "Dataverse Um",
                    "theme": {"linkUrl": "https://journal.example"}
                }
            })),
        ),
        "/api/datasets/:persistentId/" if *state.datasets_down.lock().unwrap() => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "ERROR", "message": "dataset not found"})),
        ),
        "/api/datasets/:persistentId/" => (
            StatusCode::OK,
            Json(json!({
                "status": "OK",
                "data": {"identifier": "ds-1", "persistentUrl": "https://doi.org/10.48331/ds-1"}
            })),
        ),
        _ => (StatusCode::NOT_FOUND, Json(json!({"status": "ERROR"}))),
    }
}

#[tokio::test]
async fn test_dataverse_pagination_persists_both_items() {
    let state = DataverseState::default();
    let base_url = serve(Router::new().fallback(dataverse).with_state(state.clone())).await;

    let tmp = TempDir::new().unwrap();
    let (pipeline, backend) = open_pipeline(&tmp, |c| {
        c.sources.datasets.base_url = Some(base_url.clone());
        c.sources.datasets.per_page = 1;
    })
    .await;
    let store = pipeline.store();

    let summary = harvest::run_harvest(
        &pipeline,
        RecordSource::Dataset,
        &HarvestOptions::default(),
        &NoProgress,
    )
    .await
    .unwrap();

    assert_eq!(*state.starts.lock().unwrap(), vec![0, 1]);
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(store.count(RecordSource::Dataset).await.unwrap(), 2);

    let dv = store.find(RecordSource::Dataset, "dv-1").await.unwrap().unwrap();
    assert_eq!(dv.type_data.as_deref(), Some("dataverse"));
    assert_eq!(dv.harvest_status, Status::Success);
    assert_eq!(dv.raw_data["alias"], "dv-1");
    assert!(dv.source_url.as_deref().unwrap().ends_with("/api/dataverses/dv-1"));

    let ds = store.find(RecordSource::Dataset, "ds-1").await.unwrap().unwrap();
    assert_eq!(ds.type_data.as_deref(), Some("dataset"));
    assert_eq!(ds.raw_data["publisher"]["name"], "Dataverse Um");
    assert_eq!(ds.raw_data["publisher"]["identifier"], "dv-1");
    assert_eq!(ds.raw_data["publisher"]["url"], "https://journal.example");

    assert!(backend.document("raw_scielo_data_dataverse", "dv-1").is_some());
    assert!(backend.document("raw_scielo_data_dataset", "ds-1").is_some());
}

#[tokio::test]
async fn test_unseen_dataset_fetch_failure_is_kept_for_retry() {
    let state = DataverseState::default();
    *state.datasets_down.lock().unwrap() = true;
    let base_url = serve(Router::new().fallback(dataverse).with_state(state.clone())).await;

    let tmp = TempDir::new().unwrap();
    let (pipeline, backend) = open_pipeline(&tmp, |c| {
        c.sources.datasets.base_url = Some(base_url.clone());
        c.sources.datasets.per_page = 1;
    })
    .await;
    let store = pipeline.store();

    let summary = harvest::run_harvest(
        &pipeline,
        RecordSource::Dataset,
        &HarvestOptions::default(),
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);

    let failed = harvest::failed_records(store, RecordSource::Dataset).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].record.identifier, "doi:10.48331/ds-1");
    assert_eq!(failed[0].record.type_data.as_deref(), Some("dataset"));
    assert_eq!(failed[0].errors[0].field_name, "fetch_dataset");
    assert_eq!(failed[0].errors[0].context_data["global_id"], "doi:10.48331/ds-1");

    *state.datasets_down.lock().unwrap() = false;
    let summary = harvest::run_retry_failed(&pipeline, RecordSource::Dataset, &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);

    let ds = store.find(RecordSource::Dataset, "ds-1").await.unwrap().unwrap();
    assert_eq!(ds.harvest_status, Status::Success);
    assert!(store
        .find(RecordSource::Dataset, "doi:10.48331/ds-1")
        .await
        .unwrap()
        .is_none());
    assert_eq!(store.count(RecordSource::Dataset).await.unwrap(), 2);
    assert!(backend.document("raw_scielo_data_dataset", "ds-1").is_some());
}

// ============ OAI-PMH ============

fn oai_record(id: &str, date: &str) -> String {
    format!(
        r#"<record>
      <header>
        <identifier>{id}</identifier>
        <datestamp>2024-05-20T10:00:00Z</datestamp>
      </header>
      <metadata>
        <oai_dc:dc xmlns:oai_dc="http://www.openarchives.org/OAI/2.0/oai_dc/"
                   xmlns:dc="http://purl.org/dc/elements/1.1/">
          <dc:title xml:lang="pt">Titulo de teste</dc:title>
          <dc:creator>Silva, Maria</dc:creator>
          <dc:identifier>https://ex/preprint/123</dc:identifier>
          <dc:date>{date}</dc:date>
          <dc:language>pt</dc:language>
        </oai_dc:dc>
      </metadata>
    </record>"#
    )
}

fn oai_envelope(verb: &str, body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<OAI-PMH xmlns="http://www.openarchives.org/OAI/2.0/">
  <responseDate>2024-06-01T00:00:00Z</responseDate>
  <{verb}>{body}</{verb}>
</OAI-PMH>"#
    )
}

async fn oai(Query(params): Query<HashMap<String, String>>) -> String {
    match params.get("verb").map(String::as_str) {
        Some("ListRecords") => match params.get("resumptionToken").map(String::as_str) {
            None => oai_envelope(
                "ListRecords",
                &format!(
                    "{}<resumptionToken completeListSize=\"3\">page-2</resumptionToken>",
                    oai_record("oai:ex:1", "2024-05-20")
                ),
            ),
            Some(_) => oai_envelope(
                "ListRecords",
                &format!(
                    r#"{}<record><header status="deleted"><identifier>oai:ex:gone</identifier><datestamp>2024-05-21</datestamp></header></record><resumptionToken completeListSize="3"/>"#,
                    oai_record("oai:ex:2", "not-a-date")
                ),
            ),
        },
        Some("GetRecord") => oai_envelope("GetRecord", &oai_record("oai:ex:2", "2024-05-22")),
        _ => oai_envelope("error", ""),
    }
}

#[tokio::test]
async fn test_preprint_harvest_then_retry_with_get_record() {
    let base_url = serve(Router::new().route("/oai", get(oai))).await;

    let tmp = TempDir::new().unwrap();
    let (pipeline, backend) = open_pipeline(&tmp, |c| {
        c.sources.preprints.base_url = Some(format!("{}/oai", base_url));
    })
    .await;
    let store = pipeline.store();

    let summary = harvest::run_harvest(
        &pipeline,
        RecordSource::Preprint,
        &HarvestOptions::default(),
        &NoProgress,
    )
    .await
    .unwrap();
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.skipped, 1);
    assert!(store.find(RecordSource::Preprint, "oai:ex:gone").await.unwrap().is_none());

    let ok = store.find(RecordSource::Preprint, "oai:ex:1").await.unwrap().unwrap();
    assert_eq!(ok.harvest_status, Status::Success);
    assert_eq!(ok.raw_data["title"][0]["text"], "Titulo de teste");
    assert_eq!(ok.raw_data["language"], "pt");
    assert_eq!(ok.raw_data["authors"][0]["surname"], "Silva");
    assert!(backend.document("raw_preprint", "oai:ex:1").is_some());

    let bad = store.find(RecordSource::Preprint, "oai:ex:2").await.unwrap().unwrap();
    assert_eq!(bad.harvest_status, Status::Failed);
    let errors = store.latest_attempt_errors(&bad).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].field_name, "date");

    let summary = harvest::run_retry_failed(&pipeline, RecordSource::Preprint, &NoProgress)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    let fixed = store.find(RecordSource::Preprint, "oai:ex:2").await.unwrap().unwrap();
    assert_eq!(fixed.harvest_status, Status::Success);
    assert_eq!(fixed.raw_data["date"]["day"], 22);
    assert!(store.latest_attempt_errors(&fixed).await.unwrap().is_empty());
    // The failed attempt's log stays in history.
    assert_eq!(store.error_logs(&fixed.id).await.unwrap().len(), 1);
}
