use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn setup_test_env(extra: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/oca.sqlite"

[search]
url = "http://127.0.0.1:1"

[server]
bind = "127.0.0.1:7341"
{}
"#,
        root.display(),
        extra
    );

    let config_path = config_dir.join("oca.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_oca(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_oca"))
        .arg("--config")
        .arg(config_path)
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run oca binary: {}", e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env("");

    let (stdout, stderr, success) = run_oca(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/oca.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env("");

    let (_, _, first) = run_oca(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_oca(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_stats_on_empty_database() {
    let (_tmp, config_path) = setup_test_env("");

    run_oca(&config_path, &["init"]);
    let (stdout, stderr, success) = run_oca(&config_path, &["stats"]);
    assert!(success, "stats failed: stderr={}", stderr);
    assert!(stdout.contains("Records:     0"));
    assert!(stdout.contains("No records harvested yet."));
}

#[test]
fn test_harvest_without_base_url_is_config_error() {
    let (_tmp, config_path) = setup_test_env("");

    run_oca(&config_path, &["init"]);
    let (_, stderr, success) = run_oca(&config_path, &["harvest", "books"]);
    assert!(!success);
    assert!(
        stderr.contains("sources.books.base_url is not set"),
        "unexpected stderr: {}",
        stderr
    );
}

#[test]
fn test_invalid_config_rejected() {
    let (_tmp, config_path) = setup_test_env("[sources.datasets]\nper_page = 0\n");

    let (_, stderr, success) = run_oca(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("per_page"));
}

#[test]
fn test_script_add_and_list() {
    let (tmp, config_path) = setup_test_env("");
    let script_path = tmp.path().join("books.painless");
    fs::write(&script_path, "ctx._source.curated = true").unwrap();

    run_oca(&config_path, &["init"]);
    let (stdout, stderr, success) = run_oca(
        &config_path,
        &[
            "script",
            "add",
            "books-v1",
            "--model",
            "HarvestedBooks",
            "--dest-index",
            "bronze_book",
            "--transform",
            script_path.to_str().unwrap(),
            "--active",
        ],
    );
    assert!(success, "script add failed: stderr={}", stderr);
    assert!(stdout.contains("Created script 1"));

    let (stdout, _, success) = run_oca(&config_path, &["script", "list"]);
    assert!(success);
    assert!(stdout.contains("books-v1"));
    assert!(stdout.contains("raw_book -> bronze_book"));
    assert!(stdout.contains(" * "));

    let (_, _, success) = run_oca(&config_path, &["script", "deactivate", "1"]);
    assert!(success);
    let (stdout, _, _) = run_oca(&config_path, &["script", "list"]);
    assert!(!stdout.contains(" * "));
}

#[test]
fn test_unknown_harvest_model_rejected() {
    let (tmp, config_path) = setup_test_env("");
    let script_path = tmp.path().join("x.painless");
    fs::write(&script_path, "").unwrap();

    let (_, stderr, success) = run_oca(
        &config_path,
        &[
            "script",
            "add",
            "x",
            "--model",
            "HarvestedJournals",
            "--dest-index",
            "x",
            "--transform",
            script_path.to_str().unwrap(),
        ],
    );
    assert!(!success);
    assert!(stderr.contains("Unknown harvest model"));
}

#[test]
fn test_resolve_unknown_error_log_fails() {
    let (_tmp, config_path) = setup_test_env("");

    run_oca(&config_path, &["init"]);
    let (_, stderr, success) = run_oca(&config_path, &["records", "resolve", "99"]);
    assert!(!success);
    assert!(stderr.contains("error log 99 not found"));
}

#[test]
fn test_records_failed_empty() {
    let (_tmp, config_path) = setup_test_env("");

    run_oca(&config_path, &["init"]);
    let (stdout, _, success) = run_oca(&config_path, &["records", "failed", "preprints"]);
    assert!(success);
    assert!(stdout.contains("No failed preprint records."));
}

#[test]
fn test_indicator_unknown_data_source() {
    let (tmp, config_path) = setup_test_env("");
    let spec_path = tmp.path().join("spec.json");
    fs::write(
        &spec_path,
        r#"{"title": "Docs por ano", "data_source": "nope", "facet_by": "year"}"#,
    )
    .unwrap();

    let (_, stderr, success) = run_oca(&config_path, &["indicator", spec_path.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("unknown data source: nope"));
}
