//! Harvest progress reporting.
//!
//! Reports observable progress during `oca harvest` and `oca retry-failed`
//! so operators see which page is being listed and how many records were
//! processed. Progress is emitted on **stderr** so stdout remains parseable
//! for scripts.

use std::io::Write;

/// A single progress event for a harvest batch.
#[derive(Clone, Debug)]
pub enum HarvestProgressEvent {
    /// A listing page (OAI page, `_changes` page, search page) is being fetched.
    Listing { source: String, page: u64 },
    /// `n` records processed so far; `total` when the source reports one.
    Processed {
        source: String,
        n: u64,
        total: Option<u64>,
        failed: u64,
    },
}

/// Reports harvest progress. Implementations write to stderr (human or JSON).
pub trait HarvestProgressReporter: Send + Sync {
    fn report(&self, event: HarvestProgressEvent);
}

/// Human-friendly progress on stderr: "harvest preprint  1,234 / 5,000 records  (3 failed)".
pub struct StderrProgress;

impl HarvestProgressReporter for StderrProgress {
    fn report(&self, event: HarvestProgressEvent) {
        let line = match &event {
            HarvestProgressEvent::Listing { source, page } => {
                format!("harvest {}  listing page {}\n", source, format_number(*page))
            }
            HarvestProgressEvent::Processed {
                source,
                n,
                total,
                failed,
            } => {
                let total = match total {
                    Some(t) => format!(" / {}", format_number(*t)),
                    None => String::new(),
                };
                format!(
                    "harvest {}  {}{} records  ({} failed)\n",
                    source,
                    format_number(*n),
                    total,
                    format_number(*failed)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl HarvestProgressReporter for JsonProgress {
    fn report(&self, event: HarvestProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event.to_json()) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

impl HarvestProgressEvent {
    /// One `{"event": "progress", ...}` object per event.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            HarvestProgressEvent::Listing { source, page } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "listing",
                "page": page
            }),
            HarvestProgressEvent::Processed {
                source,
                n,
                total,
                failed,
            } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "processing",
                "n": n,
                "total": total,
                "failed": failed
            }),
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl HarvestProgressReporter for NoProgress {
    fn report(&self, _event: HarvestProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn HarvestProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
