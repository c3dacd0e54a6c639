//! Harvest statistics.
//!
//! Per-source record counts by harvest and index status, plus the time of
//! the latest harvest attempt. Used by `oca stats` to confirm that harvests
//! and projections are keeping up.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::models::Status;
use crate::store::{RecordStore, StatusCount};

/// Counts for one status column.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusBreakdown {
    pub pending: i64,
    pub in_progress: i64,
    pub success: i64,
    pub failed: i64,
}

impl StatusBreakdown {
    fn add(&mut self, status: &str, count: i64) {
        match status.parse::<Status>() {
            Ok(Status::Pending) => self.pending += count,
            Ok(Status::InProgress) => self.in_progress += count,
            Ok(Status::Success) => self.success += count,
            Ok(Status::Failed) => self.failed += count,
            Err(_) => tracing::warn!(status, "unknown status in store"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub total: i64,
    pub harvest: StatusBreakdown,
    pub index: StatusBreakdown,
    pub last_attempt: Option<i64>,
}

/// Folds the per-(status, status) rows into one entry per source.
pub fn summarize(rows: &[StatusCount]) -> Vec<SourceStats> {
    let mut by_source: BTreeMap<&str, SourceStats> = BTreeMap::new();
    for row in rows {
        let entry = by_source
            .entry(row.source.as_str())
            .or_insert_with(|| SourceStats {
                source: row.source.clone(),
                ..SourceStats::default()
            });
        entry.total += row.count;
        entry.harvest.add(&row.harvest_status, row.count);
        entry.index.add(&row.index_status, row.count);
        entry.last_attempt = entry.last_attempt.max(row.last_attempt);
    }
    by_source.into_values().collect()
}

pub async fn collect_stats(store: &RecordStore) -> Result<Vec<SourceStats>> {
    Ok(summarize(&store.status_counts().await?))
}

/// Run the stats command: query the store and print a summary.
pub async fn run_stats(store: &RecordStore, db_path: &std::path::Path) -> Result<()> {
    let stats = collect_stats(store).await?;
    let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);

    println!("OCA Harvest Record Stats");
    println!("========================");
    println!();
    println!("  Database:    {}", db_path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!(
        "  Records:     {}",
        stats.iter().map(|s| s.total).sum::<i64>()
    );

    if stats.is_empty() {
        println!();
        println!("  No records harvested yet.");
        println!();
        return Ok(());
    }

    println!();
    println!(
        "  {:<10} {:>7} {:>8} {:>8} {:>8} {:>9} {:>10}   {}",
        "SOURCE", "TOTAL", "PENDING", "OK", "FAILED", "INDEXED", "IDX FAIL", "LAST ATTEMPT"
    );
    println!("  {}", "-".repeat(88));
    for s in &stats {
        let attempt = match s.last_attempt {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        };
        println!(
            "  {:<10} {:>7} {:>8} {:>8} {:>8} {:>9} {:>10}   {}",
            s.source,
            s.total,
            s.harvest.pending + s.harvest.in_progress,
            s.harvest.success,
            s.harvest.failed,
            s.index.success,
            s.index.failed,
            attempt
        );
    }
    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering; older than a month falls back to a date.
pub fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => format!("{} min{} ago", d / 60, plural(d / 60)),
        d if d < 86400 => format!("{} hour{} ago", d / 3600, plural(d / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
