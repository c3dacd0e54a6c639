use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await
}

/// Creates every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Harvested records, all sources in one table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvested_records (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            identifier TEXT NOT NULL,
            source_url TEXT,
            raw_data TEXT NOT NULL DEFAULT '{}',
            datestamp INTEGER,
            harvest_status TEXT NOT NULL DEFAULT 'pending',
            index_status TEXT NOT NULL DEFAULT 'pending',
            harvest_attempt INTEGER NOT NULL DEFAULT 0,
            last_harvest_attempt INTEGER,
            indexed_at INTEGER,
            index_name TEXT,
            type_data TEXT,
            parent_id TEXT,
            last_seq INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(source, identifier),
            FOREIGN KEY (parent_id) REFERENCES harvested_records(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_status ON harvested_records(source, harvest_status)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_index_status ON harvested_records(source, index_status)",
    )
    .execute(pool)
    .await?;

    // Error logs, append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvest_error_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            record_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            field_name TEXT NOT NULL,
            exception_type TEXT NOT NULL,
            message TEXT NOT NULL,
            traceback TEXT NOT NULL DEFAULT '',
            context_data TEXT NOT NULL DEFAULT '{}',
            occurred_at INTEGER NOT NULL,
            is_resolved INTEGER NOT NULL DEFAULT 0,
            resolved_at INTEGER,
            FOREIGN KEY (record_id) REFERENCES harvested_records(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_error_logs_record ON harvest_error_logs(record_id, attempt)",
    )
    .execute(pool)
    .await?;

    // Transformation scripts
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transformation_scripts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            description TEXT,
            harvest_model TEXT NOT NULL,
            source_index TEXT NOT NULL,
            dest_index TEXT NOT NULL,
            query_script TEXT,
            transform_script TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one active script per harvest model
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_scripts_one_active
        ON transformation_scripts(harvest_model) WHERE is_active = 1
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
