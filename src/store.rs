//! Raw document store.
//!
//! Durable storage for harvested records, their append-only error logs, and
//! the transformation scripts that drive the curated indices. All sources
//! share the `harvested_records` table; `(source, identifier)` is unique.
//!
//! Status helpers (`mark_*`) update one row and never publish events. Writes
//! that replace a record's payload go through [`RecordStore::save`], which
//! takes a pre-save snapshot of `raw_data` and publishes
//! [`RecordEvent::Saved`] once the row is committed.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::events::{EventBus, RecordEvent, SavedRecord};
use crate::models::{
    ErrorEntry, ErrorLog, HarvestModel, HarvestedRecord, RecordSource, Status,
    TransformationScript,
};

const RECORD_COLUMNS: &str = "id, source, identifier, source_url, raw_data, datestamp, \
    harvest_status, index_status, harvest_attempt, last_harvest_attempt, indexed_at, \
    index_name, type_data, parent_id, last_seq, created_at, updated_at";

const SCRIPT_COLUMNS: &str = "id, name, description, harvest_model, source_index, dest_index, \
    query_script, transform_script, is_active, created_at, updated_at";

#[derive(Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    events: Arc<EventBus>,
}

/// Fields for a new transformation script.
#[derive(Debug, Clone)]
pub struct NewScript {
    pub name: String,
    pub description: Option<String>,
    pub harvest_model: HarvestModel,
    pub source_index: String,
    pub dest_index: String,
    pub query_script: Option<String>,
    pub transform_script: String,
    pub is_active: bool,
}

/// Per-source, per-status record counts.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusCount {
    pub source: String,
    pub harvest_status: String,
    pub index_status: String,
    pub count: i64,
    pub last_attempt: Option<i64>,
}

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

impl RecordStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    // ═══════════════════════════════════════════════════════════════════
    // Records
    // ═══════════════════════════════════════════════════════════════════

    /// Returns the record for `(source, identifier)`, inserting an empty one
    /// on first sight. The boolean is `true` when the row was created here.
    pub async fn get_or_create(
        &self,
        source: RecordSource,
        identifier: &str,
    ) -> Result<(HarvestedRecord, bool)> {
        let now = now_ts();
        let inserted = sqlx::query(
            r#"
            INSERT INTO harvested_records (id, source, identifier, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source, identifier) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(source.as_str())
        .bind(identifier)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected()
            == 1;

        let record = self
            .find(source, identifier)
            .await?
            .with_context(|| format!("record {}/{} vanished after insert", source, identifier))?;

        if inserted {
            self.events
                .publish(
                    self,
                    RecordEvent::Saved(SavedRecord {
                        record: record.clone(),
                        created: true,
                        previous_raw: None,
                        update_fields: None,
                    }),
                )
                .await;
        }

        Ok((record, inserted))
    }

    pub async fn find(
        &self,
        source: RecordSource,
        identifier: &str,
    ) -> Result<Option<HarvestedRecord>> {
        let sql = format!(
            "SELECT {} FROM harvested_records WHERE source = ? AND identifier = ?",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(identifier)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn get(&self, id: &str) -> Result<Option<HarvestedRecord>> {
        let sql = format!("SELECT {} FROM harvested_records WHERE id = ?", RECORD_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn find_by_source_url(
        &self,
        source: RecordSource,
        source_url: &str,
    ) -> Result<Option<HarvestedRecord>> {
        let sql = format!(
            "SELECT {} FROM harvested_records WHERE source = ? AND source_url = ? LIMIT 1",
            RECORD_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(source_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Persists the payload columns of `record` and publishes `Saved`.
    ///
    /// `update_fields` lists the columns the caller changed; pass `None` for
    /// a full save.
    pub async fn save(
        &self,
        record: &mut HarvestedRecord,
        update_fields: Option<&[&str]>,
    ) -> Result<()> {
        let previous_raw: Option<String> =
            sqlx::query_scalar("SELECT raw_data FROM harvested_records WHERE id = ?")
                .bind(&record.id)
                .fetch_optional(&self.pool)
                .await?;
        let created = previous_raw.is_none();
        let previous_raw = previous_raw
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .context("stored raw_data is not valid JSON")?;

        record.updated_at = now_ts();
        if created {
            record.created_at = record.updated_at;
        }
        let raw = serde_json::to_string(&record.raw_data)?;

        sqlx::query(
            r#"
            INSERT INTO harvested_records (
                id, source, identifier, source_url, raw_data, datestamp,
                harvest_status, index_status, harvest_attempt, last_harvest_attempt,
                indexed_at, index_name, type_data, parent_id, last_seq, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_url = excluded.source_url,
                raw_data = excluded.raw_data,
                datestamp = excluded.datestamp,
                last_harvest_attempt = excluded.last_harvest_attempt,
                type_data = excluded.type_data,
                parent_id = excluded.parent_id,
                last_seq = excluded.last_seq,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(record.source.as_str())
        .bind(&record.identifier)
        .bind(&record.source_url)
        .bind(&raw)
        .bind(record.datestamp)
        .bind(record.harvest_status.as_str())
        .bind(record.index_status.as_str())
        .bind(record.harvest_attempt)
        .bind(record.last_harvest_attempt)
        .bind(record.indexed_at)
        .bind(&record.index_name)
        .bind(&record.type_data)
        .bind(&record.parent_id)
        .bind(record.last_seq)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        self.events
            .publish(
                self,
                RecordEvent::Saved(SavedRecord {
                    record: record.clone(),
                    created,
                    previous_raw,
                    update_fields: update_fields
                        .map(|fields| fields.iter().map(|f| f.to_string()).collect()),
                }),
            )
            .await;

        Ok(())
    }

    /// Copies a parsed payload onto the record and saves it.
    ///
    /// `source_url` becomes the first entry of `parsed.source`, when present.
    pub async fn set_attrs_from_parsed(
        &self,
        record: &mut HarvestedRecord,
        parsed: Value,
        datestamp: Option<i64>,
    ) -> Result<()> {
        if let Some(url) = parsed
            .get("source")
            .and_then(|s| s.as_array())
            .and_then(|urls| urls.first())
            .and_then(|u| u.as_str())
        {
            record.source_url = Some(url.to_string());
        }
        record.raw_data = parsed;
        record.datestamp = datestamp;
        record.last_harvest_attempt = Some(now_ts());
        self.save(record, None).await
    }

    /// Deletes the record and publishes `Deleted`. Returns `false` when no
    /// row existed.
    pub async fn delete(&self, record: &HarvestedRecord) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM harvested_records WHERE id = ?")
            .bind(&record.id)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;

        if deleted {
            self.events
                .publish(self, RecordEvent::Deleted(record.clone()))
                .await;
        }
        Ok(deleted)
    }

    pub async fn delete_by_identifier(
        &self,
        source: RecordSource,
        identifier: &str,
    ) -> Result<bool> {
        match self.find(source, identifier).await? {
            Some(record) => self.delete(&record).await,
            None => Ok(false),
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Status transitions
    // ═══════════════════════════════════════════════════════════════════

    /// Starts a new harvest attempt: bumps `harvest_attempt` and sets
    /// `harvest_status = in_progress`.
    pub async fn mark_in_progress(&self, record: &mut HarvestedRecord) -> Result<()> {
        let now = now_ts();
        let attempt: i64 = sqlx::query_scalar(
            r#"
            UPDATE harvested_records
            SET harvest_status = 'in_progress',
                harvest_attempt = harvest_attempt + 1,
                last_harvest_attempt = ?,
                updated_at = ?
            WHERE id = ?
            RETURNING harvest_attempt
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(&record.id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to start attempt for {}", record.identifier))?;

        record.harvest_status = Status::InProgress;
        record.harvest_attempt = attempt;
        record.last_harvest_attempt = Some(now);
        record.updated_at = now;
        Ok(())
    }

    pub async fn mark_success(&self, record: &mut HarvestedRecord) -> Result<()> {
        self.set_harvest_status(record, Status::Success).await
    }

    pub async fn mark_failed(&self, record: &mut HarvestedRecord) -> Result<()> {
        self.set_harvest_status(record, Status::Failed).await
    }

    async fn set_harvest_status(&self, record: &mut HarvestedRecord, status: Status) -> Result<()> {
        let now = now_ts();
        sqlx::query(
            "UPDATE harvested_records SET harvest_status = ?, last_harvest_attempt = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(now)
        .bind(now)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;
        record.harvest_status = status;
        record.last_harvest_attempt = Some(now);
        record.updated_at = now;
        Ok(())
    }

    /// Writes the errors of one attempt and moves the record out of
    /// `in_progress` in a single transaction.
    ///
    /// The transition only applies while the row is still in progress for
    /// `attempt`, so a second finalization of the same attempt is a no-op.
    /// Returns the resulting status.
    pub async fn finalize_attempt(
        &self,
        record_id: &str,
        attempt: i64,
        errors: &[ErrorEntry],
    ) -> Result<Status> {
        let status = if errors.is_empty() {
            Status::Success
        } else {
            Status::Failed
        };
        let now = now_ts();

        let mut tx = self.pool.begin().await?;
        let transitioned = sqlx::query(
            r#"
            UPDATE harvested_records
            SET harvest_status = ?, updated_at = ?
            WHERE id = ? AND harvest_attempt = ? AND harvest_status = 'in_progress'
            "#,
        )
        .bind(status.as_str())
        .bind(now)
        .bind(record_id)
        .bind(attempt)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !transitioned {
            tx.rollback().await?;
            let current: Option<String> =
                sqlx::query_scalar("SELECT harvest_status FROM harvested_records WHERE id = ?")
                    .bind(record_id)
                    .fetch_optional(&self.pool)
                    .await?;
            tracing::warn!(
                record_id,
                attempt,
                "attempt already finalized or superseded; status left unchanged"
            );
            return match current {
                Some(s) => s.parse(),
                None => anyhow::bail!("record {} no longer exists", record_id),
            };
        }

        for entry in errors {
            insert_error_log(&mut tx, record_id, attempt, entry).await?;
        }

        tx.commit().await?;
        Ok(status)
    }

    /// Appends error logs to `attempt` without touching `harvest_status`.
    ///
    /// Used for failures outside a harvest attempt, such as a projection
    /// the search engine rejected.
    pub async fn append_error_logs(
        &self,
        record_id: &str,
        attempt: i64,
        errors: &[ErrorEntry],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for entry in errors {
            insert_error_log(&mut tx, record_id, attempt, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn mark_index_in_progress(&self, record: &mut HarvestedRecord) -> Result<()> {
        self.set_index_status(record, Status::InProgress, None).await
    }

    /// Records a successful projection into `index_name`.
    pub async fn mark_indexed(&self, record: &mut HarvestedRecord, index_name: &str) -> Result<()> {
        self.set_index_status(record, Status::Success, Some(index_name))
            .await
    }

    pub async fn mark_index_failed(&self, record: &mut HarvestedRecord) -> Result<()> {
        self.set_index_status(record, Status::Failed, None).await
    }

    async fn set_index_status(
        &self,
        record: &mut HarvestedRecord,
        status: Status,
        index_name: Option<&str>,
    ) -> Result<()> {
        let now = now_ts();
        let indexed_at = index_name.map(|_| now);
        sqlx::query(
            r#"
            UPDATE harvested_records
            SET index_status = ?,
                indexed_at = COALESCE(?, indexed_at),
                index_name = COALESCE(?, index_name),
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(indexed_at)
        .bind(index_name)
        .bind(now)
        .bind(&record.id)
        .execute(&self.pool)
        .await?;

        record.index_status = status;
        if let Some(name) = index_name {
            record.indexed_at = indexed_at;
            record.index_name = Some(name.to_string());
        }
        record.updated_at = now;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════
    // Cursors and listings
    // ═══════════════════════════════════════════════════════════════════

    /// Latest `datestamp` among successfully harvested records of `source`.
    pub async fn max_success_datestamp(&self, source: RecordSource) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(datestamp) FROM harvested_records WHERE source = ? AND harvest_status = 'success'",
        )
        .bind(source.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(max)
    }

    /// Books change-feed cursor: `max(last_seq)` over successful books.
    pub async fn max_last_seq(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(last_seq) FROM harvested_records WHERE source = 'book' AND harvest_status = 'success'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(max.unwrap_or(0))
    }

    pub async fn count(&self, source: RecordSource) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM harvested_records WHERE source = ?")
            .bind(source.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn list_by_harvest_status(
        &self,
        source: RecordSource,
        status: Status,
    ) -> Result<Vec<HarvestedRecord>> {
        let sql = format!(
            "SELECT {} FROM harvested_records WHERE source = ? AND harvest_status = ? ORDER BY identifier",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_by_index_status(
        &self,
        source: RecordSource,
        status: Status,
    ) -> Result<Vec<HarvestedRecord>> {
        let sql = format!(
            "SELECT {} FROM harvested_records WHERE source = ? AND index_status = ? ORDER BY identifier",
            RECORD_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(source.as_str())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn list_all(
        &self,
        source: RecordSource,
        only_success: bool,
    ) -> Result<Vec<HarvestedRecord>> {
        let filter = if only_success {
            " AND harvest_status = 'success'"
        } else {
            ""
        };
        let sql = format!(
            "SELECT {} FROM harvested_records WHERE source = ?{} ORDER BY identifier",
            RECORD_COLUMNS, filter
        );
        let rows = sqlx::query(&sql)
            .bind(source.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query(
            r#"
            SELECT source, harvest_status, index_status,
                   COUNT(*) AS cnt, MAX(last_harvest_attempt) AS last_attempt
            FROM harvested_records
            GROUP BY source, harvest_status, index_status
            ORDER BY source, harvest_status, index_status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(StatusCount {
                    source: row.try_get("source")?,
                    harvest_status: row.try_get("harvest_status")?,
                    index_status: row.try_get("index_status")?,
                    count: row.try_get("cnt")?,
                    last_attempt: row.try_get("last_attempt")?,
                })
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════
    // Error logs
    // ═══════════════════════════════════════════════════════════════════

    pub async fn error_logs(&self, record_id: &str) -> Result<Vec<ErrorLog>> {
        let rows = sqlx::query(
            r#"
            SELECT id, record_id, attempt, field_name, exception_type, message,
                   traceback, context_data, occurred_at, is_resolved, resolved_at
            FROM harvest_error_logs
            WHERE record_id = ?
            ORDER BY attempt, id
            "#,
        )
        .bind(record_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(error_log_from_row).collect()
    }

    /// Error logs written by the record's most recent attempt.
    pub async fn latest_attempt_errors(&self, record: &HarvestedRecord) -> Result<Vec<ErrorLog>> {
        Ok(self
            .error_logs(&record.id)
            .await?
            .into_iter()
            .filter(|log| log.attempt == record.harvest_attempt)
            .collect())
    }

    /// Marks an error log as resolved. Returns `false` when the id is unknown.
    pub async fn resolve_error_log(&self, log_id: i64) -> Result<bool> {
        let updated = sqlx::query(
            "UPDATE harvest_error_logs SET is_resolved = 1, resolved_at = ? WHERE id = ? AND is_resolved = 0",
        )
        .bind(now_ts())
        .bind(log_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated > 0)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Transformation scripts
    // ═══════════════════════════════════════════════════════════════════

    /// Inserts a script. An active script replaces the model's current one.
    pub async fn create_script(&self, script: &NewScript) -> Result<i64> {
        let now = now_ts();
        let mut tx = self.pool.begin().await?;
        if script.is_active {
            sqlx::query(
                "UPDATE transformation_scripts SET is_active = 0, updated_at = ? WHERE harvest_model = ? AND is_active = 1",
            )
            .bind(now)
            .bind(script.harvest_model.as_str())
            .execute(&mut *tx)
            .await?;
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO transformation_scripts (
                name, description, harvest_model, source_index, dest_index,
                query_script, transform_script, is_active, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&script.name)
        .bind(&script.description)
        .bind(script.harvest_model.as_str())
        .bind(&script.source_index)
        .bind(&script.dest_index)
        .bind(&script.query_script)
        .bind(&script.transform_script)
        .bind(script.is_active)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_script(&self, id: i64) -> Result<Option<TransformationScript>> {
        let sql = format!(
            "SELECT {} FROM transformation_scripts WHERE id = ?",
            SCRIPT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(script_from_row).transpose()
    }

    pub async fn active_script(&self, model: HarvestModel) -> Result<Option<TransformationScript>> {
        let sql = format!(
            "SELECT {} FROM transformation_scripts WHERE harvest_model = ? AND is_active = 1",
            SCRIPT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(model.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(script_from_row).transpose()
    }

    pub async fn list_scripts(&self) -> Result<Vec<TransformationScript>> {
        let sql = format!(
            "SELECT {} FROM transformation_scripts ORDER BY harvest_model, id",
            SCRIPT_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(script_from_row).collect()
    }

    /// Activates or deactivates a script. Activation deactivates any other
    /// active script of the same model.
    pub async fn set_script_active(&self, id: i64, active: bool) -> Result<bool> {
        let script = match self.get_script(id).await? {
            Some(s) => s,
            None => return Ok(false),
        };
        let now = now_ts();
        let mut tx = self.pool.begin().await?;
        if active {
            sqlx::query(
                "UPDATE transformation_scripts SET is_active = 0, updated_at = ? WHERE harvest_model = ? AND id != ?",
            )
            .bind(now)
            .bind(script.harvest_model.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("UPDATE transformation_scripts SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(active)
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }
}

async fn insert_error_log(
    conn: &mut SqliteConnection,
    record_id: &str,
    attempt: i64,
    entry: &ErrorEntry,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO harvest_error_logs (
            record_id, attempt, field_name, exception_type, message,
            traceback, context_data, occurred_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record_id)
    .bind(attempt)
    .bind(&entry.field_name)
    .bind(&entry.exception_type)
    .bind(&entry.message)
    .bind(&entry.traceback)
    .bind(serde_json::to_string(&entry.context_data)?)
    .bind(entry.occurred_at)
    .execute(conn)
    .await?;
    Ok(())
}

fn record_from_row(row: &SqliteRow) -> Result<HarvestedRecord> {
    let source: String = row.try_get("source")?;
    let raw: String = row.try_get("raw_data")?;
    let harvest_status: String = row.try_get("harvest_status")?;
    let index_status: String = row.try_get("index_status")?;

    Ok(HarvestedRecord {
        id: row.try_get("id")?,
        source: source.parse()?,
        identifier: row.try_get("identifier")?,
        source_url: row.try_get("source_url")?,
        raw_data: serde_json::from_str(&raw).context("stored raw_data is not valid JSON")?,
        datestamp: row.try_get("datestamp")?,
        harvest_status: harvest_status.parse()?,
        index_status: index_status.parse()?,
        harvest_attempt: row.try_get("harvest_attempt")?,
        last_harvest_attempt: row.try_get("last_harvest_attempt")?,
        indexed_at: row.try_get("indexed_at")?,
        index_name: row.try_get("index_name")?,
        type_data: row.try_get("type_data")?,
        parent_id: row.try_get("parent_id")?,
        last_seq: row.try_get("last_seq")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn error_log_from_row(row: &SqliteRow) -> Result<ErrorLog> {
    let context: String = row.try_get("context_data")?;
    Ok(ErrorLog {
        id: row.try_get("id")?,
        record_id: row.try_get("record_id")?,
        attempt: row.try_get("attempt")?,
        field_name: row.try_get("field_name")?,
        exception_type: row.try_get("exception_type")?,
        message: row.try_get("message")?,
        traceback: row.try_get("traceback")?,
        context_data: serde_json::from_str(&context).unwrap_or(Value::Null),
        occurred_at: row.try_get("occurred_at")?,
        is_resolved: row.try_get("is_resolved")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn script_from_row(row: &SqliteRow) -> Result<TransformationScript> {
    let model: String = row.try_get("harvest_model")?;
    Ok(TransformationScript {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        harvest_model: model.parse()?,
        source_index: row.try_get("source_index")?,
        dest_index: row.try_get("dest_index")?,
        query_script: row.try_get("query_script")?,
        transform_script: row.try_get("transform_script")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
