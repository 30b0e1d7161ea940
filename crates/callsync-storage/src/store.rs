//! SQLite-backed store for call logs, check-ins and normalized health entries.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use callsync_core::{
    normalize_phone, CallLog, CallRecord, CallTranscript, CheckIn, CheckInSource, ExtractionMode,
    FoodEntry, MedicationEntry, Sentiment, StructuredResult, SymptomEntry, User,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::sha256_hex;

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("unique constraint violated: {0}")]
    UniqueViolation(String),
    #[error("constraint violated: {0}")]
    ConstraintViolation(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("encoding {column}: {source}")]
    Encode {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected value {value:?} in column {column}")]
    Corrupt { column: &'static str, value: String },
}

impl From<sqlx::Error> for PersistenceError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return Self::UniqueViolation(db.message().to_string());
            }
            if db.is_check_violation() || db.is_foreign_key_violation() {
                return Self::ConstraintViolation(db.message().to_string());
            }
        }
        Self::Database(err)
    }
}

impl PersistenceError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }
}

/// Result of one sync transaction. `AlreadyProcessed` is the idempotent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Synced {
        call_log_id: i64,
        checkin_id: i64,
        entries: usize,
    },
    Replaced {
        call_log_id: i64,
        checkin_id: i64,
        entries: usize,
    },
    AlreadyProcessed {
        call_log_id: i64,
    },
}

impl SyncOutcome {
    pub fn call_log_id(&self) -> i64 {
        match self {
            Self::Synced { call_log_id, .. }
            | Self::Replaced { call_log_id, .. }
            | Self::AlreadyProcessed { call_log_id } => *call_log_id,
        }
    }

    pub fn is_new_work(&self) -> bool {
        !matches!(self, Self::AlreadyProcessed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EntryCounts {
    pub medications: i64,
    pub foods: i64,
    pub symptoms: i64,
}

impl EntryCounts {
    pub fn total(&self) -> i64 {
        self.medications + self.foods + self.symptoms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Scheduled,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    Running,
    Succeeded,
    Failed,
}

impl SyncRunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncRunRecord {
    pub run_id: Uuid,
    pub trigger: SyncTrigger,
    pub status: SyncRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub fetched: i64,
    pub processed: i64,
    pub already_processed: i64,
    pub failed: i64,
    pub error: Option<String>,
}

impl SyncRunRecord {
    pub fn started(run_id: Uuid, trigger: SyncTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            trigger,
            status: SyncRunStatus::Running,
            started_at,
            finished_at: None,
            fetched: 0,
            processed: 0,
            already_processed: 0,
            failed: 0,
            error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database and applies embedded migrations.
    pub async fn open(database_url: &str) -> Result<Self, PersistenceError> {
        let store = Self::connect(database_url).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let mut opts = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            opts = opts
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // Every connection to `:memory:` is a distinct database, so pin the pool to one.
        let pool_opts = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_opts.connect_with(opts).await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self, PersistenceError> {
        Self::open("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn register_user(
        &self,
        phone: &str,
        full_name: &str,
    ) -> Result<User, PersistenceError> {
        let phone = normalize_phone(phone);
        let row = sqlx::query(
            r#"
            INSERT INTO users (phone, full_name, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(phone) DO UPDATE SET full_name = excluded.full_name
            RETURNING id, phone, full_name
            "#,
        )
        .bind(&phone)
        .bind(full_name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        user_from_row(&row)
    }

    pub async fn user_by_phone(&self, phone: &str) -> Result<Option<User>, PersistenceError> {
        let row = sqlx::query("SELECT id, phone, full_name FROM users WHERE phone = ?")
            .bind(normalize_phone(phone))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    /// Idempotent raw upsert of the call log and its transcript backup, independent of extraction.
    pub async fn upsert_call_log(&self, record: &CallRecord) -> Result<CallLog, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let call_log = upsert_call_log_row(&mut tx, record, Utc::now()).await?;
        tx.commit().await?;
        Ok(call_log)
    }

    pub async fn call_log(&self, external_call_id: &str) -> Result<Option<CallLog>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, external_call_id, user_id, caller_phone, occurred_at,
                   duration_seconds, processed, processed_at
              FROM call_logs
             WHERE external_call_id = ?
            "#,
        )
        .bind(external_call_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(call_log_from_row).transpose()
    }

    pub async fn transcript_for(
        &self,
        call_log_id: i64,
    ) -> Result<Option<CallTranscript>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, call_log_id, raw_transcript, api_summary, content_sha256, created_at
              FROM call_transcripts
             WHERE call_log_id = ?
            "#,
        )
        .bind(call_log_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(CallTranscript {
            id: row.try_get("id")?,
            call_log_id: row.try_get("call_log_id")?,
            raw_transcript: row.try_get("raw_transcript")?,
            api_summary: row.try_get("api_summary")?,
            content_sha256: row.try_get("content_sha256")?,
            created_at: row.try_get("created_at")?,
        }))
    }

    /// External ids among `ids` whose call log is already marked processed. Read-only.
    pub async fn processed_call_ids(
        &self,
        ids: &[String],
    ) -> Result<HashSet<String>, PersistenceError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT external_call_id FROM call_logs WHERE processed = 1 AND external_call_id IN (",
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.as_str());
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        let mut out = HashSet::with_capacity(rows.len());
        for row in rows {
            out.insert(row.try_get::<String, _>("external_call_id")?);
        }
        Ok(out)
    }

    /// Writes one call's extraction as a single transaction: upsert call log and transcript,
    /// create the check-in, create its entries, flip `processed`. All or nothing.
    ///
    /// When the call log is already processed the transaction rolls back and the call
    /// reports `AlreadyProcessed`, unless `replace_existing` is set, in which case the prior
    /// call-derived check-in and its entries are swapped for the new result.
    pub async fn apply_sync(
        &self,
        record: &CallRecord,
        result: &StructuredResult,
        replace_existing: bool,
    ) -> Result<SyncOutcome, PersistenceError> {
        let now = Utc::now();
        // The upsert is the first statement so the write lock is taken before any read.
        let mut tx = self.pool.begin().await?;
        let call_log = upsert_call_log_row(&mut tx, record, now).await?;

        let mut replaced = false;
        if call_log.processed {
            if !replace_existing {
                tx.rollback().await?;
                debug!(call_id = %record.external_call_id, "call log already processed");
                return Ok(SyncOutcome::AlreadyProcessed {
                    call_log_id: call_log.id,
                });
            }
            replaced = delete_call_checkin(&mut tx, call_log.id).await?;
        }

        let new_checkin = NewCheckIn {
            user_id: call_log.user_id,
            source: CheckInSource::VoiceCall,
            call_log_id: Some(call_log.id),
            timestamp: record.occurred_at,
        };
        let checkin_id = match insert_checkin(&mut tx, &new_checkin, result, now).await {
            Ok(id) => id,
            Err(PersistenceError::UniqueViolation(message)) => {
                tx.rollback().await?;
                debug!(call_id = %record.external_call_id, %message, "check-in created concurrently");
                return Ok(SyncOutcome::AlreadyProcessed {
                    call_log_id: call_log.id,
                });
            }
            Err(err) => return Err(err),
        };

        let entries = insert_entries(&mut tx, checkin_id, call_log.user_id, result, record.occurred_at)
            .await?;

        let flipped = sqlx::query(
            r#"
            UPDATE call_logs
               SET processed = 1, processed_at = ?
             WHERE id = ? AND (processed = 0 OR ?)
            "#,
        )
        .bind(now)
        .bind(call_log.id)
        .bind(replace_existing)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if flipped == 0 {
            tx.rollback().await?;
            return Ok(SyncOutcome::AlreadyProcessed {
                call_log_id: call_log.id,
            });
        }

        if let Err(err) = tx.commit().await {
            let err = PersistenceError::from(err);
            if err.is_unique_violation() {
                return Ok(SyncOutcome::AlreadyProcessed {
                    call_log_id: call_log.id,
                });
            }
            return Err(err);
        }

        Ok(if replaced {
            SyncOutcome::Replaced {
                call_log_id: call_log.id,
                checkin_id,
                entries,
            }
        } else {
            SyncOutcome::Synced {
                call_log_id: call_log.id,
                checkin_id,
                entries,
            }
        })
    }

    /// Creates a check-in from in-app input (no call log) together with its entries.
    pub async fn record_manual_checkin(
        &self,
        user_id: i64,
        source: CheckInSource,
        result: &StructuredResult,
        at: DateTime<Utc>,
    ) -> Result<CheckIn, PersistenceError> {
        if source == CheckInSource::VoiceCall {
            return Err(PersistenceError::ConstraintViolation(
                "voice_call check-ins are created from call logs only".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        let new_checkin = NewCheckIn {
            user_id: Some(user_id),
            source,
            call_log_id: None,
            timestamp: at,
        };
        let checkin_id = insert_checkin(&mut tx, &new_checkin, result, Utc::now()).await?;
        insert_entries(&mut tx, checkin_id, Some(user_id), result, at).await?;
        tx.commit().await?;

        self.checkin(checkin_id)
            .await?
            .ok_or(PersistenceError::Corrupt {
                column: "checkins.id",
                value: checkin_id.to_string(),
            })
    }

    pub async fn checkin(&self, checkin_id: i64) -> Result<Option<CheckIn>, PersistenceError> {
        let row = sqlx::query(&format!("{CHECKIN_SELECT} WHERE id = ?"))
            .bind(checkin_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(checkin_from_row).transpose()
    }

    pub async fn checkin_for_call_log(
        &self,
        call_log_id: i64,
    ) -> Result<Option<CheckIn>, PersistenceError> {
        let row = sqlx::query(&format!("{CHECKIN_SELECT} WHERE call_log_id = ?"))
            .bind(call_log_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(checkin_from_row).transpose()
    }

    /// Check-ins for a user, most recent first.
    pub async fn list_checkins(
        &self,
        user_id: i64,
        limit: u32,
    ) -> Result<Vec<CheckIn>, PersistenceError> {
        let rows = sqlx::query(&format!(
            "{CHECKIN_SELECT} WHERE user_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?"
        ))
        .bind(user_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(checkin_from_row).collect()
    }

    pub async fn list_medications(
        &self,
        user_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MedicationEntry>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, checkin_id, user_id, name, dosage, frequency, status, adherence_rate, recorded_at
              FROM medication_entries
             WHERE user_id = ? AND (? IS NULL OR recorded_at >= ?)
             ORDER BY recorded_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(MedicationEntry {
                id: row.try_get("id")?,
                checkin_id: row.try_get("checkin_id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
                dosage: row.try_get("dosage")?,
                frequency: row.try_get("frequency")?,
                status: row.try_get("status")?,
                adherence_rate: row.try_get("adherence_rate")?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(out)
    }

    pub async fn list_food(
        &self,
        user_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<FoodEntry>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, checkin_id, user_id, name, calories, protein, carbs, fat,
                   consumed_at, meal_type, recorded_at
              FROM food_entries
             WHERE user_id = ? AND (? IS NULL OR recorded_at >= ?)
             ORDER BY recorded_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(FoodEntry {
                id: row.try_get("id")?,
                checkin_id: row.try_get("checkin_id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
                calories: row.try_get("calories")?,
                protein: row.try_get("protein")?,
                carbs: row.try_get("carbs")?,
                fat: row.try_get("fat")?,
                consumed_at: row.try_get("consumed_at")?,
                meal_type: row.try_get("meal_type")?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(out)
    }

    pub async fn list_symptoms(
        &self,
        user_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<SymptomEntry>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, checkin_id, user_id, name, severity, frequency, trend, recorded_at
              FROM symptom_entries
             WHERE user_id = ? AND (? IS NULL OR recorded_at >= ?)
             ORDER BY recorded_at DESC, id DESC
            "#,
        )
        .bind(user_id)
        .bind(since)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SymptomEntry {
                id: row.try_get("id")?,
                checkin_id: row.try_get("checkin_id")?,
                user_id: row.try_get("user_id")?,
                name: row.try_get("name")?,
                severity: row.try_get("severity")?,
                frequency: row.try_get("frequency")?,
                trend: row.try_get("trend")?,
                recorded_at: row.try_get("recorded_at")?,
            });
        }
        Ok(out)
    }

    pub async fn entry_counts(&self, checkin_id: i64) -> Result<EntryCounts, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM medication_entries WHERE checkin_id = ?) AS medications,
                   (SELECT COUNT(*) FROM food_entries WHERE checkin_id = ?) AS foods,
                   (SELECT COUNT(*) FROM symptom_entries WHERE checkin_id = ?) AS symptoms
            "#,
        )
        .bind(checkin_id)
        .bind(checkin_id)
        .bind(checkin_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(EntryCounts {
            medications: row.try_get("medications")?,
            foods: row.try_get("foods")?,
            symptoms: row.try_get("symptoms")?,
        })
    }

    /// `(total, processed)` call log counts.
    pub async fn call_log_counts(&self) -> Result<(i64, i64), PersistenceError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total, COALESCE(SUM(processed), 0) AS processed FROM call_logs",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("total")?, row.try_get("processed")?))
    }

    pub async fn begin_run(&self, run: &SyncRunRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (run_id, trigger_kind, status, started_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.trigger.as_str())
        .bind(run.status.as_str())
        .bind(run.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_run(&self, run: &SyncRunRecord) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            UPDATE sync_runs
               SET status = ?, finished_at = ?, fetched = ?, processed = ?,
                   already_processed = ?, failed = ?, error = ?
             WHERE run_id = ?
            "#,
        )
        .bind(run.status.as_str())
        .bind(run.finished_at)
        .bind(run.fetched)
        .bind(run.processed)
        .bind(run.already_processed)
        .bind(run.failed)
        .bind(run.error.as_deref())
        .bind(run.run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let finished: Option<DateTime<Utc>> = sqlx::query_scalar(
            r#"
            SELECT finished_at
              FROM sync_runs
             WHERE status = 'succeeded' AND finished_at IS NOT NULL
             ORDER BY finished_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(finished)
    }

    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<SyncRunRecord>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, trigger_kind, status, started_at, finished_at, fetched,
                   processed, already_processed, failed, error
              FROM sync_runs
             ORDER BY started_at DESC
             LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(sync_run_from_row).collect()
    }
}

const CHECKIN_SELECT: &str = r#"
    SELECT id, user_id, source, call_log_id, summary, sentiment, key_topics,
           extraction_mode, llm_model, timestamp
      FROM checkins
"#;

struct NewCheckIn {
    user_id: Option<i64>,
    source: CheckInSource,
    call_log_id: Option<i64>,
    timestamp: DateTime<Utc>,
}

async fn upsert_call_log_row(
    conn: &mut SqliteConnection,
    record: &CallRecord,
    now: DateTime<Utc>,
) -> Result<CallLog, PersistenceError> {
    let phone = normalize_phone(&record.caller_phone);
    let row = sqlx::query(
        r#"
        INSERT INTO call_logs
            (external_call_id, user_id, caller_phone, occurred_at, duration_seconds, processed, created_at)
        VALUES (?, (SELECT id FROM users WHERE phone = ?), ?, ?, ?, 0, ?)
        ON CONFLICT(external_call_id) DO UPDATE SET
            caller_phone = excluded.caller_phone,
            occurred_at = excluded.occurred_at,
            duration_seconds = excluded.duration_seconds,
            user_id = COALESCE(call_logs.user_id, excluded.user_id)
        RETURNING id, external_call_id, user_id, caller_phone, occurred_at,
                  duration_seconds, processed, processed_at
        "#,
    )
    .bind(&record.external_call_id)
    .bind(&phone)
    .bind(&phone)
    .bind(record.occurred_at)
    .bind(record.duration_seconds)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    let call_log = call_log_from_row(&row)?;

    if let Some(transcript) = record.raw_transcript.as_deref() {
        let content_sha256 = sha256_hex(transcript.as_bytes());
        let inserted = sqlx::query(
            r#"
            INSERT INTO call_transcripts
                (call_log_id, raw_transcript, api_summary, content_sha256, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(call_log_id) DO NOTHING
            "#,
        )
        .bind(call_log.id)
        .bind(transcript)
        .bind(record.api_summary.as_deref())
        .bind(&content_sha256)
        .bind(now)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if inserted == 0 {
            let stored: Option<String> = sqlx::query_scalar(
                "SELECT content_sha256 FROM call_transcripts WHERE call_log_id = ?",
            )
            .bind(call_log.id)
            .fetch_optional(&mut *conn)
            .await?;
            if stored.as_deref().is_some_and(|s| s != content_sha256) {
                warn!(
                    call_id = %record.external_call_id,
                    "source transcript changed after first capture; keeping stored copy"
                );
            }
        }
    }

    Ok(call_log)
}

async fn delete_call_checkin(
    conn: &mut SqliteConnection,
    call_log_id: i64,
) -> Result<bool, PersistenceError> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT id FROM checkins WHERE call_log_id = ?")
        .bind(call_log_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(checkin_id) = existing else {
        return Ok(false);
    };

    for table in ["medication_entries", "food_entries", "symptom_entries"] {
        let sql = format!("DELETE FROM {table} WHERE checkin_id = ?");
        sqlx::query(&sql)
            .bind(checkin_id)
            .execute(&mut *conn)
            .await?;
    }
    sqlx::query("DELETE FROM checkins WHERE id = ?")
        .bind(checkin_id)
        .execute(&mut *conn)
        .await?;
    Ok(true)
}

async fn insert_checkin(
    conn: &mut SqliteConnection,
    checkin: &NewCheckIn,
    result: &StructuredResult,
    now: DateTime<Utc>,
) -> Result<i64, PersistenceError> {
    let key_topics = serde_json::to_string(&result.key_topics).map_err(|source| {
        PersistenceError::Encode {
            column: "checkins.key_topics",
            source,
        }
    })?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO checkins
            (user_id, source, call_log_id, summary, sentiment, key_topics,
             extraction_mode, llm_model, timestamp, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(checkin.user_id)
    .bind(checkin.source.as_str())
    .bind(checkin.call_log_id)
    .bind(&result.summary)
    .bind(result.sentiment.map(Sentiment::as_str))
    .bind(key_topics)
    .bind(result.mode.as_str())
    .bind(result.model.as_deref())
    .bind(checkin.timestamp)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(inserted.last_insert_rowid())
}

async fn insert_entries(
    conn: &mut SqliteConnection,
    checkin_id: i64,
    user_id: Option<i64>,
    result: &StructuredResult,
    recorded_at: DateTime<Utc>,
) -> Result<usize, PersistenceError> {
    for med in &result.medications {
        sqlx::query(
            r#"
            INSERT INTO medication_entries
                (checkin_id, user_id, name, dosage, frequency, status, adherence_rate, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(checkin_id)
        .bind(user_id)
        .bind(&med.name)
        .bind(&med.dosage)
        .bind(&med.frequency)
        .bind(&med.status)
        .bind(med.adherence_rate)
        .bind(recorded_at)
        .execute(&mut *conn)
        .await?;
    }

    for food in &result.foods {
        sqlx::query(
            r#"
            INSERT INTO food_entries
                (checkin_id, user_id, name, calories, protein, carbs, fat,
                 consumed_at, meal_type, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(checkin_id)
        .bind(user_id)
        .bind(&food.name)
        .bind(food.calories)
        .bind(food.protein)
        .bind(food.carbs)
        .bind(food.fat)
        .bind(food.consumed_at.as_deref())
        .bind(&food.meal_type)
        .bind(recorded_at)
        .execute(&mut *conn)
        .await?;
    }

    for symptom in &result.symptoms {
        sqlx::query(
            r#"
            INSERT INTO symptom_entries
                (checkin_id, user_id, name, severity, frequency, trend, recorded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(checkin_id)
        .bind(user_id)
        .bind(&symptom.name)
        .bind(&symptom.severity)
        .bind(&symptom.frequency)
        .bind(&symptom.trend)
        .bind(recorded_at)
        .execute(&mut *conn)
        .await?;
    }

    Ok(result.entry_count())
}

fn user_from_row(row: &SqliteRow) -> Result<User, PersistenceError> {
    Ok(User {
        id: row.try_get("id")?,
        phone: row.try_get("phone")?,
        full_name: row.try_get("full_name")?,
    })
}

fn call_log_from_row(row: &SqliteRow) -> Result<CallLog, PersistenceError> {
    Ok(CallLog {
        id: row.try_get("id")?,
        external_call_id: row.try_get("external_call_id")?,
        user_id: row.try_get("user_id")?,
        caller_phone: row.try_get("caller_phone")?,
        occurred_at: row.try_get("occurred_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        processed: row.try_get("processed")?,
        processed_at: row.try_get("processed_at")?,
    })
}

fn checkin_from_row(row: &SqliteRow) -> Result<CheckIn, PersistenceError> {
    let source: String = row.try_get("source")?;
    let source = source.parse().map_err(|_| PersistenceError::Corrupt {
        column: "checkins.source",
        value: source.clone(),
    })?;
    let mode: String = row.try_get("extraction_mode")?;
    let extraction_mode: ExtractionMode = mode.parse().map_err(|_| PersistenceError::Corrupt {
        column: "checkins.extraction_mode",
        value: mode.clone(),
    })?;
    let topics: String = row.try_get("key_topics")?;
    let key_topics = serde_json::from_str(&topics).map_err(|_| PersistenceError::Corrupt {
        column: "checkins.key_topics",
        value: topics.clone(),
    })?;
    let sentiment: Option<String> = row.try_get("sentiment")?;

    Ok(CheckIn {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        source,
        call_log_id: row.try_get("call_log_id")?,
        summary: row.try_get("summary")?,
        sentiment: sentiment.as_deref().map(Sentiment::from_lenient),
        key_topics,
        extraction_mode,
        llm_model: row.try_get("llm_model")?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn sync_run_from_row(row: &SqliteRow) -> Result<SyncRunRecord, PersistenceError> {
    let run_id: String = row.try_get("run_id")?;
    let run_id = Uuid::parse_str(&run_id).map_err(|_| PersistenceError::Corrupt {
        column: "sync_runs.run_id",
        value: run_id.clone(),
    })?;
    let trigger: String = row.try_get("trigger_kind")?;
    let trigger = match trigger.as_str() {
        "scheduled" => SyncTrigger::Scheduled,
        "manual" => SyncTrigger::Manual,
        _ => {
            return Err(PersistenceError::Corrupt {
                column: "sync_runs.trigger_kind",
                value: trigger,
            })
        }
    };
    let status: String = row.try_get("status")?;
    let status = match status.as_str() {
        "running" => SyncRunStatus::Running,
        "succeeded" => SyncRunStatus::Succeeded,
        "failed" => SyncRunStatus::Failed,
        _ => {
            return Err(PersistenceError::Corrupt {
                column: "sync_runs.status",
                value: status,
            })
        }
    };

    Ok(SyncRunRecord {
        run_id,
        trigger,
        status,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        fetched: row.try_get("fetched")?,
        processed: row.try_get("processed")?,
        already_processed: row.try_get("already_processed")?,
        failed: row.try_get("failed")?,
        error: row.try_get("error")?,
    })
}
