use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replybot_core::{
    Account, CheckpointStore, Commit, CoreError, DatabaseError, MarkerState, Outcome,
    ReplyEntry, ReplyRecord, ReplyWindow, RunCheckpoint, TargetCheckpoint,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;


const MIGRATIONS: &[(&str, &str)] = &[
    (
        "create_target_checkpoints",
        r#"
        CREATE TABLE IF NOT EXISTS target_checkpoints (
            target TEXT PRIMARY KEY,
            last_processed INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    ),
    (
        "create_replied_items",
        r#"
        CREATE TABLE IF NOT EXISTS replied_items (
            target TEXT NOT NULL,
            item_id TEXT NOT NULL,
            item_created INTEGER NOT NULL,
            marked_at INTEGER NOT NULL,
            account TEXT,
            state TEXT NOT NULL,
            PRIMARY KEY (target, item_id)
        )
        "#,
    ),
    (
        "create_reply_records",
        r#"
        CREATE TABLE IF NOT EXISTS reply_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            target TEXT NOT NULL,
            item_id TEXT NOT NULL,
            item_created INTEGER NOT NULL,
            account TEXT,
            generated_text TEXT,
            recorded_at TEXT NOT NULL,
            outcome TEXT NOT NULL,
            reason TEXT,
            reply_id TEXT
        )
        "#,
    ),
    (
        "index_single_success",
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_reply_records_single_success
        ON reply_records(item_id) WHERE outcome = 'success'
        "#,
    ),
    (
        "index_records_by_target",
        r#"
        CREATE INDEX IF NOT EXISTS idx_reply_records_target
        ON reply_records(target, id)
        "#,
    ),
    (
        "create_accounts",
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            last_used INTEGER,
            consecutive_failures INTEGER NOT NULL,
            revision INTEGER NOT NULL
        )
        "#,
    ),
];

fn sql_error(e: sqlx::Error) -> CoreError {
    if let sqlx::Error::Database(db) = &e {
        // SQLITE_BUSY
        if db.code().as_deref() == Some("5") {
            return CoreError::Database(DatabaseError::DatabaseLocked);
        }
    }
    CoreError::Database(DatabaseError::Sql(e))
}

fn corrupt(details: impl Into<String>) -> CoreError {
    CoreError::Database(DatabaseError::CorruptCheckpoint {
        details: details.into(),
    })
}

/// SQLite-backed checkpoint store.
pub struct Database {
    connection_string: String,
    pool: Option<SqlitePool>,
}

impl Database {
    /// `connection_string` is a path or a `sqlite://` URL.
    pub fn new(connection_string: String) -> Self {
        Self {
            connection_string,
            pool: None,
        }
    }

    pub async fn connect(&mut self) -> Result<(), CoreError> {
        let url = if self.connection_string.starts_with("sqlite:") {
            self.connection_string.clone()
        } else {
            format!("sqlite://{}", self.connection_string)
        };

        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| {
                CoreError::Database(DatabaseError::ConnectionFailed {
                    reason: e.to_string(),
                })
            })?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                CoreError::Database(DatabaseError::ConnectionFailed {
                    reason: e.to_string(),
                })
            })?;

        info!("Connected to state database at {}", self.connection_string);
        self.pool = Some(pool);
        Ok(())
    }

    fn pool(&self) -> Result<&SqlitePool, CoreError> {
        self.pool.as_ref().ok_or_else(|| {
            CoreError::Database(DatabaseError::ConnectionFailed {
                reason: "database not connected".to_string(),
            })
        })
    }

    pub async fn run_migrations(&self) -> Result<(), CoreError> {
        let pool = self.pool()?;
        for (name, statement) in MIGRATIONS {
            sqlx::query(statement).execute(pool).await.map_err(|e| {
                CoreError::Database(DatabaseError::MigrationFailed {
                    migration: format!("{}: {}", name, e),
                })
            })?;
        }
        debug!("Applied {} migrations", MIGRATIONS.len());
        Ok(())
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    async fn load_window(&self, target: &str) -> Result<ReplyWindow, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT item_id, item_created, marked_at, account, state
            FROM replied_items WHERE target = ?
            "#,
        )
        .bind(target)
        .fetch_all(self.pool()?)
        .await
        .map_err(sql_error)?;

        let mut window = ReplyWindow::default();
        for row in rows {
            let state = match row.get::<String, _>("state").as_str() {
                "in_flight" => MarkerState::InFlight,
                "replied" => MarkerState::Replied,
                other => return Err(corrupt(format!("unknown marker state '{}'", other))),
            };
            window.entries.insert(
                row.get("item_id"),
                ReplyEntry {
                    item_created: row.get("item_created"),
                    marked_at: row.get("marked_at"),
                    account: row.get("account"),
                    state,
                },
            );
        }
        Ok(window)
    }

    /// Append-only history for a target, oldest first.
    pub async fn records_for(&self, target: &str) -> Result<Vec<ReplyRecord>, CoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, target, item_id, item_created, account, generated_text,
                   recorded_at, outcome, reason, reply_id
            FROM reply_records WHERE target = ? ORDER BY id
            "#,
        )
        .bind(target)
        .fetch_all(self.pool()?)
        .await
        .map_err(sql_error)?;

        rows.into_iter()
            .map(|row| {
                let run_id: String = row.get("run_id");
                let outcome: String = row.get("outcome");
                Ok(ReplyRecord {
                    run_id: Uuid::parse_str(&run_id).map_err(|e| corrupt(e.to_string()))?,
                    target: row.get("target"),
                    item_id: row.get("item_id"),
                    item_created: row.get("item_created"),
                    account: row.get("account"),
                    generated_text: row.get("generated_text"),
                    recorded_at: row.get::<DateTime<Utc>, _>("recorded_at"),
                    outcome: Outcome::from_str(&outcome).map_err(corrupt)?,
                    reason: row.get("reason"),
                    reply_id: row.get("reply_id"),
                })
            })
            .collect()
    }

    pub async fn count_successes(&self, target: &str) -> Result<i64, CoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM reply_records WHERE target = ? AND outcome = 'success'",
        )
        .bind(target)
        .fetch_one(self.pool()?)
        .await
        .map_err(sql_error)?;
        Ok(row.get("n"))
    }

    /// Everything stored, in the serializable checkpoint layout.
    pub async fn export_checkpoint(&self) -> Result<RunCheckpoint, CoreError> {
        let targets: Vec<String> =
            sqlx::query("SELECT target FROM target_checkpoints ORDER BY target")
                .fetch_all(self.pool()?)
                .await
                .map_err(sql_error)?
                .into_iter()
                .map(|row| row.get("target"))
                .collect();

        let mut checkpoint = RunCheckpoint::default();
        for target in targets {
            if let Some(cp) = self.load(&target).await? {
                checkpoint.targets.insert(target, cp);
            }
        }
        checkpoint.accounts = self.load_accounts().await?;
        Ok(checkpoint)
    }

    async fn write_checkpoint(
        tx: &mut Transaction<'_, Sqlite>,
        checkpoint: &TargetCheckpoint,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO target_checkpoints (target, last_processed, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(target) DO UPDATE SET
                last_processed = MAX(last_processed, excluded.last_processed),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.target)
        .bind(checkpoint.last_processed)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;

        let stored: HashMap<String, (String, i64)> = sqlx::query(
            "SELECT item_id, state, marked_at FROM replied_items WHERE target = ?",
        )
        .bind(&checkpoint.target)
        .fetch_all(&mut **tx)
        .await?
        .into_iter()
        .map(|row| (row.get("item_id"), (row.get("state"), row.get("marked_at"))))
        .collect();

        let entries = &checkpoint.replied.entries;
        let mut written = 0;
        for (item_id, entry) in entries {
            let unchanged = stored.get(item_id).is_some_and(|(state, marked_at)| {
                state == entry.state.as_str() && *marked_at == entry.marked_at
            });
            if unchanged {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO replied_items (target, item_id, item_created, marked_at, account, state)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(target, item_id) DO UPDATE SET
                    item_created = excluded.item_created,
                    marked_at = excluded.marked_at,
                    account = excluded.account,
                    state = excluded.state
                "#,
            )
            .bind(&checkpoint.target)
            .bind(item_id)
            .bind(entry.item_created)
            .bind(entry.marked_at)
            .bind(&entry.account)
            .bind(entry.state.as_str())
            .execute(&mut **tx)
            .await?;
            written += 1;
        }

        let mut removed = 0;
        for item_id in stored.keys().filter(|id| !entries.contains_key(*id)) {
            sqlx::query("DELETE FROM replied_items WHERE target = ? AND item_id = ?")
                .bind(&checkpoint.target)
                .bind(item_id)
                .execute(&mut **tx)
                .await?;
            removed += 1;
        }

        if written > 0 || removed > 0 {
            debug!(
                target_key = %checkpoint.target,
                written, removed, "Replied window updated"
            );
        }
        Ok(())
    }

    async fn write_record(
        tx: &mut Transaction<'_, Sqlite>,
        record: &ReplyRecord,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO reply_records
                (run_id, target, item_id, item_created, account, generated_text,
                 recorded_at, outcome, reason, reply_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.run_id.to_string())
        .bind(&record.target)
        .bind(&record.item_id)
        .bind(record.item_created)
        .bind(&record.account)
        .bind(&record.generated_text)
        .bind(record.recorded_at)
        .bind(record.outcome.as_str())
        .bind(&record.reason)
        .bind(&record.reply_id)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn write_account(
        tx: &mut Transaction<'_, Sqlite>,
        account: &Account,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, last_used, consecutive_failures, revision)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_used = excluded.last_used,
                consecutive_failures = excluded.consecutive_failures,
                revision = excluded.revision
            WHERE excluded.revision >= accounts.revision
            "#,
        )
        .bind(&account.id)
        .bind(account.last_used)
        .bind(i64::from(account.consecutive_failures))
        .bind(account.revision as i64)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for Database {
    async fn load(&self, target: &str) -> Result<Option<TargetCheckpoint>, CoreError> {
        let row = sqlx::query("SELECT last_processed FROM target_checkpoints WHERE target = ?")
            .bind(target)
            .fetch_optional(self.pool()?)
            .await
            .map_err(sql_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(TargetCheckpoint {
            target: target.to_string(),
            last_processed: row.get("last_processed"),
            replied: self.load_window(target).await?,
        }))
    }

    async fn load_accounts(&self) -> Result<Vec<Account>, CoreError> {
        let rows = sqlx::query(
            "SELECT id, last_used, consecutive_failures, revision FROM accounts ORDER BY id",
        )
        .fetch_all(self.pool()?)
        .await
        .map_err(sql_error)?;

        Ok(rows
            .into_iter()
            .map(|row| Account {
                id: row.get("id"),
                last_used: row.get("last_used"),
                consecutive_failures: row.get::<i64, _>("consecutive_failures").max(0) as u32,
                revision: row.get::<i64, _>("revision").max(0) as u64,
            })
            .collect())
    }

    async fn commit(&self, commit: &Commit) -> Result<(), CoreError> {
        let mut tx = self.pool()?.begin().await.map_err(sql_error)?;

        Self::write_checkpoint(&mut tx, &commit.checkpoint)
            .await
            .map_err(sql_error)?;

        if let Some(record) = &commit.record {
            let inserted = Self::write_record(&mut tx, record).await.map_err(sql_error)?;
            if !inserted {
                warn!(
                    item_id = %record.item_id,
                    target_key = %record.target,
                    "Duplicate success record ignored by store"
                );
            }
        }

        if let Some(account) = &commit.account {
            Self::write_account(&mut tx, account)
                .await
                .map_err(sql_error)?;
        }

        tx.commit().await.map_err(|e| {
            CoreError::Database(DatabaseError::TransactionFailed {
                reason: e.to_string(),
            })
        })?;
        debug!(
            target_key = %commit.checkpoint.target,
            last_processed = commit.checkpoint.last_processed,
            "Checkpoint committed"
        );
        Ok(())
    }
}
