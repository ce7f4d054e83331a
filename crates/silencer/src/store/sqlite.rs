//! SQLite-backed [`SilenceStore`].
//!
//! Timestamps are stored as INTEGER nanoseconds since the Unix epoch so that
//! `updated_at` keeps full precision as an optimistic-lock token. Matchers
//! live in a child table keyed by `(silence_id, position)`.
//!
//! The persisted `status` column is a GC marker only: reads always derive
//! status from the window at the store clock's current instant.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::StoreConfig;
use crate::error::{Result, SilenceError};
use crate::store::{ExpireMode, SilenceFilter, SilenceStore};
use crate::types::{MatchType, Matcher, NewSilence, Silence, SilencePatch, SilenceStatus};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS silences (
        id TEXT PRIMARY KEY NOT NULL,
        created_by TEXT NOT NULL,
        comment TEXT NOT NULL,
        starts_at INTEGER NOT NULL,
        ends_at INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK (ends_at > starts_at)
    )",
    "CREATE TABLE IF NOT EXISTS silence_matchers (
        silence_id TEXT NOT NULL REFERENCES silences(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        match_type TEXT NOT NULL,
        PRIMARY KEY (silence_id, position)
    )",
    "CREATE INDEX IF NOT EXISTS idx_silences_ends_at ON silences(ends_at)",
    "CREATE INDEX IF NOT EXISTS idx_silences_status_ends_at ON silences(status, ends_at)",
    "CREATE INDEX IF NOT EXISTS idx_silences_starts_at ON silences(starts_at)",
    "CREATE INDEX IF NOT EXISTS idx_silences_created_by ON silences(created_by)",
    "CREATE INDEX IF NOT EXISTS idx_silence_matchers_name ON silence_matchers(name, value)",
];

#[derive(Debug, sqlx::FromRow)]
struct SilenceRow {
    id: String,
    created_by: String,
    comment: String,
    starts_at: i64,
    ends_at: i64,
    created_at: i64,
    updated_at: i64,
}

impl SilenceRow {
    fn into_silence(self, matchers: Vec<Matcher>, now: DateTime<Utc>) -> Silence {
        let starts_at = from_nanos(self.starts_at);
        let ends_at = from_nanos(self.ends_at);
        Silence {
            id: self.id,
            created_by: self.created_by,
            comment: self.comment,
            starts_at,
            ends_at,
            matchers,
            status: SilenceStatus::at(starts_at, ends_at, now),
            created_at: from_nanos(self.created_at),
            updated_at: from_nanos(self.updated_at),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct MatcherRow {
    silence_id: String,
    name: String,
    value: String,
    match_type: String,
}

/// A [`SilenceStore`] over a SQLite connection pool.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    config: StoreConfig,
    clock: SharedClock,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad config, `Unavailable` if the database cannot be
    /// opened or migrated.
    pub async fn connect(url: &str, config: StoreConfig, clock: SharedClock) -> Result<Self> {
        config.validate()?;
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout());
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.statement_timeout())
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            config,
            clock,
        };
        store.apply_schema().await?;
        info!(url = %url, "silence store opened");
        Ok(store)
    }

    /// Opens a private in-memory database.
    ///
    /// The pool holds exactly one connection that never idles out, since
    /// each SQLite connection to `:memory:` sees its own database.
    pub async fn in_memory(clock: SharedClock) -> Result<Self> {
        let config = StoreConfig {
            max_connections: 1,
            ..StoreConfig::default()
        };
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .acquire_timeout(config.statement_timeout())
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            config,
            clock,
        };
        store.apply_schema().await?;
        Ok(store)
    }

    /// Replaces the store configuration (batch sizes, limits, deadlines).
    ///
    /// # Errors
    ///
    /// `Validation` if the configuration is unusable.
    pub fn with_config(mut self, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// The store configuration.
    #[must_use]
    pub const fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn apply_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("silence schema applied");
        Ok(())
    }

    /// Runs `fut` under the statement deadline, logging failures.
    async fn bounded<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
        T: Send,
    {
        match tokio::time::timeout(self.config.statement_timeout(), fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if let SilenceError::Unavailable { reason } = &err {
                    warn!(op, error = %reason, "silence store call failed");
                }
                Err(err)
            }
            Err(_) => {
                warn!(
                    op,
                    timeout_ms = self.config.statement_timeout_ms,
                    "silence store call timed out"
                );
                Err(SilenceError::Unavailable {
                    reason: format!(
                        "{op} timed out after {}ms",
                        self.config.statement_timeout_ms
                    ),
                })
            }
        }
    }

    async fn create_inner(&self, new: NewSilence) -> Result<Silence> {
        new.validate()?;
        let now = self.clock.now();
        let id = new
            .requested_id()
            .map_or_else(|| Uuid::new_v4().to_string(), str::to_string);
        let silence = Silence {
            id,
            status: SilenceStatus::at(new.starts_at, new.ends_at, now),
            created_by: new.created_by,
            comment: new.comment,
            starts_at: new.starts_at,
            ends_at: new.ends_at,
            matchers: new.matchers,
            created_at: now,
            updated_at: now,
        };
        let now_nanos = to_nanos("now", now)?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO silences
                (id, created_by, comment, starts_at, ends_at, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&silence.id)
        .bind(&silence.created_by)
        .bind(&silence.comment)
        .bind(to_nanos("startsAt", silence.starts_at)?)
        .bind(to_nanos("endsAt", silence.ends_at)?)
        .bind(silence.status.as_str())
        .bind(now_nanos)
        .bind(now_nanos)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(SilenceError::AlreadyExists { id: silence.id });
            }
            return Err(err.into());
        }

        insert_matchers(&mut *tx, &silence.id, &silence.matchers).await?;
        tx.commit().await?;

        debug!(silence_id = %silence.id, status = %silence.status, "silence stored");
        Ok(silence)
    }

    async fn get_inner(&self, id: &str) -> Result<Silence> {
        let row = sqlx::query_as::<_, SilenceRow>(
            "SELECT s.id, s.created_by, s.comment, s.starts_at, s.ends_at, s.created_at, s.updated_at
             FROM silences s WHERE s.id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| SilenceError::not_found(id))?;

        let matchers = sqlx::query_as::<_, MatcherRow>(
            "SELECT silence_id, name, value, match_type
             FROM silence_matchers WHERE silence_id = ? ORDER BY position",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut silences = assemble(vec![row], matchers, self.clock.now())?;
        silences.pop().ok_or_else(|| SilenceError::not_found(id))
    }

    async fn list_inner(&self, filter: &SilenceFilter) -> Result<Vec<Silence>> {
        let now = self.clock.now();
        let limit = self.config.effective_limit(filter.limit);

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT s.id, s.created_by, s.comment, s.starts_at, s.ends_at, s.created_at, s.updated_at
             FROM silences s WHERE 1 = 1",
        );
        push_filter(&mut query, filter, to_nanos("now", now)?)?;
        let order = filter.order.keyword();
        query
            .push(" ORDER BY ")
            .push(filter.sort_by.column())
            .push(" ")
            .push(order)
            .push(", s.id ")
            .push(order)
            .push(" LIMIT ")
            .push_bind(i64::from(limit))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.offset));

        let rows = query
            .build_query_as::<SilenceRow>()
            .fetch_all(&self.pool)
            .await?;
        let matchers = self.load_matchers(&rows).await?;
        assemble(rows, matchers, now)
    }

    async fn count_inner(&self, filter: &SilenceFilter) -> Result<u64> {
        let now = to_nanos("now", self.clock.now())?;
        let mut query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM silences s WHERE 1 = 1");
        push_filter(&mut query, filter, now)?;
        let count: i64 = query
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    async fn update_inner(&self, patch: &SilencePatch) -> Result<Silence> {
        let current = self.get_inner(&patch.id).await?;
        if current.updated_at != patch.expected_updated_at {
            return Err(SilenceError::Conflict {
                id: patch.id.clone(),
            });
        }

        let mut merged = patch.apply(&current)?;
        let now = self.clock.now();
        let expected = to_nanos("expectedUpdatedAt", patch.expected_updated_at)?;
        // The new token must differ from the old one even if the clock has not moved.
        let token = to_nanos("now", now)?.max(expected.saturating_add(1));
        merged.updated_at = from_nanos(token);
        merged.refresh_status(now);

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "UPDATE silences
             SET comment = ?, starts_at = ?, ends_at = ?, status = ?, updated_at = ?
             WHERE id = ? AND updated_at = ?",
        )
        .bind(&merged.comment)
        .bind(to_nanos("startsAt", merged.starts_at)?)
        .bind(to_nanos("endsAt", merged.ends_at)?)
        .bind(merged.status.as_str())
        .bind(token)
        .bind(&patch.id)
        .bind(expected)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(if self.exists(&patch.id).await? {
                SilenceError::Conflict {
                    id: patch.id.clone(),
                }
            } else {
                SilenceError::not_found(&patch.id)
            });
        }

        if patch.matchers.is_some() {
            sqlx::query("DELETE FROM silence_matchers WHERE silence_id = ?")
                .bind(&patch.id)
                .execute(&mut *tx)
                .await?;
            insert_matchers(&mut *tx, &patch.id, &merged.matchers).await?;
        }
        tx.commit().await?;

        debug!(silence_id = %merged.id, status = %merged.status, "silence updated");
        Ok(merged)
    }

    async fn delete_inner(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM silences WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SilenceError::not_found(id));
        }
        debug!(silence_id = %id, "silence deleted");
        Ok(())
    }

    async fn expire_inner(&self, before: DateTime<Utc>, mode: ExpireMode) -> Result<u64> {
        let before = to_nanos("before", before)?;
        let batch = i64::from(self.config.expire_batch_size);
        let statement = match mode {
            ExpireMode::SoftExpire => {
                "UPDATE silences SET status = 'expired'
                 WHERE id IN (
                     SELECT id FROM silences
                     WHERE ends_at < ? AND status != 'expired'
                     ORDER BY ends_at LIMIT ?
                 )"
            }
            ExpireMode::HardDelete => {
                "DELETE FROM silences
                 WHERE id IN (
                     SELECT id FROM silences
                     WHERE status = 'expired' AND ends_at < ?
                     ORDER BY ends_at LIMIT ?
                 )"
            }
        };
        let result = sqlx::query(statement)
            .bind(before)
            .bind(batch)
            .execute(&self.pool)
            .await?;
        let affected = result.rows_affected();
        if affected > 0 {
            debug!(mode = %mode, affected, "expiry batch applied");
        }
        Ok(affected)
    }

    async fn expiring_soon_inner(&self, window: Duration) -> Result<Vec<Silence>> {
        let now = self.clock.now();
        let window = chrono::Duration::from_std(window)
            .map_err(|_| SilenceError::validation("window", "out of range"))?;
        let now_nanos = to_nanos("now", now)?;
        let horizon = now
            .checked_add_signed(window)
            .and_then(|h| h.timestamp_nanos_opt())
            .unwrap_or(i64::MAX);

        let rows = sqlx::query_as::<_, SilenceRow>(
            "SELECT s.id, s.created_by, s.comment, s.starts_at, s.ends_at, s.created_at, s.updated_at
             FROM silences s
             WHERE s.starts_at <= ?1 AND s.ends_at > ?1 AND s.ends_at <= ?2
             ORDER BY s.ends_at ASC, s.id ASC",
        )
        .bind(now_nanos)
        .bind(horizon)
        .fetch_all(&self.pool)
        .await?;
        let matchers = self.load_matchers(&rows).await?;
        assemble(rows, matchers, now)
    }

    async fn bulk_update_inner(&self, ids: &[String], status: SilenceStatus) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let statement = match status {
            SilenceStatus::Pending => {
                return Err(SilenceError::validation(
                    "status",
                    "pending cannot be forced; move startsAt instead",
                ));
            }
            // Pull the window back so that it ends now.
            SilenceStatus::Expired => {
                "UPDATE silences
                 SET starts_at = CASE WHEN starts_at >= ?1 THEN ?1 - 1 ELSE starts_at END,
                     ends_at = CASE WHEN ends_at > ?1 THEN ?1 ELSE ends_at END,
                     status = 'expired',
                     updated_at = MAX(?1, updated_at + 1)
                 WHERE id = ?2"
            }
            // Pull a future start back to now; an ended window cannot be revived.
            SilenceStatus::Active => {
                "UPDATE silences
                 SET starts_at = CASE WHEN starts_at > ?1 THEN ?1 ELSE starts_at END,
                     status = 'active',
                     updated_at = MAX(?1, updated_at + 1)
                 WHERE id = ?2 AND ends_at > ?1"
            }
        };
        let now = to_nanos("now", self.clock.now())?;

        let mut tx = self.pool.begin().await?;
        let mut affected = 0_u64;
        for id in ids {
            let result = sqlx::query(statement)
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM silences WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .is_some();
                tx.rollback().await?;
                return Err(if exists {
                    SilenceError::validation(
                        "status",
                        format!("silence {id} has already ended and cannot be {status}"),
                    )
                } else {
                    SilenceError::not_found(id)
                });
            }
            affected += result.rows_affected();
        }
        tx.commit().await?;

        debug!(count = affected, status = %status, "bulk status update applied");
        Ok(affected)
    }

    async fn all_inner(&self) -> Result<Vec<Silence>> {
        let now = self.clock.now();
        let rows = sqlx::query_as::<_, SilenceRow>(
            "SELECT s.id, s.created_by, s.comment, s.starts_at, s.ends_at, s.created_at, s.updated_at
             FROM silences s ORDER BY s.id",
        )
        .fetch_all(&self.pool)
        .await?;
        let matchers = sqlx::query_as::<_, MatcherRow>(
            "SELECT silence_id, name, value, match_type
             FROM silence_matchers ORDER BY silence_id, position",
        )
        .fetch_all(&self.pool)
        .await?;
        assemble(rows, matchers, now)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM silences WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    async fn load_matchers(&self, rows: &[SilenceRow]) -> Result<Vec<MatcherRow>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT silence_id, name, value, match_type FROM silence_matchers WHERE silence_id IN (",
        );
        let mut ids = query.separated(", ");
        for row in rows {
            ids.push_bind(row.id.clone());
        }
        ids.push_unseparated(") ORDER BY silence_id, position");

        Ok(query
            .build_query_as::<MatcherRow>()
            .fetch_all(&self.pool)
            .await?)
    }
}

#[async_trait]
impl SilenceStore for SqliteStore {
    async fn create_silence(&self, silence: NewSilence) -> Result<Silence> {
        self.bounded("create_silence", self.create_inner(silence))
            .await
    }

    async fn get_silence(&self, id: &str) -> Result<Silence> {
        self.bounded("get_silence", self.get_inner(id)).await
    }

    async fn list_silences(&self, filter: &SilenceFilter) -> Result<Vec<Silence>> {
        self.bounded("list_silences", self.list_inner(filter)).await
    }

    async fn count_silences(&self, filter: &SilenceFilter) -> Result<u64> {
        self.bounded("count_silences", self.count_inner(filter))
            .await
    }

    async fn update_silence(&self, patch: &SilencePatch) -> Result<Silence> {
        self.bounded("update_silence", self.update_inner(patch))
            .await
    }

    async fn delete_silence(&self, id: &str) -> Result<()> {
        self.bounded("delete_silence", self.delete_inner(id)).await
    }

    async fn expire_silences(&self, before: DateTime<Utc>, mode: ExpireMode) -> Result<u64> {
        self.bounded("expire_silences", self.expire_inner(before, mode))
            .await
    }

    async fn expiring_soon(&self, window: Duration) -> Result<Vec<Silence>> {
        self.bounded("expiring_soon", self.expiring_soon_inner(window))
            .await
    }

    async fn bulk_update_status(&self, ids: &[String], status: SilenceStatus) -> Result<u64> {
        self.bounded("bulk_update_status", self.bulk_update_inner(ids, status))
            .await
    }

    async fn all_silences(&self) -> Result<Vec<Silence>> {
        self.bounded("all_silences", self.all_inner()).await
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &SilenceFilter, now: i64) -> Result<()> {
    if !filter.statuses.is_empty() {
        query.push(" AND (");
        for (i, status) in filter.statuses.iter().enumerate() {
            if i > 0 {
                query.push(" OR ");
            }
            match status {
                SilenceStatus::Pending => {
                    query.push("s.starts_at > ").push_bind(now);
                }
                SilenceStatus::Active => {
                    query
                        .push("(s.starts_at <= ")
                        .push_bind(now)
                        .push(" AND s.ends_at > ")
                        .push_bind(now)
                        .push(")");
                }
                SilenceStatus::Expired => {
                    query.push("s.ends_at <= ").push_bind(now);
                }
            }
        }
        query.push(")");
    }

    if let Some(created_by) = &filter.created_by {
        query.push(" AND s.created_by = ").push_bind(created_by.clone());
    }

    if filter.matcher_name.is_some() || filter.matcher_value.is_some() {
        query.push(" AND EXISTS (SELECT 1 FROM silence_matchers m WHERE m.silence_id = s.id");
        if let Some(name) = &filter.matcher_name {
            query.push(" AND m.name = ").push_bind(name.clone());
        }
        if let Some(value) = &filter.matcher_value {
            query
                .push(" AND instr(m.value, ")
                .push_bind(value.clone())
                .push(") > 0");
        }
        query.push(")");
    }

    let bounds = [
        ("startsAfter", "s.starts_at >= ", filter.starts_after),
        ("startsBefore", "s.starts_at < ", filter.starts_before),
        ("endsAfter", "s.ends_at >= ", filter.ends_after),
        ("endsBefore", "s.ends_at < ", filter.ends_before),
    ];
    for (field, predicate, bound) in bounds {
        if let Some(bound) = bound {
            query
                .push(" AND ")
                .push(predicate)
                .push_bind(to_nanos(field, bound)?);
        }
    }
    Ok(())
}

async fn insert_matchers(conn: &mut SqliteConnection, id: &str, matchers: &[Matcher]) -> Result<()> {
    if matchers.is_empty() {
        return Ok(());
    }
    let mut query = QueryBuilder::<Sqlite>::new(
        "INSERT INTO silence_matchers (silence_id, position, name, value, match_type) ",
    );
    query.push_values(matchers.iter().zip(0_i64..), |mut row, (matcher, position)| {
        row.push_bind(id.to_string())
            .push_bind(position)
            .push_bind(matcher.name.clone())
            .push_bind(matcher.value.clone())
            .push_bind(matcher.match_type.as_symbol());
    });
    query.build().execute(conn).await?;
    Ok(())
}

fn assemble(
    rows: Vec<SilenceRow>,
    matcher_rows: Vec<MatcherRow>,
    now: DateTime<Utc>,
) -> Result<Vec<Silence>> {
    let mut by_silence: HashMap<String, Vec<Matcher>> = HashMap::new();
    for row in matcher_rows {
        let match_type = row.match_type.parse::<MatchType>().map_err(|_| {
            SilenceError::Unavailable {
                reason: format!(
                    "corrupt matcher for silence {}: unknown type '{}'",
                    row.silence_id, row.match_type
                ),
            }
        })?;
        by_silence.entry(row.silence_id).or_default().push(Matcher {
            name: row.name,
            value: row.value,
            match_type,
        });
    }

    Ok(rows
        .into_iter()
        .map(|row| {
            let matchers = by_silence.remove(&row.id).unwrap_or_default();
            row.into_silence(matchers, now)
        })
        .collect())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error().is_some_and(|db| {
        db.is_unique_violation() || db.message().contains("UNIQUE constraint failed")
    })
}

fn to_nanos(field: &str, instant: DateTime<Utc>) -> Result<i64> {
    instant
        .timestamp_nanos_opt()
        .ok_or_else(|| SilenceError::validation(field, "out of range"))
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_nanos(nanos)
}
