use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use sqlx::{
    Row, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{collections::BTreeMap, convert::TryFrom, path::Path, sync::Arc};

/// SQLite-backed session store. Each session key owns a namespace of named JSON values that
/// survive across invocations, plus an append-only log of completed turns.
#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| "failed to connect to sqlite database")?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_values (
                session_key TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_key, name)
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure session_values schema")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turn_log (
                session_key TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                session_id TEXT,
                prompt_tokens INTEGER NOT NULL,
                completion_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                cached_tokens INTEGER NOT NULL,
                cache_hit_cost REAL NOT NULL,
                cache_miss_cost REAL NOT NULL,
                cost REAL NOT NULL
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure turn_log schema")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_turn_log_session_timestamp
            ON turn_log(session_key, timestamp);
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure turn_log index")?;

        Ok(())
    }

    /// Reads every value stored under `session_key`. Rows whose JSON no longer parses are
    /// skipped, so callers see them as absent.
    pub async fn load_snapshot(&self, session_key: &str) -> Result<StoreSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT name, value
            FROM session_values
            WHERE session_key = ?
            "#,
        )
        .bind(session_key)
        .fetch_all(&*self.pool)
        .await
        .with_context(|| format!("failed to load session values for {session_key}"))?;

        let mut snapshot = StoreSnapshot::default();
        for row in rows {
            let name: String = row.try_get("name")?;
            let raw: String = row.try_get("value")?;
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    snapshot.values.insert(name, value);
                }
                Err(err) => {
                    tracing::warn!(error = %err, session_key, name = %name, "dropping unreadable session value");
                }
            }
        }
        Ok(snapshot)
    }

    /// Replaces the namespace for `session_key` with `snapshot` in a single transaction, so the
    /// next invocation sees either the previous namespace or the new one in full.
    pub async fn save_snapshot(&self, session_key: &str, snapshot: &StoreSnapshot) -> Result<()> {
        self.save_turn(session_key, snapshot, None).await
    }

    /// Rewrites the namespace and, when given, appends the turn log row in the same transaction.
    pub async fn save_turn(
        &self,
        session_key: &str,
        snapshot: &StoreSnapshot,
        turn: Option<&TurnRecord>,
    ) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .with_context(|| "failed to begin session store transaction")?;

        write_values(&mut *tx, session_key, snapshot).await?;
        if let Some(turn) = turn {
            insert_turn(&mut *tx, session_key, turn).await?;
        }

        tx.commit()
            .await
            .with_context(|| "failed to commit session store transaction")?;
        Ok(())
    }

    /// Most recent turns first.
    pub async fn recent_turns(&self, session_key: &str, limit: usize) -> Result<Vec<TurnRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, session_id, prompt_tokens, completion_tokens, total_tokens,
                   cached_tokens, cache_hit_cost, cache_miss_cost, cost
            FROM turn_log
            WHERE session_key = ?
            ORDER BY timestamp DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(session_key)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .with_context(|| "failed to load recent turns")?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in rows {
            let ts: String = row.try_get("timestamp")?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .with_context(|| format!("invalid timestamp stored in DB: {ts}"))?
                .with_timezone(&Utc);
            turns.push(TurnRecord {
                timestamp,
                session_id: row.try_get::<Option<String>, _>("session_id")?,
                prompt_tokens: row.try_get::<i64, _>("prompt_tokens").unwrap_or(0) as u64,
                completion_tokens: row.try_get::<i64, _>("completion_tokens").unwrap_or(0) as u64,
                total_tokens: row.try_get::<i64, _>("total_tokens").unwrap_or(0) as u64,
                cached_tokens: row.try_get::<i64, _>("cached_tokens").unwrap_or(0) as u64,
                cache_hit_cost: row.try_get::<f64, _>("cache_hit_cost").unwrap_or(0.0),
                cache_miss_cost: row.try_get::<f64, _>("cache_miss_cost").unwrap_or(0.0),
                cost: row.try_get::<f64, _>("cost").unwrap_or(0.0),
            });
        }
        Ok(turns)
    }
}

async fn write_values(
    conn: &mut SqliteConnection,
    session_key: &str,
    snapshot: &StoreSnapshot,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(r#"DELETE FROM session_values WHERE session_key = ?"#)
        .bind(session_key)
        .execute(&mut *conn)
        .await
        .with_context(|| "failed to clear session values")?;

    for (name, value) in &snapshot.values {
        let encoded = serde_json::to_string(value)
            .with_context(|| format!("failed to encode session value {name}"))?;
        sqlx::query(
            r#"
            INSERT INTO session_values (session_key, name, value, updated_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(session_key)
        .bind(name)
        .bind(encoded)
        .bind(&now)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("failed to write session value {name}"))?;
    }
    Ok(())
}

async fn insert_turn(
    conn: &mut SqliteConnection,
    session_key: &str,
    turn: &TurnRecord,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO turn_log (
            session_key, timestamp, session_id, prompt_tokens, completion_tokens, total_tokens,
            cached_tokens, cache_hit_cost, cache_miss_cost, cost
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
        "#,
    )
    .bind(session_key)
    .bind(turn.timestamp.to_rfc3339())
    .bind(turn.session_id.as_deref())
    .bind(i64::try_from(turn.prompt_tokens).unwrap_or(i64::MAX))
    .bind(i64::try_from(turn.completion_tokens).unwrap_or(i64::MAX))
    .bind(i64::try_from(turn.total_tokens).unwrap_or(i64::MAX))
    .bind(i64::try_from(turn.cached_tokens).unwrap_or(i64::MAX))
    .bind(turn.cache_hit_cost)
    .bind(turn.cache_miss_cost)
    .bind(turn.cost)
    .execute(&mut *conn)
    .await
    .with_context(|| "failed to insert turn log row")?;
    Ok(())
}

/// In-memory copy of one session key's namespace. Loaded at the start of a turn, mutated by the
/// session and usage components, then handed back to [`Storage::save_turn`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    values: BTreeMap<String, Value>,
}

impl StoreSnapshot {
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// `None` when the value is absent or no longer decodes as `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let value = self.values.get(name)?;
        match serde_json::from_value(value.clone()) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                tracing::warn!(error = %err, name, "session value has unexpected shape");
                None
            }
        }
    }

    pub fn set<T: Serialize>(&mut self, name: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value)
            .with_context(|| format!("failed to encode session value {name}"))?;
        self.values.insert(name.to_string(), encoded);
        Ok(())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn remove(&mut self, name: &str) {
        self.values.remove(name);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub cached_tokens: u64,
    pub cache_hit_cost: f64,
    pub cache_miss_cost: f64,
    pub cost: f64,
}
