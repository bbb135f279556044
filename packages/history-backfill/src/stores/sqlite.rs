//! SQLite storage implementation.
//!
//! One database holds the archived messages, the resume cursors and the
//! dead-letter table. Good for:
//! - Local archiving runs
//! - Single-host deployments
//! - Testing with persistent data

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tokio::runtime::Handle;

use crate::error::{BackfillError, PersistenceError, Result};
use crate::traits::cursor::CursorStore;
use crate::traits::sink::{DeadLetterSink, PersistenceSink};
use crate::types::cursor::{ChannelCursor, CursorKey};
use crate::types::record::{AuthorId, ChannelId, Record, RecordId};

/// SQLite-backed message archive, cursor store and dead-letter sink.
///
/// Must be created inside a tokio runtime. The blocking [`PersistenceSink`]
/// side drives queries on that runtime, so it may only be called from
/// blocking threads, which is where the write dispatcher runs it.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    handle: Handle,
}

#[derive(FromRow)]
struct MessageRow {
    id: i64,
    channel_id: i64,
    author_id: i64,
    author_name: String,
    content: String,
    created_at: String,
}

impl MessageRow {
    fn into_record(self) -> Result<Record> {
        let timestamp = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| BackfillError::Storage(Box::new(e)))?
            .with_timezone(&Utc);
        Ok(Record {
            id: RecordId(self.id as u64),
            channel_id: ChannelId(self.channel_id as u64),
            author_id: AuthorId(self.author_id as u64),
            author_name: self.author_name,
            content: self.content,
            timestamp,
        })
    }
}

/// A dead-lettered record as stored.
#[derive(Debug, Clone, FromRow)]
pub struct DeadLetterRow {
    pub record_id: i64,
    pub channel_id: i64,
    pub error: String,
    pub attempts: i64,
    pub payload: String,
}

impl SqliteStore {
    /// Create a new SQLite store with the given connection URL.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - In-memory database (ephemeral)
    /// - `sqlite://backfill.db?mode=rwc` - Create if not exists
    pub async fn new(database_url: &str) -> Result<Self> {
        Self::connect(database_url, 5).await
    }

    /// Create an in-memory SQLite store (for testing).
    ///
    /// Uses a single connection, since every connection to `:memory:` opens
    /// a separate database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(storage_error)?;

        let store = Self {
            pool,
            handle: Handle::current(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY,
                channel_id INTEGER NOT NULL,
                author_id INTEGER NOT NULL,
                author_name TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages(channel_id, id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                key TEXT PRIMARY KEY,
                record_id INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                record_id INTEGER NOT NULL,
                channel_id INTEGER NOT NULL,
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    /// Insert or replace one message.
    pub async fn upsert_message(&self, record: &Record) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, channel_id, author_id, author_name, content, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                channel_id = excluded.channel_id,
                author_id = excluded.author_id,
                author_name = excluded.author_name,
                content = excluded.content,
                created_at = excluded.created_at
            "#,
        )
        .bind(record.id.get() as i64)
        .bind(record.channel_id.get() as i64)
        .bind(record.author_id.get() as i64)
        .bind(&record.author_name)
        .bind(&record.content)
        .bind(record.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    pub async fn message(&self, record_id: RecordId) -> Result<Option<Record>> {
        let row: Option<MessageRow> = sqlx::query_as(
            "SELECT id, channel_id, author_id, author_name, content, created_at \
             FROM messages WHERE id = ?",
        )
        .bind(record_id.get() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.map(MessageRow::into_record).transpose()
    }

    pub async fn message_count(&self, channel_id: ChannelId) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE channel_id = ?")
            .bind(channel_id.get() as i64)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(count as usize)
    }

    /// Every stored resume cursor, ordered by key.
    pub async fn cursors(&self) -> Result<Vec<ChannelCursor>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT key, record_id FROM cursors ORDER BY key")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| BackfillError::CursorStore(Box::new(e)))?;

        Ok(rows
            .into_iter()
            .filter_map(|(raw, id)| {
                let key = CursorKey::parse(&raw)?;
                Some(ChannelCursor {
                    channel_id: key.channel_id,
                    direction: key.direction,
                    last_record_id: RecordId(id as u64),
                })
            })
            .collect())
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetterRow>> {
        sqlx::query_as(
            "SELECT record_id, channel_id, error, attempts, payload \
             FROM dead_letters ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)
    }
}

fn storage_error(e: sqlx::Error) -> BackfillError {
    BackfillError::Storage(Box::new(e))
}

impl PersistenceSink for SqliteStore {
    fn save(&self, record: &Record) -> std::result::Result<(), PersistenceError> {
        self.handle
            .block_on(self.upsert_message(record))
            .map_err(|e| PersistenceError::Storage(e.to_string()))
    }
}

#[async_trait]
impl CursorStore for SqliteStore {
    async fn get(&self, key: &CursorKey) -> Result<Option<RecordId>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT record_id FROM cursors WHERE key = ?")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BackfillError::CursorStore(Box::new(e)))?;

        Ok(row.map(|(id,)| RecordId(id as u64)))
    }

    async fn set(&self, key: &CursorKey, record_id: RecordId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (key, record_id, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                record_id = excluded.record_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key.to_string())
        .bind(record_id.get() as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| BackfillError::CursorStore(Box::new(e)))?;

        Ok(())
    }
}

#[async_trait]
impl DeadLetterSink for SqliteStore {
    async fn dead_letter(
        &self,
        record: &Record,
        error: &PersistenceError,
        attempts: u32,
    ) -> std::result::Result<(), PersistenceError> {
        let payload =
            serde_json::to_string(record).map_err(|e| PersistenceError::Rejected(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO dead_letters (record_id, channel_id, error, attempts, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.get() as i64)
        .bind(record.channel_id.get() as i64)
        .bind(error.to_string())
        .bind(attempts as i64)
        .bind(payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Storage(e.to_string()))?;

        Ok(())
    }
}
