use crate::{
    chat::{Content, Conversation, Message, NewMessage, Role, DEFAULT_TITLE},
    error::PersistenceError,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Row, SqlitePool,
};
use std::{collections::HashMap, path::Path, str::FromStr};
use tracing::debug;
use uuid::Uuid;

/// Durable record of conversations and their ordered messages.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self, owner_id: &str) -> Result<Conversation, PersistenceError>;

    /// Most recently updated first, each with its full message sequence.
    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Conversation>, PersistenceError>;

    async fn get(&self, chat_id: &str) -> Result<Option<Conversation>, PersistenceError>;

    /// Messages of one conversation in append order. Empty when the
    /// conversation does not exist.
    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, PersistenceError>;

    async fn append(&self, chat_id: &str, message: NewMessage)
        -> Result<Message, PersistenceError>;

    /// Sets the title and bumps `updated_at`. Returns the new `updated_at`,
    /// or `None` when there is no such conversation.
    async fn rename(
        &self,
        chat_id: &str,
        title: &str,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError>;

    /// Removes the conversation and all of its messages, or nothing at all.
    async fn delete(&self, chat_id: &str) -> Result<bool, PersistenceError>;
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens the conversation database at `db_path`, creating the file and
    /// its directory on first run.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// A private in-memory database. The pool is pinned to one connection
    /// because every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory SQLite database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Creates the conversation and message tables if they are missing.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_owner_updated
                ON conversations(owner_id, updated_at DESC);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
                content TEXT NOT NULL,
                sender_id TEXT,
                ai_agent TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE (chat_id, seq)
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    fn message_from_row(row: &SqliteRow) -> Result<Message, PersistenceError> {
        let id: String = row.try_get("id")?;
        let role_str: String = row.try_get("role")?;
        let role = Role::parse(&role_str).ok_or_else(|| PersistenceError::Corrupt {
            id: id.clone(),
            reason: format!("unknown role {:?}", role_str),
        })?;
        let raw: String = row.try_get("content")?;
        let content: Content =
            serde_json::from_str(&raw).map_err(|e| PersistenceError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            })?;

        Ok(Message {
            id,
            chat_id: row.try_get("chat_id")?,
            role,
            content,
            sender_id: row.try_get("sender_id")?,
            ai_agent: row.try_get("ai_agent")?,
            created_at: from_micros(row.try_get("created_at")?),
        })
    }

    fn conversation_from_row(row: &SqliteRow) -> Result<Conversation, PersistenceError> {
        Ok(Conversation {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            title: row.try_get("title")?,
            created_at: from_micros(row.try_get("created_at")?),
            updated_at: from_micros(row.try_get("updated_at")?),
            messages: Vec::new(),
        })
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create(&self, owner_id: &str) -> Result<Conversation, PersistenceError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO conversations (id, owner_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(owner_id)
        .bind(DEFAULT_TITLE)
        .bind(to_micros(now))
        .bind(to_micros(now))
        .execute(&self.pool)
        .await?;

        debug!(chat_id = %id, owner_id, "created conversation");

        Ok(Conversation {
            id,
            owner_id: owner_id.to_string(),
            title: DEFAULT_TITLE.to_string(),
            created_at: from_micros(to_micros(now)),
            updated_at: from_micros(to_micros(now)),
            messages: Vec::new(),
        })
    }

    async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<Conversation>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_id, title, created_at, updated_at
            FROM conversations
            WHERE owner_id = ?
            ORDER BY updated_at DESC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let message_rows = sqlx::query(
            r#"
            SELECT m.id, m.chat_id, m.role, m.content, m.sender_id, m.ai_agent, m.created_at
            FROM messages m
            JOIN conversations c ON c.id = m.chat_id
            WHERE c.owner_id = ?
            ORDER BY m.chat_id, m.seq ASC
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_chat: HashMap<String, Vec<Message>> = HashMap::new();
        for row in &message_rows {
            let msg = Self::message_from_row(row)?;
            by_chat.entry(msg.chat_id.clone()).or_default().push(msg);
        }

        let mut conversations = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut conv = Self::conversation_from_row(row)?;
            conv.messages = by_chat.remove(&conv.id).unwrap_or_default();
            conversations.push(conv);
        }

        Ok(conversations)
    }

    async fn get(&self, chat_id: &str) -> Result<Option<Conversation>, PersistenceError> {
        let row = sqlx::query(
            r#"
            SELECT id, owner_id, title, created_at, updated_at
            FROM conversations
            WHERE id = ?
            "#,
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut conv = Self::conversation_from_row(&row)?;
        conv.messages = self.messages(chat_id).await?;
        Ok(Some(conv))
    }

    async fn messages(&self, chat_id: &str) -> Result<Vec<Message>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, chat_id, role, content, sender_id, ai_agent, created_at
            FROM messages
            WHERE chat_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::message_from_row).collect()
    }

    async fn append(
        &self,
        chat_id: &str,
        message: NewMessage,
    ) -> Result<Message, PersistenceError> {
        let id = Uuid::new_v4().to_string();
        let content = serde_json::to_string(message.content()).map_err(|e| {
            PersistenceError::Corrupt {
                id: id.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut tx = self.pool.begin().await?;

        // Bumping the conversation first takes the write lock before anything
        // is read, and yields a stamp strictly later than the previous one.
        let stamp: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE conversations
            SET updated_at = MAX(?, updated_at + 1)
            WHERE id = ?
            RETURNING updated_at
            "#,
        )
        .bind(to_micros(Utc::now()))
        .bind(chat_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(stamp) = stamp else {
            return Err(PersistenceError::NotFound(chat_id.to_string()));
        };

        let seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?")
                .bind(chat_id)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO messages (id, chat_id, seq, role, content, sender_id, ai_agent, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(chat_id)
        .bind(seq)
        .bind(message.role().as_str())
        .bind(&content)
        .bind(message.sender_id())
        .bind(message.ai_agent())
        .bind(stamp)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        debug!(chat_id, message_id = %id, seq, role = %message.role(), "appended message");

        Ok(Message {
            id,
            chat_id: chat_id.to_string(),
            role: message.role(),
            sender_id: message.sender_id().map(str::to_string),
            ai_agent: message.ai_agent().map(str::to_string),
            content: message.content().clone(),
            created_at: from_micros(stamp),
        })
    }

    async fn rename(
        &self,
        chat_id: &str,
        title: &str,
    ) -> Result<Option<DateTime<Utc>>, PersistenceError> {
        let stamp: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE conversations
            SET title = ?, updated_at = MAX(?, updated_at + 1)
            WHERE id = ?
            RETURNING updated_at
            "#,
        )
        .bind(title)
        .bind(to_micros(Utc::now()))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(stamp.map(from_micros))
    }

    async fn delete(&self, chat_id: &str) -> Result<bool, PersistenceError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM messages WHERE chat_id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let found = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
            > 0;

        if !found {
            tx.rollback().await?;
            return Ok(false);
        }

        tx.commit().await?;
        debug!(chat_id, removed, "deleted conversation");
        Ok(true)
    }
}
