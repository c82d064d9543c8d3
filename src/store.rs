use crate::fingerprint::normalize;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Pool, Sqlite};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error("sqlite file: {0}")]
    File(String),
}

/// One known upstream thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatSession {
    pub chat_id: String,
    pub title: String,
    pub chat_type: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub current_response_id: Option<String>,
    pub last_assistant_content: Option<String>,
}

/// Where to attach the next turn of a resumed thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadPointer {
    pub chat_id: String,
    pub current_response_id: Option<String>,
}

/// End-of-turn update. `title`, `chat_type` and `created_at` only apply
/// when the thread has no row yet.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub chat_id: String,
    pub title: String,
    pub chat_type: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub current_response_id: String,
    pub last_assistant_content: String,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn upsert(&self, session: &ChatSession) -> Result<(), StorageError>;
    async fn record_turn(&self, turn: &TurnRecord) -> Result<(), StorageError>;
    async fn find_by_fingerprint(&self, text: &str) -> Result<Option<ThreadPointer>, StorageError>;
    async fn get(&self, chat_id: &str) -> Result<Option<ChatSession>, StorageError>;
    async fn list(&self) -> Result<Vec<ChatSession>, StorageError>;
    async fn delete(&self, chat_id: &str) -> Result<(), StorageError>;
    async fn clear(&self) -> Result<(), StorageError>;
}

fn first_match<'a, I>(query: &str, rows: I) -> Option<ThreadPointer>
where
    I: IntoIterator<Item = (&'a str, Option<&'a str>, &'a str)>,
{
    let wanted = normalize(query);
    if wanted.is_empty() {
        return None;
    }
    for (chat_id, response_id, content) in rows {
        if content.is_empty() {
            continue;
        }
        if normalize(content) == wanted {
            return Some(ThreadPointer {
                chat_id: chat_id.to_string(),
                current_response_id: response_id.map(|s| s.to_string()),
            });
        }
    }
    None
}

#[derive(Clone, Default)]
pub struct MemorySessionStore {
    // insertion order is scan order
    inner: Arc<RwLock<Vec<ChatSession>>>,
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn upsert(&self, session: &ChatSession) -> Result<(), StorageError> {
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.iter_mut().find(|s| s.chat_id == session.chat_id) {
            *existing = session.clone();
        } else {
            guard.push(session.clone());
        }
        Ok(())
    }

    async fn record_turn(&self, turn: &TurnRecord) -> Result<(), StorageError> {
        let mut guard = self.inner.write().await;
        if let Some(existing) = guard.iter_mut().find(|s| s.chat_id == turn.chat_id) {
            existing.updated_at = turn.updated_at;
            existing.current_response_id = Some(turn.current_response_id.clone());
            existing.last_assistant_content = Some(turn.last_assistant_content.clone());
        } else {
            guard.push(ChatSession {
                chat_id: turn.chat_id.clone(),
                title: turn.title.clone(),
                chat_type: turn.chat_type.clone(),
                created_at: turn.created_at,
                updated_at: turn.updated_at,
                current_response_id: Some(turn.current_response_id.clone()),
                last_assistant_content: Some(turn.last_assistant_content.clone()),
            });
        }
        Ok(())
    }

    async fn find_by_fingerprint(&self, text: &str) -> Result<Option<ThreadPointer>, StorageError> {
        let guard = self.inner.read().await;
        Ok(first_match(
            text,
            guard.iter().filter_map(|s| {
                s.last_assistant_content.as_deref().map(|content| {
                    (s.chat_id.as_str(), s.current_response_id.as_deref(), content)
                })
            }),
        ))
    }

    async fn get(&self, chat_id: &str) -> Result<Option<ChatSession>, StorageError> {
        let guard = self.inner.read().await;
        Ok(guard.iter().find(|s| s.chat_id == chat_id).cloned())
    }

    async fn list(&self) -> Result<Vec<ChatSession>, StorageError> {
        let guard = self.inner.read().await;
        let mut out = guard.clone();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn delete(&self, chat_id: &str) -> Result<(), StorageError> {
        let mut guard = self.inner.write().await;
        guard.retain(|s| s.chat_id != chat_id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.inner.write().await.clear();
        Ok(())
    }
}

#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: Pool<Sqlite>,
}

type SessionRow = (
    String,
    String,
    String,
    i64,
    i64,
    Option<String>,
    Option<String>,
);

fn session_from_row(row: SessionRow) -> ChatSession {
    let (chat_id, title, chat_type, created_at, updated_at, current_response_id, content) = row;
    ChatSession {
        chat_id,
        title,
        chat_type,
        created_at,
        updated_at,
        current_response_id,
        last_assistant_content: content,
    }
}

impl SqliteSessionStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, StorageError> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS chat_sessions (
                chat_id TEXT PRIMARY KEY,
                title TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL DEFAULT 0,
                chat_type TEXT NOT NULL DEFAULT 't2t',
                current_response_id TEXT,
                last_assistant_content TEXT
            )"#,
        )
        .execute(&pool)
        .await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn upsert(&self, session: &ChatSession) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT OR REPLACE INTO chat_sessions \
             (chat_id, title, created_at, updated_at, chat_type, current_response_id, last_assistant_content) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.chat_id)
        .bind(&session.title)
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(&session.chat_type)
        .bind(&session.current_response_id)
        .bind(&session.last_assistant_content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_turn(&self, turn: &TurnRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO chat_sessions \
             (chat_id, title, created_at, updated_at, chat_type, current_response_id, last_assistant_content) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(chat_id) DO UPDATE SET \
             updated_at=excluded.updated_at, \
             current_response_id=excluded.current_response_id, \
             last_assistant_content=excluded.last_assistant_content",
        )
        .bind(&turn.chat_id)
        .bind(&turn.title)
        .bind(turn.created_at)
        .bind(turn.updated_at)
        .bind(&turn.chat_type)
        .bind(&turn.current_response_id)
        .bind(&turn.last_assistant_content)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_fingerprint(&self, text: &str) -> Result<Option<ThreadPointer>, StorageError> {
        let rows = sqlx::query_as::<_, (String, Option<String>, String)>(
            "SELECT chat_id, current_response_id, last_assistant_content FROM chat_sessions \
             WHERE last_assistant_content IS NOT NULL AND last_assistant_content != '' \
             ORDER BY rowid",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(first_match(
            text,
            rows.iter()
                .map(|(id, response_id, content)| (id.as_str(), response_id.as_deref(), content.as_str())),
        ))
    }

    async fn get(&self, chat_id: &str) -> Result<Option<ChatSession>, StorageError> {
        let row = sqlx::query_as::<_, SessionRow>(
            "SELECT chat_id, title, chat_type, created_at, updated_at, current_response_id, last_assistant_content \
             FROM chat_sessions WHERE chat_id=?",
        )
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(session_from_row))
    }

    async fn list(&self) -> Result<Vec<ChatSession>, StorageError> {
        let rows = sqlx::query_as::<_, SessionRow>(
            "SELECT chat_id, title, chat_type, created_at, updated_at, current_response_id, last_assistant_content \
             FROM chat_sessions ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(session_from_row).collect())
    }

    async fn delete(&self, chat_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM chat_sessions WHERE chat_id=?")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM chat_sessions")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

pub fn ensure_sqlite_file(dsn: &str) -> Result<(), StorageError> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| StorageError::File(format!("dir create failed: {err}")))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path)
            .map_err(|err| StorageError::File(format!("file create failed: {err}")))?;
    }
    Ok(())
}

pub async fn open_sqlite_pool(dsn: &str) -> Result<Pool<Sqlite>, StorageError> {
    ensure_sqlite_file(dsn)?;
    let options = dsn
        .parse::<sqlx::sqlite::SqliteConnectOptions>()?
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}
