//! Persistent conversation storage backed by libsql.
//!
//! Every message exchanged with a user is appended here so the planner can
//! rehydrate a transcript prefix across process restarts. Writes degrade to a
//! logged warning rather than failing the caller's turn; reads degrade to an
//! empty history rather than failing the turn outright, since a planner run
//! without prior context is still useful.

use crate::types::{CoreError, Message, MessageRole, Result, Session};
use chrono::{DateTime, Utc};
use libsql::params;
use std::time::Duration;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    user_key TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    user_key TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    metadata TEXT,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_user_key_timestamp ON messages(user_key, timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages(timestamp);
"#;

fn storage_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::StorageError(e.to_string())
}

/// Conversation history store, one libsql connection per process.
pub struct ConversationStore {
    conn: libsql::Connection,
}

impl ConversationStore {
    /// Open (creating if absent) the libsql database at `db_path` and apply schema.
    pub async fn open(db_path: &str) -> Result<Self> {
        let db = libsql::Builder::new_local(db_path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;
        conn.execute_batch(SCHEMA_SQL).await.map_err(storage_err)?;
        Ok(Self { conn })
    }

    /// Find the most recently active session for `user_key`, reusing it if its
    /// last message fell within `idle_timeout`; otherwise start a fresh one.
    pub async fn open_or_reuse_session(
        &self,
        user_key: &str,
        idle_timeout: Duration,
    ) -> Result<Session> {
        let mut rows = self
            .conn
            .query(
                "SELECT session_id, timestamp FROM messages WHERE user_key = ?1 AND role != 'tool' \
                 ORDER BY timestamp DESC LIMIT 1",
                params![user_key],
            )
            .await
            .map_err(storage_err)?;

        if let Some(row) = rows.next().await.map_err(storage_err)? {
            let session_id: String = row.get(0).map_err(storage_err)?;
            let last_ts: String = row.get(1).map_err(storage_err)?;
            let last_ts: DateTime<Utc> = last_ts.parse().map_err(|e| {
                CoreError::StorageError(format!("corrupt timestamp in messages row: {e}"))
            })?;
            if Utc::now().signed_duration_since(last_ts).to_std().unwrap_or(Duration::MAX) < idle_timeout {
                return self.load_session(&session_id, user_key).await;
            }
        }

        self.create_session(user_key).await
    }

    async fn load_session(&self, session_id: &str, user_key: &str) -> Result<Session> {
        let mut rows = self
            .conn
            .query(
                "SELECT created_at FROM sessions WHERE id = ?1",
                params![session_id],
            )
            .await
            .map_err(storage_err)?;
        if let Some(row) = rows.next().await.map_err(storage_err)? {
            let created_at: String = row.get(0).map_err(storage_err)?;
            let created_at: DateTime<Utc> = created_at.parse().map_err(|e| {
                CoreError::StorageError(format!("corrupt timestamp in sessions row: {e}"))
            })?;
            Ok(Session {
                id: session_id.to_string(),
                user_key: user_key.to_string(),
                created_at,
            })
        } else {
            // A message referenced a session row that never got written (crash
            // mid-insert); treat it as freshly created rather than failing the turn.
            self.create_session(user_key).await
        }
    }

    async fn create_session(&self, user_key: &str) -> Result<Session> {
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_key: user_key.to_string(),
            created_at: Utc::now(),
        };
        self.conn
            .execute(
                "INSERT INTO sessions (id, user_key, created_at) VALUES (?1, ?2, ?3)",
                params![
                    session.id.clone(),
                    session.user_key.clone(),
                    session.created_at.to_rfc3339()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(session)
    }

    /// Append a message. Failures are logged and swallowed: losing one row of
    /// history must not abort an otherwise-successful turn.
    pub async fn append(&self, message: &Message) {
        let metadata = message
            .metadata
            .as_ref()
            .map(|v| v.to_string());
        let result = self
            .conn
            .execute(
                "INSERT INTO messages (session_id, user_key, role, content, metadata, timestamp) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.session_id.clone(),
                    message.user_key.clone(),
                    message.role.as_str().to_string(),
                    message.content.clone(),
                    metadata,
                    message.timestamp.to_rfc3339()
                ],
            )
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, session_id = %message.session_id, "failed to persist message");
        }
    }

    /// Most recent `limit` messages for a user across all of their sessions,
    /// oldest first. Degrades to an empty vec (with a logged warning) on read
    /// failure rather than failing the caller's turn.
    pub async fn recent(&self, user_key: &str, limit: usize) -> Vec<Message> {
        match self.recent_inner(user_key, limit).await {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(error = %e, user_key, "failed to read conversation history; continuing with empty context");
                Vec::new()
            }
        }
    }

    async fn recent_inner(&self, user_key: &str, limit: usize) -> Result<Vec<Message>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, session_id, user_key, role, content, metadata, timestamp \
                 FROM messages WHERE user_key = ?1 ORDER BY timestamp DESC LIMIT ?2",
                params![user_key, limit as i64],
            )
            .await
            .map_err(storage_err)?;

        let mut messages = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let id: i64 = row.get(0).map_err(storage_err)?;
            let session_id: String = row.get(1).map_err(storage_err)?;
            let user_key: String = row.get(2).map_err(storage_err)?;
            let role: String = row.get(3).map_err(storage_err)?;
            let content: String = row.get(4).map_err(storage_err)?;
            let metadata: Option<String> = row.get(5).map_err(storage_err)?;
            let timestamp: String = row.get(6).map_err(storage_err)?;

            messages.push(Message {
                id: Some(id),
                session_id,
                user_key,
                role: role.parse::<MessageRole>()?,
                content,
                metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
                timestamp: timestamp
                    .parse()
                    .map_err(|e| CoreError::StorageError(format!("corrupt timestamp: {e}")))?,
            });
        }
        messages.reverse();
        Ok(messages)
    }

    /// Delete messages older than `retention`, returning the number of rows removed.
    pub async fn purge_older_than(&self, retention: Duration) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let removed = self
            .conn
            .execute(
                "DELETE FROM messages WHERE timestamp < ?1",
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(storage_err)?;
        Ok(removed)
    }

    /// Drop all history for a user (all sessions and messages).
    pub async fn clear(&self, user_key: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM messages WHERE user_key = ?1",
                params![user_key.to_string()],
            )
            .await
            .map_err(storage_err)?;
        self.conn
            .execute(
                "DELETE FROM sessions WHERE user_key = ?1",
                params![user_key.to_string()],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageRole;

    async fn temp_store() -> (ConversationStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = ConversationStore::open(path.to_str().unwrap()).await.unwrap();
        (store, dir)
    }

    fn message(session_id: &str, user_key: &str, role: MessageRole, content: &str) -> Message {
        Message {
            id: None,
            session_id: session_id.to_string(),
            user_key: user_key.to_string(),
            role,
            content: content.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn new_user_gets_a_fresh_session() {
        let (store, _dir) = temp_store().await;
        let session = store
            .open_or_reuse_session("alice", Duration::from_secs(1800))
            .await
            .unwrap();
        assert_eq!(session.user_key, "alice");
    }

    #[tokio::test]
    async fn recent_returns_messages_oldest_first() {
        let (store, _dir) = temp_store().await;
        let session = store
            .open_or_reuse_session("bob", Duration::from_secs(1800))
            .await
            .unwrap();

        store.append(&message(&session.id, "bob", MessageRole::User, "hello")).await;
        store.append(&message(&session.id, "bob", MessageRole::Assistant, "hi there")).await;

        let history = store.recent("bob", 10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "hello");
        assert_eq!(history[1].content, "hi there");
    }

    #[tokio::test]
    async fn recent_is_capped_to_the_requested_window() {
        let (store, _dir) = temp_store().await;
        let session = store
            .open_or_reuse_session("carol", Duration::from_secs(1800))
            .await
            .unwrap();

        for i in 0..5 {
            store
                .append(&message(&session.id, "carol", MessageRole::User, &format!("msg {i}")))
                .await;
        }

        let history = store.recent("carol", 3).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].content, "msg 4");
    }

    #[tokio::test]
    async fn recent_spans_every_session_a_user_has_had() {
        let (store, _dir) = temp_store().await;
        let idle_timeout = Duration::from_millis(10);
        let first = store.open_or_reuse_session("erin", idle_timeout).await.unwrap();
        store.append(&message(&first.id, "erin", MessageRole::User, "first session")).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = store.open_or_reuse_session("erin", idle_timeout).await.unwrap();
        assert_ne!(first.id, second.id);
        store.append(&message(&second.id, "erin", MessageRole::User, "second session")).await;

        let history = store.recent("erin", 10).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content, "first session");
        assert_eq!(history[1].content, "second session");
    }

    #[tokio::test]
    async fn a_trailing_tool_message_does_not_extend_the_idle_reuse_window() {
        let (store, _dir) = temp_store().await;
        let idle_timeout = Duration::from_millis(50);
        let session = store.open_or_reuse_session("fran", idle_timeout).await.unwrap();
        store.append(&message(&session.id, "fran", MessageRole::User, "hi")).await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Appended after the idle window has already elapsed, and must not
        // reset it: last_activity is tracked off the latest non-tool message.
        store.append(&message(&session.id, "fran", MessageRole::Tool, "{}")).await;

        let reused = store.open_or_reuse_session("fran", idle_timeout).await.unwrap();
        assert_ne!(reused.id, session.id);
    }

    #[tokio::test]
    async fn clear_removes_all_history_for_a_user() {
        let (store, _dir) = temp_store().await;
        let session = store
            .open_or_reuse_session("dave", Duration::from_secs(1800))
            .await
            .unwrap();
        store.append(&message(&session.id, "dave", MessageRole::User, "hi")).await;

        store.clear("dave").await.unwrap();

        let history = store.recent("dave", 10).await;
        assert!(history.is_empty());
    }
}
