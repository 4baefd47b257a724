//! Durable SQLite-backed message queue.
//!
//! Two tables: `messages` (inbound work) and `responses` (outbound replies).
//! Claims are atomic: an IMMEDIATE transaction selects the oldest pending row
//! for an agent and flips it to `processing` before anyone else can observe
//! it. WAL journaling keeps every mutation crash-safe.
//!
//! Message state machine:
//! `pending -> processing` (claim) `-> completed` | `-> pending` (fail,
//! retries left) | `-> dead` (retries exhausted). Stale recovery moves
//! `processing -> pending | dead` and counts as a retry attempt.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::events::{EventBus, EventKind};
use crate::error::{Error, Result};

/// Attempts before a message is dead-lettered.
pub const MAX_RETRIES: u32 = 5;

/// Message status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Completed => "completed",
            MessageStatus::Dead => "dead",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "processing" => MessageStatus::Processing,
            "completed" => MessageStatus::Completed,
            "dead" => MessageStatus::Dead,
            _ => MessageStatus::Pending,
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Pending,
    Acked,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Pending => "pending",
            ResponseStatus::Acked => "acked",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "acked" => ResponseStatus::Acked,
            _ => ResponseStatus::Pending,
        }
    }
}

/// Data for a new inbound message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageData {
    /// External id, unique across the table.
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub content: String,
    pub files: Option<Vec<String>>,
    /// Target agent; None routes via the message body.
    pub agent: Option<String>,
    pub conversation_id: Option<String>,
    /// Set for internal agent-to-agent messages.
    pub from_agent: Option<String>,
}

impl MessageData {
    pub fn new(channel: &str, sender: &str, content: &str) -> Self {
        Self {
            message_id: ulid::Ulid::new().to_string(),
            channel: channel.to_string(),
            sender: sender.to_string(),
            sender_id: None,
            content: content.to_string(),
            files: None,
            agent: None,
            conversation_id: None,
            from_agent: None,
        }
    }
}

/// A persisted message row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub content: String,
    pub files: Option<Vec<String>>,
    pub agent: Option<String>,
    pub conversation_id: Option<String>,
    pub from_agent: Option<String>,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl StoredMessage {
    /// Internal messages hand work between agents inside a conversation.
    pub fn is_internal(&self) -> bool {
        self.from_agent.is_some()
    }
}

/// Data for a new outbound response.
#[derive(Debug, Clone, Default)]
pub struct ResponseData {
    /// External message id this answers.
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub content: String,
    pub original_message: Option<String>,
    pub agent: Option<String>,
    pub files: Option<Vec<String>>,
}

/// A persisted response row.
#[derive(Debug, Clone, Serialize)]
pub struct StoredResponse {
    pub id: i64,
    pub message_id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    pub content: String,
    pub original_message: Option<String>,
    pub agent: Option<String>,
    pub files: Option<Vec<String>>,
    pub status: ResponseStatus,
    pub created_at: i64,
    pub acked_at: Option<i64>,
}

/// Aggregated queue counts for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub dead: i64,
    #[serde(rename = "responsesPending")]
    pub responses_pending: i64,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn files_to_json(files: &Option<Vec<String>>) -> Option<String> {
    files
        .as_ref()
        .map(|f| serde_json::to_string(f).unwrap_or_else(|_| "[]".to_string()))
}

fn files_from_json(raw: Option<String>) -> Option<Vec<String>> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

/// SQLite-backed queue store.
#[derive(Clone)]
pub struct QueueStore {
    path: PathBuf,
    events: EventBus,
    max_retries: u32,
}

impl QueueStore {
    /// Open (creating if needed) the queue database at `path`.
    pub fn open(path: &Path, events: EventBus) -> Result<Self> {
        Self::open_with_retries(path, events, MAX_RETRIES)
    }

    pub fn open_with_retries(path: &Path, events: EventBus, max_retries: u32) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Self {
            path: path.to_path_buf(),
            events,
            max_retries,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_id TEXT,
                content TEXT NOT NULL,
                files TEXT,
                agent TEXT,
                conversation_id TEXT,
                from_agent TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                claimed_by TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS responses (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                sender TEXT NOT NULL,
                sender_id TEXT,
                content TEXT NOT NULL,
                original_message TEXT,
                agent TEXT,
                files TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at INTEGER NOT NULL,
                acked_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_messages_claim
                ON messages(status, agent, created_at);
            CREATE INDEX IF NOT EXISTS idx_responses_channel
                ON responses(channel, status);
            CREATE INDEX IF NOT EXISTS idx_responses_agent
                ON responses(agent, created_at);
            "#,
        )?;
        Ok(())
    }

    /// Insert a new message with status `pending` and signal the bus.
    pub fn enqueue_message(&self, data: MessageData) -> Result<i64> {
        let now = now_ms();
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO messages (message_id, channel, sender, sender_id, content, files, \
             agent, conversation_id, from_agent, status, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'pending', ?10, ?10)",
            params![
                data.message_id,
                data.channel,
                data.sender,
                data.sender_id,
                data.content,
                files_to_json(&data.files),
                data.agent,
                data.conversation_id,
                data.from_agent,
                now,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Queue(format!("duplicate message id {}", data.message_id))
            }
            other => Error::Storage(other),
        })?;
        let id = conn.last_insert_rowid();

        self.events.publish(EventKind::MessageEnqueued {
            message_id: data.message_id.clone(),
            agent: data.agent.clone(),
        });
        tracing::debug!("Enqueued message {} for {:?}", data.message_id, data.agent);
        Ok(id)
    }

    fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
        Ok(StoredMessage {
            id: row.get(0)?,
            message_id: row.get(1)?,
            channel: row.get(2)?,
            sender: row.get(3)?,
            sender_id: row.get(4)?,
            content: row.get(5)?,
            files: files_from_json(row.get(6)?),
            agent: row.get(7)?,
            conversation_id: row.get(8)?,
            from_agent: row.get(9)?,
            status: MessageStatus::parse(&row.get::<_, String>(10)?),
            retry_count: row.get(11)?,
            last_error: row.get(12)?,
            claimed_by: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    const MESSAGE_COLUMNS: &'static str = "id, message_id, channel, sender, sender_id, content, \
        files, agent, conversation_id, from_agent, status, retry_count, last_error, claimed_by, \
        created_at, updated_at";

    /// Atomically claim the oldest pending message for `agent_id`.
    ///
    /// `"default"` also claims rows whose agent field is NULL. Ties break by
    /// lowest created_at, then lowest id.
    pub fn claim_next_message(&self, agent_id: &str) -> Result<Option<StoredMessage>> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!(
            "SELECT {} FROM messages \
             WHERE status = 'pending' AND (agent = ?1 OR (?1 = 'default' AND agent IS NULL)) \
             ORDER BY created_at ASC, id ASC LIMIT 1",
            Self::MESSAGE_COLUMNS
        );
        let row = tx
            .query_row(&sql, params![agent_id], Self::row_to_message)
            .optional()?;

        let Some(mut msg) = row else {
            return Ok(None);
        };

        let now = now_ms();
        tx.execute(
            "UPDATE messages SET status = 'processing', claimed_by = ?1, updated_at = ?2 \
             WHERE id = ?3",
            params![agent_id, now, msg.id],
        )?;
        tx.commit()?;

        msg.status = MessageStatus::Processing;
        msg.claimed_by = Some(agent_id.to_string());
        msg.updated_at = now;
        tracing::debug!("Claimed message {} for {}", msg.message_id, agent_id);
        Ok(Some(msg))
    }

    /// Mark a message completed.
    pub fn complete_message(&self, id: i64) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE messages SET status = 'completed', updated_at = ?1 WHERE id = ?2",
            params![now_ms(), id],
        )?;
        Ok(())
    }

    /// Record a failure. Retries until the budget is spent, then dead-letters.
    pub fn fail_message(&self, id: i64, error: &str) -> Result<MessageStatus> {
        let mut conn = self.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let retry_count: u32 = tx
            .query_row(
                "SELECT retry_count FROM messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;

        let retries = retry_count + 1;
        let status = if retries >= self.max_retries {
            MessageStatus::Dead
        } else {
            MessageStatus::Pending
        };
        tx.execute(
            "UPDATE messages SET status = ?1, retry_count = ?2, last_error = ?3, \
             claimed_by = NULL, updated_at = ?4 WHERE id = ?5",
            params![status.as_str(), retries, error, now_ms(), id],
        )?;
        tx.commit()?;

        if status == MessageStatus::Dead {
            tracing::warn!("Message {} dead-lettered after {} attempts: {}", id, retries, error);
        } else {
            tracing::debug!("Message {} returned to pending (attempt {}): {}", id, retries, error);
        }
        Ok(status)
    }

    /// Return stale `processing` rows to `pending` (or `dead`), counting the
    /// recovery as a retry attempt. A threshold of 0 reclaims every in-flight
    /// row, which is what boot does.
    pub fn recover_stale_messages(&self, threshold_ms: i64) -> Result<usize> {
        let now = now_ms();
        let cutoff = now - threshold_ms;
        let conn = self.connect()?;
        let touched = conn.execute(
            "UPDATE messages SET \
                retry_count = retry_count + 1, \
                status = CASE WHEN retry_count + 1 >= ?1 THEN 'dead' ELSE 'pending' END, \
                claimed_by = NULL, \
                last_error = 'recovered from stale claim', \
                updated_at = ?2 \
             WHERE status = 'processing' AND updated_at <= ?3",
            params![self.max_retries, now, cutoff],
        )?;
        if touched > 0 {
            tracing::info!("Recovered {} stale message(s)", touched);
        }
        Ok(touched)
    }

    /// Distinct agent tags with pending work; NULL maps to "default".
    pub fn get_pending_agents(&self) -> Result<Vec<String>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT COALESCE(agent, 'default') FROM messages WHERE status = 'pending'",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    /// Insert a response row with status `pending`.
    pub fn enqueue_response(&self, data: ResponseData) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO responses (message_id, channel, sender, sender_id, content, \
             original_message, agent, files, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9)",
            params![
                data.message_id,
                data.channel,
                data.sender,
                data.sender_id,
                data.content,
                data.original_message,
                data.agent,
                files_to_json(&data.files),
                now_ms(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Mark a response delivered. Idempotent: acking twice keeps the first
    /// acked_at.
    pub fn ack_response(&self, id: i64) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE responses SET status = 'acked', acked_at = ?1 \
             WHERE id = ?2 AND status != 'acked'",
            params![now_ms(), id],
        )?;
        if changed == 0 {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT id FROM responses WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(Error::NotFound(format!("response {}", id)));
            }
        }
        Ok(())
    }

    fn row_to_response(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredResponse> {
        Ok(StoredResponse {
            id: row.get(0)?,
            message_id: row.get(1)?,
            channel: row.get(2)?,
            sender: row.get(3)?,
            sender_id: row.get(4)?,
            content: row.get(5)?,
            original_message: row.get(6)?,
            agent: row.get(7)?,
            files: files_from_json(row.get(8)?),
            status: ResponseStatus::parse(&row.get::<_, String>(9)?),
            created_at: row.get(10)?,
            acked_at: row.get(11)?,
        })
    }

    const RESPONSE_COLUMNS: &'static str = "id, message_id, channel, sender, sender_id, content, \
        original_message, agent, files, status, created_at, acked_at";

    /// Undelivered responses for a channel, oldest first.
    pub fn pending_responses(&self, channel: &str) -> Result<Vec<StoredResponse>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {} FROM responses WHERE channel = ?1 AND status = 'pending' \
             ORDER BY created_at ASC, id ASC",
            Self::RESPONSE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![channel], Self::row_to_response)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Recent responses, optionally filtered by a set of agent ids.
    pub fn recent_responses(
        &self,
        agents: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<StoredResponse>> {
        let conn = self.connect()?;
        let mut out = Vec::new();
        match agents {
            Some(ids) if !ids.is_empty() => {
                let placeholders = (1..=ids.len())
                    .map(|i| format!("?{}", i))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "SELECT {} FROM responses WHERE agent IN ({}) \
                     ORDER BY created_at DESC, id DESC LIMIT {}",
                    Self::RESPONSE_COLUMNS,
                    placeholders,
                    limit
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows =
                    stmt.query_map(rusqlite::params_from_iter(ids), Self::row_to_response)?;
                for row in rows {
                    out.push(row?);
                }
            }
            _ => {
                let sql = format!(
                    "SELECT {} FROM responses ORDER BY created_at DESC, id DESC LIMIT {}",
                    Self::RESPONSE_COLUMNS,
                    limit
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], Self::row_to_response)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Recent top-level (non-internal) messages, optionally agent-filtered.
    pub fn recent_sent_messages(
        &self,
        agents: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let conn = self.connect()?;
        let mut out = Vec::new();
        match agents {
            Some(ids) if !ids.is_empty() => {
                let placeholders = (1..=ids.len())
                    .map(|i| format!("?{}", i))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "SELECT {} FROM messages WHERE from_agent IS NULL AND agent IN ({}) \
                     ORDER BY created_at DESC, id DESC LIMIT {}",
                    Self::MESSAGE_COLUMNS,
                    placeholders,
                    limit
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows =
                    stmt.query_map(rusqlite::params_from_iter(ids), Self::row_to_message)?;
                for row in rows {
                    out.push(row?);
                }
            }
            _ => {
                let sql = format!(
                    "SELECT {} FROM messages WHERE from_agent IS NULL \
                     ORDER BY created_at DESC, id DESC LIMIT {}",
                    Self::MESSAGE_COLUMNS,
                    limit
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], Self::row_to_message)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Dead-lettered messages, oldest first.
    pub fn dead_messages(&self) -> Result<Vec<StoredMessage>> {
        let conn = self.connect()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE status = 'dead' ORDER BY created_at ASC, id ASC",
            Self::MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], Self::row_to_message)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Manually requeue a dead message with a fresh retry budget.
    pub fn retry_message(&self, id: i64) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE messages SET status = 'pending', retry_count = 0, last_error = NULL, \
             claimed_by = NULL, updated_at = ?1 WHERE id = ?2 AND status = 'dead'",
            params![now_ms(), id],
        )?;
        if changed == 0 {
            return Err(Error::NotFound(format!("dead message {}", id)));
        }
        Ok(())
    }

    /// Park a message as dead immediately, bypassing the retry budget.
    /// Used when no agent can ever handle it.
    pub fn dead_letter_message(&self, id: i64, error: &str) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE messages SET status = 'dead', last_error = ?1, claimed_by = NULL, \
             updated_at = ?2 WHERE id = ?3",
            params![error, now_ms(), id],
        )?;
        tracing::warn!("Message {} dead-lettered: {}", id, error);
        Ok(())
    }

    /// Delete a message row outright.
    pub fn delete_message(&self, id: i64) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        if changed == 0 {
            return Err(Error::NotFound(format!("message {}", id)));
        }
        Ok(())
    }

    /// Delete completed messages older than `older_than_ms`.
    pub fn prune_completed_messages(&self, older_than_ms: i64) -> Result<usize> {
        let cutoff = now_ms() - older_than_ms;
        let conn = self.connect()?;
        let removed = conn.execute(
            "DELETE FROM messages WHERE status = 'completed' AND updated_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Delete acked responses older than `older_than_ms`.
    pub fn prune_acked_responses(&self, older_than_ms: i64) -> Result<usize> {
        let cutoff = now_ms() - older_than_ms;
        let conn = self.connect()?;
        let removed = conn.execute(
            "DELETE FROM responses WHERE status = 'acked' AND acked_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Aggregated queue counts.
    pub fn queue_status(&self) -> Result<QueueStatus> {
        let conn = self.connect()?;
        let count = |status: &str| -> Result<i64> {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE status = ?1",
                params![status],
                |row| row.get(0),
            )?)
        };
        let responses_pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM responses WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(QueueStatus {
            pending: count("pending")?,
            processing: count("processing")?,
            completed: count("completed")?,
            dead: count("dead")?,
            responses_pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, QueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = QueueStore::open(&dir.path().join("queue.db"), EventBus::default()).unwrap();
        (dir, store)
    }

    fn msg(channel: &str, content: &str, agent: Option<&str>) -> MessageData {
        let mut data = MessageData::new(channel, "alice", content);
        data.agent = agent.map(|a| a.to_string());
        data
    }

    #[test]
    fn test_claim_is_exclusive_and_ordered() {
        let (_dir, store) = test_store();
        store.enqueue_message(msg("cli", "first", Some("coder"))).unwrap();
        store.enqueue_message(msg("cli", "second", Some("coder"))).unwrap();
        store.enqueue_message(msg("cli", "third", Some("coder"))).unwrap();

        let one = store.claim_next_message("coder").unwrap().unwrap();
        assert_eq!(one.content, "first");
        assert_eq!(one.status, MessageStatus::Processing);
        assert_eq!(one.claimed_by.as_deref(), Some("coder"));

        // The claimed row is not visible to a second claimer.
        let two = store.claim_next_message("coder").unwrap().unwrap();
        assert_eq!(two.content, "second");
        let three = store.claim_next_message("coder").unwrap().unwrap();
        assert_eq!(three.content, "third");
        assert!(store.claim_next_message("coder").unwrap().is_none());
    }

    #[test]
    fn test_default_claims_null_agent_rows() {
        let (_dir, store) = test_store();
        store.enqueue_message(msg("cli", "untargeted", None)).unwrap();

        assert!(store.claim_next_message("coder").unwrap().is_none());
        let claimed = store.claim_next_message("default").unwrap().unwrap();
        assert_eq!(claimed.content, "untargeted");
    }

    #[test]
    fn test_pending_agents_maps_null_to_default() {
        let (_dir, store) = test_store();
        store.enqueue_message(msg("cli", "a", None)).unwrap();
        store.enqueue_message(msg("cli", "b", Some("coder"))).unwrap();

        let mut agents = store.get_pending_agents().unwrap();
        agents.sort();
        assert_eq!(agents, vec!["coder".to_string(), "default".to_string()]);
    }

    #[test]
    fn test_duplicate_external_id_rejected() {
        let (_dir, store) = test_store();
        let mut data = msg("cli", "hello", None);
        data.message_id = "fixed".to_string();
        store.enqueue_message(data.clone()).unwrap();
        assert!(store.enqueue_message(data).is_err());
    }

    #[test]
    fn test_fail_until_dead_letter() {
        let (_dir, store) = test_store();
        store.enqueue_message(msg("cli", "flaky", Some("coder"))).unwrap();

        for attempt in 1..MAX_RETRIES {
            let claimed = store.claim_next_message("coder").unwrap().unwrap();
            assert_eq!(claimed.retry_count, attempt - 1);
            let status = store.fail_message(claimed.id, "boom").unwrap();
            assert_eq!(status, MessageStatus::Pending);
        }

        let claimed = store.claim_next_message("coder").unwrap().unwrap();
        let status = store.fail_message(claimed.id, "boom").unwrap();
        assert_eq!(status, MessageStatus::Dead);

        assert!(store.claim_next_message("coder").unwrap().is_none());
        let dead = store.dead_messages().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, MAX_RETRIES);
    }

    #[test]
    fn test_stale_recovery_counts_as_retry() {
        let (_dir, store) = test_store();
        store.enqueue_message(msg("cli", "stuck", Some("coder"))).unwrap();
        let claimed = store.claim_next_message("coder").unwrap().unwrap();

        // Nothing is stale inside the threshold.
        assert_eq!(store.recover_stale_messages(10 * 60 * 1000).unwrap(), 0);

        // Threshold 0 reclaims the in-flight row.
        assert_eq!(store.recover_stale_messages(0).unwrap(), 1);
        let reclaimed = store.claim_next_message("coder").unwrap().unwrap();
        assert_eq!(reclaimed.id, claimed.id);
        assert_eq!(reclaimed.retry_count, 1);
        assert_eq!(
            reclaimed.last_error.as_deref(),
            Some("recovered from stale claim")
        );
    }

    #[test]
    fn test_boot_recovery_empties_processing() {
        let (_dir, store) = test_store();
        for i in 0..3 {
            store
                .enqueue_message(msg("cli", &format!("m{}", i), Some("coder")))
                .unwrap();
            store.claim_next_message("coder").unwrap().unwrap();
        }
        store.recover_stale_messages(0).unwrap();
        let status = store.queue_status().unwrap();
        assert_eq!(status.processing, 0);
        assert_eq!(status.pending, 3);
    }

    #[test]
    fn test_ack_response_idempotent() {
        let (_dir, store) = test_store();
        let id = store
            .enqueue_response(ResponseData {
                message_id: "m1".to_string(),
                channel: "cli".to_string(),
                sender: "alice".to_string(),
                content: "done".to_string(),
                ..Default::default()
            })
            .unwrap();

        store.ack_response(id).unwrap();
        let first = store.recent_responses(None, 10).unwrap()[0].acked_at;
        store.ack_response(id).unwrap();
        let second = store.recent_responses(None, 10).unwrap()[0].acked_at;
        assert_eq!(first, second);
        assert!(store.ack_response(9999).is_err());
    }

    #[test]
    fn test_pending_responses_by_channel() {
        let (_dir, store) = test_store();
        for channel in ["web", "web", "cli"] {
            store
                .enqueue_response(ResponseData {
                    message_id: ulid::Ulid::new().to_string(),
                    channel: channel.to_string(),
                    sender: "alice".to_string(),
                    content: "hi".to_string(),
                    ..Default::default()
                })
                .unwrap();
        }
        assert_eq!(store.pending_responses("web").unwrap().len(), 2);
        assert_eq!(store.pending_responses("cli").unwrap().len(), 1);
        assert_eq!(store.pending_responses("telegram").unwrap().len(), 0);
    }

    #[test]
    fn test_sent_messages_exclude_internal() {
        let (_dir, store) = test_store();
        store.enqueue_message(msg("cli", "top-level", Some("coder"))).unwrap();
        let mut internal = msg("cli", "handoff", Some("reviewer"));
        internal.from_agent = Some("coder".to_string());
        internal.conversation_id = Some("conv1".to_string());
        store.enqueue_message(internal).unwrap();

        let sent = store.recent_sent_messages(None, 10).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "top-level");
    }

    #[test]
    fn test_retry_dead_message() {
        let (_dir, store) = test_store();
        store.enqueue_message(msg("cli", "doomed", Some("coder"))).unwrap();
        let mut id = 0;
        for _ in 0..MAX_RETRIES {
            let claimed = store.claim_next_message("coder").unwrap().unwrap();
            id = claimed.id;
            store.fail_message(claimed.id, "err").unwrap();
        }
        store.retry_message(id).unwrap();
        let claimed = store.claim_next_message("coder").unwrap().unwrap();
        assert_eq!(claimed.retry_count, 0);
    }

    #[test]
    fn test_prune_old_rows() {
        let (_dir, store) = test_store();
        store.enqueue_message(msg("cli", "old", Some("coder"))).unwrap();
        let claimed = store.claim_next_message("coder").unwrap().unwrap();
        store.complete_message(claimed.id).unwrap();

        // Recent rows survive a 24h prune; a zero-age prune removes them.
        assert_eq!(store.prune_completed_messages(24 * 3600 * 1000).unwrap(), 0);
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.prune_completed_messages(0).unwrap(), 1);
    }
}
