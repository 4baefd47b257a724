//! Team conversation tracking.
//!
//! A conversation is the live state behind one top-level user message routed
//! to a team: a pending-branch counter, the ordered step responses, and the
//! pipeline cursor. Records live in memory keyed by conversation id; the only
//! durable link is the `conversation_id` column on internal message rows, so
//! a restart re-materializes a conversation when its next internal message
//! arrives.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

use crate::config::Limits;
use crate::core::events::{EventBus, EventKind};
use crate::core::routing::{strip_mention_tags, Mention};
use crate::core::store::{MessageData, QueueStore, ResponseData, StoredMessage};
use crate::error::Result;

/// One live team conversation.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub sender_id: Option<String>,
    /// External id of the originating user message.
    pub message_id: String,
    pub original_message: String,
    /// Branches still in flight. The conversation completes when this
    /// reaches zero.
    pub pending: u32,
    /// Step responses in completion order.
    pub responses: Vec<(String, String)>,
    pub files: Vec<String>,
    pub total_messages: u32,
    pub max_messages: u32,
    pub team_id: String,
    pub started_at: i64,
    pub completed: bool,
    pub pipeline_step: usize,
    pub completed_agents: HashSet<String>,
    pub pipeline_loops: u32,
}

impl Conversation {
    fn new(id: &str, team_id: &str, msg: &StoredMessage, max_messages: u32) -> Self {
        Self {
            id: id.to_string(),
            channel: msg.channel.clone(),
            sender: msg.sender.clone(),
            sender_id: msg.sender_id.clone(),
            message_id: msg.message_id.clone(),
            original_message: msg.content.clone(),
            pending: 1,
            responses: Vec::new(),
            files: Vec::new(),
            total_messages: 0,
            max_messages,
            team_id: team_id.to_string(),
            started_at: chrono::Utc::now().timestamp_millis(),
            completed: false,
            pipeline_step: 0,
            completed_agents: HashSet::new(),
            pipeline_loops: 0,
        }
    }

    /// Record one completed step.
    pub fn record_step(&mut self, agent_id: &str, response: &str) {
        self.responses
            .push((agent_id.to_string(), response.to_string()));
        self.total_messages += 1;
        self.completed_agents.insert(agent_id.to_string());
    }

    /// Decrement the pending counter; true when the conversation is done.
    /// An underflow clamps to zero and reports done.
    pub fn complete_branch(&mut self) -> bool {
        if self.pending == 0 {
            tracing::warn!("Conversation {} pending counter underflow", self.id);
            return true;
        }
        self.pending -= 1;
        self.pending == 0
    }

    /// Room left for further fan-out.
    pub fn can_fan_out(&self) -> bool {
        self.total_messages < self.max_messages
    }
}

/// Pull `[send_file: PATH]` tokens out of a response body. Tokens are always
/// removed; only paths that exist on disk are kept.
pub fn extract_send_files(text: &str) -> (String, Vec<String>) {
    let re = regex::Regex::new(r"\[send_file:\s*([^\]]+)\]").expect("static regex");
    let mut files = Vec::new();
    for caps in re.captures_iter(text) {
        let path = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if path.is_empty() {
            continue;
        }
        if Path::new(path).exists() {
            if !files.iter().any(|f| f == path) {
                files.push(path.to_string());
            }
        } else {
            tracing::warn!("send_file points at missing path: {}", path);
        }
    }
    let body = re.replace_all(text, "").trim().to_string();
    (body, files)
}

/// Suffix appended to a truncated long response.
pub const LONG_RESPONSE_NOTE: &str = "\n\n[Response truncated; full text attached as a file]";

/// When `text` exceeds `threshold` characters, persist the full text under
/// `dir` and return the truncated body plus the saved path.
pub fn spill_long_response(
    text: String,
    threshold: usize,
    dir: &Path,
) -> Result<(String, Option<String>)> {
    if text.chars().count() <= threshold {
        return Ok((text, None));
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("response-{}.md", ulid::Ulid::new()));
    std::fs::write(&path, &text)?;

    let mut body: String = text.chars().take(threshold).collect();
    body.push_str(LONG_RESPONSE_NOTE);
    tracing::info!(
        "Long response ({} chars) spilled to {}",
        text.chars().count(),
        path.display()
    );
    Ok((body, Some(path.to_string_lossy().to_string())))
}

/// Wrap an internal message body so the receiving agent knows its origin.
pub fn wrap_internal_body(from_agent: &str, message: &str, strict_pipeline: bool) -> String {
    if strict_pipeline {
        format!("[Pipeline step from @{}]:\n{}", from_agent, message)
    } else {
        format!("[From teammate @{}]:\n{}", from_agent, message)
    }
}

/// Manager for the live conversation set.
///
/// The map lock is only ever held for lookups; per-conversation work happens
/// under each conversation's own async mutex, so distinct conversations
/// proceed in parallel.
pub struct ConversationManager {
    store: QueueStore,
    events: EventBus,
    files_dir: PathBuf,
    limits: Limits,
    conversations: StdMutex<HashMap<String, Arc<Mutex<Conversation>>>>,
}

impl ConversationManager {
    pub fn new(store: QueueStore, events: EventBus, files_dir: PathBuf, limits: Limits) -> Self {
        Self {
            store,
            events,
            files_dir,
            limits,
            conversations: StdMutex::new(HashMap::new()),
        }
    }

    /// Look up a conversation, or start one with pending = 1.
    ///
    /// Returns the handle and whether it was just created. Re-materializes
    /// implicitly for internal messages that survived a restart.
    pub fn get_or_start(
        &self,
        id: &str,
        team_id: &str,
        msg: &StoredMessage,
    ) -> (Arc<Mutex<Conversation>>, bool) {
        let mut map = self.conversations.lock().expect("conversation map poisoned");
        if let Some(existing) = map.get(id) {
            return (existing.clone(), false);
        }
        let conv = Arc::new(Mutex::new(Conversation::new(
            id,
            team_id,
            msg,
            self.limits.max_messages,
        )));
        map.insert(id.to_string(), conv.clone());
        self.events.publish(EventKind::TeamChainStart {
            team_id: team_id.to_string(),
            conversation_id: id.to_string(),
        });
        (conv, true)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Mutex<Conversation>>> {
        self.conversations
            .lock()
            .expect("conversation map poisoned")
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &str) {
        self.conversations
            .lock()
            .expect("conversation map poisoned")
            .remove(id);
    }

    pub fn active_count(&self) -> usize {
        self.conversations
            .lock()
            .expect("conversation map poisoned")
            .len()
    }

    /// Fan out mentions as internal messages. Bumps the pending counter and
    /// enqueues one row per mention, each carrying the conversation id and
    /// the sending agent.
    pub fn enqueue_mentions(
        &self,
        conv: &mut Conversation,
        current_agent: &str,
        mentions: &[Mention],
        strict_pipeline: bool,
    ) -> Result<()> {
        for mention in mentions {
            conv.pending += 1;
            let mut data = MessageData::new(
                &conv.channel,
                &conv.sender,
                &wrap_internal_body(current_agent, &mention.message, strict_pipeline),
            );
            data.sender_id = conv.sender_id.clone();
            data.agent = Some(mention.target.clone());
            data.conversation_id = Some(conv.id.clone());
            data.from_agent = Some(current_agent.to_string());
            self.store.enqueue_message(data)?;

            self.events.publish(EventKind::ChainHandoff {
                from_agent: current_agent.to_string(),
                to_agent: mention.target.clone(),
                conversation_id: conv.id.clone(),
            });
        }
        Ok(())
    }

    /// Complete a conversation: aggregate the steps into a single response
    /// row addressed to the originating user, then drop the live record.
    /// Idempotent.
    pub fn complete(&self, conv: &mut Conversation) -> Result<()> {
        if conv.completed {
            return Ok(());
        }
        conv.completed = true;

        let aggregated = if conv.responses.len() == 1 {
            conv.responses[0].1.clone()
        } else {
            conv.responses
                .iter()
                .map(|(agent, text)| format!("@{}: {}", agent, text))
                .collect::<Vec<_>>()
                .join("\n\n------\n\n")
        };

        // Any mention tags that survived pipeline filtering are noise to the
        // end user.
        let cleaned = strip_mention_tags(&aggregated);
        let (body, mentioned_files) = extract_send_files(&cleaned);

        let mut files = conv.files.clone();
        for file in mentioned_files {
            if !files.contains(&file) {
                files.push(file);
            }
        }

        let (mut body, spilled) =
            spill_long_response(body, self.limits.long_response_threshold, &self.files_dir)?;
        if let Some(path) = spilled {
            files.push(path);
        }
        if body.is_empty() {
            body = "The team did not produce a response.".to_string();
        }

        let first_agent = conv.responses.first().map(|(agent, _)| agent.clone());
        let response_length = body.chars().count();
        self.store.enqueue_response(ResponseData {
            message_id: conv.message_id.clone(),
            channel: conv.channel.clone(),
            sender: conv.sender.clone(),
            sender_id: conv.sender_id.clone(),
            content: body,
            original_message: Some(conv.original_message.clone()),
            agent: first_agent.clone(),
            files: if files.is_empty() { None } else { Some(files) },
        })?;

        self.events.publish(EventKind::TeamChainEnd {
            team_id: conv.team_id.clone(),
            conversation_id: conv.id.clone(),
            total: conv.total_messages,
        });
        self.events.publish(EventKind::ResponseReady {
            message_id: conv.message_id.clone(),
            agent_id: first_agent,
            response_length,
        });

        tracing::info!(
            "Conversation {} completed with {} step(s)",
            conv.id,
            conv.responses.len()
        );
        Ok(())
    }

    /// Force-complete conversations older than `timeout_ms`, with whatever
    /// responses they have. Returns how many were swept.
    pub async fn sweep_expired(&self, timeout_ms: i64) -> Result<usize> {
        let now = chrono::Utc::now().timestamp_millis();
        let expired: Vec<(String, Arc<Mutex<Conversation>>)> = {
            let map = self.conversations.lock().expect("conversation map poisoned");
            map.iter()
                .map(|(id, conv)| (id.clone(), conv.clone()))
                .collect()
        };

        let mut swept = 0;
        for (id, handle) in expired {
            let mut conv = handle.lock().await;
            if conv.started_at + timeout_ms < now {
                tracing::warn!("Conversation {} timed out, force-completing", id);
                self.complete(&mut conv)?;
                drop(conv);
                self.remove(&id);
                swept += 1;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::store::MessageStatus;

    fn manager() -> (tempfile::TempDir, ConversationManager, QueueStore) {
        let dir = tempfile::tempdir().unwrap();
        let events = EventBus::default();
        let store = QueueStore::open(&dir.path().join("queue.db"), events.clone()).unwrap();
        let mgr = ConversationManager::new(
            store.clone(),
            events,
            dir.path().join("files"),
            Limits::default(),
        );
        (dir, mgr, store)
    }

    fn seed_message() -> StoredMessage {
        StoredMessage {
            id: 1,
            message_id: "m1".to_string(),
            channel: "web".to_string(),
            sender: "alice".to_string(),
            sender_id: Some("u1".to_string()),
            content: "build feature X".to_string(),
            files: None,
            agent: Some("po".to_string()),
            conversation_id: None,
            from_agent: None,
            status: MessageStatus::Processing,
            retry_count: 0,
            last_error: None,
            claimed_by: Some("po".to_string()),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn test_start_records_and_completes_single_step() {
        let (_dir, mgr, store) = manager();
        let msg = seed_message();
        let (handle, created) = mgr.get_or_start("conv1", "dev", &msg);
        assert!(created);

        let mut conv = handle.lock().await;
        conv.record_step("po", "done");
        assert!(conv.complete_branch());
        mgr.complete(&mut conv).unwrap();
        drop(conv);
        mgr.remove("conv1");

        let responses = store.pending_responses("web").unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].content, "done");
        assert_eq!(responses[0].message_id, "m1");
        assert_eq!(responses[0].agent.as_deref(), Some("po"));
        assert_eq!(mgr.active_count(), 0);
    }

    #[tokio::test]
    async fn test_multi_step_aggregation() {
        let (_dir, mgr, store) = manager();
        let (handle, _) = mgr.get_or_start("conv1", "dev", &seed_message());
        let mut conv = handle.lock().await;
        conv.record_step("po", "story");
        conv.record_step("coder", "impl");
        conv.record_step("reviewer", "approved");
        mgr.complete(&mut conv).unwrap();

        let responses = store.pending_responses("web").unwrap();
        let body = &responses[0].content;
        assert!(body.contains("@po: story"));
        assert!(body.contains("@coder: impl"));
        assert!(body.contains("@reviewer: approved"));
        assert!(body.contains("------"));
    }

    #[tokio::test]
    async fn test_complete_is_idempotent() {
        let (_dir, mgr, store) = manager();
        let (handle, _) = mgr.get_or_start("conv1", "dev", &seed_message());
        let mut conv = handle.lock().await;
        conv.record_step("po", "done");
        mgr.complete(&mut conv).unwrap();
        mgr.complete(&mut conv).unwrap();

        assert_eq!(store.pending_responses("web").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_mentions_creates_internal_rows() {
        let (_dir, mgr, store) = manager();
        let (handle, _) = mgr.get_or_start("conv1", "dev", &seed_message());
        let mut conv = handle.lock().await;

        let mentions = vec![
            Mention {
                target: "coder".to_string(),
                message: "implement".to_string(),
            },
            Mention {
                target: "reviewer".to_string(),
                message: "review".to_string(),
            },
        ];
        mgr.enqueue_mentions(&mut conv, "po", &mentions, false).unwrap();
        assert_eq!(conv.pending, 3);

        let claimed = store.claim_next_message("coder").unwrap().unwrap();
        assert!(claimed.is_internal());
        assert_eq!(claimed.from_agent.as_deref(), Some("po"));
        assert_eq!(claimed.conversation_id.as_deref(), Some("conv1"));
        assert!(claimed.content.starts_with("[From teammate @po]:"));
    }

    #[test]
    fn test_complete_branch_clamps_underflow() {
        let msg = seed_message();
        let mut conv = Conversation::new("c", "dev", &msg, 50);
        assert!(conv.complete_branch());
        assert!(conv.complete_branch());
        assert_eq!(conv.pending, 0);
    }

    #[test]
    fn test_extract_send_files_keeps_existing_only() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("report.txt");
        std::fs::write(&real, "data").unwrap();

        let text = format!(
            "Here you go [send_file: {}] and [send_file: /no/such/file.bin] done",
            real.display()
        );
        let (body, files) = extract_send_files(&text);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0], real.to_string_lossy());
        assert!(!body.contains("send_file"));
        assert!(body.contains("Here you go"));
        assert!(body.contains("done"));
    }

    #[test]
    fn test_spill_long_response() {
        let dir = tempfile::tempdir().unwrap();
        let text = "x".repeat(5000);
        let (body, spilled) = spill_long_response(text.clone(), 4000, dir.path()).unwrap();

        let path = spilled.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), text);
        assert_eq!(body.chars().count(), 4000 + LONG_RESPONSE_NOTE.chars().count());
        assert!(body.ends_with(LONG_RESPONSE_NOTE));

        let (short, none) = spill_long_response("short".to_string(), 4000, dir.path()).unwrap();
        assert_eq!(short, "short");
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn test_sweep_expired_force_completes() {
        let (_dir, mgr, store) = manager();
        let (handle, _) = mgr.get_or_start("conv1", "dev", &seed_message());
        {
            let mut conv = handle.lock().await;
            conv.record_step("po", "partial work");
            conv.started_at -= 31 * 60 * 1000;
        }

        let swept = mgr.sweep_expired(30 * 60 * 1000).await.unwrap();
        assert_eq!(swept, 1);
        assert_eq!(mgr.active_count(), 0);
        let responses = store.pending_responses("web").unwrap();
        assert_eq!(responses[0].content, "partial work");
    }
}
