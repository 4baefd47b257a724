//! Message dispatcher.
//!
//! Wakes on `message_enqueued` events (with a fallback poll), claims one
//! message per pending agent, and feeds each claim into that agent's FIFO
//! chain. A chain is a dedicated task that processes one message at a time,
//! so within an agent ordering matches claim order while distinct agents run
//! fully concurrently.
//!
//! Also owns periodic maintenance: stale-claim recovery, conversation
//! timeout sweeps, and pruning of old completed/acked rows.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use crate::config::{ConfigProvider, Settings, TeamConfig};
use crate::core::conversation::{
    extract_send_files, spill_long_response, ConversationManager,
};
use crate::core::events::{EventBus, EventKind};
use crate::core::invoker::{Invoker, FALLBACK_APOLOGY};
use crate::core::routing::{
    extract_teammate_mentions, filter_mentions_for_pipeline, find_team_for_agent,
    next_pipeline_agent, parse_agent_routing, pipeline_loop_target, Mention, DEFAULT_AGENT,
};
use crate::core::store::{QueueStore, ResponseData, StoredMessage};
use crate::error::Result;

/// How long chain responses can be in event payloads before truncation.
const EVENT_TEXT_LIMIT: usize = 500;

/// Fallback poll when no enqueue event arrives.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

const STALE_RECOVERY_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CONVERSATION_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Dispatcher {
    store: QueueStore,
    config: Arc<ConfigProvider>,
    conversations: Arc<ConversationManager>,
    invoker: Arc<dyn Invoker>,
    events: EventBus,
    chains: StdMutex<HashMap<String, mpsc::UnboundedSender<()>>>,
}

impl Dispatcher {
    pub fn new(
        store: QueueStore,
        config: Arc<ConfigProvider>,
        conversations: Arc<ConversationManager>,
        invoker: Arc<dyn Invoker>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            conversations,
            invoker,
            events,
            chains: StdMutex::new(HashMap::new()),
        })
    }

    /// Run the dispatcher until the process exits.
    ///
    /// Boot first returns every in-flight row to pending so nothing claimed
    /// by a dead process is lost.
    pub async fn run(self: Arc<Self>) {
        self.events.publish(EventKind::ProcessorStart {});
        match self.store.recover_stale_messages(0) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Boot recovery returned {} message(s) to pending", n),
            Err(e) => tracing::error!("Boot recovery failed: {}", e),
        }

        tokio::spawn(self.clone().maintenance_loop());

        let mut rx = self.events.subscribe();
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Ok(ev) => {
                        if matches!(ev.kind, EventKind::MessageEnqueued { .. }) {
                            self.wake();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Dispatcher lagged {} event(s)", skipped);
                        self.wake();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = poll.tick() => self.wake(),
            }
        }
    }

    /// Nudge a chain for every agent with pending work, spawning chains on
    /// first contact.
    pub fn wake(self: &Arc<Self>) {
        let agents = match self.store.get_pending_agents() {
            Ok(agents) => agents,
            Err(e) => {
                tracing::error!("Could not read pending agents: {}", e);
                return;
            }
        };

        let mut chains = self.chains.lock().expect("chain map poisoned");
        for agent in agents {
            let tx = chains.entry(agent.clone()).or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(self.clone().chain_loop(agent.clone(), rx));
                tx
            });
            let _ = tx.send(());
        }
    }

    /// Serial worker for one agent id. At most one message is in flight per
    /// chain; ordering is the claim order.
    async fn chain_loop(
        self: Arc<Self>,
        agent_id: String,
        mut nudge: mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            loop {
                match self.store.claim_next_message(&agent_id) {
                    Ok(Some(msg)) => {
                        let row_id = msg.id;
                        if let Err(e) = self.process_message(msg).await {
                            tracing::error!("Processing failed on chain {}: {}", agent_id, e);
                            if let Err(e) = self.store.fail_message(row_id, &e.to_string()) {
                                tracing::error!("Could not record failure: {}", e);
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Claim failed on chain {}: {}", agent_id, e);
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        break;
                    }
                }
            }

            if nudge.recv().await.is_none() {
                break;
            }
        }
    }

    /// Resolve the agent that should handle a message, applying the
    /// no-such-agent fallbacks.
    fn resolve_agent(
        &self,
        candidate: String,
        settings: &Settings,
    ) -> std::result::Result<String, String> {
        if settings.agents.contains_key(&candidate) {
            return Ok(candidate);
        }
        if let Some(configured) = settings.routing.default_agent.as_deref() {
            if settings.agents.contains_key(configured) {
                return Ok(configured.to_string());
            }
        }
        if settings.agents.contains_key(DEFAULT_AGENT) {
            return Ok(DEFAULT_AGENT.to_string());
        }
        let mut ids: Vec<&String> = settings.agents.keys().collect();
        ids.sort();
        match ids.first() {
            Some(first) => Ok((*first).clone()),
            None => Err("No agents configured".to_string()),
        }
    }

    async fn process_message(&self, msg: StoredMessage) -> Result<()> {
        let settings = self.config.snapshot();
        let home = self.config.home().to_path_buf();

        // A pre-routed agent field is authoritative; otherwise parse the body.
        let (candidate, mut body, routed_team, was_team) = match msg.agent.clone() {
            Some(agent) => (agent, msg.content.clone(), None, false),
            None => {
                let decision =
                    parse_agent_routing(&msg.content, &settings.agents, &settings.teams);
                self.events.publish(EventKind::AgentRouted {
                    message_id: msg.message_id.clone(),
                    agent_id: decision.agent_id.clone(),
                    team_id: decision.team_id.clone(),
                });
                (
                    decision.agent_id,
                    decision.message,
                    decision.team_id,
                    decision.is_team,
                )
            }
        };

        let mut agent_id = match self.resolve_agent(candidate, &settings) {
            Ok(agent_id) => agent_id,
            Err(reason) => {
                self.store.dead_letter_message(msg.id, &reason)?;
                return Ok(());
            }
        };

        // Team context: internal messages inherit their conversation's team;
        // external ones use the explicitly named team, else the first team
        // containing the routed agent.
        let team_ctx: Option<(String, TeamConfig)> = if msg.is_internal() {
            let inherited = msg
                .conversation_id
                .as_deref()
                .and_then(|cid| self.conversations.get(cid));
            match inherited {
                Some(handle) => {
                    let team_id = handle.lock().await.team_id.clone();
                    settings
                        .teams
                        .get(&team_id)
                        .map(|t| (team_id, t.clone()))
                }
                None => find_team_for_agent(&agent_id, &settings.teams),
            }
        } else if let Some(team_id) = routed_team.clone() {
            settings.teams.get(&team_id).map(|t| (team_id, t.clone()))
        } else {
            find_team_for_agent(&agent_id, &settings.teams)
        };

        // Pipeline leader override: the first external message into a
        // pipelined team starts at the head of the sequence, not the leader.
        if was_team && !msg.is_internal() {
            if let Some((_, team)) = &team_ctx {
                if let Some(first) = team
                    .pipeline
                    .as_ref()
                    .and_then(|p| p.sequence.first().cloned())
                {
                    if settings.agents.contains_key(&first) {
                        agent_id = first;
                    }
                }
            }
        }

        // The prompt grows trailers below; the conversation seed keeps the
        // routed body as the user wrote it.
        let routed_body = body.clone();

        // A reset flag file requests a fresh provider session.
        let working_dir = settings.agent_working_dir(&agent_id, &home);
        let reset_flag = working_dir.join("reset_flag");
        let reset = reset_flag.exists();
        if reset {
            if let Err(e) = std::fs::remove_file(&reset_flag) {
                tracing::warn!("Could not remove reset flag {}: {}", reset_flag.display(), e);
            }
        }

        // Tell the agent when teammate branches are still in flight.
        if msg.is_internal() {
            if let Some(handle) = msg
                .conversation_id
                .as_deref()
                .and_then(|cid| self.conversations.get(cid))
            {
                let pending = handle.lock().await.pending;
                let others = pending.saturating_sub(1);
                if others > 0 {
                    body.push_str(&format!(
                        "\n\n[{} other teammate response(s) are still being processed and \
                         will be delivered when ready. Do not re-mention teammates who \
                         haven't responded yet.]",
                        others
                    ));
                }
            }
        }

        if let Some(files) = msg.files.as_ref().filter(|f| !f.is_empty()) {
            body.push_str("\n\n[Attached files]");
            for file in files {
                body.push_str(&format!("\n- {}", file));
            }
        }

        self.events.publish(EventKind::ChainStepStart {
            agent_id: agent_id.clone(),
            conversation_id: msg.conversation_id.clone(),
        });

        let response = match self.invoker.invoke(&agent_id, &body, reset, &settings).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Invoker failed for @{}: {}", agent_id, e);
                FALLBACK_APOLOGY.to_string()
            }
        };

        self.events.publish(EventKind::ChainStepDone {
            agent_id: agent_id.clone(),
            conversation_id: msg.conversation_id.clone(),
            response_length: response.chars().count(),
            response_text: response.chars().take(EVENT_TEXT_LIMIT).collect(),
        });

        match team_ctx {
            None => self.reply_single(&msg, &agent_id, response, &settings),
            Some((team_id, team)) => {
                self.advance_conversation(
                    &msg,
                    &agent_id,
                    &team_id,
                    &team,
                    routed_body,
                    response,
                    &settings,
                )
                .await
            }
        }
    }

    /// Single-agent reply: no conversation, one response row.
    fn reply_single(
        &self,
        msg: &StoredMessage,
        agent_id: &str,
        response: String,
        settings: &Settings,
    ) -> Result<()> {
        let files_dir = self.config.home().join("files");
        let (body, mut files) = extract_send_files(&response);
        let (body, spilled) =
            spill_long_response(body, settings.limits.long_response_threshold, &files_dir)?;
        if let Some(path) = spilled {
            files.push(path);
        }

        let response_length = body.chars().count();
        self.store.enqueue_response(ResponseData {
            message_id: msg.message_id.clone(),
            channel: msg.channel.clone(),
            sender: msg.sender.clone(),
            sender_id: msg.sender_id.clone(),
            content: body,
            original_message: Some(msg.content.clone()),
            agent: Some(agent_id.to_string()),
            files: if files.is_empty() { None } else { Some(files) },
        })?;

        self.events.publish(EventKind::ResponseReady {
            message_id: msg.message_id.clone(),
            agent_id: Some(agent_id.to_string()),
            response_length,
        });

        self.store.complete_message(msg.id)?;
        Ok(())
    }

    /// Team path: record the step, fan out pipeline-adjusted mentions, and
    /// complete the conversation when its last branch settles.
    #[allow(clippy::too_many_arguments)]
    async fn advance_conversation(
        &self,
        msg: &StoredMessage,
        agent_id: &str,
        team_id: &str,
        team: &TeamConfig,
        routed_body: String,
        response: String,
        settings: &Settings,
    ) -> Result<()> {
        let conv_id = msg
            .conversation_id
            .clone()
            .unwrap_or_else(|| ulid::Ulid::new().to_string());

        // Seed the conversation with the routed body so aggregates and
        // pipeline prompts quote what the user actually asked.
        let mut seed = msg.clone();
        seed.content = routed_body;
        let (handle, _created) = self.conversations.get_or_start(&conv_id, team_id, &seed);

        let mut conv = handle.lock().await;
        conv.record_step(agent_id, &response);

        let pipeline = team.pipeline.as_ref();
        let mut strict_mode = false;

        let mentions: Vec<Mention> = match pipeline {
            Some(p) if p.strict => {
                // Strict pipelines ignore whatever the agent mentioned and
                // hand the combined context to the next agent in sequence.
                strict_mode = true;
                let next = next_pipeline_agent(p, agent_id);
                match next {
                    Some(next) if conv.can_fan_out() => {
                        let body = format!(
                            "[Original request]:\n{}\n\n[Output from @{}]:\n{}",
                            conv.original_message, agent_id, response
                        );
                        conv.pipeline_step = p
                            .sequence
                            .iter()
                            .position(|a| a == &next)
                            .unwrap_or(conv.pipeline_step + 1);
                        self.events.publish(EventKind::PipelineStep {
                            team_id: team_id.to_string(),
                            agent_id: next.clone(),
                            step: conv.pipeline_step,
                            total: p.sequence.len(),
                        });
                        vec![Mention {
                            target: next,
                            message: body,
                        }]
                    }
                    _ => Vec::new(),
                }
            }
            Some(p) => {
                let raw = extract_teammate_mentions(
                    &response,
                    agent_id,
                    team_id,
                    &settings.teams,
                    &settings.agents,
                );
                let filtered =
                    filter_mentions_for_pipeline(raw, p, agent_id, conv.pipeline_loops);
                for mention in &filtered {
                    if pipeline_loop_target(p, agent_id, &mention.target, conv.pipeline_loops) {
                        conv.pipeline_loops += 1;
                        conv.pipeline_step = p
                            .sequence
                            .iter()
                            .position(|a| a == &mention.target)
                            .unwrap_or(0);
                        self.events.publish(EventKind::PipelineLoop {
                            team_id: team_id.to_string(),
                            agent_id: mention.target.clone(),
                            loop_count: conv.pipeline_loops,
                            max_loops: p.max_loops,
                        });
                    } else {
                        conv.pipeline_step = p
                            .sequence
                            .iter()
                            .position(|a| a == &mention.target)
                            .unwrap_or(conv.pipeline_step + 1);
                        self.events.publish(EventKind::PipelineStep {
                            team_id: team_id.to_string(),
                            agent_id: mention.target.clone(),
                            step: conv.pipeline_step,
                            total: p.sequence.len(),
                        });
                    }
                }
                filtered
            }
            None => extract_teammate_mentions(
                &response,
                agent_id,
                team_id,
                &settings.teams,
                &settings.agents,
            ),
        };

        if !mentions.is_empty() {
            if conv.can_fan_out() {
                self.conversations
                    .enqueue_mentions(&mut conv, agent_id, &mentions, strict_mode)?;
            } else {
                tracing::warn!(
                    "Conversation {} reached max messages ({}); dropping {} mention(s)",
                    conv.id,
                    conv.max_messages,
                    mentions.len()
                );
            }
        }

        let done = conv.complete_branch();
        if done {
            self.conversations.complete(&mut conv)?;
            if pipeline.is_some() {
                self.events.publish(EventKind::PipelineComplete {
                    team_id: team_id.to_string(),
                    conversation_id: conv_id.clone(),
                });
            }
        }
        drop(conv);
        if done {
            self.conversations.remove(&conv_id);
        }

        self.store.complete_message(msg.id)?;
        Ok(())
    }

    /// Periodic maintenance: stale recovery, conversation sweeps, pruning.
    async fn maintenance_loop(self: Arc<Self>) {
        let mut stale = tokio::time::interval(STALE_RECOVERY_INTERVAL);
        let mut sweep = tokio::time::interval(CONVERSATION_SWEEP_INTERVAL);
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        // Swallow the immediate first ticks; boot already recovered.
        stale.tick().await;
        sweep.tick().await;
        prune.tick().await;

        loop {
            let limits = self.config.snapshot().limits.clone();
            tokio::select! {
                _ = stale.tick() => {
                    match self.store.recover_stale_messages(limits.stale_threshold_ms) {
                        Ok(0) => {}
                        Ok(n) => {
                            tracing::info!("Stale recovery requeued {} message(s)", n);
                            self.wake();
                        }
                        Err(e) => tracing::error!("Stale recovery failed: {}", e),
                    }
                }
                _ = sweep.tick() => {
                    match self.conversations.sweep_expired(limits.conversation_timeout_ms).await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!("Swept {} timed-out conversation(s)", n),
                        Err(e) => tracing::error!("Conversation sweep failed: {}", e),
                    }
                }
                _ = prune.tick() => {
                    if let Err(e) = self.store.prune_completed_messages(limits.prune_age_ms) {
                        tracing::error!("Message prune failed: {}", e);
                    }
                    if let Err(e) = self.store.prune_acked_responses(limits.prune_age_ms) {
                        tracing::error!("Response prune failed: {}", e);
                    }
                }
            }
        }
    }
}
