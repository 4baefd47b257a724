//! End-to-end dispatch flows against a scripted mock invoker.
//!
//! Each test builds a throwaway home directory, wires the real queue store,
//! conversation manager, and dispatcher together, and drives them through
//! the control-plane seams only: enqueue a message, wait for response rows.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agentmux::config::{ConfigProvider, Settings};
use agentmux::core::conversation::LONG_RESPONSE_NOTE;
use agentmux::core::events::EventKind;
use agentmux::core::{
    ConversationManager, Dispatcher, EventBus, Invoker, MessageData, QueueStore,
};
use agentmux::error::{Error, Result};

/// One recorded invocation.
#[derive(Debug, Clone)]
struct Call {
    agent: String,
    prompt: String,
    reset: bool,
    started: Instant,
    finished: Instant,
}

/// Scripted invoker: pops canned responses per agent, records every call.
struct MockInvoker {
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    calls: Mutex<Vec<Call>>,
    delay: Duration,
    fail: bool,
}

impl MockInvoker {
    fn new(scripts: &[(&str, &[&str])]) -> Arc<Self> {
        let map = scripts
            .iter()
            .map(|(agent, responses)| {
                (
                    agent.to_string(),
                    responses.iter().map(|r| r.to_string()).collect(),
                )
            })
            .collect();
        Arc::new(Self {
            scripts: Mutex::new(map),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail: false,
        })
    }

    fn with_delay(scripts: &[(&str, &[&str])], delay: Duration) -> Arc<Self> {
        let mock = Self::new(scripts);
        let inner = Arc::try_unwrap(mock).ok().unwrap();
        Arc::new(Self { delay, ..inner })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
            fail: true,
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, agent: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| c.agent == agent)
            .collect()
    }
}

#[async_trait]
impl Invoker for MockInvoker {
    async fn invoke(
        &self,
        agent_id: &str,
        prompt: &str,
        reset: bool,
        _settings: &Settings,
    ) -> Result<String> {
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(Error::Provider("mock provider exploded".to_string()));
        }
        let response = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(agent_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| format!("ok from {}", agent_id));
        self.calls.lock().unwrap().push(Call {
            agent: agent_id.to_string(),
            prompt: prompt.to_string(),
            reset,
            started,
            finished: Instant::now(),
        });
        Ok(response)
    }
}

struct Harness {
    home: tempfile::TempDir,
    store: QueueStore,
    events: EventBus,
}

impl Harness {
    /// Write settings, wire the components, and spawn the dispatcher.
    async fn start(settings_json: &str, invoker: Arc<dyn Invoker>) -> Self {
        let home = tempfile::tempdir().unwrap();
        std::fs::write(home.path().join("settings.json"), settings_json).unwrap();

        let config = Arc::new(ConfigProvider::new(home.path().to_path_buf()));
        let limits = config.snapshot().limits.clone();
        let events = EventBus::default();
        let store = QueueStore::open_with_retries(
            &home.path().join("queue.db"),
            events.clone(),
            limits.max_retries,
        )
        .unwrap();
        let conversations = Arc::new(ConversationManager::new(
            store.clone(),
            events.clone(),
            home.path().join("files"),
            limits,
        ));
        let dispatcher = Dispatcher::new(
            store.clone(),
            config,
            conversations,
            invoker,
            events.clone(),
        );
        tokio::spawn(dispatcher.run());
        // Let the dispatcher subscribe before the first enqueue.
        tokio::time::sleep(Duration::from_millis(30)).await;

        Self {
            home,
            store,
            events,
        }
    }

    fn enqueue(&self, channel: &str, content: &str, agent: Option<&str>) -> String {
        let mut data = MessageData::new(channel, "alice", content);
        data.agent = agent.map(|a| a.to_string());
        let id = data.message_id.clone();
        self.store.enqueue_message(data).unwrap();
        id
    }

    /// Poll until `channel` has at least `count` pending responses.
    async fn wait_for_responses(
        &self,
        channel: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<agentmux::core::StoredResponse> {
        let deadline = Instant::now() + timeout;
        loop {
            let responses = self.store.pending_responses(channel).unwrap();
            if responses.len() >= count {
                return responses;
            }
            if Instant::now() > deadline {
                panic!(
                    "timed out waiting for {} response(s) on {}, have {}",
                    count,
                    channel,
                    responses.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

const SINGLE_AGENT_SETTINGS: &str = r#"{
    "agents": { "coder": { "name": "Coder" } }
}"#;

const TEAM_SETTINGS_STRICT: &str = r#"{
    "agents": { "po": {}, "coder": {}, "reviewer": {} },
    "teams": {
        "dev": {
            "name": "Dev",
            "agents": ["po", "coder", "reviewer"],
            "leader_agent": "reviewer",
            "pipeline": { "sequence": ["po", "coder", "reviewer"], "strict": true }
        }
    }
}"#;

const TEAM_SETTINGS_LOOPING: &str = r#"{
    "agents": { "po": {}, "coder": {}, "reviewer": {} },
    "teams": {
        "dev": {
            "name": "Dev",
            "agents": ["po", "coder", "reviewer"],
            "leader_agent": "po",
            "pipeline": { "sequence": ["po", "coder", "reviewer"], "strict": false, "max_loops": 2 }
        }
    }
}"#;

#[tokio::test]
async fn single_agent_reply() {
    let mock = MockInvoker::new(&[("coder", &["done"])]);
    let harness = Harness::start(SINGLE_AGENT_SETTINGS, mock.clone()).await;

    let message_id = harness.enqueue("cli", "@coder fix bug", None);
    let responses = harness
        .wait_for_responses("cli", 1, Duration::from_secs(5))
        .await;

    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].content, "done");
    assert_eq!(responses[0].message_id, message_id);
    assert_eq!(responses[0].agent.as_deref(), Some("coder"));

    // Exactly one invocation, routed body only.
    let calls = mock.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].agent, "coder");
    assert_eq!(calls[0].prompt, "fix bug");

    // Message row ended completed; no conversation was created.
    let status = harness.store.queue_status().unwrap();
    assert_eq!(status.completed, 1);
    assert_eq!(status.pending, 0);
    assert_eq!(status.processing, 0);
}

#[tokio::test]
async fn strict_pipeline_runs_in_sequence() {
    let mock = MockInvoker::new(&[
        ("po", &["story"]),
        ("coder", &["impl"]),
        ("reviewer", &["approved"]),
    ]);
    let harness = Harness::start(TEAM_SETTINGS_STRICT, mock.clone()).await;

    harness.enqueue("web", "@dev build feature X", None);
    let responses = harness
        .wait_for_responses("web", 1, Duration::from_secs(5))
        .await;

    // (a) Three invocations in sequence order, despite reviewer being leader.
    let calls = mock.calls();
    let order: Vec<&str> = calls.iter().map(|c| c.agent.as_str()).collect();
    assert_eq!(order, vec!["po", "coder", "reviewer"]);

    // (b) The handoff prompt carries the original request and the upstream
    // output under the pipeline markers.
    let coder_prompt = &calls[1].prompt;
    assert!(coder_prompt.contains("[Original request]:"));
    assert!(coder_prompt.contains("build feature X"));
    assert!(coder_prompt.contains("[Output from @po]:"));
    assert!(coder_prompt.contains("story"));
    let reviewer_prompt = &calls[2].prompt;
    assert!(reviewer_prompt.contains("[Output from @coder]:"));
    assert!(reviewer_prompt.contains("impl"));

    // (c) One aggregated response with @id sections and separators.
    let body = &responses[0].content;
    assert!(body.contains("@po: story"));
    assert!(body.contains("@coder: impl"));
    assert!(body.contains("@reviewer: approved"));
    assert!(body.contains("------"));
}

#[tokio::test]
async fn non_strict_pipeline_loops_within_budget() {
    let mock = MockInvoker::new(&[
        ("po", &["[@coder: implement]"]),
        ("coder", &["[@reviewer: review PR]", "[@reviewer: fixed]"]),
        ("reviewer", &["[@coder: needs tests]", "approved"]),
    ]);
    let harness = Harness::start(TEAM_SETTINGS_LOOPING, mock.clone()).await;
    let mut event_rx = harness.events.subscribe();

    harness.enqueue("web", "@dev build feature X", None);
    let responses = harness
        .wait_for_responses("web", 1, Duration::from_secs(5))
        .await;

    // Five steps total: po, coder, reviewer, coder (loop-back), reviewer.
    assert_eq!(mock.calls().len(), 5);
    assert_eq!(mock.calls_for("po").len(), 1);
    assert_eq!(mock.calls_for("coder").len(), 2);
    assert_eq!(mock.calls_for("reviewer").len(), 2);

    // All five steps show up in the aggregate.
    let body = &responses[0].content;
    assert_eq!(body.matches("@po:").count(), 1);
    assert_eq!(body.matches("@coder:").count(), 2);
    assert_eq!(body.matches("@reviewer:").count(), 2);

    // Exactly one loop-back was spent.
    let mut saw_loop = false;
    while let Ok(event) = event_rx.try_recv() {
        if let EventKind::PipelineLoop {
            loop_count,
            max_loops,
            ..
        } = event.kind
        {
            assert_eq!(loop_count, 1);
            assert_eq!(max_loops, 2);
            saw_loop = true;
        }
    }
    assert!(saw_loop, "expected a pipeline_loop event");
}

#[tokio::test]
async fn pipeline_blocks_sequence_skipping() {
    let mock = MockInvoker::new(&[("po", &["Let's skip ahead. [@reviewer: skip coder]"])]);
    let harness = Harness::start(TEAM_SETTINGS_LOOPING, mock.clone()).await;

    harness.enqueue("web", "@dev do the thing", None);
    let responses = harness
        .wait_for_responses("web", 1, Duration::from_secs(5))
        .await;

    // The forward-skipping mention was filtered; only po ever ran.
    assert_eq!(mock.calls().len(), 1);
    assert!(mock.calls_for("reviewer").is_empty());
    assert_eq!(responses[0].content, "Let's skip ahead.");
}

#[tokio::test]
async fn invoker_failure_becomes_apology() {
    let mock = MockInvoker::failing();
    let harness = Harness::start(SINGLE_AGENT_SETTINGS, mock).await;

    harness.enqueue("cli", "@coder fix bug", None);
    let responses = harness
        .wait_for_responses("cli", 1, Duration::from_secs(5))
        .await;

    assert_eq!(responses[0].content, agentmux::core::FALLBACK_APOLOGY);
    // The message completed rather than retrying.
    let status = harness.store.queue_status().unwrap();
    assert_eq!(status.completed, 1);
    assert_eq!(status.dead, 0);
}

#[tokio::test]
async fn long_response_is_spilled_to_file() {
    let long_text = "x".repeat(5000);
    let scripts: &[(&str, &[&str])] = &[("coder", &[long_text.as_str()])];
    let mock = MockInvoker::new(scripts);
    let harness = Harness::start(SINGLE_AGENT_SETTINGS, mock).await;

    harness.enqueue("cli", "@coder write a novel", None);
    let responses = harness
        .wait_for_responses("cli", 1, Duration::from_secs(5))
        .await;

    let body = &responses[0].content;
    assert_eq!(
        body.chars().count(),
        4000 + LONG_RESPONSE_NOTE.chars().count()
    );
    assert!(body.ends_with(LONG_RESPONSE_NOTE));

    let files = responses[0].files.clone().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read_to_string(&files[0]).unwrap(), long_text);
}

#[tokio::test]
async fn reset_flag_forces_fresh_session() {
    let mock = MockInvoker::new(&[("coder", &["fresh", "continued"])]);
    let harness = Harness::start(SINGLE_AGENT_SETTINGS, mock.clone()).await;

    let flag_dir = harness.home.path().join("workspace").join("coder");
    std::fs::create_dir_all(&flag_dir).unwrap();
    let flag = flag_dir.join("reset_flag");
    std::fs::write(&flag, "").unwrap();

    harness.enqueue("cli", "@coder hello", None);
    harness
        .wait_for_responses("cli", 1, Duration::from_secs(5))
        .await;
    assert!(mock.calls()[0].reset);
    assert!(!flag.exists(), "reset flag should be consumed");

    harness.enqueue("cli", "@coder hello again", None);
    harness
        .wait_for_responses("cli", 2, Duration::from_secs(5))
        .await;
    assert!(!mock.calls()[1].reset);
}

#[tokio::test]
async fn fifo_per_agent_parallel_across_agents() {
    const PER_AGENT: usize = 4;
    let delay = Duration::from_millis(25);
    let mock = MockInvoker::with_delay(&[], delay);
    let settings = r#"{
        "agents": { "alpha": {}, "beta": {} }
    }"#;
    let harness = Harness::start(settings, mock.clone()).await;

    let started = Instant::now();
    for i in 0..PER_AGENT {
        harness.enqueue("a-chan", &format!("message {}", i), Some("alpha"));
        harness.enqueue("b-chan", &format!("message {}", i), Some("beta"));
    }
    harness
        .wait_for_responses("a-chan", PER_AGENT, Duration::from_secs(10))
        .await;
    harness
        .wait_for_responses("b-chan", PER_AGENT, Duration::from_secs(10))
        .await;
    let elapsed = started.elapsed();

    // FIFO within each agent: prompts arrive in enqueue order.
    for agent in ["alpha", "beta"] {
        let prompts: Vec<String> = mock
            .calls_for(agent)
            .iter()
            .map(|c| c.prompt.clone())
            .collect();
        let expected: Vec<String> = (0..PER_AGENT).map(|i| format!("message {}", i)).collect();
        assert_eq!(prompts, expected, "agent {} ran out of order", agent);
    }

    // Chains overlapped: some alpha call ran while beta was still working.
    let alpha = mock.calls_for("alpha");
    let beta = mock.calls_for("beta");
    let alpha_first = alpha.iter().map(|c| c.started).min().unwrap();
    let alpha_last = alpha.iter().map(|c| c.finished).max().unwrap();
    let beta_first = beta.iter().map(|c| c.started).min().unwrap();
    let beta_last = beta.iter().map(|c| c.finished).max().unwrap();
    assert!(
        alpha_first < beta_last && beta_first < alpha_last,
        "chains did not overlap"
    );

    // And well under the fully-serialized wall time.
    let serial = delay * (PER_AGENT as u32 * 2);
    assert!(
        elapsed < serial,
        "expected parallel chains, took {:?} (serial would be {:?})",
        elapsed,
        serial
    );
}

#[tokio::test]
async fn unroutable_message_falls_back_to_first_agent() {
    let mock = MockInvoker::new(&[("coder", &["caught it"])]);
    let harness = Harness::start(SINGLE_AGENT_SETTINGS, mock.clone()).await;

    // No @token, no configured "default" agent: first available agent wins.
    harness.enqueue("cli", "plain message with no routing", None);
    let responses = harness
        .wait_for_responses("cli", 1, Duration::from_secs(5))
        .await;

    assert_eq!(responses[0].content, "caught it");
    let calls = mock.calls();
    assert_eq!(calls[0].agent, "coder");
    // The raw body is preserved for the fallback agent.
    assert_eq!(calls[0].prompt, "plain message with no routing");
}
