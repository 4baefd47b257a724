//! Configuration loading for agentmux.
//!
//! A single `settings.json` document holds agents, teams, pipelines, the
//! workspace path, API settings, and tuning limits. `ConfigProvider` serves
//! cached immutable snapshots with a short TTL so hot edits are picked up
//! without restarting the daemon.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Get the agentmux home directory (~/.agentmux, or $AGENTMUX_HOME).
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(raw) = std::env::var("AGENTMUX_HOME") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".agentmux"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Workspace configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Workspace {
    pub path: Option<PathBuf>,
    pub name: Option<String>,
}

/// Agent configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AgentConfig {
    pub name: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub working_directory: Option<PathBuf>,
    pub system_prompt: Option<String>,
    pub prompt_file: Option<PathBuf>,
    pub reasoning_effort: Option<String>,
}

/// Pipeline configuration within a team.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct PipelineConfig {
    /// Ordered agent ids; must be a subset of the team members.
    pub sequence: Vec<String>,
    /// When true, agent mentions are ignored and the sequence is enforced.
    #[serde(default)]
    pub strict: bool,
    /// Loop-back budget for non-strict pipelines. 0 disables loop-backs.
    #[serde(default)]
    pub max_loops: u32,
}

/// Team configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TeamConfig {
    pub name: String,
    pub agents: Vec<String>,
    pub leader_agent: Option<String>,
    pub pipeline: Option<PipelineConfig>,
}

impl TeamConfig {
    /// Leader id, falling back to the first member.
    pub fn leader(&self) -> Option<&str> {
        self.leader_agent
            .as_deref()
            .or_else(|| self.agents.first().map(|s| s.as_str()))
    }
}

/// Legacy single-model section, used to synthesize a default agent when no
/// agents are configured.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Models {
    #[serde(default)]
    pub provider: String,
    pub model: Option<String>,
    pub ollama_base_url: Option<String>,
}

/// Routing configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Routing {
    pub default_agent: Option<String>,
}

/// Control API configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer-token check; "off" disables it.
    #[serde(default = "default_api_auth")]
    pub auth: String,
    /// Auto-generated on first start when auth is on.
    pub key: Option<String>,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    3777
}

fn default_api_auth() -> String {
    "on".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            auth: default_api_auth(),
            key: None,
        }
    }
}

impl ApiConfig {
    /// Whether requests must carry the bearer key.
    ///
    /// `AGENTMUX_API_AUTH=off` overrides the settings document.
    pub fn auth_enabled(&self) -> bool {
        if let Ok(v) = std::env::var("AGENTMUX_API_AUTH") {
            if v.trim().eq_ignore_ascii_case("off") {
                return false;
            }
        }
        !self.auth.eq_ignore_ascii_case("off")
    }
}

/// Tuning limits. All have working defaults; present in settings.json only
/// when overridden.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Limits {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: i64,
    #[serde(default = "default_conversation_timeout_ms")]
    pub conversation_timeout_ms: i64,
    #[serde(default = "default_max_messages")]
    pub max_messages: u32,
    #[serde(default = "default_long_response_threshold")]
    pub long_response_threshold: usize,
    #[serde(default = "default_prune_age_ms")]
    pub prune_age_ms: i64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_stale_threshold_ms() -> i64 {
    10 * 60 * 1000
}

fn default_conversation_timeout_ms() -> i64 {
    30 * 60 * 1000
}

fn default_max_messages() -> u32 {
    50
}

fn default_long_response_threshold() -> usize {
    4000
}

fn default_prune_age_ms() -> i64 {
    24 * 60 * 60 * 1000
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            stale_threshold_ms: default_stale_threshold_ms(),
            conversation_timeout_ms: default_conversation_timeout_ms(),
            max_messages: default_max_messages(),
            long_response_threshold: default_long_response_threshold(),
            prune_age_ms: default_prune_age_ms(),
        }
    }
}

/// agentmux settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub workspace: Workspace,

    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,

    #[serde(default)]
    pub teams: HashMap<String, TeamConfig>,

    #[serde(default)]
    pub models: Models,

    #[serde(default)]
    pub routing: Routing,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub limits: Limits,
}

impl Settings {
    /// Workspace root, defaulting to `<home>/workspace`.
    pub fn workspace_root(&self, home: &Path) -> PathBuf {
        self.workspace
            .path
            .clone()
            .unwrap_or_else(|| home.join("workspace"))
    }

    /// Working directory for an agent: its configured directory, else
    /// `<workspace>/<agent_id>`.
    pub fn agent_working_dir(&self, agent_id: &str, home: &Path) -> PathBuf {
        self.agents
            .get(agent_id)
            .and_then(|a| a.working_directory.clone())
            .unwrap_or_else(|| self.workspace_root(home).join(agent_id))
    }
}

/// Synthesize a default agent from the legacy models section when no agents
/// are configured, so a bare install still answers messages.
fn ensure_default_agent(settings: &mut Settings) {
    if !settings.agents.is_empty() {
        return;
    }
    let provider = if settings.models.provider.is_empty() {
        "claude".to_string()
    } else {
        settings.models.provider.clone()
    };
    settings.agents.insert(
        "default".to_string(),
        AgentConfig {
            name: Some("Default".to_string()),
            provider: Some(provider),
            model: settings.models.model.clone(),
            working_directory: None,
            system_prompt: None,
            prompt_file: None,
            reasoning_effort: None,
        },
    );
    tracing::debug!("No agents configured; synthesized implicit default agent");
}

/// Best-effort repair of a corrupted settings document: drop everything after
/// the last closing brace, then strip trailing commas before `}` / `]`.
fn repair_settings_text(raw: &str) -> String {
    let mut text = match raw.rfind('}') {
        Some(idx) => raw[..=idx].to_string(),
        None => raw.to_string(),
    };
    let re = regex::Regex::new(r",\s*([}\]])").expect("static regex");
    text = re.replace_all(&text, "$1").to_string();
    text
}

/// Load and validate the settings document at `path`.
///
/// A parse failure triggers one repair attempt; the broken file is snapshot
/// as `.bak` first. A second failure degrades to an empty document rather
/// than taking the daemon down.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        let mut settings = Settings::default();
        ensure_default_agent(&mut settings);
        return Ok(settings);
    }

    let content = std::fs::read_to_string(path)?;
    let mut settings = match serde_json::from_str::<Settings>(&content) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Settings parse failed ({}), attempting repair", e);
            let bak = path.with_extension("json.bak");
            if let Err(e) = std::fs::write(&bak, &content) {
                tracing::warn!("Could not snapshot broken settings: {}", e);
            }
            let repaired = repair_settings_text(&content);
            match serde_json::from_str::<Settings>(&repaired) {
                Ok(s) => {
                    tracing::info!("Settings repaired; snapshot saved as {}", bak.display());
                    s
                }
                Err(e) => {
                    tracing::error!("Settings repair failed ({}), using empty config", e);
                    Settings::default()
                }
            }
        }
    };

    ensure_default_agent(&mut settings);
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if let Some(default_agent) = settings.routing.default_agent.as_deref() {
        if !settings.agents.contains_key(default_agent) {
            return Err(Error::Config(format!(
                "routing.default_agent '{}' not found in agents",
                default_agent
            )));
        }
    }
    for (team_id, team) in &settings.teams {
        if let Some(pipeline) = &team.pipeline {
            for agent_id in &pipeline.sequence {
                if !team.agents.contains(agent_id) {
                    return Err(Error::Config(format!(
                        "team '{}' pipeline references non-member '{}'",
                        team_id, agent_id
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Persist settings back to disk.
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

/// Cache TTL for config snapshots.
const SNAPSHOT_TTL: Duration = Duration::from_secs(5);

/// Live configuration source with a short TTL cache.
///
/// Snapshots are immutable `Arc<Settings>`; consumers never see a document
/// mutate underneath them.
pub struct ConfigProvider {
    path: PathBuf,
    home: PathBuf,
    cached: Mutex<Option<(Instant, Arc<Settings>)>>,
}

impl ConfigProvider {
    pub fn new(home: PathBuf) -> Self {
        Self {
            path: home.join("settings.json"),
            home,
            cached: Mutex::new(None),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn settings_path(&self) -> &Path {
        &self.path
    }

    /// Current settings snapshot, reloading when the cache is stale.
    pub fn snapshot(&self) -> Arc<Settings> {
        let mut cached = self.cached.lock().expect("config cache poisoned");
        if let Some((loaded_at, snapshot)) = cached.as_ref() {
            if loaded_at.elapsed() < SNAPSHOT_TTL {
                return snapshot.clone();
            }
        }
        let settings = Arc::new(load_settings_from(&self.path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load settings: {}, using defaults", e);
            let mut s = Settings::default();
            ensure_default_agent(&mut s);
            s
        }));
        *cached = Some((Instant::now(), settings.clone()));
        settings
    }

    /// Drop the cached snapshot so the next read hits disk.
    pub fn invalidate(&self) {
        *self.cached.lock().expect("config cache poisoned") = None;
    }

    /// Mutate the settings document on disk and invalidate the cache.
    pub fn update<F>(&self, mutate: F) -> Result<Arc<Settings>>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = load_settings_from(&self.path)?;
        mutate(&mut settings);
        validate_settings(&settings)?;
        save_settings_to(&self.path, &settings)?;
        self.invalidate();
        Ok(self.snapshot())
    }

    /// Ensure an API key exists when auth is on, persisting a generated one.
    pub fn ensure_api_key(&self) -> Result<Option<String>> {
        let snapshot = self.snapshot();
        if !snapshot.api.auth_enabled() {
            return Ok(None);
        }
        if let Some(key) = snapshot.api.key.clone() {
            return Ok(Some(key));
        }
        let key = ulid::Ulid::new().to_string().to_lowercase();
        let generated = key.clone();
        self.update(|s| s.api.key = Some(key))?;
        tracing::info!("Generated control API key");
        Ok(Some(generated))
    }
}
