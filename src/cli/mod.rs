//! CLI commands for agentmux using clap.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::config::{self, AgentConfig, ConfigProvider, TeamConfig};
use crate::core::{
    ConversationManager, Dispatcher, EventBus, MessageData, ProviderInvoker, QueueStore,
};
use crate::web::{run_web_server, AppState};

/// agentmux - multi-agent message routing and orchestration core.
#[derive(Parser)]
#[command(name = "agentmux")]
#[command(version = "0.1.0")]
#[command(about = "Multi-agent message routing and orchestration core", long_about = None)]
pub struct Commands {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the daemon (dispatcher + control API)
    Start,

    /// Show queue status
    Status,

    /// Enqueue a message
    Send {
        /// Message text; may start with @agent or @team
        message: String,

        /// Target agent, overriding body routing
        #[arg(long)]
        agent: Option<String>,
    },

    /// Queue operations
    Queue {
        #[command(subcommand)]
        action: QueueCommand,
    },

    /// Manage agents
    #[command(subcommand, alias = "a")]
    Agent(AgentCommand),

    /// Manage teams
    #[command(subcommand, alias = "t")]
    Team(TeamCommand),
}

#[derive(Subcommand)]
pub enum QueueCommand {
    /// Show queue counts
    Stats,

    /// List dead-lettered messages
    Dead,

    /// Requeue a dead message
    Retry {
        /// Internal row id
        id: i64,
    },
}

#[derive(Subcommand)]
pub enum AgentCommand {
    /// List agents
    List,

    /// Add an agent
    Add {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },

    /// Remove an agent
    Remove { id: String },
}

#[derive(Subcommand)]
pub enum TeamCommand {
    /// List teams
    List,

    /// Add a team
    Add {
        id: String,
        /// Comma-separated member agent ids
        #[arg(long)]
        agents: String,
        #[arg(long)]
        leader: Option<String>,
    },

    /// Remove a team
    Remove { id: String },
}

fn open_store() -> Result<QueueStore> {
    let home = config::get_home_dir()?;
    let provider = ConfigProvider::new(home.clone());
    let limits = provider.snapshot().limits.clone();
    Ok(QueueStore::open_with_retries(
        &home.join("queue.db"),
        EventBus::default(),
        limits.max_retries,
    )?)
}

impl Commands {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Start => run_daemon().await,
            Command::Status => {
                let store = open_store()?;
                let status = store.queue_status()?;
                println!("Queue status:");
                println!("  Pending:            {}", status.pending);
                println!("  Processing:         {}", status.processing);
                println!("  Completed:          {}", status.completed);
                println!("  Dead:               {}", status.dead);
                println!("  Responses pending:  {}", status.responses_pending);
                Ok(())
            }
            Command::Send { message, agent } => {
                let store = open_store()?;
                let mut data = MessageData::new("cli", "cli", &message);
                data.agent = agent;
                let external_id = data.message_id.clone();
                store.enqueue_message(data)?;
                println!("Enqueued message {}", external_id);
                Ok(())
            }
            Command::Queue { action } => run_queue_command(action),
            Command::Agent(action) => run_agent_command(action),
            Command::Team(action) => run_team_command(action),
        }
    }
}

fn run_queue_command(action: QueueCommand) -> Result<()> {
    let store = open_store()?;
    match action {
        QueueCommand::Stats => {
            let status = store.queue_status()?;
            println!(
                "pending={} processing={} completed={} dead={} responses_pending={}",
                status.pending,
                status.processing,
                status.completed,
                status.dead,
                status.responses_pending
            );
        }
        QueueCommand::Dead => {
            let dead = store.dead_messages()?;
            if dead.is_empty() {
                println!("No dead messages");
            }
            for msg in dead {
                println!(
                    "#{} [{}] @{} {} ({})",
                    msg.id,
                    msg.message_id,
                    msg.agent.as_deref().unwrap_or("default"),
                    msg.content.chars().take(60).collect::<String>(),
                    msg.last_error.as_deref().unwrap_or("no error recorded"),
                );
            }
        }
        QueueCommand::Retry { id } => {
            store.retry_message(id)?;
            println!("Message {} requeued", id);
        }
    }
    Ok(())
}

fn run_agent_command(action: AgentCommand) -> Result<()> {
    let provider = ConfigProvider::new(config::get_home_dir()?);
    match action {
        AgentCommand::List => {
            let settings = provider.snapshot();
            let mut ids: Vec<&String> = settings.agents.keys().collect();
            ids.sort();
            for id in ids {
                let agent = &settings.agents[id];
                println!(
                    "{} ({} / {})",
                    id,
                    agent.provider.as_deref().unwrap_or("claude"),
                    agent.model.as_deref().unwrap_or("default"),
                );
            }
        }
        AgentCommand::Add {
            id,
            name,
            provider: provider_name,
            model,
        } => {
            let id = id.trim().to_lowercase();
            provider.update(|s| {
                s.agents.insert(
                    id.clone(),
                    AgentConfig {
                        name,
                        provider: provider_name,
                        model,
                        ..Default::default()
                    },
                );
            })?;
            println!("Agent {} added", id);
        }
        AgentCommand::Remove { id } => {
            provider.update(|s| {
                s.agents.remove(&id);
                for team in s.teams.values_mut() {
                    team.agents.retain(|a| a != &id);
                    if team.leader_agent.as_deref() == Some(id.as_str()) {
                        team.leader_agent = team.agents.first().cloned();
                    }
                    if let Some(pipeline) = team.pipeline.as_mut() {
                        pipeline.sequence.retain(|a| a != &id);
                    }
                }
                if s.routing.default_agent.as_deref() == Some(id.as_str()) {
                    s.routing.default_agent = None;
                }
            })?;
            println!("Agent {} removed", id);
        }
    }
    Ok(())
}

fn run_team_command(action: TeamCommand) -> Result<()> {
    let provider = ConfigProvider::new(config::get_home_dir()?);
    match action {
        TeamCommand::List => {
            let settings = provider.snapshot();
            let mut ids: Vec<&String> = settings.teams.keys().collect();
            ids.sort();
            for id in ids {
                let team = &settings.teams[id];
                println!(
                    "{}: [{}] leader={}",
                    id,
                    team.agents.join(", "),
                    team.leader().unwrap_or("-"),
                );
            }
        }
        TeamCommand::Add { id, agents, leader } => {
            let id = id.trim().to_lowercase();
            let members: Vec<String> = agents
                .split(',')
                .map(|a| a.trim().to_string())
                .filter(|a| !a.is_empty())
                .collect();
            if members.is_empty() {
                anyhow::bail!("team needs at least one agent");
            }
            let leader = leader.or_else(|| members.first().cloned());
            provider.update(|s| {
                s.teams.insert(
                    id.clone(),
                    TeamConfig {
                        name: id.clone(),
                        agents: members,
                        leader_agent: leader,
                        pipeline: None,
                    },
                );
            })?;
            println!("Team {} added", id);
        }
        TeamCommand::Remove { id } => {
            provider.update(|s| {
                s.teams.remove(&id);
            })?;
            println!("Team {} removed", id);
        }
    }
    Ok(())
}

/// Bring up the full daemon: queue store, conversation manager, dispatcher,
/// and control API, all sharing one event bus.
pub async fn run_daemon() -> Result<()> {
    let home = config::get_home_dir()?;
    std::fs::create_dir_all(&home)?;

    let provider = Arc::new(ConfigProvider::new(home.clone()));
    let limits = provider.snapshot().limits.clone();
    let events = EventBus::default();

    let store = QueueStore::open_with_retries(
        &home.join("queue.db"),
        events.clone(),
        limits.max_retries,
    )?;
    let conversations = Arc::new(ConversationManager::new(
        store.clone(),
        events.clone(),
        home.join("files"),
        limits,
    ));
    let invoker = Arc::new(ProviderInvoker::new(home.clone()));
    let dispatcher = Dispatcher::new(
        store.clone(),
        provider.clone(),
        conversations.clone(),
        invoker,
        events.clone(),
    );

    let state = AppState {
        store,
        config: provider,
        events,
        conversations,
        log_dir: crate::logging::get_log_dir()?,
    };

    tracing::info!("agentmux daemon starting from {}", home.display());

    tokio::select! {
        _ = dispatcher.run() => Ok(()),
        result = run_web_server(state) => Ok(result?),
    }
}
