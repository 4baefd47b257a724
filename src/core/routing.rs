//! Message routing.
//!
//! Pure functions over configuration snapshots:
//! - top-level routing (`@agent` / `@team` prefix, optional `[channel/sender]:`
//!   context prefix)
//! - teammate mention tags inside agent responses (`[@mate: text]`)
//! - pipeline sequencing (next step, loop-back budget, mention filtering)

use regex::Regex;
use std::collections::HashMap;

use crate::config::{AgentConfig, PipelineConfig, TeamConfig};

/// Fallback agent tag when no target resolves.
pub const DEFAULT_AGENT: &str = "default";

/// Separator between shared context and the directed part of a mention.
pub const DIRECTED_SEPARATOR: &str = "\n\n------\n\nDirected to you:\n";

/// Outcome of parsing a top-level message.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingDecision {
    /// Resolved agent id; the team leader when a team was addressed.
    pub agent_id: String,
    /// Message body the agent should see.
    pub message: String,
    /// True when the token named a team.
    pub is_team: bool,
    /// The team that was explicitly addressed, if any.
    pub team_id: Option<String>,
}

fn routing_regex() -> Regex {
    // Optional "[channel/sender]:" prefix, "@token", optional body.
    Regex::new(r"^\s*(?:\[([^\]]+)\]\s*:\s*)?@([A-Za-z0-9_\-]+)[ \t]*([\s\S]*)$")
        .expect("static regex")
}

/// Parse agent/team routing from a message prefix.
///
/// Resolution order for the token (case-insensitive): exact agent id, exact
/// team id, agent display name, team display name. A team resolves to its
/// leader with `is_team` set. No match falls back to [`DEFAULT_AGENT`] with
/// the raw input unchanged.
pub fn parse_agent_routing(
    raw: &str,
    agents: &HashMap<String, AgentConfig>,
    teams: &HashMap<String, TeamConfig>,
) -> RoutingDecision {
    let fallback = RoutingDecision {
        agent_id: DEFAULT_AGENT.to_string(),
        message: raw.to_string(),
        is_team: false,
        team_id: None,
    };

    let Some(caps) = routing_regex().captures(raw) else {
        return fallback;
    };

    let prefix = caps.get(1).map(|m| m.as_str().trim().to_string());
    let token = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_lowercase();
    let body = caps.get(3).map(|m| m.as_str().trim()).unwrap_or("");

    let resolved = resolve_token(&token, agents, teams);
    let Some(target) = resolved else {
        return fallback;
    };

    // The channel prefix is kept as context but never affects routing. An
    // empty body without a prefix keeps the raw input so the agent still
    // sees what was said.
    let message = match (&prefix, body.is_empty()) {
        (Some(p), _) => format!("[{}]: {}", p, body),
        (None, true) => raw.to_string(),
        (None, false) => body.to_string(),
    };

    match target {
        ResolvedTarget::Agent(agent_id) => RoutingDecision {
            agent_id,
            message,
            is_team: false,
            team_id: None,
        },
        ResolvedTarget::Team(team_id) => {
            let leader = teams
                .get(&team_id)
                .and_then(|t| t.leader().map(|l| l.to_string()))
                .unwrap_or_else(|| DEFAULT_AGENT.to_string());
            RoutingDecision {
                agent_id: leader,
                message,
                is_team: true,
                team_id: Some(team_id),
            }
        }
    }
}

enum ResolvedTarget {
    Agent(String),
    Team(String),
}

fn resolve_token(
    token: &str,
    agents: &HashMap<String, AgentConfig>,
    teams: &HashMap<String, TeamConfig>,
) -> Option<ResolvedTarget> {
    // Exact agent id.
    for id in agents.keys() {
        if id.to_lowercase() == token {
            return Some(ResolvedTarget::Agent(id.clone()));
        }
    }
    // Exact team id.
    for id in teams.keys() {
        if id.to_lowercase() == token {
            return Some(ResolvedTarget::Team(id.clone()));
        }
    }
    // Agent display name.
    let mut agent_ids: Vec<&String> = agents.keys().collect();
    agent_ids.sort();
    for id in agent_ids {
        if let Some(name) = agents[id].name.as_deref() {
            if name.to_lowercase() == token {
                return Some(ResolvedTarget::Agent(id.clone()));
            }
        }
    }
    // Team display name.
    let mut team_ids: Vec<&String> = teams.keys().collect();
    team_ids.sort();
    for id in team_ids {
        if teams[id].name.to_lowercase() == token {
            return Some(ResolvedTarget::Team(id.clone()));
        }
    }
    None
}

/// Find the first team containing an agent. Teams are scanned in sorted-id
/// order so the answer is stable across snapshots.
pub fn find_team_for_agent(
    agent_id: &str,
    teams: &HashMap<String, TeamConfig>,
) -> Option<(String, TeamConfig)> {
    let mut team_ids: Vec<&String> = teams.keys().collect();
    team_ids.sort();
    for team_id in team_ids {
        let team = &teams[team_id];
        if team.agents.iter().any(|a| a == agent_id) {
            return Some((team_id.clone(), team.clone()));
        }
    }
    None
}

/// A teammate mention drawn from an agent's response.
#[derive(Debug, Clone, PartialEq)]
pub struct Mention {
    pub target: String,
    pub message: String,
}

fn mention_regex() -> Regex {
    Regex::new(r"\[@([A-Za-z0-9_\-]+(?:\s*,\s*[A-Za-z0-9_\-]+)*):\s*([\s\S]*?)\]")
        .expect("static regex")
}

/// Strip all mention tags from a response, leaving the shared context.
pub fn strip_mention_tags(response: &str) -> String {
    mention_regex().replace_all(response, "").trim().to_string()
}

/// Extract teammate mentions (`[@a: text]`, `[@a,b: text]`) from a response.
///
/// Targets must be configured agents, members of `team_id`, and not the
/// current agent. Text outside all tags becomes shared context prepended to
/// each directed message. Duplicate targets collapse to the first occurrence.
pub fn extract_teammate_mentions(
    response: &str,
    current_agent_id: &str,
    team_id: &str,
    teams: &HashMap<String, TeamConfig>,
    agents: &HashMap<String, AgentConfig>,
) -> Vec<Mention> {
    let mut results = Vec::new();
    let Some(team) = teams.get(team_id) else {
        return results;
    };

    let shared_context = strip_mention_tags(response);
    let mut seen = std::collections::HashSet::new();

    for caps in mention_regex().captures_iter(response) {
        let targets = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let direct = caps.get(2).map(|m| m.as_str()).unwrap_or("").trim();

        for target in targets.split(',') {
            let target_id = target.trim().to_lowercase();
            if target_id.is_empty() || seen.contains(&target_id) {
                continue;
            }
            seen.insert(target_id.clone());

            if target_id == current_agent_id
                || !team.agents.iter().any(|a| a == &target_id)
                || !agents.contains_key(&target_id)
            {
                tracing::debug!(
                    "Dropping mention of '{}' from @{}: not a valid teammate",
                    target_id,
                    current_agent_id
                );
                continue;
            }

            let message = if shared_context.is_empty() {
                direct.to_string()
            } else {
                format!("{}{}{}", shared_context, DIRECTED_SEPARATOR, direct)
            };
            results.push(Mention {
                target: target_id,
                message,
            });
        }
    }

    results
}

/// The agent after `current` in the pipeline sequence, if any.
pub fn next_pipeline_agent(pipeline: &PipelineConfig, current: &str) -> Option<String> {
    let idx = pipeline.sequence.iter().position(|a| a == current)?;
    pipeline.sequence.get(idx + 1).cloned()
}

/// Whether `target` is a permitted loop-back from `current`: the loop budget
/// must allow it and the target must sit strictly earlier in the sequence.
pub fn pipeline_loop_target(
    pipeline: &PipelineConfig,
    current: &str,
    target: &str,
    loops_used: u32,
) -> bool {
    if pipeline.max_loops == 0 || loops_used >= pipeline.max_loops {
        return false;
    }
    let (Some(current_idx), Some(target_idx)) = (
        pipeline.sequence.iter().position(|a| a == current),
        pipeline.sequence.iter().position(|a| a == target),
    ) else {
        return false;
    };
    target_idx < current_idx
}

/// Keep mentions a non-strict pipeline permits: the next agent in sequence,
/// or a loop-back within budget. Everything else is dropped with a warning.
pub fn filter_mentions_for_pipeline(
    mentions: Vec<Mention>,
    pipeline: &PipelineConfig,
    current: &str,
    loops_used: u32,
) -> Vec<Mention> {
    let next = next_pipeline_agent(pipeline, current);
    mentions
        .into_iter()
        .filter(|m| {
            let is_next = next.as_deref() == Some(m.target.as_str());
            let is_loop = pipeline_loop_target(pipeline, current, &m.target, loops_used);
            if !is_next && !is_loop {
                tracing::warn!(
                    "Pipeline blocked mention of @{} by @{} (not next in sequence, not a \
                     permitted loop-back)",
                    m.target,
                    current
                );
            }
            is_next || is_loop
        })
        .collect()
}
