//! API endpoints for agent configuration.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::api_error;
use crate::config::AgentConfig;
use crate::web::AppState;

/// Agent API response.
#[derive(Serialize)]
pub struct AgentResponse {
    pub id: String,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub working_directory: Option<String>,
}

impl From<(String, AgentConfig)> for AgentResponse {
    fn from((id, agent): (String, AgentConfig)) -> Self {
        Self {
            id,
            name: agent.name,
            provider: agent.provider,
            model: agent.model,
            working_directory: agent
                .working_directory
                .map(|p| p.to_string_lossy().to_string()),
        }
    }
}

/// Create agent request.
#[derive(Deserialize)]
pub struct CreateAgentRequest {
    pub id: String,
    pub name: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub working_directory: Option<String>,
    pub system_prompt: Option<String>,
}

/// List all agents.
pub async fn list_agents(State(state): State<AppState>) -> Json<Vec<AgentResponse>> {
    let settings = state.config.snapshot();
    let mut agents: Vec<AgentResponse> = settings
        .agents
        .iter()
        .map(|(id, agent)| AgentResponse::from((id.clone(), agent.clone())))
        .collect();
    agents.sort_by(|a, b| a.id.cmp(&b.id));
    Json(agents)
}

/// Get a single agent.
pub async fn get_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AgentResponse>, (StatusCode, Json<serde_json::Value>)> {
    let settings = state.config.snapshot();
    let agent = settings
        .agents
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("agent '{}' not found", id)))?;
    Ok(Json(AgentResponse::from((id, agent.clone()))))
}

/// Create a new agent.
pub async fn create_agent(
    State(state): State<AppState>,
    Json(payload): Json<CreateAgentRequest>,
) -> Result<Json<AgentResponse>, (StatusCode, Json<serde_json::Value>)> {
    let id = payload.id.trim().to_lowercase();
    if id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "agent id is required"));
    }
    if state.config.snapshot().agents.contains_key(&id) {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("agent '{}' already exists", id),
        ));
    }

    let agent = AgentConfig {
        name: payload.name,
        provider: payload.provider,
        model: payload.model,
        working_directory: payload.working_directory.map(|p| p.into()),
        system_prompt: payload.system_prompt,
        prompt_file: None,
        reasoning_effort: None,
    };

    let stored = agent.clone();
    state
        .config
        .update(|s| {
            s.agents.insert(id.clone(), agent);
        })
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(AgentResponse::from((id, stored))))
}

/// Delete an agent, removing it from any team rosters as well.
pub async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    if !state.config.snapshot().agents.contains_key(&id) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("agent '{}' not found", id),
        ));
    }

    state
        .config
        .update(|s| {
            s.agents.remove(&id);
            if s.routing.default_agent.as_deref() == Some(id.as_str()) {
                s.routing.default_agent = None;
            }
            for team in s.teams.values_mut() {
                team.agents.retain(|a| a != &id);
                if team.leader_agent.as_deref() == Some(id.as_str()) {
                    team.leader_agent = team.agents.first().cloned();
                }
                if let Some(pipeline) = team.pipeline.as_mut() {
                    pipeline.sequence.retain(|a| a != &id);
                }
            }
        })
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}
