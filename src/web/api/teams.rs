//! API endpoints for team configuration.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::api_error;
use crate::config::{PipelineConfig, TeamConfig};
use crate::web::AppState;

/// Team API response.
#[derive(Serialize)]
pub struct TeamResponse {
    pub id: String,
    pub name: String,
    pub agents: Vec<String>,
    pub leader_agent: Option<String>,
    pub pipeline: Option<PipelineConfig>,
}

impl From<(String, TeamConfig)> for TeamResponse {
    fn from((id, team): (String, TeamConfig)) -> Self {
        Self {
            id,
            name: team.name,
            agents: team.agents,
            leader_agent: team.leader_agent,
            pipeline: team.pipeline,
        }
    }
}

/// Create team request.
#[derive(Deserialize)]
pub struct CreateTeamRequest {
    pub id: String,
    pub name: Option<String>,
    pub agents: Vec<String>,
    pub leader_agent: Option<String>,
    pub pipeline: Option<PipelineConfig>,
}

/// List all teams.
pub async fn list_teams(State(state): State<AppState>) -> Json<Vec<TeamResponse>> {
    let settings = state.config.snapshot();
    let mut teams: Vec<TeamResponse> = settings
        .teams
        .iter()
        .map(|(id, team)| TeamResponse::from((id.clone(), team.clone())))
        .collect();
    teams.sort_by(|a, b| a.id.cmp(&b.id));
    Json(teams)
}

/// Get a single team.
pub async fn get_team(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TeamResponse>, (StatusCode, Json<serde_json::Value>)> {
    let settings = state.config.snapshot();
    let team = settings
        .teams
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("team '{}' not found", id)))?;
    Ok(Json(TeamResponse::from((id, team.clone()))))
}

/// Create a new team.
pub async fn create_team(
    State(state): State<AppState>,
    Json(payload): Json<CreateTeamRequest>,
) -> Result<Json<TeamResponse>, (StatusCode, Json<serde_json::Value>)> {
    let id = payload.id.trim().to_lowercase();
    if id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "team id is required"));
    }
    let snapshot = state.config.snapshot();
    if snapshot.teams.contains_key(&id) {
        return Err(api_error(
            StatusCode::CONFLICT,
            format!("team '{}' already exists", id),
        ));
    }
    for agent_id in &payload.agents {
        if !snapshot.agents.contains_key(agent_id) {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("unknown agent '{}'", agent_id),
            ));
        }
    }
    if let Some(pipeline) = &payload.pipeline {
        for agent_id in &pipeline.sequence {
            if !payload.agents.contains(agent_id) {
                return Err(api_error(
                    StatusCode::BAD_REQUEST,
                    format!("pipeline references non-member '{}'", agent_id),
                ));
            }
        }
    }
    let leader = payload
        .leader_agent
        .clone()
        .or_else(|| payload.agents.first().cloned());
    if let Some(leader) = &leader {
        if !payload.agents.contains(leader) {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                format!("leader '{}' is not a member", leader),
            ));
        }
    }

    let team = TeamConfig {
        name: payload.name.unwrap_or_else(|| id.clone()),
        agents: payload.agents,
        leader_agent: leader,
        pipeline: payload.pipeline,
    };

    let stored = team.clone();
    state
        .config
        .update(|s| {
            s.teams.insert(id.clone(), team);
        })
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(TeamResponse::from((id, stored))))
}

/// Delete a team.
pub async fn delete_team(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    if !state.config.snapshot().teams.contains_key(&id) {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("team '{}' not found", id),
        ));
    }
    state
        .config
        .update(|s| {
            s.teams.remove(&id);
        })
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::NO_CONTENT)
}
