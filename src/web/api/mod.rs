//! API endpoint handlers.

pub mod agents;
pub mod events;
pub mod logs;
pub mod messages;
pub mod queue;
pub mod responses;
pub mod teams;

use axum::http::StatusCode;
use axum::Json;

/// Standard protocol-error body: `{error: message}`.
pub fn api_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

/// Merge the `agent=` and `agents=a,b` query parameters into one filter set.
pub fn merge_agent_filter(agent: Option<String>, agents: Option<String>) -> Option<Vec<String>> {
    let mut ids: Vec<String> = Vec::new();
    if let Some(one) = agent {
        let one = one.trim().to_string();
        if !one.is_empty() {
            ids.push(one);
        }
    }
    if let Some(many) = agents {
        for id in many.split(',') {
            let id = id.trim().to_string();
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    if ids.is_empty() {
        None
    } else {
        Some(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_agent_filter() {
        assert_eq!(merge_agent_filter(None, None), None);
        assert_eq!(
            merge_agent_filter(Some("a".into()), None),
            Some(vec!["a".to_string()])
        );
        assert_eq!(
            merge_agent_filter(Some("a".into()), Some("a,b, c".into())),
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }
}
