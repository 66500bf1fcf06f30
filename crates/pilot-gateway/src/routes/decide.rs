//! The decide endpoint: one loop iteration per POST, driven by a client
//! that captures frames and executes the returned plan itself.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use pilot_core::agent::coordinator::ExternalTurn;
use pilot_core::agent::state::AgentRecord;
use pilot_core::frame::Button;
use pilot_core::agent::schema::ButtonScores;
use pilot_core::store::agent_key;

use crate::error::HttpApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideRequest {
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub model_id: String,
    #[serde(default)]
    pub frame: String,
    #[serde(default)]
    pub previous_frames: Vec<String>,
    #[serde(default)]
    pub command_history_with_changes: Vec<String>,
    #[serde(default)]
    pub previous_confidence_scores: Option<ButtonScores>,
    #[serde(default)]
    pub previous_dialog_history: Vec<String>,
    #[serde(default)]
    pub avoid_start_select: bool,
    #[serde(default)]
    pub avoid_wait: bool,
    #[serde(default)]
    pub avoid_b: bool,
    #[serde(default)]
    pub buttons_to_avoid: Vec<Button>,
    #[serde(default)]
    pub banned_buttons: Vec<Button>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecideResponse {
    pub success: bool,
    pub decision: pilot_core::agent::Decision,
    pub game_state: pilot_core::agent::GameState,
    pub cost: f64,
    pub total_cost: f64,
    pub total_decisions: u64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
}

pub async fn post_decide(
    State(state): State<AppState>,
    Json(req): Json<DecideRequest>,
) -> Result<Json<DecideResponse>, HttpApiError> {
    if req.agent_id.trim().is_empty() {
        return Err(HttpApiError::missing_field("agentId"));
    }
    if req.model_id.trim().is_empty() {
        return Err(HttpApiError::missing_field("modelId"));
    }
    if req.frame.trim().is_empty() {
        return Err(HttpApiError::missing_field("frame"));
    }

    let client = state.client(&req.agent_id, &req.model_id).await;
    let turn = ExternalTurn {
        frame: req.frame,
        previous_frames: req.previous_frames,
        command_history: req.command_history_with_changes,
        previous_scores: req.previous_confidence_scores,
        dialog_history: req.previous_dialog_history,
        avoid_start_select: req.avoid_start_select,
        avoid_wait: req.avoid_wait,
        avoid_b: req.avoid_b,
        buttons_to_avoid: req.buttons_to_avoid,
        banned_buttons: req.banned_buttons,
    };

    let result = client
        .decide(turn)
        .await
        .map_err(HttpApiError::from_decide_error)?;
    debug!(agent_id = %result.record.id, button = %result.decision.button, "decide served");

    Ok(Json(DecideResponse {
        success: true,
        decision: result.decision,
        game_state: result.game_state,
        cost: result.cost,
        total_cost: result.record.total_cost,
        total_decisions: result.record.total_decisions,
        total_tokens_in: result.record.total_tokens_in,
        total_tokens_out: result.record.total_tokens_out,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AgentQuery {
    #[serde(rename = "agentId")]
    pub agent_id: String,
}

/// Current agent record: live from the agent's task when it is
/// resident, otherwise the persisted copy.
pub async fn get_agent(
    State(state): State<AppState>,
    Query(query): Query<AgentQuery>,
) -> Result<Json<Value>, HttpApiError> {
    if let Some(client) = state.existing(&query.agent_id).await {
        let record = client
            .record()
            .await
            .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
        return Ok(Json(json!(record)));
    }

    let raw = state
        .kv
        .get(&agent_key(&query.agent_id, "state"))
        .await
        .map_err(|e| HttpApiError::internal(e.to_string()))?
        .ok_or_else(|| HttpApiError::agent_not_found(&query.agent_id))?;
    let record: AgentRecord = serde_json::from_str(&raw)
        .map_err(|e| HttpApiError::internal(format!("stored record is corrupt: {e}")))?;
    Ok(Json(json!(record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testutil::{png_data_url, state};

    fn request(agent: &str, frame: String) -> DecideRequest {
        DecideRequest {
            agent_id: agent.to_string(),
            model_id: "openai/gpt-4o".to_string(),
            frame,
            previous_frames: vec![],
            command_history_with_changes: vec![],
            previous_confidence_scores: None,
            previous_dialog_history: vec![],
            avoid_start_select: false,
            avoid_wait: false,
            avoid_b: false,
            buttons_to_avoid: vec![],
            banned_buttons: vec![],
        }
    }

    #[tokio::test]
    async fn decide_round_trip_and_totals() {
        let state = state();
        let res = post_decide(
            State(state.clone()),
            Json(request("agent-1", png_data_url(2048))),
        )
        .await
        .unwrap();
        assert!(res.0.success);
        assert_eq!(res.0.decision.button, Button::A);
        assert_eq!(res.0.total_decisions, 1);
        assert_eq!(res.0.game_state.area, "pallet-town");
        assert!(res.0.total_cost > 0.0);

        // Second decide advances totals on the same coordinator.
        let res = post_decide(
            State(state),
            Json(request("agent-1", png_data_url(2048))),
        )
        .await
        .unwrap();
        assert_eq!(res.0.total_decisions, 2);
    }

    #[tokio::test]
    async fn decide_missing_fields_are_400() {
        let state = state();
        let mut req = request("", png_data_url(2048));
        let err = post_decide(State(state.clone()), Json(req)).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);

        req = request("agent-1", String::new());
        let err = post_decide(State(state), Json(req)).await.unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn decide_small_frame_is_400() {
        let state = state();
        let err = post_decide(
            State(state),
            Json(request("agent-1", png_data_url(999))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_agent_serves_registry_then_404() {
        let state = state();
        let _ = post_decide(
            State(state.clone()),
            Json(request("agent-1", png_data_url(2048))),
        )
        .await
        .unwrap();

        let res = get_agent(
            State(state.clone()),
            Query(AgentQuery {
                agent_id: "agent-1".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(res.0["totalDecisions"], 1);

        let err = get_agent(
            State(state),
            Query(AgentQuery {
                agent_id: "nobody".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::NOT_FOUND);
    }
}
