//! Liveness and persisted-state routes, plus pause/resume.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use serde_json::{json, Value};

use pilot_core::agent::coordinator::{
    read_heartbeat, record_heartbeat, CLIENT_GONE_AFTER,
};
use pilot_core::store::{agent_key, ttl};

use crate::error::HttpApiError;
use crate::server::AppState;

pub async fn post_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let now = Utc::now();
    record_heartbeat(state.kv.as_ref(), &id, now)
        .await
        .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
    Ok(Json(json!({
        "success": true,
        "timestamp": now.timestamp_millis(),
    })))
}

pub async fn get_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let now = Utc::now();
    let status = read_heartbeat(state.kv.as_ref(), &id, now, CLIENT_GONE_AFTER)
        .await
        .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
    Ok(Json(json!({
        "alive": status.alive,
        "lastBeat": status.last_beat.map(|at| at.timestamp_millis()),
        "elapsed": status.elapsed.map(|e| e.as_millis() as u64),
        "timeout": CLIENT_GONE_AFTER.as_millis() as u64,
    })))
}

pub async fn get_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let raw = state
        .kv
        .get(&agent_key(&id, "state"))
        .await
        .map_err(|e| HttpApiError::internal(e.to_string()))?
        .ok_or_else(|| HttpApiError::agent_not_found(&id))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| HttpApiError::internal(format!("stored state is corrupt: {e}")))?;
    Ok(Json(value))
}

/// Writes the persisted record verbatim with the 24h TTL.
pub async fn put_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, HttpApiError> {
    if !body.is_object() {
        return Err(HttpApiError::invalid_body("state body must be an object"));
    }
    state
        .kv
        .set(&agent_key(&id, "state"), body.to_string(), Some(ttl::AGENT_STATE))
        .await
        .map_err(|e| HttpApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "success": true })))
}

pub async fn delete_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let deleted = state
        .kv
        .del(&agent_key(&id, "state"))
        .await
        .map_err(|e| HttpApiError::internal(e.to_string()))?;
    Ok(Json(json!({ "success": true, "deleted": deleted })))
}

pub async fn post_pause(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let client = state
        .existing(&id)
        .await
        .ok_or_else(|| HttpApiError::agent_not_found(&id))?;
    let status = client
        .pause()
        .await
        .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
    Ok(Json(json!({ "success": true, "status": status })))
}

pub async fn post_resume(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let client = state
        .existing(&id)
        .await
        .ok_or_else(|| HttpApiError::agent_not_found(&id))?;
    let status = client
        .resume()
        .await
        .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
    Ok(Json(json!({ "success": true, "status": status })))
}

/// Aborts in-flight work, clears the agent's keys, and reinitializes
/// game state.
pub async fn post_reset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let client = state
        .existing(&id)
        .await
        .ok_or_else(|| HttpApiError::agent_not_found(&id))?;
    client
        .reset()
        .await
        .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
    Ok(Json(json!({ "success": true })))
}
