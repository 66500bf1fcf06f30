//! Checkpoint, frame, notes, and parse-state routes.

use axum::extract::{Path, State};
use axum::Json;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use pilot_core::agent::memory::MemoryStore;
use pilot_core::frame::CapturedFrame;
use pilot_core::savestate::{self, ParseOutcome};
use pilot_core::store::blob::BlobEntry;

use crate::error::HttpApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveStateRequest {
    /// Base64-encoded save-state bytes.
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub decision_number: u64,
    #[serde(default)]
    pub model_id: Option<String>,
}

pub async fn post_save_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SaveStateRequest>,
) -> Result<Json<Value>, HttpApiError> {
    if req.state.trim().is_empty() {
        return Err(HttpApiError::invalid_body("no state payload"));
    }
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(req.state.trim())
        .map_err(|e| HttpApiError::invalid_body(format!("state is not valid base64: {e}")))?;

    // Route the upload through the agent's task so checkpoint parsing
    // and level rewards apply exactly as on the cadence path.
    let model_hint = req.model_id.unwrap_or_else(|| "unknown".to_string());
    let client = state.client(&id, &model_hint).await;
    let receipt = client
        .ingest_checkpoint(bytes, req.decision_number)
        .await
        .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
    info!(agent_id = %id, url = %receipt.url, "checkpoint stored via api");

    let filename = receipt
        .path
        .rsplit('/')
        .next()
        .unwrap_or(&receipt.path)
        .to_string();
    Ok(Json(json!({
        "success": true,
        "url": receipt.url,
        "filename": filename,
        "decisionNumber": receipt.decision_number,
    })))
}

fn frames_prefix(agent_id: &str) -> String {
    format!("frames/{agent_id}/")
}

pub async fn get_frames(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let frames: Vec<BlobEntry> = state
        .blob
        .list(&frames_prefix(&id))
        .await
        .map_err(|e| HttpApiError::internal(e.to_string()))?;
    let total = frames.len();
    Ok(Json(json!({ "frames": frames, "totalCount": total })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreFrameRequest {
    #[serde(default)]
    pub frame: String,
}

pub async fn post_frames(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StoreFrameRequest>,
) -> Result<Json<Value>, HttpApiError> {
    let now = Utc::now();
    let frame = CapturedFrame::from_data_url(req.frame, now)
        .map_err(|e| HttpApiError::invalid_frame(e.to_string()))?;
    let bytes = frame
        .decode_bytes()
        .map_err(|e| HttpApiError::invalid_frame(e.to_string()))?;

    let path = format!(
        "{}{}.png",
        frames_prefix(&id),
        now.format("%Y-%m-%d_%H-%M-%S%.3f")
    );
    let url = state
        .blob
        .put(&path, bytes)
        .await
        .map_err(|e| HttpApiError::internal(e.to_string()))?;

    Ok(Json(json!({
        "url": url,
        "timestamp": now.timestamp_millis(),
        "agentId": id,
    })))
}

pub async fn get_memstash(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let memory = MemoryStore::new(state.kv.clone());
    let notes = memory
        .get_notes(&id)
        .await
        .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
    Ok(Json(json!({ "content": notes })))
}

/// Clears notes and the decision log together.
pub async fn delete_memstash(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let memory = MemoryStore::new(state.kv.clone());
    memory
        .clear(&id)
        .await
        .map_err(|e| HttpApiError::internal(format!("{e:#}")))?;
    Ok(Json(json!({ "success": true })))
}

/// Parses the most recent checkpoint into structured game data,
/// surfacing failure instead of fabricating fields.
pub async fn get_parse_state(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, HttpApiError> {
    let checkpoints = state
        .blob
        .list(&format!("save-states/{id}/"))
        .await
        .map_err(|e| HttpApiError::internal(e.to_string()))?;
    let Some(latest) = checkpoints.iter().max_by_key(|b| b.uploaded_at) else {
        return Ok(Json(json!({
            "success": false,
            "reason": "no checkpoint uploaded yet",
        })));
    };
    let Some(bytes) = state
        .blob
        .get(&latest.path)
        .await
        .map_err(|e| HttpApiError::internal(e.to_string()))?
    else {
        return Ok(Json(json!({
            "success": false,
            "reason": "checkpoint blob vanished",
        })));
    };

    match savestate::parse(&bytes) {
        ParseOutcome::Parsed(parsed) => Ok(Json(json!({
            "success": true,
            "parsed": parsed,
            "formatted": parsed.formatted(),
        }))),
        ParseOutcome::Unrecognized { reason } => Ok(Json(json!({
            "success": false,
            "reason": reason,
        }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testutil::{png_data_url, state};

    fn b64(bytes: &[u8]) -> String {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    }

    fn recognized_container() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"PPSS");
        out.extend_from_slice(&1u16.to_le_bytes());
        out.push(1);
        out.push(0x01);
        out.extend_from_slice(&3u32.to_le_bytes());
        out.extend_from_slice(&[2, 10, 12]);
        out
    }

    #[tokio::test]
    async fn save_state_uploads_and_names_blob() {
        let app = state();
        let res = post_save_state(
            State(app.clone()),
            Path("a1".to_string()),
            Json(SaveStateRequest {
                state: b64(&[1, 2, 3]),
                decision_number: 200,
                model_id: Some("openai/gpt-4o".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(res.0["success"], true);
        let filename = res.0["filename"].as_str().unwrap();
        assert!(filename.contains("_D200_openai-gpt-4o.state"));

        let listed = app.blob.list("save-states/a1/").await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn save_state_upload_earns_level_reward() {
        let app = state();
        let levels_before = recognized_container();
        post_save_state(
            State(app.clone()),
            Path("a1".to_string()),
            Json(SaveStateRequest {
                state: b64(&levels_before),
                decision_number: 100,
                model_id: Some("openai/gpt-4o".to_string()),
            }),
        )
        .await
        .unwrap();

        // Same container with a higher party level.
        let mut levels_after = recognized_container();
        let last = levels_after.len() - 1;
        levels_after[last] = 14;
        post_save_state(
            State(app.clone()),
            Path("a1".to_string()),
            Json(SaveStateRequest {
                state: b64(&levels_after),
                decision_number: 200,
                model_id: None,
            }),
        )
        .await
        .unwrap();

        let client = app.existing("a1").await.unwrap();
        let record = client.record().await.unwrap();
        assert!(record.game_state.progress.level_reward_total > 0.0);
    }

    #[tokio::test]
    async fn save_state_without_payload_is_400() {
        let app = state();
        let err = post_save_state(
            State(app),
            Path("a1".to_string()),
            Json(SaveStateRequest {
                state: String::new(),
                decision_number: 1,
                model_id: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn frames_store_and_list() {
        let app = state();
        let res = post_frames(
            State(app.clone()),
            Path("a1".to_string()),
            Json(StoreFrameRequest {
                frame: png_data_url(2048),
            }),
        )
        .await
        .unwrap();
        assert_eq!(res.0["agentId"], "a1");

        let listed = get_frames(State(app), Path("a1".to_string())).await.unwrap();
        assert_eq!(listed.0["totalCount"], 1);
    }

    #[tokio::test]
    async fn memstash_reads_and_clears() {
        let app = state();
        let memory = MemoryStore::new(app.kv.clone());
        memory
            .merge_notes(
                "a1",
                &pilot_core::agent::schema::NotesDelta {
                    current_objective: Some("beat brock".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let read = get_memstash(State(app.clone()), Path("a1".to_string()))
            .await
            .unwrap();
        assert_eq!(read.0["content"]["currentObjective"], "beat brock");

        delete_memstash(State(app.clone()), Path("a1".to_string()))
            .await
            .unwrap();
        let read = get_memstash(State(app), Path("a1".to_string()))
            .await
            .unwrap();
        assert_eq!(read.0["content"]["currentObjective"], Value::Null);
    }

    #[tokio::test]
    async fn parse_state_reports_latest_checkpoint() {
        let app = state();
        app.blob
            .put("save-states/a1/old.state", vec![0, 0, 0])
            .await
            .unwrap();
        app.blob
            .put("save-states/a1/new.state", recognized_container())
            .await
            .unwrap();

        let res = get_parse_state(State(app), Path("a1".to_string()))
            .await
            .unwrap();
        assert_eq!(res.0["success"], true);
        assert_eq!(res.0["parsed"]["partyCount"], 2);
        assert!(res.0["formatted"].as_str().unwrap().contains("party"));
    }

    #[tokio::test]
    async fn parse_state_surfaces_unrecognized() {
        let app = state();
        app.blob
            .put("save-states/a1/x.state", vec![9, 9, 9, 9, 9, 9, 9, 9, 9])
            .await
            .unwrap();
        let res = get_parse_state(State(app), Path("a1".to_string()))
            .await
            .unwrap();
        assert_eq!(res.0["success"], false);
        assert!(res.0["reason"].as_str().is_some());
    }

    #[tokio::test]
    async fn parse_state_without_checkpoint() {
        let app = state();
        let res = get_parse_state(State(app), Path("a1".to_string()))
            .await
            .unwrap();
        assert_eq!(res.0["success"], false);
    }
}
