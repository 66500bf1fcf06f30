//! JSON error envelope shared by every route.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MissingField,
    InvalidFrame,
    AgentNotFound,
    AgentPaused,
    InvalidBody,
    Internal,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug)]
pub struct HttpApiError {
    pub status: StatusCode,
    pub error: ApiError,
}

impl HttpApiError {
    pub fn missing_field(field: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError {
                code: ErrorCode::MissingField,
                message: format!("missing required field: {field}"),
                details: None,
            },
        }
    }

    pub fn invalid_frame(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError {
                code: ErrorCode::InvalidFrame,
                message: "frame is not a valid png data url of at least 1 KB".to_string(),
                details: Some(details.into()),
            },
        }
    }

    pub fn invalid_body(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError {
                code: ErrorCode::InvalidBody,
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn agent_not_found(agent_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError {
                code: ErrorCode::AgentNotFound,
                message: "no record for this agent".to_string(),
                details: Some(format!("agent_id={agent_id}")),
            },
        }
    }

    pub fn agent_paused() -> Self {
        Self {
            status: StatusCode::CONFLICT,
            error: ApiError {
                code: ErrorCode::AgentPaused,
                message: "agent is paused; send a heartbeat to resume".to_string(),
                details: None,
            },
        }
    }

    pub fn internal(details: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: ApiError {
                code: ErrorCode::Internal,
                message: "internal error".to_string(),
                details: Some(details.into()),
            },
        }
    }

    /// Maps a decide failure onto the right status: invalid frames are
    /// the caller's fault, paused agents are a conflict, the rest is ours.
    pub fn from_decide_error(err: anyhow::Error) -> Self {
        if let Some(frame_err) = err.downcast_ref::<pilot_core::frame::FrameError>() {
            return Self::invalid_frame(frame_err.to_string());
        }
        if err.to_string().contains("paused") {
            return Self::agent_paused();
        }
        Self::internal(format!("{err:#}"))
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decide_error_mapping() {
        let err = anyhow::Error::new(pilot_core::frame::FrameError::FrameUnavailable(
            "too small".to_string(),
        ));
        assert_eq!(
            HttpApiError::from_decide_error(err).status,
            StatusCode::BAD_REQUEST
        );

        let err = anyhow::anyhow!("agent is paused; send a heartbeat to resume");
        assert_eq!(
            HttpApiError::from_decide_error(err).status,
            StatusCode::CONFLICT
        );

        let err = anyhow::anyhow!("model exploded");
        assert_eq!(
            HttpApiError::from_decide_error(err).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
