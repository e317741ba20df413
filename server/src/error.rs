use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::graph::GraphError;
use crate::llm::LlmError;

#[inline]
pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>, details: Option<serde_json::Value>) -> Response {
    let body = serde_json::json!({ "error": { "code": code, "message": message.into(), "details": details } });
    (status, Json(body)).into_response()
}

/// Failures as seen by HTTP and realtime clients.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    NotFound(String),

    #[error("graph store error: {0:#}")]
    Graph(anyhow::Error),

    #[error("language model error: {0:#}")]
    Llm(anyhow::Error),
}

impl AppError {
    /// Sorts an internal failure by the collaborator it came from.
    pub fn classify(err: anyhow::Error) -> Self {
        if let Some(g) = err.downcast_ref::<GraphError>() {
            return AppError::NotFound(g.to_string());
        }
        if err.downcast_ref::<LlmError>().is_some() || err.downcast_ref::<crate::story::ChoiceParseError>().is_some() {
            return AppError::Llm(err);
        }
        AppError::Graph(err)
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Graph(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Llm(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::InvalidInput(_) => "INVALID_INPUT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Graph(_) => "GRAPH_ERROR",
            AppError::Llm(_) => "LLM_ERROR",
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::classify(err)
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::InvalidInput(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if matches!(self, AppError::Graph(_) | AppError::Llm(_)) {
            tracing::error!(error = %self, "request failed");
        }
        json_error(self.status(), self.code(), self.to_string(), None)
    }
}
