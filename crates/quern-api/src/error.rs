//! API error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// The result type used by route handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Errors surfaced to API callers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid credentials.
    #[error("unauthorized")]
    Unauthorized,

    /// The request was well-formed but semantically invalid.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The referenced node does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request conflicts with the node's current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An internal failure; details stay in the logs.
    #[error("internal error")]
    Internal,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<quern_pipeline::error::Error> for ApiError {
    fn from(err: quern_pipeline::error::Error) -> Self {
        use quern_pipeline::error::Error;
        match err {
            Error::PayloadRejected { message } => Self::BadRequest(message),
            Error::NodeNotFound { id } => Self::NotFound(id.to_string()),
            Error::ParentClosed { parent, state } => {
                Self::Conflict(format!("parent {parent} is {state}"))
            }
            other => {
                tracing::error!(error = %other, "internal API failure");
                Self::Internal
            }
        }
    }
}

impl From<quern_core::Error> for ApiError {
    fn from(err: quern_core::Error) -> Self {
        tracing::error!(error = %err, "internal API failure");
        Self::Internal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_maps_to_bad_request() {
        let err: ApiError =
            quern_pipeline::error::Error::rejected("no job id").into();
        assert!(matches!(err, ApiError::BadRequest(_)));
    }

    #[test]
    fn closed_parent_maps_to_conflict() {
        let err: ApiError = quern_pipeline::error::Error::ParentClosed {
            parent: quern_core::NodeId::new("n1"),
            state: quern_core::NodeState::Closing,
        }
        .into();
        assert!(matches!(err, ApiError::Conflict(_)));
    }
}
