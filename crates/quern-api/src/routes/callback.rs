//! Lab callback endpoint.
//!
//! One request per completed external job. The lab authenticates with a
//! per-runtime shared secret in the `Authorization` header; the secret
//! value maps back to the runtime name, which must match the path. The
//! token *description* embedded in outgoing jobs is public and never
//! checked here.

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;

use quern_core::NodeId;
use quern_pipeline::results::{apply_results, locate_node, parse_runtime_payload};

use crate::auth::shared_secret;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Response for an accepted callback.
#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    /// The node the results were applied to.
    pub node_id: NodeId,
}

/// Ingests one lab callback.
pub async fn callback(
    State(state): State<AppState>,
    Path(runtime): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<Json<CallbackResponse>> {
    let secret = shared_secret(&headers).ok_or(ApiError::Unauthorized)?;
    let token_runtime = state
        .secrets
        .runtime_for_callback_token(secret)
        .ok_or(ApiError::Unauthorized)?;
    if token_runtime != runtime {
        tracing::warn!(path = %runtime, token = %token_runtime, "callback token/runtime mismatch");
        return Err(ApiError::Unauthorized);
    }

    let kind = state
        .config
        .runtimes
        .get(&runtime)
        .map(|c| c.lab_type)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown runtime {runtime}")))?;

    let payload = parse_runtime_payload(kind, &body)?;
    let node = locate_node(state.store.as_ref(), &payload).await?;
    let updated = apply_results(state.store.as_ref(), &node, &payload, state.holdoff()).await?;

    tracing::info!(node = %updated.id, runtime = %runtime, "callback applied");
    Ok(Json(CallbackResponse {
        node_id: updated.id,
    }))
}
