//! User-facing endpoints, guarded by bearer tokens.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use quern_core::node::tree_fingerprint;
use quern_core::{Node, NodeId, NodeKind};
use quern_pipeline::retry::{spawn_retry_sibling, MAX_RETRY_COUNTER};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Response carrying the created node.
#[derive(Debug, Serialize)]
pub struct NodeResponse {
    /// The node id assigned by the state store.
    pub id: NodeId,
    /// The full created node.
    pub node: Node,
}

/// Body of `POST /api/checkout`.
#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    /// Existing checkout to re-target; its tree settings are inherited.
    #[serde(default)]
    pub nodeid: Option<NodeId>,
    /// Git URL for a custom checkout.
    #[serde(default)]
    pub url: Option<String>,
    /// Branch for a custom checkout.
    #[serde(default)]
    pub branch: Option<String>,
    /// Commit to test.
    pub commit: String,
    /// Job-name patterns restricting what gets scheduled.
    #[serde(default)]
    pub jobfilter: Option<Vec<String>>,
}

/// Creates a user checkout, bypassing the trigger's frequency gates.
pub async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> ApiResult<Json<NodeResponse>> {
    let claims = state.verifier.verify_headers(&headers)?;

    let mut node = if let Some(nodeid) = &request.nodeid {
        let base = state
            .store
            .get(nodeid)
            .await?
            .ok_or_else(|| ApiError::NotFound(nodeid.to_string()))?;
        let revision = base
            .data
            .kernel_revision
            .clone()
            .ok_or_else(|| ApiError::BadRequest("node carries no revision".to_string()))?;

        let mut child = Node::child_of(&base, NodeKind::Checkout, "checkout");
        if let Some(rev) = child.data.kernel_revision.as_mut() {
            rev.commit.clone_from(&request.commit);
            rev.describe = None;
        }
        child.treeid = Some(tree_fingerprint(
            &revision.tree,
            &revision.branch,
            &request.commit,
            &[],
        ));
        child
    } else {
        let url = request
            .url
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("url or nodeid is required".to_string()))?;
        let branch = request
            .branch
            .as_deref()
            .ok_or_else(|| ApiError::BadRequest("branch is required".to_string()))?;
        let tree = state
            .config
            .trees
            .iter()
            .find(|(_, t)| t.url == url)
            .map_or("custom", |(name, _)| name.as_str());

        let mut checkout = Node::checkout(tree, branch, &request.commit, url);
        checkout.treeid = Some(tree_fingerprint(tree, branch, &request.commit, &[]));
        checkout
    };

    node.jobfilter = request.jobfilter;
    node.owner = Some(claims.sub.clone());
    node.submitter = Some(claims.sub);
    node.user_groups = claims.groups;

    let created = state.store.create(node).await?;
    tracing::info!(node = %created.id, owner = ?created.owner, "user checkout created");
    Ok(Json(NodeResponse {
        id: created.id.clone(),
        node: created,
    }))
}

/// Body of `POST /api/jobretry`.
#[derive(Debug, Deserialize)]
pub struct JobRetryRequest {
    /// The terminal job node to retry.
    pub nodeid: NodeId,
}

/// Spawns a fresh retry sibling for a terminal job node.
pub async fn jobretry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<JobRetryRequest>,
) -> ApiResult<Json<NodeResponse>> {
    let claims = state.verifier.verify_headers(&headers)?;

    let node = state
        .store
        .get(&request.nodeid)
        .await?
        .ok_or_else(|| ApiError::NotFound(request.nodeid.to_string()))?;

    if !matches!(node.kind, NodeKind::Kbuild | NodeKind::Job) {
        return Err(ApiError::BadRequest(format!(
            "cannot retry a {} node",
            node.kind
        )));
    }
    if !node.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "node {} is still {}",
            node.id, node.state
        )));
    }
    if node.data.retry_counter >= MAX_RETRY_COUNTER {
        return Err(ApiError::Conflict(format!(
            "node {} has exhausted its retries",
            node.id
        )));
    }

    let sibling = spawn_retry_sibling(state.store.as_ref(), &node)
        .await?
        .ok_or_else(|| {
            ApiError::Conflict("parent no longer accepts children".to_string())
        })?;

    tracing::info!(node = %node.id, retry = %sibling.id, user = %claims.sub, "user retry");
    Ok(Json(NodeResponse {
        id: sibling.id.clone(),
        node: sibling,
    }))
}

/// Body of `POST /api/patchset`.
#[derive(Debug, Deserialize)]
pub struct PatchsetRequest {
    /// The base checkout to apply patches on.
    pub nodeid: NodeId,
    /// Patch URLs, applied in order.
    pub patchurl: Vec<String>,
    /// Job-name patterns restricting what gets scheduled.
    #[serde(default)]
    pub jobfilter: Option<Vec<String>>,
}

/// Creates a patchset checkout child of an existing checkout.
pub async fn patchset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PatchsetRequest>,
) -> ApiResult<Json<NodeResponse>> {
    let claims = state.verifier.verify_headers(&headers)?;

    if request.patchurl.is_empty() {
        return Err(ApiError::BadRequest("patchurl must not be empty".to_string()));
    }

    let base = state
        .store
        .get(&request.nodeid)
        .await?
        .ok_or_else(|| ApiError::NotFound(request.nodeid.to_string()))?;
    if base.kind != NodeKind::Checkout {
        return Err(ApiError::BadRequest(format!(
            "patchset base must be a checkout, not {}",
            base.kind
        )));
    }
    let revision = base
        .data
        .kernel_revision
        .clone()
        .ok_or_else(|| ApiError::BadRequest("node carries no revision".to_string()))?;

    let mut node = Node::child_of(&base, NodeKind::Checkout, "patchset");
    node.treeid = Some(tree_fingerprint(
        &revision.tree,
        &revision.branch,
        &revision.commit,
        &request.patchurl,
    ));
    node.data.extra.insert(
        "patchurl".to_string(),
        serde_json::Value::Array(
            request
                .patchurl
                .iter()
                .map(|u| serde_json::Value::String(u.clone()))
                .collect(),
        ),
    );
    node.jobfilter = request.jobfilter;
    node.owner = Some(claims.sub.clone());
    node.submitter = Some(claims.sub);
    node.user_groups = claims.groups;

    let created = state.store.create(node).await?;
    tracing::info!(node = %created.id, base = %base.id, "patchset created");
    Ok(Json(NodeResponse {
        id: created.id.clone(),
        node: created,
    }))
}
