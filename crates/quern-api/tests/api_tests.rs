//! API surface tests over the in-memory state store.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use tower::ServiceExt;

use quern_api::{router, AppState};
use quern_core::config::{RuntimeSecrets, SecretsConfig};
use quern_core::{NodeKind, NodeResult, NodeState};
use quern_pipeline::store::memory::MemoryStore;
use quern_pipeline::store::{NodeFilter, NodeStore};
use quern_test_utils::{finish, sample_config, user_token, NodeBuilder};

const JWT_SECRET: &str = "test-signing-secret";
const LAB_SECRET: &str = "lab-callback-secret";

fn secrets() -> SecretsConfig {
    let mut secrets = SecretsConfig::default();
    secrets.jwt.secret = JWT_SECRET.to_string();
    secrets.runtimes.insert(
        "lava-lab".to_string(),
        RuntimeSecrets {
            runtime_token: None,
            callback_token: Some(LAB_SECRET.to_string()),
        },
    );
    secrets
}

fn app(store: &Arc<MemoryStore>) -> Router {
    let state = AppState::new(
        Arc::clone(store) as Arc<dyn NodeStore>,
        Arc::new(sample_config()),
        secrets(),
    );
    router(state)
}

fn post_json(uri: &str, auth: Option<&str>, body: serde_json::Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn bearer(sub: &str) -> String {
    format!("Bearer {}", user_token(JWT_SECRET, sub))
}

#[tokio::test]
async fn checkout_requires_auth() {
    let store = Arc::new(MemoryStore::new());
    let response = app(&store)
        .oneshot(post_json(
            "/api/checkout",
            None,
            serde_json::json!({"commit": "abc"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app(&store)
        .oneshot(post_json(
            "/api/checkout",
            Some("Bearer not-a-token"),
            serde_json::json!({"commit": "abc"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn custom_checkout_carries_owner_and_jobfilter() {
    let store = Arc::new(MemoryStore::new());
    let response = app(&store)
        .oneshot(post_json(
            "/api/checkout",
            Some(&bearer("dev@example.org")),
            serde_json::json!({
                "url": "https://git.example.org/linux.git",
                "branch": "master",
                "commit": "user-commit",
                "jobfilter": ["kbuild-*"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let id: quern_core::NodeId = serde_json::from_value(body["id"].clone()).unwrap();
    let node = store.get(&id).await.unwrap().unwrap();
    assert_eq!(node.kind, NodeKind::Checkout);
    assert_eq!(node.owner.as_deref(), Some("dev@example.org"));
    assert_eq!(node.jobfilter.as_deref(), Some(&["kbuild-*".to_string()][..]));
    // The URL matches a configured tree, so the tree name is resolved.
    assert_eq!(
        node.data.kernel_revision.as_ref().map(|r| r.tree.as_str()),
        Some("mainline")
    );
    assert!(node.treeid.is_some());
}

#[tokio::test]
async fn retarget_checkout_creates_child() {
    let store = Arc::new(MemoryStore::new());
    let base = NodeBuilder::checkout()
        .commit("base-commit")
        .create(store.as_ref())
        .await
        .unwrap();

    let response = app(&store)
        .oneshot(post_json(
            "/api/checkout",
            Some(&bearer("dev@example.org")),
            serde_json::json!({
                "nodeid": base.id,
                "commit": "new-commit",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    assert_eq!(body["node"]["parent"], serde_json::json!(base.id));
    assert_eq!(
        body["node"]["data"]["kernel_revision"]["commit"],
        serde_json::json!("new-commit")
    );
}

#[tokio::test]
async fn jobretry_spawns_sibling() {
    let store = Arc::new(MemoryStore::new());
    let checkout = NodeBuilder::checkout().create(store.as_ref()).await.unwrap();
    let kbuild = NodeBuilder::child_of(&checkout, NodeKind::Kbuild, "kbuild-gcc-12-arm64")
        .create(store.as_ref())
        .await
        .unwrap();
    finish(store.as_ref(), &kbuild, NodeResult::Fail)
        .await
        .unwrap();

    let response = app(&store)
        .oneshot(post_json(
            "/api/jobretry",
            Some(&bearer("dev@example.org")),
            serde_json::json!({"nodeid": kbuild.id}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["node"]["data"]["retry_counter"], serde_json::json!(1));

    let siblings = store
        .find(
            &NodeFilter::new()
                .parent(checkout.id.clone())
                .name("kbuild-gcc-12-arm64"),
        )
        .await
        .unwrap();
    assert_eq!(siblings.len(), 2);
}

#[tokio::test]
async fn jobretry_rejects_running_node() {
    let store = Arc::new(MemoryStore::new());
    let checkout = NodeBuilder::checkout().create(store.as_ref()).await.unwrap();
    let kbuild = NodeBuilder::child_of(&checkout, NodeKind::Kbuild, "kbuild-gcc-12-arm64")
        .create(store.as_ref())
        .await
        .unwrap();

    let response = app(&store)
        .oneshot(post_json(
            "/api/jobretry",
            Some(&bearer("dev@example.org")),
            serde_json::json!({"nodeid": kbuild.id}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn patchset_fingerprint_differs_from_base() {
    let store = Arc::new(MemoryStore::new());
    let base = NodeBuilder::checkout().create(store.as_ref()).await.unwrap();

    let response = app(&store)
        .oneshot(post_json(
            "/api/patchset",
            Some(&bearer("dev@example.org")),
            serde_json::json!({
                "nodeid": base.id,
                "patchurl": ["https://example.org/fix.mbox"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let id: quern_core::NodeId = serde_json::from_value(body["id"].clone()).unwrap();
    let node = store.get(&id).await.unwrap().unwrap();
    assert_eq!(node.kind, NodeKind::Checkout);
    assert_eq!(node.name, "patchset");
    assert_ne!(node.treeid, base.treeid);
    assert_eq!(
        node.data.extra["patchurl"],
        serde_json::json!(["https://example.org/fix.mbox"])
    );
}

fn lab_payload() -> serde_json::Value {
    serde_json::json!({
        "id": "lava-77",
        "status_string": "complete",
        "results": {
            "lava": [{"name": "validate", "result": "pass"}],
            "baseline": [{"name": "login", "result": "pass"}],
        },
    })
}

async fn seeded_job(store: &Arc<MemoryStore>) -> quern_core::Node {
    let checkout = NodeBuilder::checkout().create(store.as_ref()).await.unwrap();
    NodeBuilder::child_of(&checkout, NodeKind::Job, "baseline-arm64")
        .job_id("lava-77")
        .create(store.as_ref())
        .await
        .unwrap()
}

#[tokio::test]
async fn callback_rejects_bad_secret() {
    let store = Arc::new(MemoryStore::new());
    seeded_job(&store).await;

    let response = app(&store)
        .oneshot(post_json("/callback/lava-lab", None, lab_payload()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app(&store)
        .oneshot(post_json(
            "/callback/lava-lab",
            Some("Token wrong-secret"),
            lab_payload(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn callback_rejects_runtime_mismatch() {
    let store = Arc::new(MemoryStore::new());
    seeded_job(&store).await;

    // Valid secret, but it belongs to lava-lab, not this path.
    let response = app(&store)
        .oneshot(post_json(
            "/callback/other-lab",
            Some(&format!("Token {LAB_SECRET}")),
            lab_payload(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn callback_applies_results_idempotently() {
    let store = Arc::new(MemoryStore::new());
    let job = seeded_job(&store).await;

    let response = app(&store)
        .oneshot(post_json(
            "/callback/lava-lab",
            Some(&format!("Token {LAB_SECRET}")),
            lab_payload(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let updated = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(updated.state, NodeState::Available);
    assert_eq!(updated.result, Some(NodeResult::Pass));

    let children = store
        .find(&NodeFilter::new().parent(job.id.clone()))
        .await
        .unwrap();
    let first_count = children.len();
    assert!(first_count >= 2);

    // Duplicate delivery updates in place, no new children.
    let response = app(&store)
        .oneshot(post_json(
            "/callback/lava-lab",
            Some(&format!("Token {LAB_SECRET}")),
            lab_payload(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let children = store
        .find(&NodeFilter::new().parent(job.id.clone()))
        .await
        .unwrap();
    assert_eq!(children.len(), first_count);
}

#[tokio::test]
async fn callback_rejects_malformed_payload() {
    let store = Arc::new(MemoryStore::new());
    seeded_job(&store).await;

    let response = app(&store)
        .oneshot(post_json(
            "/callback/lava-lab",
            Some(&format!("Token {LAB_SECRET}")),
            serde_json::json!({"status_string": "complete"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Rejection leaves no side effects.
    let nodes = store
        .find(&NodeFilter::new().state(NodeState::Done))
        .await
        .unwrap();
    assert!(nodes.is_empty());
}
