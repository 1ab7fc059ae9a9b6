//! HTTP routes.

pub mod callback;
pub mod user;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

async fn index() -> &'static str {
    "quern pipeline API and lab callback handler"
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Builds the API router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/checkout", post(user::checkout))
        .route("/api/jobretry", post(user::jobretry))
        .route("/api/patchset", post(user::patchset))
        .route("/callback/{runtime}", post(callback::callback))
        .with_state(state)
}
