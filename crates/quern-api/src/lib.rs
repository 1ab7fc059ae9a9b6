//! # quern-api
//!
//! Inbound HTTP surface of the quern pipeline:
//!
//! - `POST /api/checkout`, `/api/jobretry`, `/api/patchset`: user
//!   operations guarded by HS256 bearer tokens
//! - `POST /callback/{runtime}`: asynchronous lab result sink guarded
//!   by per-runtime shared secrets
//!
//! Handlers translate requests into node operations against the state
//! store; all pipeline semantics live in `quern-pipeline`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
