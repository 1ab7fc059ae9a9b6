//! # quern-core
//!
//! Core abstractions for the quern kernel CI pipeline.
//!
//! This crate provides the foundational types shared by all pipeline
//! services:
//!
//! - **Node model**: The single persistent entity tracked through the
//!   checkout → build → test lifecycle
//! - **State machine**: Monotone node state transitions with validation
//! - **Configuration**: Static catalog of trees, platforms, runtimes,
//!   job definitions and scheduler entries, loaded from TOML
//! - **Identifiers**: Opaque node ids and locally generated ULIDs
//! - **Observability**: Logging initialization shared by every binary
//!
//! ## Crate Boundary
//!
//! `quern-core` defines the shared vocabulary. It performs no I/O; the
//! state store, event bus and runtime clients live in `quern-pipeline`.
//!
//! ## Example
//!
//! ```rust
//! use quern_core::node::{Node, NodeKind, NodeState};
//!
//! let checkout = Node::checkout("mainline", "master", "184f1fe", "https://git.example.org/linux.git");
//! assert_eq!(checkout.kind, NodeKind::Checkout);
//! assert_eq!(checkout.state, NodeState::Running);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod id;
pub mod node;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{
        BuildConfig, JobConfig, PipelineConfig, PlatformConfig, RuntimeConfig, SchedulerEntry,
        SecretsConfig, TreeConfig,
    };
    pub use crate::error::{Error, Result};
    pub use crate::id::NodeId;
    pub use crate::node::{
        KernelRevision, Node, NodeData, NodeKind, NodeResult, NodeState,
    };
}

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use id::NodeId;
pub use node::{KernelRevision, Node, NodeData, NodeKind, NodeResult, NodeState};
pub use observability::{init_logging, LogFormat};
