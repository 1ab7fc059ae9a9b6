//! # quern-pipeline
//!
//! The event-driven work-graph engine of the quern CI pipeline.
//!
//! A set of cooperating long-running services maintains a tree of nodes
//! (checkout → build → test suite → test case) through a shared state
//! store and a pub/sub event bus:
//!
//! - **Trigger**: watches upstream trees and creates `checkout` roots
//! - **Tarball**: publishes source tarballs and opens checkouts for
//!   scheduling
//! - **Scheduler**: matches node events to job definitions and
//!   dispatches into runtimes
//! - **Runtime adapters**: shell, docker, kubernetes, LAVA and pull labs
//! - **Reconciler**: drives timeouts, holdoffs and parent completion
//! - **Regression tracker**: records pass→fail transitions
//! - **Forwarder**: ships terminal nodes to the reporting sink
//!
//! No service holds authoritative state: every transition is a
//! compare-and-swap write to the state store, which fans out an event
//! that other services react to.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod aggregate;
pub mod blob;
pub mod bus;
pub mod cli;
pub mod error;
pub mod forward;
pub mod reconcile;
pub mod regression;
pub mod results;
pub mod retry;
pub mod rules;
pub mod runtime;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod tarball;
pub mod trigger;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::aggregate::aggregate;
    pub use crate::blob::BlobStore;
    pub use crate::bus::{EventBus, EventOp, EventSubscription, NodeEvent, NODE_CHANNEL};
    pub use crate::error::{Error, Result};
    pub use crate::forward::{ForwarderService, Report, ReportSink};
    pub use crate::reconcile::ReconcilerService;
    pub use crate::regression::RegressionService;
    pub use crate::results::{ResultsPayload, TestResult};
    pub use crate::rules::CompiledRules;
    pub use crate::runtime::{JobHandle, JobRenderer, JobStatus, RenderedJob, Runtime};
    pub use crate::scheduler::SchedulerService;
    pub use crate::service::{shutdown_pair, ShutdownSignal};
    pub use crate::store::{CasOutcome, NodeFilter, NodeStore};
    pub use crate::tarball::{SourceMirror, TarballService};
    pub use crate::trigger::{RevisionSource, TriggerService};
}
