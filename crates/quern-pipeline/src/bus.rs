//! The event bus client.
//!
//! The engine uses a single `node` topic. Every state-store write
//! produces one [`NodeEvent`] carrying just enough of the node for
//! subscribers to route on; consumers re-read the full node from the
//! store before acting so that routing stays cheap and the store stays
//! authoritative.
//!
//! Delivery is per-topic in-order per subscriber; nothing is assumed
//! across subscribers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use quern_core::{Node, NodeId, NodeKind, NodeResult, NodeState};

use crate::error::Result;

/// The default (and currently only) topic.
pub const NODE_CHANNEL: &str = "node";

/// What happened to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    /// The node was created.
    Created,
    /// The node was updated.
    Updated,
}

/// A node change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEvent {
    /// What happened.
    pub op: EventOp,
    /// The node id.
    pub id: NodeId,
    /// Node kind, for routing.
    pub kind: NodeKind,
    /// Node name, for routing.
    pub name: String,
    /// Node state after the write.
    pub state: NodeState,
    /// Node result after the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<NodeResult>,
    /// Group label, for routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Owning user, for routing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl NodeEvent {
    /// Builds the notification for a node write.
    #[must_use]
    pub fn for_node(op: EventOp, node: &Node) -> Self {
        Self {
            op,
            id: node.id.clone(),
            kind: node.kind,
            name: node.name.clone(),
            state: node.state,
            result: node.result,
            group: node.group.clone(),
            owner: node.owner.clone(),
        }
    }
}

/// A live subscription to a topic.
#[async_trait]
pub trait EventSubscription: Send {
    /// Waits for the next event. Returns `None` when the bus shuts down.
    async fn next(&mut self) -> Result<Option<NodeEvent>>;
}

/// Topic-based publish/subscribe over node change notifications.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Subscribes to a topic.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn EventSubscription>>;

    /// Publishes an event on a topic.
    async fn publish(&self, channel: &str, event: &NodeEvent) -> Result<()>;
}
