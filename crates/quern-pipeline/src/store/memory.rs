//! In-memory state store for tests.
//!
//! Mirrors the production pairing of REST store and pub/sub bus: every
//! create/update publishes a [`NodeEvent`] on the shared `node` topic, so
//! services under test observe exactly the same dataflow as against the
//! real collaborators.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, Mutex};

use quern_core::{Node, NodeId, NodeState};

use crate::bus::{EventBus, EventOp, EventSubscription, NodeEvent};
use crate::error::{Error, Result};
use crate::store::{CasOutcome, NodeFilter, NodeStore};

const EVENT_BUFFER: usize = 1024;

/// In-memory store and bus pair.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    nodes: Mutex<BTreeMap<NodeId, Node>>,
    events: broadcast::Sender<NodeEvent>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                nodes: Mutex::new(BTreeMap::new()),
                events,
            }),
        }
    }

    /// Returns every stored node. Test helper.
    pub async fn dump(&self) -> Vec<Node> {
        self.inner.nodes.lock().await.values().cloned().collect()
    }

    fn publish_event(&self, op: EventOp, node: &Node) {
        // Send errors just mean nobody is subscribed.
        let _ = self.inner.events.send(NodeEvent::for_node(op, node));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn create(&self, mut node: Node) -> Result<Node> {
        let mut nodes = self.inner.nodes.lock().await;

        if let Some(parent_id) = &node.parent {
            let parent = nodes
                .get(parent_id)
                .ok_or_else(|| Error::NodeNotFound {
                    id: parent_id.clone(),
                })?;
            // Regression records attach to the terminal node they
            // describe; only lifecycle work nodes are gated on the
            // parent still accepting children.
            if node.kind != quern_core::NodeKind::Regression && !parent.state.accepts_children() {
                return Err(Error::ParentClosed {
                    parent: parent_id.clone(),
                    state: parent.state,
                });
            }
        }

        let now = Utc::now();
        node.id = NodeId::generate();
        node.created = now;
        node.updated = now;
        nodes.insert(node.id.clone(), node.clone());
        drop(nodes);

        self.publish_event(EventOp::Created, &node);
        Ok(node)
    }

    async fn get(&self, id: &NodeId) -> Result<Option<Node>> {
        Ok(self.inner.nodes.lock().await.get(id).cloned())
    }

    async fn find(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        Ok(self
            .inner
            .nodes
            .lock()
            .await
            .values()
            .filter(|node| filter.matches(node))
            .cloned()
            .collect())
    }

    async fn update(&self, node: &Node, expected_state: Option<NodeState>) -> Result<CasOutcome> {
        let mut nodes = self.inner.nodes.lock().await;
        let stored = nodes.get_mut(&node.id).ok_or_else(|| Error::NodeNotFound {
            id: node.id.clone(),
        })?;

        if let Some(expected) = expected_state {
            if stored.state != expected {
                return Ok(CasOutcome::StateMismatch {
                    actual: stored.state,
                });
            }
        }

        let mut updated = node.clone();
        updated.created = stored.created;
        updated.updated = Utc::now();
        *stored = updated.clone();
        drop(nodes);

        self.publish_event(EventOp::Updated, &updated);
        Ok(CasOutcome::Updated(updated))
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<NodeEvent>,
}

#[async_trait]
impl EventSubscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<NodeEvent>> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(Some(event)),
                // A lagged subscriber skips ahead; consumers re-read from
                // the store, so dropped notifications are recoverable.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl EventBus for MemoryStore {
    async fn subscribe(&self, _channel: &str) -> Result<Box<dyn EventSubscription>> {
        Ok(Box::new(MemorySubscription {
            rx: self.inner.events.subscribe(),
        }))
    }

    async fn publish(&self, _channel: &str, event: &NodeEvent) -> Result<()> {
        let _ = self.inner.events.send(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quern_core::{NodeKind, NodeResult};

    #[tokio::test]
    async fn create_assigns_id_and_publishes() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe("node").await.unwrap();

        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();

        let event = sub.next().await.unwrap().unwrap();
        assert_eq!(event.op, EventOp::Created);
        assert_eq!(event.id, checkout.id);
    }

    #[tokio::test]
    async fn closing_parent_rejects_children() {
        let store = MemoryStore::new();
        let mut checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();

        checkout.transition(NodeState::Available).unwrap();
        store.update(&checkout, None).await.unwrap();
        checkout.transition(NodeState::Closing).unwrap();
        store.update(&checkout, None).await.unwrap();

        let child = Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-gcc-12-x86");
        let err = store.create(child).await.unwrap_err();
        assert!(matches!(err, Error::ParentClosed { .. }));
    }

    #[tokio::test]
    async fn cas_mismatch_reports_actual_state() {
        let store = MemoryStore::new();
        let mut checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();

        let mut competing = checkout.clone();
        competing.transition(NodeState::Available).unwrap();
        store
            .update(&competing, Some(NodeState::Running))
            .await
            .unwrap();

        checkout.transition(NodeState::Done).unwrap();
        checkout.set_result(NodeResult::Incomplete).unwrap();
        let outcome = store
            .update(&checkout, Some(NodeState::Running))
            .await
            .unwrap();
        match outcome {
            CasOutcome::StateMismatch { actual } => assert_eq!(actual, NodeState::Available),
            CasOutcome::Updated(_) => panic!("write should have lost the race"),
        }
    }

    #[tokio::test]
    async fn find_applies_filters() {
        let store = MemoryStore::new();
        let checkout = store
            .create(Node::checkout("mainline", "master", "abc", "url"))
            .await
            .unwrap();
        store
            .create(Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-a"))
            .await
            .unwrap();
        store
            .create(Node::child_of(&checkout, NodeKind::Kbuild, "kbuild-b"))
            .await
            .unwrap();

        let kbuilds = store
            .find(&NodeFilter::new().kind(NodeKind::Kbuild))
            .await
            .unwrap();
        assert_eq!(kbuilds.len(), 2);

        let named = store
            .find(&NodeFilter::new().parent(checkout.id.clone()).name("kbuild-a"))
            .await
            .unwrap();
        assert_eq!(named.len(), 1);
    }
}
