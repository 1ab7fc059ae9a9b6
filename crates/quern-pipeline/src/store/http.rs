//! REST client for the state store and its pub/sub transport.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use quern_core::config::ApiSettings;
use quern_core::{Node, NodeId, NodeState};

use crate::bus::{EventBus, EventSubscription, NodeEvent};
use crate::error::{Error, Result};
use crate::store::{CasOutcome, NodeFilter, NodeStore};

/// REST state store client.
///
/// Every method maps onto the store's CRUD surface; `update` carries the
/// expected prior state in an `If-Match` header so the store can
/// linearize concurrent transitions.
#[derive(Debug, Clone)]
pub struct HttpStore {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StateBody {
    state: NodeState,
}

#[derive(Debug, Deserialize)]
struct SubscriptionBody {
    id: u64,
}

impl HttpStore {
    /// Creates a client from API settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(settings: &ApiSettings, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|e| Error::store_with_source("building http client", e))?;
        Ok(Self {
            base_url: settings.url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

#[async_trait]
impl NodeStore for HttpStore {
    async fn create(&self, node: Node) -> Result<Node> {
        let response = self
            .request(reqwest::Method::POST, "/nodes")
            .json(&node)
            .send()
            .await
            .map_err(|e| Error::store_with_source("creating node", e))?;

        match response.status() {
            status if status.is_success() => response
                .json::<Node>()
                .await
                .map_err(|e| Error::store_with_source("decoding created node", e)),
            reqwest::StatusCode::CONFLICT => {
                let parent = node.parent.clone().unwrap_or_else(|| NodeId::new("?"));
                let actual = response
                    .json::<StateBody>()
                    .await
                    .map(|body| body.state)
                    .unwrap_or(NodeState::Closing);
                Err(Error::ParentClosed {
                    parent,
                    state: actual,
                })
            }
            status => Err(Error::store(format!("create returned {status}"))),
        }
    }

    async fn get(&self, id: &NodeId) -> Result<Option<Node>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/nodes/{id}"))
            .send()
            .await
            .map_err(|e| Error::store_with_source("fetching node", e))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<Node>()
                .await
                .map(Some)
                .map_err(|e| Error::store_with_source("decoding node", e)),
            status => Err(Error::store(format!("get returned {status}"))),
        }
    }

    async fn find(&self, filter: &NodeFilter) -> Result<Vec<Node>> {
        let response = self
            .request(reqwest::Method::GET, "/nodes")
            .query(&filter.to_query_pairs())
            .send()
            .await
            .map_err(|e| Error::store_with_source("listing nodes", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::store(format!("list returned {status}")));
        }
        response
            .json::<Vec<Node>>()
            .await
            .map_err(|e| Error::store_with_source("decoding node list", e))
    }

    async fn update(&self, node: &Node, expected_state: Option<NodeState>) -> Result<CasOutcome> {
        let mut builder = self
            .request(reqwest::Method::PATCH, &format!("/nodes/{}", node.id))
            .json(node);
        if let Some(expected) = expected_state {
            builder = builder.header("If-Match", expected.as_str());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::store_with_source("updating node", e))?;

        match response.status() {
            reqwest::StatusCode::PRECONDITION_FAILED => {
                let actual = response
                    .json::<StateBody>()
                    .await
                    .map(|body| body.state)
                    .unwrap_or(NodeState::Done);
                Ok(CasOutcome::StateMismatch { actual })
            }
            reqwest::StatusCode::NOT_FOUND => Err(Error::NodeNotFound {
                id: node.id.clone(),
            }),
            status if status.is_success() => response
                .json::<Node>()
                .await
                .map(CasOutcome::Updated)
                .map_err(|e| Error::store_with_source("decoding updated node", e)),
            status => Err(Error::store(format!("update returned {status}"))),
        }
    }
}

struct HttpSubscription {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
    sub_id: u64,
}

#[async_trait]
impl EventSubscription for HttpSubscription {
    async fn next(&mut self) -> Result<Option<NodeEvent>> {
        loop {
            let mut builder = self
                .client
                .get(format!("{}/listen/{}", self.base_url, self.sub_id));
            if let Some(token) = &self.token {
                builder = builder.bearer_auth(token);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| Error::bus(format!("listening for events: {e}")))?;

            match response.status() {
                // Long-poll window elapsed with nothing to deliver.
                reqwest::StatusCode::NO_CONTENT => continue,
                reqwest::StatusCode::NOT_FOUND => return Ok(None),
                status if status.is_success() => {
                    let event = response
                        .json::<NodeEvent>()
                        .await
                        .map_err(|e| Error::bus(format!("decoding event: {e}")))?;
                    return Ok(Some(event));
                }
                status => return Err(Error::bus(format!("listen returned {status}"))),
            }
        }
    }
}

#[async_trait]
impl EventBus for HttpStore {
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn EventSubscription>> {
        let response = self
            .request(reqwest::Method::POST, &format!("/subscribe/{channel}"))
            .send()
            .await
            .map_err(|e| Error::bus(format!("subscribing to {channel}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::bus(format!("subscribe returned {status}")));
        }
        let body = response
            .json::<SubscriptionBody>()
            .await
            .map_err(|e| Error::bus(format!("decoding subscription: {e}")))?;

        // Long polls idle until an event arrives; they get a wider window
        // than regular CRUD calls.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| Error::bus(format!("building listen client: {e}")))?;

        Ok(Box::new(HttpSubscription {
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            client,
            sub_id: body.id,
        }))
    }

    async fn publish(&self, channel: &str, event: &NodeEvent) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, &format!("/publish/{channel}"))
            .json(event)
            .send()
            .await
            .map_err(|e| Error::bus(format!("publishing to {channel}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::bus(format!("publish returned {status}")));
        }
        Ok(())
    }
}
