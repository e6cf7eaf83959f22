//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cse_core::{CseResult, Operation, Request, Resource, ResourceType, Response, ResponseStatusCode};
use parking_lot::Mutex;
use serde_json::json;

use crate::node::CseNode;
use crate::service::config::CseConfig;
use crate::service::domain::announcement::AnnouncementEngine;
use crate::service::domain::events::EventConsumer;
use crate::service::domain::expiration::RefreshEngine;
use crate::service::domain::notification::NotificationEngine;
use crate::service::domain::MethodDomain;
use crate::storage::{Database, MemoryDb};
use crate::transport::{ClientAdapter, TransportError};

// ---------------------------------------------------------------------------
// TestNode
// ---------------------------------------------------------------------------

/// A started node on an in-memory database with a recording `mock` adapter.
pub(crate) struct TestNode {
    pub(crate) domain: MethodDomain,
    pub(crate) adapter: Arc<RecordingAdapter>,
    pub(crate) db: MemoryDb,
    pub(crate) notifications: Arc<NotificationEngine>,
    pub(crate) announcements: Arc<AnnouncementEngine>,
    pub(crate) refresher: Arc<RefreshEngine>,
    node: CseNode,
}

impl TestNode {
    pub(crate) async fn start() -> Self {
        Self::build(CseConfig::default(), RecordingAdapter::ok(), Vec::new()).await
    }

    pub(crate) async fn with_config(config: CseConfig) -> Self {
        Self::build(config, RecordingAdapter::ok(), Vec::new()).await
    }

    pub(crate) async fn with_adapter(adapter: Arc<RecordingAdapter>) -> Self {
        Self::build(CseConfig::default(), adapter, Vec::new()).await
    }

    pub(crate) async fn build(
        config: CseConfig,
        adapter: Arc<RecordingAdapter>,
        consumers: Vec<Arc<dyn EventConsumer>>,
    ) -> Self {
        Self::build_with(config, adapter, Vec::new(), consumers).await
    }

    /// Like [`build`](Self::build), with further adapters for other schemes.
    pub(crate) async fn build_with(
        config: CseConfig,
        adapter: Arc<RecordingAdapter>,
        extra_adapters: Vec<Arc<dyn ClientAdapter>>,
        consumers: Vec<Arc<dyn EventConsumer>>,
    ) -> Self {
        let db = MemoryDb::new();
        let mut builder = CseNode::builder(config)
            .database(Arc::new(db.clone()))
            .adapter(adapter.clone())
            .own_poa(vec!["mock://self".into()]);
        for extra in extra_adapters {
            builder = builder.adapter(extra);
        }
        for consumer in consumers {
            builder = builder.consumer(consumer);
        }
        let node = builder.start().await.unwrap();
        Self {
            domain: node.domain().clone(),
            notifications: Arc::clone(node.notifications()),
            announcements: Arc::clone(node.announcements()),
            refresher: Arc::clone(node.refresher()),
            adapter,
            db,
            node,
        }
    }

    /// Runs `req` through the Method Domain.
    pub(crate) async fn request(&self, req: Request) -> Response {
        self.domain.handle(req).await
    }

    /// Reads a committed resource directly from storage.
    pub(crate) async fn get(&self, path_or_id: &str) -> CseResult<Resource> {
        let session = self.db.begin().await?;
        let found = session.get(path_or_id).await;
        session.rollback().await?;
        found
    }

    pub(crate) async fn create_container(&self, parent: &str, name: &str) -> Response {
        let resp = self
            .request(Request::create(
                parent,
                "Cadmin",
                ResourceType::Container,
                json!({"m2m:cnt": {"rn": name}}),
            ))
            .await;
        assert_eq!(resp.status, ResponseStatusCode::Created, "{:?}", resp.content);
        resp
    }

    pub(crate) async fn create_instance(&self, parent: &str, content: &str) -> Response {
        let resp = self
            .request(Request::create(
                parent,
                "Cadmin",
                ResourceType::ContentInstance,
                json!({"m2m:cin": {"con": content}}),
            ))
            .await;
        assert_eq!(resp.status, ResponseStatusCode::Created, "{:?}", resp.content);
        resp
    }

    /// Gives the event dispatcher time to drain.
    pub(crate) async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    pub(crate) async fn stop(&mut self, terminate: bool) {
        self.node.stop(terminate).await;
    }
}

// ---------------------------------------------------------------------------
// RecordingAdapter
// ---------------------------------------------------------------------------

type Responder = dyn Fn(&str, &Request) -> Result<Response, TransportError> + Send + Sync;

/// Client adapter for the `mock` scheme that records every call and answers
/// through a configurable responder.
pub(crate) struct RecordingAdapter {
    calls: Mutex<Vec<(String, Request)>>,
    responder: Box<Responder>,
}

impl RecordingAdapter {
    /// Answers every request with the operation's success code.
    pub(crate) fn ok() -> Arc<Self> {
        Self::with(|_, req| {
            let status = match req.operation {
                Operation::Create => ResponseStatusCode::Created,
                Operation::Update => ResponseStatusCode::Updated,
                Operation::Delete => ResponseStatusCode::Deleted,
                Operation::Retrieve | Operation::Notify => ResponseStatusCode::Ok,
            };
            Ok(Response::new(status, req, None))
        })
    }

    pub(crate) fn with(
        responder: impl Fn(&str, &Request) -> Result<Response, TransportError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    pub(crate) fn calls(&self) -> Vec<(String, Request)> {
        self.calls.lock().clone()
    }

    pub(crate) fn calls_for(&self, op: Operation) -> Vec<(String, Request)> {
        self.calls()
            .into_iter()
            .filter(|(_, req)| req.operation == op)
            .collect()
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Polls until at least `count` calls of `op` were recorded, or two
    /// seconds passed; returns what was recorded.
    pub(crate) async fn wait_for(&self, op: Operation, count: usize) -> Vec<(String, Request)> {
        for _ in 0..200 {
            let calls = self.calls_for(op);
            if calls.len() >= count {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.calls_for(op)
    }
}

#[async_trait]
impl ClientAdapter for RecordingAdapter {
    fn schemes(&self) -> &[&'static str] {
        &["mock"]
    }

    async fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError> {
        self.calls
            .lock()
            .push((endpoint.to_owned(), request.clone()));
        (self.responder)(endpoint, request)
    }
}
