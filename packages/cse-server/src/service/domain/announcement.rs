//! Announcement engine: mirrors announceable resources onto the CSEs listed
//! in their `at` attribute.
//!
//! A shadow per announced resource remembers the attributes last pushed and
//! where each mirror lives. A change of `at` is diffed against the shadow:
//! mirrors are created on added CSEs and deleted on removed ones, and CSEs
//! that could not be reached are dropped from `at` again. Any other change
//! to labels, expiration or policies is pushed as a partial update.
//!
//! Mirror traffic never runs on the event dispatcher. Events are queued per
//! announced resource and each queue is drained by its own task, so the
//! changes of one resource reach its mirrors in order while a slow peer
//! holds up nothing but that resource.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cse_core::{time, CseError, CseResult, Request, Resource, ResourceType, Response, ResponseStatusCode};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use futures_util::future::{join, join_all};
use serde_json::{json, Map, Value};

use super::events::{DomainEvent, EventConsumer, EventKind};
use super::MethodDomain;
use crate::transport::expect_success;

/// Attributes carried over to mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Snapshot {
    labels: Vec<String>,
    expiration_time: Option<DateTime<Utc>>,
    acpi: Vec<String>,
}

impl Snapshot {
    fn of(resource: &Resource) -> Self {
        Self {
            labels: resource.labels.clone(),
            expiration_time: resource.expiration_time,
            acpi: resource.acpi(),
        }
    }
}

#[derive(Debug, Default)]
struct Shadow {
    snapshot: Snapshot,
    /// Peer CSE-ID to the address of the mirror there.
    mirrors: HashMap<String, String>,
}

/// Pending events of one resource and the generation of the task draining them.
struct Queue {
    generation: u64,
    tx: mpsc::UnboundedSender<DomainEvent>,
}

/// Event consumer maintaining announced mirrors.
pub struct AnnouncementEngine {
    announcer: Arc<Announcer>,
}

struct Announcer {
    domain: MethodDomain,
    shadows: DashMap<String, Shadow>,
    queues: DashMap<String, Queue>,
    generations: AtomicU64,
}

impl AnnouncementEngine {
    #[must_use]
    pub fn new(domain: MethodDomain) -> Self {
        Self {
            announcer: Arc::new(Announcer {
                domain,
                shadows: DashMap::new(),
                queues: DashMap::new(),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Address of the mirror of `resource_id` on `cse_id`, if one exists.
    #[must_use]
    pub fn mirror_of(&self, resource_id: &str, cse_id: &str) -> Option<String> {
        self.announcer.mirror_of(resource_id, cse_id)
    }

    /// Resources with mirror work queued or running.
    #[must_use]
    pub fn busy(&self) -> usize {
        self.announcer.queues.len()
    }

    /// Appends `event` to its resource's queue, starting a drain task when
    /// none is running.
    fn enqueue(&self, event: DomainEvent) {
        let announcer = &self.announcer;
        let ri = event.resource.resource_id.clone();
        let event = match announcer.queues.entry(ri.clone()) {
            Entry::Occupied(slot) => match slot.get().tx.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => {
                    slot.remove();
                    event
                }
            },
            Entry::Vacant(_) => event,
        };

        let generation = announcer.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(event).is_err() {
            return;
        }
        announcer.queues.insert(ri.clone(), Queue { generation, tx });
        tokio::spawn(Arc::clone(announcer).drain(ri, generation, rx));
    }
}

impl Announcer {
    fn mirror_of(&self, resource_id: &str, cse_id: &str) -> Option<String> {
        self.shadows
            .get(resource_id)
            .and_then(|shadow| shadow.mirrors.get(cse_id).cloned())
    }

    /// Applies queued events of `ri` in order. The queue entry is removed
    /// under the map's lock only once the channel is empty, so an event
    /// enqueued concurrently is never stranded.
    async fn drain(self: Arc<Self>, ri: String, generation: u64, mut rx: mpsc::UnboundedReceiver<DomainEvent>) {
        loop {
            while let Ok(event) = rx.try_recv() {
                self.apply(&event).await;
            }
            let idle = self
                .queues
                .remove_if(&ri, |_, queue| queue.generation == generation && rx.is_empty())
                .is_some();
            if idle {
                return;
            }
            match rx.recv().await {
                Some(event) => self.apply(&event).await,
                None => return,
            }
        }
    }

    async fn apply(&self, event: &DomainEvent) {
        match event.kind {
            EventKind::Created | EventKind::Updated => self.sync(&event.resource).await,
            EventKind::Deleted => self.teardown(&event.resource).await,
        }
    }

    /// `at` entries as bare CSE-IDs, without duplicates or this node.
    fn announce_targets(&self, resource: &Resource) -> Vec<String> {
        let own = &self.domain.core().identity.cse_id;
        let mut targets: Vec<String> = Vec::new();
        for entry in resource.announce_to() {
            let id = entry.trim_start_matches('/').to_owned();
            if !id.is_empty() && id != *own && !targets.contains(&id) {
                targets.push(id);
            }
        }
        targets
    }

    async fn sync(&self, resource: &Resource) {
        let targets = self.announce_targets(resource);
        let (known, snapshot) = match self.shadows.get(&resource.resource_id) {
            Some(shadow) => (shadow.mirrors.clone(), shadow.snapshot.clone()),
            None if targets.is_empty() => return,
            None => (HashMap::new(), Snapshot::default()),
        };

        let added: Vec<&String> = targets.iter().filter(|t| !known.contains_key(*t)).collect();
        let removed: Vec<(&String, &String)> =
            known.iter().filter(|(cse, _)| !targets.contains(*cse)).collect();
        let current = Snapshot::of(resource);

        if added.is_empty() && removed.is_empty() {
            if current != snapshot {
                let updates = known
                    .iter()
                    .map(|(cse, mirror)| self.update_mirror(cse, mirror, resource));
                join_all(updates).await;
            }
            if let Some(mut shadow) = self.shadows.get_mut(&resource.resource_id) {
                shadow.snapshot = current;
            }
            return;
        }

        let creates = join_all(added.iter().map(|cse| self.create_mirror(cse, resource)));
        let deletes = join_all(removed.iter().map(|(cse, mirror)| self.delete_mirror(cse, mirror)));
        let (created, _) = join(creates, deletes).await;

        let mut mirrors: HashMap<String, String> = known
            .into_iter()
            .filter(|(cse, _)| targets.contains(cse))
            .collect();
        let mut failed: Vec<&str> = Vec::new();
        for (cse, result) in added.iter().zip(created) {
            match result {
                Ok(address) => {
                    mirrors.insert((*cse).clone(), address);
                }
                Err(e) => {
                    tracing::warn!(ri = %resource.resource_id, cse = %cse, error = %e, "announcement failed, dropping CSE");
                    failed.push(cse.as_str());
                }
            }
        }

        if mirrors.is_empty() {
            self.shadows.remove(&resource.resource_id);
        } else {
            self.shadows.insert(
                resource.resource_id.clone(),
                Shadow {
                    snapshot: current,
                    mirrors,
                },
            );
        }

        if !failed.is_empty() {
            let kept: Vec<&String> = targets.iter().filter(|t| !failed.contains(&t.as_str())).collect();
            self.rewrite_announce_to(resource, &kept).await;
        }
    }

    async fn teardown(&self, resource: &Resource) {
        let Some((_, shadow)) = self.shadows.remove(&resource.resource_id) else {
            return;
        };
        let deletes = shadow
            .mirrors
            .iter()
            .map(|(cse, mirror)| self.delete_mirror(cse, mirror));
        join_all(deletes).await;
        tracing::debug!(ri = %resource.resource_id, mirrors = shadow.mirrors.len(), "announcements withdrawn");
    }

    /// Where the mirror goes on `cse_id`: below the parent's mirror when the
    /// parent is announced there too, otherwise below this node's RemoteCSE.
    fn mirror_parent(&self, cse_id: &str, resource: &Resource) -> String {
        if let Some(parent_mirror) = resource
            .parent_id
            .as_deref()
            .and_then(|parent| self.mirror_of(parent, cse_id))
        {
            return parent_mirror;
        }
        let core = self.domain.core();
        let base = core
            .transport
            .peer(cse_id)
            .map(|peer| peer.base_name)
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| core.config.cse_base_name.clone());
        format!("/{cse_id}/{base}/{}", core.identity.cse_id)
    }

    fn mirror_content(&self, resource: &Resource, with_identity: bool) -> CseResult<Value> {
        let identity = &self.domain.core().identity;
        let announced = resource.resource_type.announced().ok_or_else(|| {
            CseError::BadRequest(format!("{} is not announceable", resource.resource_type))
        })?;
        let mut attrs = Map::new();
        if with_identity {
            attrs.insert("rn".into(), Value::from(format!("{}Annc", resource.resource_id)));
            attrs.insert("lnk".into(), Value::from(identity.qualify(&resource.resource_id)));
        }
        attrs.insert("lbl".into(), json!(resource.labels));
        if let Some(et) = resource.expiration_time {
            attrs.insert("et".into(), Value::from(time::format(et)));
        }
        let acpi: Vec<String> = resource.acpi().iter().map(|id| identity.qualify(id)).collect();
        if !acpi.is_empty() || !with_identity {
            attrs.insert("acpi".into(), json!(acpi));
        }
        let mut root = Map::new();
        root.insert(announced.root_key(), Value::Object(attrs));
        Ok(Value::Object(root))
    }

    async fn create_mirror(&self, cse_id: &str, resource: &Resource) -> CseResult<String> {
        let core = self.domain.core();
        let parent = self.mirror_parent(cse_id, resource);
        let content = self.mirror_content(resource, true)?;
        let rn = format!("{}Annc", resource.resource_id);
        let ty = resource.resource_type.announced().ok_or_else(|| {
            CseError::BadRequest(format!("{} is not announceable", resource.resource_type))
        })?;
        let req = Request::create(parent.clone(), core.identity.sp_relative_id(), ty, content);

        let resp = core.transport.send(&req).await?;
        if matches!(
            resp.status,
            ResponseStatusCode::Conflict | ResponseStatusCode::AlreadyExists
        ) {
            tracing::debug!(cse = %cse_id, rn = %rn, "mirror already present");
            return Ok(format!("{parent}/{rn}"));
        }
        let resp = expect_success(resp)?;
        tracing::debug!(ri = %resource.resource_id, cse = %cse_id, "resource announced");
        Ok(mirror_address(&resp, cse_id).unwrap_or_else(|| format!("{parent}/{rn}")))
    }

    async fn update_mirror(&self, cse_id: &str, mirror: &str, resource: &Resource) {
        let core = self.domain.core();
        let result = match self.mirror_content(resource, false) {
            Ok(content) => {
                let req = Request::update(mirror, core.identity.sp_relative_id(), content);
                core.transport.send(&req).await.and_then(expect_success)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!(cse = %cse_id, mirror = %mirror, error = %e, "mirror update failed");
        }
    }

    async fn delete_mirror(&self, cse_id: &str, mirror: &str) -> CseResult<()> {
        let core = self.domain.core();
        let req = Request::delete(mirror, core.identity.sp_relative_id());
        match core.transport.send(&req).await.and_then(expect_success) {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                tracing::warn!(cse = %cse_id, mirror = %mirror, error = %e, "mirror delete failed");
                Err(e)
            }
        }
    }

    async fn rewrite_announce_to(&self, resource: &Resource, kept: &[&String]) {
        let core = self.domain.core();
        let mut attrs = Map::new();
        attrs.insert("at".into(), json!(kept));
        let mut root = Map::new();
        root.insert(resource.resource_type.root_key(), Value::Object(attrs));
        let req = Request::update(
            resource.resource_id.clone(),
            core.identity.sp_relative_id(),
            Value::Object(root),
        )
        .internal();
        if let Err(e) = self.domain.process(req).await {
            tracing::warn!(ri = %resource.resource_id, error = %e, "could not rewrite announceTo");
        }
    }
}

/// `/{cse}/{ri}` from a create response that carries the new resource.
fn mirror_address(resp: &Response, cse_id: &str) -> Option<String> {
    let ri = resp.resource_attributes()?.get("ri")?.as_str()?;
    Some(format!("/{cse_id}/{ri}"))
}

#[async_trait]
impl EventConsumer for AnnouncementEngine {
    fn name(&self) -> &'static str {
        "announcement"
    }

    fn accepts(&self, resource_type: ResourceType) -> bool {
        resource_type.announced().is_some()
    }

    async fn on_event(&self, event: &DomainEvent) {
        if event.kind != EventKind::Deleted && event.child_type.is_some() {
            return;
        }
        self.enqueue(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cse_core::Operation;

    use super::*;
    use crate::service::config::CseConfig;
    use crate::testing::{RecordingAdapter, TestNode};
    use crate::transport::{ClientAdapter, TransportError};

    /// Peer on the `slow` scheme that answers only after a long pause.
    struct Stalled;

    #[async_trait]
    impl ClientAdapter for Stalled {
        fn schemes(&self) -> &[&'static str] {
            &["slow"]
        }

        async fn send(&self, _endpoint: &str, request: &Request) -> Result<Response, TransportError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Response::new(ResponseStatusCode::Created, request, None))
        }
    }

    fn announced_node_adapter() -> std::sync::Arc<crate::testing::RecordingAdapter> {
        crate::testing::RecordingAdapter::with(|endpoint, req| {
            if endpoint.starts_with("mock://dead") {
                return Err(TransportError::Unreachable {
                    endpoint: endpoint.to_owned(),
                    reason: "refused".into(),
                });
            }
            let status = match req.operation {
                Operation::Create => ResponseStatusCode::Created,
                Operation::Update => ResponseStatusCode::Updated,
                Operation::Delete => ResponseStatusCode::Deleted,
                _ => ResponseStatusCode::Ok,
            };
            Ok(Response::new(status, req, None))
        })
    }

    async fn node_with_peers() -> TestNode {
        let node = TestNode::with_adapter(announced_node_adapter()).await;
        let transport = &node.domain.core().transport;
        transport.add_peer("in-cse", vec!["mock://in".into()], "onem2m", true);
        transport.add_peer("dead-cse", vec!["mock://dead".into()], "onem2m", true);
        node
    }

    #[tokio::test]
    async fn announce_update_and_withdraw() {
        let node = node_with_peers().await;
        let resp = node
            .request(Request::create(
                "onem2m",
                "Cann",
                ResourceType::Ae,
                json!({"m2m:ae": {"rn": "app", "api": "a", "at": ["/in-cse"]}}),
            ))
            .await;
        assert_eq!(resp.status, ResponseStatusCode::Created);

        let creates = node.adapter.wait_for(Operation::Create, 1).await;
        let (endpoint, create) = &creates[0];
        assert_eq!(endpoint, "mock://in");
        assert_eq!(create.to, "/in-cse/onem2m/mn-cse-1");
        assert_eq!(create.resource_type, Some(ResourceType::AeAnnc));
        let body = &create.content.as_ref().unwrap()["m2m:aeA"];
        assert_eq!(body["rn"], "CannAnnc");
        assert_eq!(body["lnk"], "/mn-cse-1/Cann");
        node.settle().await;
        assert_eq!(
            node.announcements.mirror_of("Cann", "in-cse").as_deref(),
            Some("/in-cse/onem2m/mn-cse-1/CannAnnc")
        );

        node.request(Request::update("onem2m/app", "Cann", json!({"m2m:ae": {"lbl": ["k"]}})))
            .await;
        let updates = node.adapter.wait_for(Operation::Update, 1).await;
        assert_eq!(updates[0].1.to, "/in-cse/onem2m/mn-cse-1/CannAnnc");
        assert_eq!(updates[0].1.content.as_ref().unwrap()["m2m:aeA"]["lbl"], json!(["k"]));

        node.request(Request::delete("onem2m/app", "Cann")).await;
        let deletes = node.adapter.wait_for(Operation::Delete, 1).await;
        assert_eq!(deletes[0].1.to, "/in-cse/onem2m/mn-cse-1/CannAnnc");
        node.settle().await;
        assert!(node.announcements.mirror_of("Cann", "in-cse").is_none());
    }

    #[tokio::test]
    async fn unreachable_cses_are_dropped_from_announce_to() {
        let node = node_with_peers().await;
        node.request(Request::create(
            "onem2m",
            "Cann",
            ResourceType::Ae,
            json!({"m2m:ae": {"rn": "app", "api": "a", "at": ["/in-cse", "/dead-cse"]}}),
        ))
        .await;
        node.adapter.wait_for(Operation::Create, 2).await;

        let mut at = Vec::new();
        for _ in 0..50 {
            node.settle().await;
            let resp = node.request(Request::retrieve("onem2m/app", "Cann")).await;
            at = resp.resource_attributes().unwrap()["at"].as_array().unwrap().clone();
            if at.len() == 1 {
                break;
            }
        }
        assert_eq!(at, vec![json!("in-cse")]);
        assert!(node.announcements.mirror_of("Cann", "dead-cse").is_none());
        assert!(node.announcements.mirror_of("Cann", "in-cse").is_some());
    }

    #[tokio::test]
    async fn a_stalled_peer_holds_up_only_its_own_resource() {
        let node = TestNode::build_with(
            CseConfig::default(),
            RecordingAdapter::ok(),
            vec![Arc::new(Stalled)],
            Vec::new(),
        )
        .await;
        node.domain
            .core()
            .transport
            .add_peer("slow-cse", vec!["slow://peer".into()], "onem2m", true);
        node.create_container("onem2m", "box").await;
        let resp = node
            .request(Request::create(
                "onem2m/box",
                "Cowner",
                ResourceType::Subscription,
                json!({"m2m:sub": {"nu": ["mock://n"]}}),
            ))
            .await;
        assert_eq!(resp.status, ResponseStatusCode::Created);

        let resp = node
            .request(Request::create(
                "onem2m",
                "Cann",
                ResourceType::Ae,
                json!({"m2m:ae": {"rn": "app", "api": "a", "at": ["/slow-cse"]}}),
            ))
            .await;
        assert_eq!(resp.status, ResponseStatusCode::Created);
        node.settle().await;
        assert_eq!(node.announcements.busy(), 1);

        node.request(Request::update("onem2m/box", "Cowner", json!({"m2m:cnt": {"lbl": ["x"]}})))
            .await;
        let notified = node.adapter.wait_for(Operation::Notify, 1).await;
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].0, "mock://n");
        assert_eq!(node.announcements.busy(), 1);
    }
}
