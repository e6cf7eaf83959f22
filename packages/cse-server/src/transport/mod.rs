//! Transport / routing domain.
//!
//! Keeps this node's own points of access and a map of peer CSE-ID to the
//! peer's points of access, and delivers requests through the client adapter
//! registered for each endpoint's URL scheme. Endpoints are tried in order:
//! a network failure moves on to the next endpoint, any protocol response
//! (success or error) ends the attempt.

pub mod adapter;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use cse_core::address::target_cse;
use cse_core::{CseError, CseResult, Request, ResourceType, Response};
use dashmap::DashMap;
use serde_json::Value;

pub use adapter::{scheme_of, ClientAdapter, TransportError};
pub use http::HttpClientAdapter;

use crate::service::domain::events::{DomainEvent, EventConsumer, EventKind};

/// Known reachability of a peer CSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub poa: Vec<String>,
    /// Resource name of the peer's CSE base.
    pub base_name: String,
    /// Configured at startup; survives deletion of the peer's RemoteCSE.
    pub pinned: bool,
}

struct TransportInner {
    own_poa: ArcSwap<Vec<String>>,
    peers: DashMap<String, PeerInfo>,
    adapters: HashMap<String, Arc<dyn ClientAdapter>>,
}

/// Cheap-clone handle to the routing tables and client adapters.
#[derive(Clone)]
pub struct TransportDomain {
    inner: Arc<TransportInner>,
}

impl TransportDomain {
    /// Builds the domain from its client adapters. A later adapter wins a
    /// scheme registered twice.
    #[must_use]
    pub fn new(adapters: Vec<Arc<dyn ClientAdapter>>) -> Self {
        let mut by_scheme: HashMap<String, Arc<dyn ClientAdapter>> = HashMap::new();
        for adapter in adapters {
            for scheme in adapter.schemes() {
                by_scheme.insert((*scheme).to_owned(), Arc::clone(&adapter));
            }
        }
        Self {
            inner: Arc::new(TransportInner {
                own_poa: ArcSwap::from_pointee(Vec::new()),
                peers: DashMap::new(),
                adapters: by_scheme,
            }),
        }
    }

    /// This node's own points of access.
    #[must_use]
    pub fn own_poa(&self) -> Vec<String> {
        self.inner.own_poa.load().as_ref().clone()
    }

    /// Replaces the own point-of-access list, e.g. after the listener bound.
    pub fn set_own_poa(&self, poa: Vec<String>) {
        tracing::info!(poa = ?poa, "points of access updated");
        self.inner.own_poa.store(Arc::new(poa));
    }

    /// Records (or refreshes) a peer. An empty `poa` keeps the known list.
    pub fn add_peer(&self, cse_id: &str, poa: Vec<String>, base_name: &str, pinned: bool) {
        let cse_id = cse_id.trim_start_matches('/').to_owned();
        let mut entry = self.inner.peers.entry(cse_id.clone()).or_insert_with(|| PeerInfo {
            poa: Vec::new(),
            base_name: base_name.to_owned(),
            pinned,
        });
        if !poa.is_empty() {
            entry.poa = poa;
        }
        if !base_name.is_empty() {
            entry.base_name = base_name.to_owned();
        }
        entry.pinned |= pinned;
        tracing::debug!(cse = %cse_id, poa = ?entry.poa, "peer known");
    }

    /// Forgets a peer unless it was configured at startup.
    pub fn remove_peer(&self, cse_id: &str) {
        let cse_id = cse_id.trim_start_matches('/');
        let removed = self
            .inner
            .peers
            .remove_if(cse_id, |_, info| !info.pinned)
            .is_some();
        if removed {
            tracing::debug!(cse = %cse_id, "peer forgotten");
        }
    }

    #[must_use]
    pub fn peer(&self, cse_id: &str) -> Option<PeerInfo> {
        self.inner
            .peers
            .get(cse_id.trim_start_matches('/'))
            .map(|entry| entry.clone())
    }

    #[must_use]
    pub fn is_peer(&self, cse_id: &str) -> bool {
        self.inner.peers.contains_key(cse_id.trim_start_matches('/'))
    }

    /// Sends `request` to the CSE named by its target address.
    ///
    /// # Errors
    ///
    /// `BadRequest` when the target names no CSE, `TargetNotReachable` when
    /// the CSE is unknown or none of its endpoints answers.
    pub async fn send(&self, request: &Request) -> CseResult<Response> {
        let cse_id = target_cse(&request.to)
            .ok_or_else(|| CseError::BadRequest(format!("{} names no CSE", request.to)))?;
        let peer = self
            .peer(&cse_id)
            .ok_or_else(|| CseError::TargetNotReachable(format!("unknown CSE {cse_id}")))?;
        self.try_endpoints(request, &peer.poa).await
    }

    /// Sends `request` to an explicit endpoint list with the same retry
    /// strategy as [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// `TargetNotReachable` when no endpoint answers.
    pub async fn send_notify(&self, request: &Request, endpoints: &[String]) -> CseResult<Response> {
        self.try_endpoints(request, endpoints).await
    }

    async fn try_endpoints(&self, request: &Request, endpoints: &[String]) -> CseResult<Response> {
        for endpoint in endpoints {
            let adapter = scheme_of(endpoint).and_then(|s| self.inner.adapters.get(&s).cloned());
            let Some(adapter) = adapter else {
                tracing::warn!(endpoint = %endpoint, "no client adapter for endpoint");
                continue;
            };
            match adapter.send(endpoint, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    tracing::warn!(
                        rqi = %request.request_identifier,
                        endpoint = %endpoint,
                        error = %e,
                        "endpoint failed, trying next"
                    );
                }
            }
        }
        Err(CseError::TargetNotReachable(format!(
            "{} unreachable on {} endpoint(s)",
            request.to,
            endpoints.len()
        )))
    }
}

/// Turns a non-success response into the matching error.
///
/// # Errors
///
/// Returns [`CseError::Remote`] carrying the peer's status and debug message.
pub fn expect_success(response: Response) -> CseResult<Response> {
    if response.is_success() {
        return Ok(response);
    }
    let message = response
        .content
        .as_ref()
        .and_then(|c| c.get("m2m:dbg"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    Err(CseError::Remote {
        status: response.status,
        message,
    })
}

fn base_name_of(cse_base: &str) -> String {
    cse_base
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or_default()
        .to_owned()
}

#[async_trait]
impl EventConsumer for TransportDomain {
    fn name(&self) -> &'static str {
        "transport"
    }

    fn accepts(&self, resource_type: ResourceType) -> bool {
        resource_type == ResourceType::RemoteCse
    }

    async fn on_event(&self, event: &DomainEvent) {
        let csr = &event.resource;
        let Some(csi) = csr.attr_str("csi") else {
            return;
        };
        match event.kind {
            EventKind::Created | EventKind::Updated => {
                let base = csr.attr_str("cb").map(base_name_of).unwrap_or_default();
                self.add_peer(csi, csr.attr_list("poa"), &base, false);
            }
            EventKind::Deleted => self.remove_peer(csi),
        }
    }
}

#[cfg(test)]
mod tests {
    use cse_core::ResponseStatusCode;
    use serde_json::json;

    use super::*;
    use crate::testing::RecordingAdapter;

    fn domain(adapter: &Arc<RecordingAdapter>) -> TransportDomain {
        TransportDomain::new(vec![adapter.clone() as Arc<dyn ClientAdapter>])
    }

    #[tokio::test]
    async fn send_tries_endpoints_in_order_until_one_answers() {
        let adapter = RecordingAdapter::with(|endpoint, req| {
            if endpoint.contains("dead") {
                Err(TransportError::Unreachable {
                    endpoint: endpoint.to_owned(),
                    reason: "connection refused".into(),
                })
            } else {
                Ok(Response::new(ResponseStatusCode::Ok, req, None))
            }
        });
        let transport = domain(&adapter);
        transport.add_peer(
            "/in-cse",
            vec!["mock://dead".into(), "mock://alive".into(), "mock://spare".into()],
            "onem2m",
            true,
        );

        let resp = transport
            .send(&Request::retrieve("/in-cse/onem2m", "/mn-cse-1"))
            .await
            .unwrap();
        assert_eq!(resp.status, ResponseStatusCode::Ok);
        let endpoints: Vec<_> = adapter.calls().into_iter().map(|(e, _)| e).collect();
        assert_eq!(endpoints, vec!["mock://dead", "mock://alive"]);
    }

    #[tokio::test]
    async fn protocol_errors_are_returned_without_retry() {
        let adapter =
            RecordingAdapter::with(|_, req| Ok(Response::new(ResponseStatusCode::NotFound, req, None)));
        let transport = domain(&adapter);
        transport.add_peer("in-cse", vec!["mock://a".into(), "mock://b".into()], "onem2m", true);

        let resp = transport
            .send(&Request::retrieve("/in-cse/onem2m/x", "/mn-cse-1"))
            .await
            .unwrap();
        assert_eq!(resp.status, ResponseStatusCode::NotFound);
        assert_eq!(adapter.calls().len(), 1);
        assert!(expect_success(resp).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn exhausted_endpoints_are_unreachable() {
        let adapter = RecordingAdapter::with(|endpoint, _| {
            Err(TransportError::Unreachable {
                endpoint: endpoint.to_owned(),
                reason: "timeout".into(),
            })
        });
        let transport = domain(&adapter);
        let err = transport
            .send_notify(
                &Request::notify("Cae", "/mn-cse-1", json!({})),
                &["mock://a".into(), "ftp://unsupported".into()],
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), ResponseStatusCode::TargetNotReachable);
        assert_eq!(adapter.calls().len(), 1);

        let err = transport
            .send(&Request::retrieve("/nobody/base", "/mn-cse-1"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), ResponseStatusCode::TargetNotReachable);
    }

    #[tokio::test]
    async fn remote_cse_events_maintain_peer_table() {
        let adapter = RecordingAdapter::ok();
        let transport = domain(&adapter);
        let mut csr = cse_core::Resource::new(ResourceType::RemoteCse, cse_core::time::now());
        csr.set_attr("csi", "/asn-cse");
        csr.set_attr("cb", "/asn-cse/asn");
        csr.set_attr("poa", json!(["mock://asn:8000"]));
        let req = Arc::new(Request::create("onem2m", "/asn-cse", ResourceType::RemoteCse, json!({})));

        transport
            .on_event(&DomainEvent::new(EventKind::Created, csr.clone(), req.clone()))
            .await;
        let peer = transport.peer("asn-cse").unwrap();
        assert_eq!(peer.poa, vec!["mock://asn:8000"]);
        assert_eq!(peer.base_name, "asn");

        transport
            .on_event(&DomainEvent::new(EventKind::Deleted, csr, req))
            .await;
        assert!(transport.peer("asn-cse").is_none());
    }

    #[test]
    fn pinned_peers_survive_removal() {
        let transport = TransportDomain::new(Vec::new());
        transport.add_peer("in-cse", vec!["http://in:8000".into()], "onem2m", true);
        transport.remove_peer("/in-cse");
        assert!(transport.is_peer("in-cse"));
    }
}
