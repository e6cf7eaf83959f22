//! Registration with the configured peer CSEs.
//!
//! One task per peer: create this node's RemoteCSE on the peer (an existing
//! one is accepted), create the peer's RemoteCSE locally, then keep the
//! remote registration alive by pushing its expiration time forward every
//! refresh interval. A lost registration is redone at once; an unreachable
//! peer is retried after the configured backoff.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use cse_core::{
    time, CseError, CseResult, Request, ResourceType, Response, ResponseStatusCode,
};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinHandle;

use super::MethodDomain;
use crate::service::config::{CseConfig, RemoteCseConfig};
use crate::service::operation::service_names;
use crate::service::registry::{ManagedService, ServiceContext};
use crate::transport::expect_success;

/// Managed service owning one registration task per configured peer.
pub struct RegistrationService {
    domain: MethodDomain,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RegistrationService {
    #[must_use]
    pub fn new(domain: MethodDomain) -> Self {
        Self {
            domain,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

/// Address of this node's RemoteCSE on `peer`.
fn remote_registration(peer: &RemoteCseConfig, own_cse_id: &str) -> String {
    format!("/{}/{}/{}", peer.cse_id, peer.base_name, own_cse_id)
}

fn refreshed_expiration(config: &CseConfig) -> String {
    let lifetime = config.refresh_interval_ms.saturating_add(config.refresh_offset_ms);
    let lifetime = ChronoDuration::milliseconds(i64::try_from(lifetime).unwrap_or(i64::MAX / 1_000_000));
    time::format(time::now() + lifetime)
}

fn accepts_existing(resp: Response) -> CseResult<()> {
    match resp.status {
        ResponseStatusCode::Conflict | ResponseStatusCode::AlreadyExists => Ok(()),
        _ => expect_success(resp).map(|_| ()),
    }
}

/// Creates this node's RemoteCSE on the peer and the peer's RemoteCSE here.
async fn register(domain: &MethodDomain, peer: &RemoteCseConfig) -> CseResult<()> {
    let core = domain.core();
    let identity = &core.identity;
    let own_id = identity.sp_relative_id();

    let remote = Request::create(
        format!("/{}/{}", peer.cse_id, peer.base_name),
        own_id.clone(),
        ResourceType::RemoteCse,
        json!({
            "m2m:csr": {
                "csi": own_id,
                "cb": identity.qualify(&identity.base_name),
                "cst": core.config.cse_type.code(),
                "poa": core.transport.own_poa(),
                "rr": true,
                "et": refreshed_expiration(&core.config),
            }
        }),
    );
    accepts_existing(core.transport.send(&remote).await?)?;

    let local = Request::create(
        identity.base_name.clone(),
        own_id,
        ResourceType::RemoteCse,
        json!({
            "m2m:csr": {
                "csi": format!("/{}", peer.cse_id),
                "cb": format!("/{}/{}", peer.cse_id, peer.base_name),
                "poa": peer.poa,
                "rr": true,
            }
        }),
    )
    .internal();
    match domain.process(local).await {
        Ok(resp) => accepts_existing(resp),
        Err(CseError::Conflict(_) | CseError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn refresh(domain: &MethodDomain, peer: &RemoteCseConfig) -> CseResult<()> {
    let core = domain.core();
    let req = Request::update(
        remote_registration(peer, &core.identity.cse_id),
        core.identity.sp_relative_id(),
        json!({
            "m2m:csr": {
                "et": refreshed_expiration(&core.config),
                "poa": core.transport.own_poa(),
            }
        }),
    );
    core.transport.send(&req).await.and_then(expect_success)?;
    Ok(())
}

async fn maintain(domain: MethodDomain, peer: RemoteCseConfig) {
    let config = std::sync::Arc::clone(&domain.core().config);
    let interval = Duration::from_millis(config.refresh_interval_ms);
    let backoff = Duration::from_millis(config.registration_retry_backoff_ms);

    loop {
        if let Err(e) = register(&domain, &peer).await {
            tracing::warn!(peer = %peer.cse_id, error = %e, "registration failed, retrying after backoff");
            tokio::time::sleep(backoff).await;
            continue;
        }
        tracing::info!(peer = %peer.cse_id, "registered with peer CSE");

        loop {
            tokio::time::sleep(interval).await;
            match refresh(&domain, &peer).await {
                Ok(()) => tracing::debug!(peer = %peer.cse_id, "registration refreshed"),
                Err(e) if e.is_not_found() => {
                    tracing::info!(peer = %peer.cse_id, "registration lost, registering again");
                    break;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer.cse_id, error = %e, "registration refresh failed, retrying after backoff");
                    tokio::time::sleep(backoff).await;
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ManagedService for RegistrationService {
    fn name(&self) -> &'static str {
        service_names::REGISTRATION
    }

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let transport = &self.domain.core().transport;
        let mut tasks = self.tasks.lock();
        for peer in &ctx.config.remote_cses {
            transport.add_peer(&peer.cse_id, peer.poa.clone(), &peer.base_name, true);
            tasks.push(tokio::spawn(maintain(self.domain.clone(), peer.clone())));
        }
        Ok(())
    }

    async fn shutdown(&self, terminate: bool) -> anyhow::Result<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        if terminate {
            return Ok(());
        }

        let core = self.domain.core();
        let deregistrations = core.config.remote_cses.iter().map(|peer| async move {
            let req = Request::delete(
                remote_registration(peer, &core.identity.cse_id),
                core.identity.sp_relative_id(),
            );
            match core.transport.send(&req).await.and_then(expect_success) {
                Ok(_) => tracing::info!(peer = %peer.cse_id, "deregistered from peer CSE"),
                Err(e) => tracing::warn!(peer = %peer.cse_id, error = %e, "deregistration failed"),
            }
        });
        join_all(deregistrations).await;
        Ok(())
    }
}
