//! Expiration handling.
//!
//! [`ExpirationSweeper`] runs on a background worker and deletes every
//! resource whose expiration time has passed, through the Method Domain so
//! that the usual events fire. [`RefreshEngine`] keeps the resources this
//! node created for itself alive: each gets a timer that pushes its
//! expiration time forward every refresh interval and recreates the resource
//! if it has disappeared behind the node's back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cse_core::address::split_last;
use cse_core::schema::AccessClass;
use cse_core::{schema_for, time, CseResult, Request, Resource, ResourceType};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use super::events::{DomainEvent, EventConsumer, EventKind};
use super::MethodDomain;
use crate::service::worker::BackgroundRunnable;

// ---------------------------------------------------------------------------
// ExpirationSweeper
// ---------------------------------------------------------------------------

pub struct ExpirationSweeper {
    domain: MethodDomain,
}

impl ExpirationSweeper {
    #[must_use]
    pub fn new(domain: MethodDomain) -> Self {
        Self { domain }
    }

    /// Deletes everything expired at `now`; returns how many resources were
    /// removed. A resource already gone with an expired ancestor is skipped.
    ///
    /// # Errors
    ///
    /// Storage failures while listing expired resources.
    pub async fn sweep(&self, now: DateTime<Utc>) -> CseResult<usize> {
        let core = self.domain.core();
        let session = core.db.begin().await?;
        let expired = session.get_expired(now).await;
        session.rollback().await?;

        let from = core.identity.sp_relative_id();
        let mut removed = 0;
        for resource in expired? {
            let req = Request::delete(resource.resource_id.clone(), from.clone()).internal();
            match self.domain.process(req).await {
                Ok(_) => {
                    removed += 1;
                    tracing::debug!(ri = %resource.resource_id, path = %resource.path, "expired resource removed");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(ri = %resource.resource_id, error = %e, "failed to remove expired resource");
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl BackgroundRunnable for ExpirationSweeper {
    type Task = ();

    async fn run(&mut self, _task: ()) {
        self.on_tick().await;
    }

    async fn on_tick(&mut self) {
        match self.sweep(time::now()).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "expiration sweep complete"),
            Err(e) => tracing::warn!(error = %e, "expiration sweep failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// RefreshEngine
// ---------------------------------------------------------------------------

/// Event consumer running one refresh timer per self-owned expiring resource.
pub struct RefreshEngine {
    domain: MethodDomain,
    timers: Arc<Timers>,
}

type Timers = DashMap<String, JoinHandle<()>>;

impl RefreshEngine {
    #[must_use]
    pub fn new(domain: MethodDomain) -> Self {
        Self {
            domain,
            timers: Arc::default(),
        }
    }

    #[must_use]
    pub fn active_timers(&self) -> usize {
        self.timers.len()
    }

    fn owns(&self, event: &DomainEvent) -> bool {
        let req = &event.request;
        !req.flags.cascading
            && (req.flags.internal || self.domain.core().identity.is_self(&req.from))
    }

    fn cancel(&self, resource_id: &str) {
        if let Some((_, timer)) = self.timers.remove(resource_id) {
            timer.abort();
        }
    }
}

impl Drop for RefreshEngine {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.abort();
        }
    }
}

/// Client-writable attributes of `resource`, enough to create it again.
fn recreation_content(resource: &Resource) -> Value {
    let schema = schema_for(resource.resource_type);
    let mut attrs = Map::new();
    attrs.insert("rn".into(), Value::from(resource.resource_name.clone()));
    if !resource.labels.is_empty() {
        attrs.insert("lbl".into(), Value::from(resource.labels.clone()));
    }
    for (name, value) in &resource.attributes {
        let writable = schema
            .attribute(name)
            .is_some_and(|def| def.access != AccessClass::ReadOnly);
        if writable {
            attrs.insert(name.clone(), value.clone());
        }
    }
    let mut root = Map::new();
    root.insert(resource.resource_type.root_key(), Value::Object(attrs));
    Value::Object(root)
}

fn expiration_update(ty: ResourceType, lifetime: Duration) -> Value {
    let et = time::now() + chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::MAX);
    let mut attrs = Map::new();
    attrs.insert("et".into(), Value::from(time::format(et)));
    let mut root = Map::new();
    root.insert(ty.root_key(), Value::Object(attrs));
    Value::Object(root)
}

/// Refreshes until the resource is found missing, then recreates it once;
/// the recreated resource gets a timer of its own through its create event,
/// so the lost one's entry leaves `timers` before the create is issued.
async fn keep_alive(domain: MethodDomain, resource: Resource, timers: Arc<Timers>) {
    let config = Arc::clone(&domain.core().config);
    let interval = Duration::from_millis(config.refresh_interval_ms);
    let lifetime = Duration::from_millis(config.refresh_interval_ms.saturating_add(config.refresh_offset_ms));
    let from = domain.core().identity.sp_relative_id();

    loop {
        tokio::time::sleep(interval).await;
        let update = Request::update(
            resource.resource_id.clone(),
            from.clone(),
            expiration_update(resource.resource_type, lifetime),
        )
        .internal();
        match domain.process(update).await {
            Ok(_) => tracing::trace!(ri = %resource.resource_id, "expiration refreshed"),
            Err(e) if e.is_not_found() => break,
            Err(e) => tracing::warn!(ri = %resource.resource_id, error = %e, "expiration refresh failed"),
        }
    }

    timers.remove(&resource.resource_id);
    let Some((parent_path, _)) = split_last(&resource.path) else {
        return;
    };
    tracing::info!(ri = %resource.resource_id, path = %resource.path, "self-owned resource lost, recreating");
    let create = Request::create(
        parent_path,
        from,
        resource.resource_type,
        recreation_content(&resource),
    )
    .internal();
    if let Err(e) = domain.process(create).await {
        tracing::warn!(path = %resource.path, error = %e, "recreation failed");
    }
}

#[async_trait]
impl EventConsumer for RefreshEngine {
    fn name(&self) -> &'static str {
        "refresh"
    }

    async fn on_event(&self, event: &DomainEvent) {
        let resource = &event.resource;
        match event.kind {
            EventKind::Created => {
                if resource.expiration_time.is_none() || !self.owns(event) {
                    return;
                }
                let timer = tokio::spawn(keep_alive(
                    self.domain.clone(),
                    resource.clone(),
                    Arc::clone(&self.timers),
                ));
                if let Some(previous) = self.timers.insert(resource.resource_id.clone(), timer) {
                    previous.abort();
                }
            }
            EventKind::Updated => {}
            EventKind::Deleted => self.cancel(&resource.resource_id),
        }
    }
}
