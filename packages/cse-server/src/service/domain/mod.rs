//! The Method Domain: the single entry point every request goes through.
//!
//! A request is classified (local or forwarded), its target resolved, and the
//! operation handed to the controller algorithms inside one transaction.
//! The transaction is committed or rolled back exactly once; the events the
//! request produced are published only after a successful commit.

pub mod access;
pub mod announcement;
pub mod controllers;
pub mod discovery;
pub mod events;
pub mod expiration;
pub mod notification;
pub mod registration;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use cse_core::address::split_last;
use cse_core::{
    time, CseError, CseIdentity, CseResult, Operation, Request, Resource, ResourceType, Response,
};
use serde_json::Value;
use tower::Service;

use self::access::AccessControl;
use self::controllers::{ControllerContext, Transaction};
use self::events::EventSink;
use crate::service::classify::{classify, Route};
use crate::service::config::CseConfig;
use crate::service::operation::{service_names, OperationError};
use crate::service::registry::{ManagedService, ServiceContext};
use crate::service::router::ControllerRegistry;
use crate::storage::{Database, DbSession};
use crate::transport::TransportDomain;

// ---------------------------------------------------------------------------
// DomainCore
// ---------------------------------------------------------------------------

/// Shared state of the Method Domain, handed to every controller call.
pub struct DomainCore {
    pub config: Arc<CseConfig>,
    pub identity: CseIdentity,
    pub db: Arc<dyn Database>,
    pub controllers: ControllerRegistry,
    pub access: AccessControl,
    pub transport: TransportDomain,
    pub events: EventSink,
}

impl DomainCore {
    /// Wires the core from its parts; the access engine shares `transport`.
    #[must_use]
    pub fn new(
        config: Arc<CseConfig>,
        db: Arc<dyn Database>,
        controllers: ControllerRegistry,
        transport: TransportDomain,
        events: EventSink,
    ) -> Self {
        Self {
            identity: config.identity(),
            access: AccessControl::new(&config, transport.clone()),
            config,
            db,
            controllers,
            transport,
            events,
        }
    }
}

// ---------------------------------------------------------------------------
// MethodDomain
// ---------------------------------------------------------------------------

/// Cheap-clone handle to the request engine.
#[derive(Clone)]
pub struct MethodDomain {
    core: Arc<DomainCore>,
}

impl MethodDomain {
    #[must_use]
    pub fn new(core: DomainCore) -> Self {
        Self {
            core: Arc::new(core),
        }
    }

    #[must_use]
    pub fn core(&self) -> &Arc<DomainCore> {
        &self.core
    }

    /// Handles one request; every failure becomes an error response.
    pub async fn handle(&self, req: Request) -> Response {
        let rqi = req.request_identifier.clone();
        let originator = req.from.clone();
        match self.process(req).await {
            Ok(resp) => resp,
            Err(e) => {
                if let CseError::Internal(inner) = &e {
                    tracing::error!(rqi = %rqi, error = ?inner, "request failed");
                } else {
                    tracing::debug!(rqi = %rqi, error = %e, "request rejected");
                }
                Response::from_error(&e, &rqi, &originator)
            }
        }
    }

    /// Handles one request, keeping failures as errors. The event-driven
    /// engines issue their internal requests through here.
    ///
    /// # Errors
    ///
    /// Any [`CseError`] raised while classifying, resolving or executing.
    pub async fn process(&self, mut req: Request) -> CseResult<Response> {
        match classify(&mut req, &self.core.identity, &self.core.transport)? {
            Route::Forward { cse_id } => self.forward(req, &cse_id).await,
            Route::Local(target) => self.execute(req, &target).await,
        }
    }

    async fn forward(&self, mut req: Request, cse_id: &str) -> CseResult<Response> {
        if req.operation == Operation::Create
            && req.resource_type == Some(ResourceType::Subscription)
        {
            qualify_notification_targets(&mut req, &self.core.identity);
        }
        tracing::debug!(rqi = %req.request_identifier, cse = %cse_id, to = %req.to, "forwarding request");
        let result = self.core.transport.send(&req).await;
        let outcome = if result.is_ok() { "delivered" } else { "unreachable" };
        metrics::counter!("cse_forwarded_requests_total", "outcome" => outcome).increment(1);
        result
    }

    async fn execute(&self, req: Request, target: &str) -> CseResult<Response> {
        let session = self.core.db.begin().await?;
        let tx = Arc::new(Transaction::new(Arc::clone(&session)));
        let ctx = ControllerContext {
            core: Arc::clone(&self.core),
            tx: Arc::clone(&tx),
        };
        let req = Arc::new(req);

        match run(&ctx, target, &req).await {
            Ok(resp) => {
                session.commit().await?;
                for event in tx.take_events() {
                    self.core.events.publish(event);
                }
                Ok(resp)
            }
            Err(e) => {
                if let Err(rollback) = session.rollback().await {
                    tracing::warn!(rqi = %req.request_identifier, error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Creates the CSE base on first start, or refreshes its points of access
    /// and supported types on later ones.
    async fn bootstrap(&self) -> CseResult<()> {
        let core = &self.core;
        let session = core.db.begin().await?;
        let result = bootstrap_base(core, session.as_ref()).await;
        match result {
            Ok(()) => session.commit().await,
            Err(e) => {
                session.rollback().await?;
                Err(e)
            }
        }
    }
}

async fn run(ctx: &ControllerContext, target: &str, req: &Arc<Request>) -> CseResult<Response> {
    let resource = resolve(ctx.session(), target).await?;
    match req.operation {
        Operation::Create => controllers::create(ctx, resource, req).await,
        Operation::Retrieve => controllers::retrieve(ctx, resource, req).await,
        Operation::Update => controllers::update(ctx, resource, req).await,
        Operation::Delete => controllers::delete(ctx, resource, req).await,
        Operation::Notify => controllers::notify(ctx, resource, req).await,
    }
}

async fn bootstrap_base(core: &DomainCore, session: &dyn DbSession) -> CseResult<()> {
    let identity = &core.identity;
    let supported: Vec<u32> = core
        .controllers
        .supported_types()
        .into_iter()
        .map(ResourceType::code)
        .collect();
    let poa = core.transport.own_poa();

    match session.get(&identity.cse_id).await {
        Ok(mut base) => {
            base.set_attr("poa", poa);
            base.set_attr("srt", supported);
            base.last_modified_time = time::now();
            session.update(&base, Some(&["poa", "srt", "lt"])).await?;
            tracing::info!(ri = %base.resource_id, "CSE base refreshed");
        }
        Err(e) if e.is_not_found() => {
            let mut base = Resource::new(ResourceType::CseBase, time::now());
            base.resource_id.clone_from(&identity.cse_id);
            base.resource_name.clone_from(&identity.base_name);
            base.path.clone_from(&identity.base_name);
            base.set_attr("csi", identity.sp_relative_id());
            base.set_attr("cst", core.config.cse_type.code());
            base.set_attr("srt", supported);
            base.set_attr("poa", poa);
            session.store(&base).await?;
            tracing::info!(ri = %base.resource_id, rn = %base.resource_name, "CSE base created");
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

/// Notification targets that are not URLs are qualified with this CSE's ID
/// before a subscription leaves the node, so the remote side can route the
/// notifications back.
fn qualify_notification_targets(req: &mut Request, identity: &CseIdentity) {
    let Some(Value::Object(content)) = req.content.as_mut() else {
        return;
    };
    let root = ResourceType::Subscription.root_key();
    let attrs = if content.contains_key(&root) {
        match content.get_mut(&root) {
            Some(Value::Object(inner)) => inner,
            _ => return,
        }
    } else {
        content
    };
    for key in ["nu", "su"] {
        match attrs.get_mut(key) {
            Some(Value::Array(items)) => {
                for item in items.iter_mut() {
                    if let Some(target) = item.as_str().filter(|t| !t.contains("://")) {
                        *item = Value::from(identity.qualify(target));
                    }
                }
            }
            Some(Value::String(target)) if !target.contains("://") => {
                *target = identity.qualify(target);
            }
            _ => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Target resolution
// ---------------------------------------------------------------------------

/// Resolves a normalized local target to a stored resource.
///
/// Tried in order: a direct lookup by path or ID; the `la`/`ol` suffix on a
/// Container; an unstructured address whose first segments name a resource
/// ID, which is rewritten to the anchor's path plus the remaining segments.
///
/// # Errors
///
/// `NotFound` when no form resolves.
pub async fn resolve(session: &dyn DbSession, target: &str) -> CseResult<Resource> {
    if let Some(resource) = resolve_structured(session, target).await? {
        return Ok(resource);
    }

    let segments: Vec<&str> = target.split('/').collect();
    for cut in (1..segments.len()).rev() {
        let prefix = segments[..cut].join("/");
        match session.get(&prefix).await {
            Ok(anchor) => {
                let rebuilt = format!("{}/{}", anchor.path, segments[cut..].join("/"));
                if let Some(resource) = resolve_structured(session, &rebuilt).await? {
                    return Ok(resource);
                }
                break;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Err(CseError::not_found(target))
}

async fn resolve_structured(session: &dyn DbSession, target: &str) -> CseResult<Option<Resource>> {
    match session.get(target).await {
        Ok(resource) => return Ok(Some(resource)),
        Err(e) if !e.is_not_found() => return Err(e),
        Err(_) => {}
    }

    let Some((parent_path, last)) = split_last(target) else {
        return Ok(None);
    };
    if last != "la" && last != "ol" {
        return Ok(None);
    }
    let parent = match session.get(parent_path).await {
        Ok(parent) if parent.resource_type == ResourceType::Container => parent,
        Ok(_) => return Ok(None),
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let Some(instance_id) = parent.attr_str(last) else {
        return Err(CseError::NotFound(format!(
            "{} holds no content instance",
            parent.path
        )));
    };
    session.get(instance_id).await.map(Some)
}

// ---------------------------------------------------------------------------
// Lifecycle and tower integration
// ---------------------------------------------------------------------------

#[async_trait]
impl ManagedService for MethodDomain {
    fn name(&self) -> &'static str {
        service_names::METHOD_DOMAIN
    }

    async fn init(&self, _ctx: &ServiceContext) -> anyhow::Result<()> {
        self.bootstrap().await.map_err(anyhow::Error::from)
    }
}

impl Service<Request> for MethodDomain {
    type Response = Response;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<Response, OperationError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let domain = self.clone();
        Box::pin(async move { Ok(domain.handle(req).await) })
    }
}
