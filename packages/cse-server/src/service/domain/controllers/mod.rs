//! Resource controllers.
//!
//! The CRUD algorithms live here as free functions; each resource type
//! registers a [`Controller`] whose hooks the algorithms call at fixed
//! points (before persisting, after persisting, before deleting...). A type
//! changes behaviour only by overriding hooks, never by replacing the
//! algorithm.

mod acp;
mod ae;
mod announced;
mod container;
mod content_instance;
mod cse;
mod subscription;

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use cse_core::schema::validate;
use cse_core::{
    filter, resource::content_attributes, schema_for, time, AccessControlOperations, CseError,
    CseResult, Request, Resource, ResourceType, Response, ResponseStatusCode, ResultContent,
    WriteMode,
};
use futures_util::future::{try_join_all, BoxFuture};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use uuid::Uuid;

pub use acp::AccessControlPolicyController;
pub use ae::AeController;
pub use announced::AnnouncedController;
pub use container::ContainerController;
pub use content_instance::ContentInstanceController;
pub use cse::{CseBaseController, RemoteCseController};
pub use subscription::SubscriptionController;

use super::discovery;
use super::events::{DomainEvent, EventKind};
use super::DomainCore;
use crate::storage::DbSession;

// ---------------------------------------------------------------------------
// Transaction and context
// ---------------------------------------------------------------------------

/// One request's database session plus the events it produced. Events are
/// published only after the session committed.
pub struct Transaction {
    session: Arc<dyn DbSession>,
    events: Mutex<Vec<DomainEvent>>,
}

impl Transaction {
    #[must_use]
    pub fn new(session: Arc<dyn DbSession>) -> Self {
        Self {
            session,
            events: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn session(&self) -> &dyn DbSession {
        self.session.as_ref()
    }

    pub fn push(&self, event: DomainEvent) {
        self.events.lock().push(event);
    }

    /// Drains the buffered events in the order they were fired.
    pub fn take_events(&self) -> Vec<DomainEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

/// Everything a controller needs while handling one request.
#[derive(Clone)]
pub struct ControllerContext {
    pub core: Arc<DomainCore>,
    pub tx: Arc<Transaction>,
}

impl ControllerContext {
    #[must_use]
    pub fn session(&self) -> &dyn DbSession {
        self.tx.session()
    }

    pub fn fire(&self, kind: EventKind, resource: Resource, req: &Arc<Request>) {
        self.tx.push(DomainEvent::new(kind, resource, Arc::clone(req)));
    }
}

// ---------------------------------------------------------------------------
// Controller trait
// ---------------------------------------------------------------------------

/// Per-type hooks into the CRUD algorithms. Every hook defaults to a no-op.
#[async_trait]
pub trait Controller: Send + Sync {
    fn resource_type(&self) -> ResourceType;

    /// Resource ID for a new resource.
    fn resource_id(&self, _req: &Request) -> String {
        format!("{}{}", self.resource_type().short_name(), Uuid::new_v4().simple())
    }

    /// Whether NOTIFY requests may target this type.
    fn notifiable(&self) -> bool {
        false
    }

    /// Runs after validation, before the resource is stored.
    async fn prepare_create(
        &self,
        _ctx: &ControllerContext,
        _parent: &Resource,
        _resource: &mut Resource,
        _req: &Request,
    ) -> CseResult<()> {
        Ok(())
    }

    async fn on_created(
        &self,
        _ctx: &ControllerContext,
        _resource: &Resource,
        _req: &Arc<Request>,
    ) -> CseResult<()> {
        Ok(())
    }

    /// Runs with the validated changes before they are applied.
    async fn prepare_update(
        &self,
        _ctx: &ControllerContext,
        _resource: &mut Resource,
        _changes: &Map<String, Value>,
        _req: &Request,
    ) -> CseResult<()> {
        Ok(())
    }

    async fn on_updated(
        &self,
        _ctx: &ControllerContext,
        _resource: &Resource,
        _req: &Arc<Request>,
    ) -> CseResult<()> {
        Ok(())
    }

    async fn prepare_delete(
        &self,
        _ctx: &ControllerContext,
        _resource: &Resource,
        _req: &Request,
    ) -> CseResult<()> {
        Ok(())
    }

    async fn on_deleted(
        &self,
        _ctx: &ControllerContext,
        _resource: &Resource,
        _req: &Arc<Request>,
    ) -> CseResult<()> {
        Ok(())
    }

    async fn notify(
        &self,
        _ctx: &ControllerContext,
        resource: &Resource,
        _req: &Request,
    ) -> CseResult<Response> {
        Err(CseError::OperationNotAllowed(format!(
            "{} does not accept notifications",
            resource.resource_type
        )))
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Creates a child of `parent` from the request representation.
///
/// # Errors
///
/// Validation, authorization and storage errors; the caller rolls back.
pub async fn create(ctx: &ControllerContext, parent: Resource, req: &Arc<Request>) -> CseResult<Response> {
    let ty = req
        .resource_type
        .ok_or_else(|| CseError::BadRequest("create without resource type".into()))?;
    let controller = ctx.core.controllers.get(ty)?;
    let parent_schema = schema_for(parent.resource_type);
    if ty == ResourceType::Subscription && !parent_schema.capabilities.subscribable {
        return Err(CseError::TargetNotSubscribable(format!(
            "{} cannot be subscribed to",
            parent.resource_type
        )));
    }
    if !parent_schema.allows_child(ty) {
        return Err(CseError::InvalidChildResourceType(format!(
            "{ty} under {}",
            parent.resource_type
        )));
    }
    ctx.core
        .access
        .authorize(ctx.session(), &parent, req, AccessControlOperations::CREATE)
        .await?;

    let content = req
        .content
        .as_ref()
        .ok_or_else(|| CseError::BadRequest("create without content".into()))?;
    let attrs = validate(ty, content_attributes(content, ty)?, WriteMode::Create, req.is_privileged())?;

    let now = time::now();
    let mut resource = Resource::new(ty, now);
    for (name, value) in attrs {
        resource.apply(&name, value)?;
    }
    if schema_for(ty).capabilities.expiring {
        resource.expiration_time = Some(clamp_lifetime(ctx, resource.expiration_time));
    }
    resource.resource_id = controller.resource_id(req);
    resource.parent_id = Some(parent.resource_id.clone());

    controller.prepare_create(ctx, &parent, &mut resource, req).await?;

    if resource.resource_name.is_empty() {
        resource.resource_name = resource.resource_id.clone();
    }
    check_resource_name(&resource.resource_name)?;
    resource.path = format!("{}/{}", parent.path, resource.resource_name);

    ctx.session().store(&resource).await?;
    tracing::debug!(ri = %resource.resource_id, path = %resource.path, ty = %ty, "resource created");
    ctx.fire(EventKind::Created, resource.clone(), req);

    controller.on_created(ctx, &resource, req).await?;
    touch_parent(ctx, &parent.resource_id, ty, req).await?;

    let stored = ctx.session().get(&resource.resource_id).await?;
    let content = match req.result_content() {
        ResultContent::Nothing => None,
        _ => Some(stored.representation()),
    };
    Ok(Response::new(ResponseStatusCode::Created, req, content))
}

fn check_resource_name(name: &str) -> CseResult<()> {
    if name.contains('/') || name == "la" || name == "ol" || name == "." || name == ".." {
        return Err(CseError::BadRequest(format!("invalid resource name {name:?}")));
    }
    Ok(())
}

fn clamp_lifetime(
    ctx: &ControllerContext,
    requested: Option<chrono::DateTime<chrono::Utc>>,
) -> chrono::DateTime<chrono::Utc> {
    let config = &ctx.core.config;
    time::clamp_expiration(
        requested,
        time::now(),
        config.min_lifetime(),
        config.max_lifetime(),
        config.default_lifetime(),
    )
}

/// Records a child mutation on its parent: bumps a Container's state tag and
/// fires the parent's update event tagged with the child's type.
async fn touch_parent(
    ctx: &ControllerContext,
    parent_id: &str,
    child_type: ResourceType,
    req: &Arc<Request>,
) -> CseResult<()> {
    let mut parent = match ctx.session().get(parent_id).await {
        Ok(parent) => parent,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    };
    if parent.resource_type == ResourceType::Container {
        parent.set_attr("st", parent.state_tag().unwrap_or(0) + 1);
        parent.last_modified_time = time::now();
        ctx.session().update(&parent, Some(&["st", "lt"])).await?;
        parent = ctx.session().get(parent_id).await?;
    }
    let mut event = DomainEvent::new(EventKind::Updated, parent, Arc::clone(req));
    event.child_type = Some(child_type);
    ctx.tx.push(event);
    Ok(())
}

// ---------------------------------------------------------------------------
// Retrieve
// ---------------------------------------------------------------------------

/// Retrieves `resource`, or runs discovery below it when `fu` asks for it.
///
/// # Errors
///
/// `PermissionDenied`, `BadRequest` for unsupported result content, storage
/// errors.
pub async fn retrieve(ctx: &ControllerContext, resource: Resource, req: &Arc<Request>) -> CseResult<Response> {
    if req.filter_criteria.is_discovery() {
        return discovery::discover(ctx, &resource, req).await;
    }
    ctx.core
        .access
        .authorize(ctx.session(), &resource, req, AccessControlOperations::RETRIEVE)
        .await?;

    let content = match req.result_content() {
        ResultContent::Nothing => None,
        ResultContent::Attributes => Some(attributes_of(&resource, req)),
        ResultContent::HierarchicalAddress => {
            Some(json!({ "m2m:uri": ctx.core.identity.qualify(&resource.path) }))
        }
        ResultContent::AttributesAndChildResources => {
            let children = matching_children(ctx, &resource, req).await?;
            let mut body = attributes_of(&resource, req);
            if let Some(inner) = body
                .get_mut(resource.resource_type.root_key())
                .and_then(Value::as_object_mut)
            {
                for child in children {
                    let list = inner
                        .entry(child.resource_type.root_key())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(items) = list {
                        items.push(Value::Object(child.to_attributes()));
                    }
                }
            }
            Some(body)
        }
        ResultContent::AttributesAndChildResourceReferences => {
            let refs = child_references(ctx, &resource, req).await?;
            let mut body = attributes_of(&resource, req);
            if let Some(inner) = body
                .get_mut(resource.resource_type.root_key())
                .and_then(Value::as_object_mut)
            {
                inner.insert("ch".into(), refs);
            }
            Some(body)
        }
        ResultContent::ChildResourceReferences => {
            let refs = child_references(ctx, &resource, req).await?;
            Some(json!({ "m2m:rrl": { "rrf": refs } }))
        }
        other => {
            return Err(CseError::BadRequest(format!(
                "result content {} not supported for retrieve",
                other.code()
            )))
        }
    };
    Ok(Response::new(ResponseStatusCode::Ok, req, content))
}

fn attributes_of(resource: &Resource, req: &Request) -> Value {
    if req.attribute_list.is_empty() {
        resource.representation()
    } else {
        resource.projection(&req.attribute_list)
    }
}

async fn matching_children(
    ctx: &ControllerContext,
    resource: &Resource,
    req: &Request,
) -> CseResult<Vec<Resource>> {
    let fc = &req.filter_criteria;
    let mut children: Vec<Resource> = ctx
        .session()
        .get_collection(None, &resource.resource_id)
        .await?
        .into_iter()
        .filter(|child| filter::matches(fc, child))
        .collect();
    if let Some(limit) = fc.limit {
        children.truncate(limit);
    }
    Ok(children)
}

async fn child_references(
    ctx: &ControllerContext,
    resource: &Resource,
    req: &Request,
) -> CseResult<Value> {
    let refs = matching_children(ctx, resource, req)
        .await?
        .into_iter()
        .map(|child| {
            json!({
                "nm": child.resource_name,
                "typ": child.resource_type.code(),
                "val": ctx.core.identity.qualify(&child.path),
            })
        })
        .collect();
    Ok(Value::Array(refs))
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// Merges the request representation into `resource`.
///
/// # Errors
///
/// Validation, authorization and storage errors.
pub async fn update(ctx: &ControllerContext, mut resource: Resource, req: &Arc<Request>) -> CseResult<Response> {
    let ty = resource.resource_type;
    let controller = ctx.core.controllers.get(ty)?;
    ctx.core
        .access
        .authorize(ctx.session(), &resource, req, AccessControlOperations::UPDATE)
        .await?;

    let content = req
        .content
        .as_ref()
        .ok_or_else(|| CseError::BadRequest("update without content".into()))?;
    let changes = validate(ty, content_attributes(content, ty)?, WriteMode::Update, req.is_privileged())?;

    controller.prepare_update(ctx, &mut resource, &changes, req).await?;

    let expiring = schema_for(ty).capabilities.expiring;
    for (name, value) in changes {
        if name == "et" && expiring {
            let requested = match value {
                Value::Null => None,
                Value::String(s) => Some(time::parse(&s)?),
                _ => return Err(CseError::BadRequest("et must be a timestamp".into())),
            };
            resource.expiration_time = Some(clamp_lifetime(ctx, requested));
        } else {
            resource.apply(&name, value)?;
        }
    }
    resource.last_modified_time = time::now();

    ctx.session().update(&resource, None).await?;
    controller.on_updated(ctx, &resource, req).await?;

    let stored = ctx.session().get(&resource.resource_id).await?;
    ctx.fire(EventKind::Updated, stored.clone(), req);
    let content = match req.result_content() {
        ResultContent::Nothing => None,
        _ => Some(stored.representation()),
    };
    Ok(Response::new(ResponseStatusCode::Updated, req, content))
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

/// Deletes `resource` and its whole subtree.
///
/// # Errors
///
/// Authorization and storage errors, or the first failing branch of the
/// recursive delete.
pub async fn delete(ctx: &ControllerContext, resource: Resource, req: &Arc<Request>) -> CseResult<Response> {
    ctx.core
        .access
        .authorize(ctx.session(), &resource, req, AccessControlOperations::DELETE)
        .await?;
    delete_tree(ctx.clone(), resource, Arc::clone(req)).await?;
    Ok(Response::new(ResponseStatusCode::Deleted, req, None))
}

/// Copy of `req` marking it as part of a recursive delete.
#[must_use]
pub fn cascading(req: &Request) -> Arc<Request> {
    let mut child = req.clone();
    child.flags.cascading = true;
    Arc::new(child)
}

/// Deletes children first, concurrently, then `resource` itself. Only the
/// root of a delete (a non-cascading request) records the change on its
/// parent.
pub(crate) fn delete_tree(
    ctx: ControllerContext,
    resource: Resource,
    req: Arc<Request>,
) -> BoxFuture<'static, CseResult<()>> {
    Box::pin(async move {
        let controller = ctx.core.controllers.get(resource.resource_type)?;
        controller.prepare_delete(&ctx, &resource, &req).await?;

        let children = ctx
            .session()
            .get_collection(None, &resource.resource_id)
            .await?;
        if !children.is_empty() {
            let child_req = cascading(&req);
            let branches = children.into_iter().map(|child| {
                let handle = tokio::spawn(delete_tree(ctx.clone(), child, Arc::clone(&child_req)));
                async move {
                    handle
                        .await
                        .map_err(|e| CseError::Internal(anyhow!("delete branch panicked: {e}")))?
                }
            });
            try_join_all(branches).await?;
        }

        ctx.session().delete(&resource).await?;
        controller.on_deleted(&ctx, &resource, &req).await?;
        tracing::debug!(ri = %resource.resource_id, path = %resource.path, cascading = req.flags.cascading, "resource deleted");

        if !req.flags.cascading {
            if let Some(parent_id) = &resource.parent_id {
                touch_parent(&ctx, parent_id, resource.resource_type, &req).await?;
            }
        }
        ctx.fire(EventKind::Deleted, resource, &req);
        Ok(())
    })
}

// ---------------------------------------------------------------------------
// Notify
// ---------------------------------------------------------------------------

/// Hands a NOTIFY to the target's controller.
///
/// # Errors
///
/// `OperationNotAllowed` for types that take no notifications, otherwise
/// authorization and delivery errors.
pub async fn notify(ctx: &ControllerContext, resource: Resource, req: &Arc<Request>) -> CseResult<Response> {
    let controller = ctx.core.controllers.get(resource.resource_type)?;
    if !controller.notifiable() {
        return controller.notify(ctx, &resource, req).await;
    }
    ctx.core
        .access
        .authorize(ctx.session(), &resource, req, AccessControlOperations::NOTIFY)
        .await?;
    controller.notify(ctx, &resource, req).await
}
