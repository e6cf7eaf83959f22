//! ContentInstance: an immutable data instance held in a Container's ring
//! buffer.

use std::sync::Arc;

use async_trait::async_trait;
use cse_core::{CseError, CseResult, Request, Resource, ResourceType};
use serde_json::Value;

use super::{cascading, delete_tree, Controller, ControllerContext};

pub struct ContentInstanceController;

/// Byte size of a content value: string length, or the length of its JSON
/// encoding for anything else.
fn content_size(con: &Value) -> u64 {
    let len = match con {
        Value::String(s) => s.len(),
        other => other.to_string().len(),
    };
    u64::try_from(len).unwrap_or(u64::MAX)
}

fn size_of(instance: &Resource) -> u64 {
    instance.attr_u64("cs").unwrap_or(0)
}

/// Evicts the oldest instances of a Container until both `mni` and `mbs` hold
/// again, then rewrites its counters and its `ol`/`la` references. A limit of
/// zero means unlimited.
pub(super) async fn enforce_capacity(
    ctx: &ControllerContext,
    container_id: &str,
    req: &Request,
) -> CseResult<()> {
    let session = ctx.session();
    let mut container = session.get(container_id).await?;
    let mut instances = session
        .get_collection(Some(ResourceType::ContentInstance), container_id)
        .await?;
    let mni = container.attr_u64("mni").filter(|m| *m > 0);
    let mbs = container.attr_u64("mbs").filter(|m| *m > 0);
    let mut cbs: u64 = instances.iter().map(size_of).sum();

    let over = |count: usize, bytes: u64| {
        mni.is_some_and(|m| u64::try_from(count).unwrap_or(u64::MAX) > m)
            || mbs.is_some_and(|m| bytes > m)
    };
    let evict_req = cascading(req);
    while !instances.is_empty() && over(instances.len(), cbs) {
        let oldest = instances.remove(0);
        cbs = cbs.saturating_sub(size_of(&oldest));
        tracing::debug!(container = %container_id, ri = %oldest.resource_id, "evicting oldest instance");
        delete_tree(ctx.clone(), oldest, Arc::clone(&evict_req)).await?;
    }

    container.set_attr("cni", instances.len());
    container.set_attr("cbs", cbs);
    set_reference(
        &mut container,
        "ol",
        session.get_oldest_content_instance(container_id).await?,
    );
    set_reference(
        &mut container,
        "la",
        session.get_latest_content_instance(container_id).await?,
    );
    session
        .update(&container, Some(&["cni", "cbs", "ol", "la"]))
        .await
}

fn set_reference(container: &mut Resource, name: &str, instance: Option<Resource>) {
    match instance {
        Some(instance) => container.set_attr(name, instance.resource_id),
        None => {
            container.remove_attr(name);
        }
    }
}

#[async_trait]
impl Controller for ContentInstanceController {
    fn resource_type(&self) -> ResourceType {
        ResourceType::ContentInstance
    }

    async fn prepare_create(
        &self,
        _ctx: &ControllerContext,
        parent: &Resource,
        resource: &mut Resource,
        req: &Request,
    ) -> CseResult<()> {
        let size = resource.attr("con").map_or(0, content_size);
        if let Some(mbs) = parent.attr_u64("mbs").filter(|m| *m > 0) {
            if size > mbs {
                return Err(CseError::ContentsUnacceptable(format!(
                    "content of {size} bytes exceeds the container limit of {mbs}"
                )));
            }
        }
        resource.set_attr("cs", size);
        resource.set_attr("st", parent.state_tag().unwrap_or(0) + 1);
        resource.set_attr("cr", req.from.clone());
        Ok(())
    }

    async fn on_created(
        &self,
        ctx: &ControllerContext,
        resource: &Resource,
        req: &Arc<Request>,
    ) -> CseResult<()> {
        let Some(container_id) = &resource.parent_id else {
            return Ok(());
        };
        enforce_capacity(ctx, container_id, req).await
    }

    async fn prepare_update(
        &self,
        _ctx: &ControllerContext,
        _resource: &mut Resource,
        _changes: &serde_json::Map<String, Value>,
        req: &Request,
    ) -> CseResult<()> {
        if req.is_privileged() {
            return Ok(());
        }
        Err(CseError::OperationNotAllowed(
            "content instances cannot be updated".into(),
        ))
    }

    async fn on_deleted(
        &self,
        ctx: &ControllerContext,
        resource: &Resource,
        req: &Arc<Request>,
    ) -> CseResult<()> {
        // Evictions and container deletes maintain the counters themselves.
        if req.flags.cascading {
            return Ok(());
        }
        let Some(container_id) = &resource.parent_id else {
            return Ok(());
        };
        enforce_capacity(ctx, container_id, req).await
    }
}
