//! Container: holds content instances under `mni`/`mbs` limits.

use std::sync::Arc;

use async_trait::async_trait;
use cse_core::{CseResult, Request, Resource, ResourceType};

use super::content_instance::enforce_capacity;
use super::{Controller, ControllerContext};

pub struct ContainerController;

#[async_trait]
impl Controller for ContainerController {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Container
    }

    async fn prepare_create(
        &self,
        _ctx: &ControllerContext,
        _parent: &Resource,
        resource: &mut Resource,
        req: &Request,
    ) -> CseResult<()> {
        resource.set_attr("cni", 0);
        resource.set_attr("cbs", 0);
        resource.set_attr("st", 0);
        resource.set_attr("cr", req.from.clone());
        Ok(())
    }

    /// A lowered `mni` or `mbs` takes effect immediately.
    async fn on_updated(
        &self,
        ctx: &ControllerContext,
        resource: &Resource,
        req: &Arc<Request>,
    ) -> CseResult<()> {
        enforce_capacity(ctx, &resource.resource_id, req).await
    }
}
