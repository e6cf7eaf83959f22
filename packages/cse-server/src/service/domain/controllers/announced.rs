//! Announced mirrors (`AEAnnc`, `ContainerAnnc`, `AccessControlPolicyAnnc`).
//!
//! Mirrors are created by peers announcing their resources here. They carry a
//! link back to the original and otherwise behave like plain resources.

use async_trait::async_trait;
use cse_core::{CseError, CseResult, Request, Resource, ResourceType};

use super::{Controller, ControllerContext};

pub struct AnnouncedController {
    resource_type: ResourceType,
}

impl AnnouncedController {
    #[must_use]
    pub fn new(resource_type: ResourceType) -> Self {
        Self { resource_type }
    }
}

#[async_trait]
impl Controller for AnnouncedController {
    fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    async fn prepare_create(
        &self,
        _ctx: &ControllerContext,
        _parent: &Resource,
        resource: &mut Resource,
        _req: &Request,
    ) -> CseResult<()> {
        match resource.attr_str("lnk") {
            Some(link) if !link.is_empty() => Ok(()),
            _ => Err(CseError::BadRequest("announced resource without lnk".into())),
        }
    }
}
