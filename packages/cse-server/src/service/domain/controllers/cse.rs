//! CSEBase and RemoteCSE.
//!
//! The base is created once at startup and only this node may change or
//! remove it. A RemoteCSE sits directly under the base; only the CSE it
//! represents (or this node) may create, change or remove it.

use async_trait::async_trait;
use cse_core::{CseError, CseResult, Request, Resource, ResourceType};
use serde_json::{Map, Value};

use super::{Controller, ControllerContext};

pub struct CseBaseController;

pub struct RemoteCseController;

fn internal_only(req: &Request, what: &str) -> CseResult<()> {
    if req.flags.internal {
        Ok(())
    } else {
        Err(CseError::OperationNotAllowed(format!(
            "the CSE base cannot be {what}"
        )))
    }
}

#[async_trait]
impl Controller for CseBaseController {
    fn resource_type(&self) -> ResourceType {
        ResourceType::CseBase
    }

    async fn prepare_update(
        &self,
        _ctx: &ControllerContext,
        _resource: &mut Resource,
        _changes: &Map<String, Value>,
        req: &Request,
    ) -> CseResult<()> {
        internal_only(req, "updated")
    }

    async fn prepare_delete(
        &self,
        _ctx: &ControllerContext,
        _resource: &Resource,
        req: &Request,
    ) -> CseResult<()> {
        internal_only(req, "deleted")
    }
}

fn same_cse(a: &str, b: &str) -> bool {
    a.trim_start_matches('/') == b.trim_start_matches('/')
}

/// The originator must be the CSE the resource stands for.
fn check_owner(csi: &str, req: &Request) -> CseResult<()> {
    if req.is_privileged() || same_cse(csi, &req.from) {
        return Ok(());
    }
    Err(CseError::Impersonation(format!(
        "{} cannot act for CSE {csi}",
        req.from
    )))
}

#[async_trait]
impl Controller for RemoteCseController {
    fn resource_type(&self) -> ResourceType {
        ResourceType::RemoteCse
    }

    /// The resource ID is the remote CSE-ID, so a second registration of the
    /// same CSE conflicts.
    async fn prepare_create(
        &self,
        _ctx: &ControllerContext,
        parent: &Resource,
        resource: &mut Resource,
        req: &Request,
    ) -> CseResult<()> {
        if parent.resource_type != ResourceType::CseBase {
            return Err(CseError::InvalidChildResourceType(
                "a remote CSE must sit directly under the CSE base".into(),
            ));
        }
        let csi = resource
            .attr_str("csi")
            .ok_or_else(|| CseError::BadRequest("csi missing".into()))?
            .to_owned();
        check_owner(&csi, req)?;
        resource.resource_id = csi.trim_start_matches('/').to_owned();
        Ok(())
    }

    async fn prepare_update(
        &self,
        _ctx: &ControllerContext,
        resource: &mut Resource,
        _changes: &Map<String, Value>,
        req: &Request,
    ) -> CseResult<()> {
        check_owner(resource.attr_str("csi").unwrap_or_default(), req)
    }

    async fn prepare_delete(
        &self,
        _ctx: &ControllerContext,
        resource: &Resource,
        req: &Request,
    ) -> CseResult<()> {
        if req.flags.cascading {
            return Ok(());
        }
        check_owner(resource.attr_str("csi").unwrap_or_default(), req)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn only_the_represented_cse_may_act() {
        let req = Request::update("onem2m/in-cse", "/in-cse", json!({}));
        assert!(check_owner("/in-cse", &req).is_ok());
        let req = Request::update("onem2m/in-cse", "in-cse", json!({}));
        assert!(check_owner("/in-cse", &req).is_ok());
        let req = Request::update("onem2m/in-cse", "/other-cse", json!({}));
        assert!(matches!(check_owner("/in-cse", &req), Err(CseError::Impersonation(_))));
        let req = Request::update("onem2m/in-cse", "/other-cse", json!({})).internal();
        assert!(check_owner("/in-cse", &req).is_ok());
    }
}
