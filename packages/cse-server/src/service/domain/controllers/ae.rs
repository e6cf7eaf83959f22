//! AE: registered application entities. The AE owns its ID scheme and is
//! the only type that accepts notifications, which it relays to its points
//! of access.

use async_trait::async_trait;
use cse_core::{CseError, CseResult, Request, Resource, ResourceType, Response};
use uuid::Uuid;

use super::{Controller, ControllerContext};

pub struct AeController;

/// Whether `originator` is a usable, client-chosen AE-ID.
fn is_assigned_ae_id(originator: &str) -> bool {
    originator.len() > 1
        && (originator.starts_with('C') || originator.starts_with('S'))
        && !originator.contains('/')
}

#[async_trait]
impl Controller for AeController {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Ae
    }

    /// Keeps a client-chosen `C...`/`S...` originator as AE-ID, otherwise
    /// assigns `C` plus a fresh UUID.
    fn resource_id(&self, req: &Request) -> String {
        if is_assigned_ae_id(&req.from) {
            req.from.clone()
        } else {
            format!("C{}", Uuid::new_v4().simple())
        }
    }

    fn notifiable(&self) -> bool {
        true
    }

    async fn prepare_create(
        &self,
        _ctx: &ControllerContext,
        _parent: &Resource,
        resource: &mut Resource,
        _req: &Request,
    ) -> CseResult<()> {
        resource.set_attr("aei", resource.resource_id.clone());
        Ok(())
    }

    async fn notify(
        &self,
        ctx: &ControllerContext,
        resource: &Resource,
        req: &Request,
    ) -> CseResult<Response> {
        let poa = resource.attr_list("poa");
        if poa.is_empty() {
            return Err(CseError::TargetNotReachable(format!(
                "{} has no point of access",
                resource.resource_id
            )));
        }
        let mut relay = req.clone();
        relay.to = resource.resource_id.clone();
        let answer = ctx.core.transport.send_notify(&relay, &poa).await?;
        Ok(Response::new(answer.status, req, answer.content))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_chosen_ids_are_kept() {
        let ctrl = AeController;
        let mut req = Request::create("onem2m", "Cmyapp", ResourceType::Ae, json!({}));
        assert_eq!(ctrl.resource_id(&req), "Cmyapp");
        req.from = "C".into();
        let generated = ctrl.resource_id(&req);
        assert!(generated.starts_with('C') && generated.len() > 1);
        req.from = String::new();
        assert_ne!(ctrl.resource_id(&req), generated);
    }
}
