//! Subscription: validates notification parameters. Delivery is the
//! notification engine's job.

use async_trait::async_trait;
use cse_core::{CseError, CseResult, Request, Resource, ResourceType};
use serde_json::{Map, Value};

use super::{Controller, ControllerContext};
use crate::service::domain::notification::{BatchNotify, EventCriteria};

pub struct SubscriptionController;

fn check_parameters<'a>(attrs: impl Iterator<Item = (&'a String, &'a Value)>) -> CseResult<()> {
    for (name, value) in attrs {
        if value.is_null() {
            continue;
        }
        match name.as_str() {
            "enc" => {
                EventCriteria::from_value(value)?;
            }
            "bn" => {
                BatchNotify::from_value(value)?;
            }
            "exc" => {
                if value.as_u64().is_none_or(|n| n == 0) {
                    return Err(CseError::BadRequest("exc must be a positive integer".into()));
                }
            }
            "nu" => {
                let empty = value.as_array().is_some_and(Vec::is_empty);
                if empty {
                    return Err(CseError::BadRequest("nu must not be empty".into()));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[async_trait]
impl Controller for SubscriptionController {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Subscription
    }

    async fn prepare_create(
        &self,
        _ctx: &ControllerContext,
        _parent: &Resource,
        resource: &mut Resource,
        req: &Request,
    ) -> CseResult<()> {
        check_parameters(resource.attributes.iter())?;
        resource.set_attr("cr", req.from.clone());
        Ok(())
    }

    async fn prepare_update(
        &self,
        _ctx: &ControllerContext,
        _resource: &mut Resource,
        changes: &Map<String, Value>,
        _req: &Request,
    ) -> CseResult<()> {
        check_parameters(changes.iter())
    }
}
