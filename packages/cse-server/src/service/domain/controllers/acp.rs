//! AccessControlPolicy: rule lists must parse before they are stored.

use async_trait::async_trait;
use cse_core::{CseResult, Privileges, Request, Resource, ResourceType};
use serde_json::{Map, Value};

use super::{Controller, ControllerContext};

pub struct AccessControlPolicyController;

fn check_privileges(attrs: impl Iterator<Item = (String, Value)>) -> CseResult<()> {
    for (name, value) in attrs {
        if (name == "pv" || name == "pvs") && !value.is_null() {
            Privileges::from_value(&value)?;
        }
    }
    Ok(())
}

#[async_trait]
impl Controller for AccessControlPolicyController {
    fn resource_type(&self) -> ResourceType {
        ResourceType::AccessControlPolicy
    }

    async fn prepare_create(
        &self,
        _ctx: &ControllerContext,
        _parent: &Resource,
        resource: &mut Resource,
        _req: &Request,
    ) -> CseResult<()> {
        check_privileges(
            resource
                .attributes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        )
    }

    async fn prepare_update(
        &self,
        _ctx: &ControllerContext,
        _resource: &mut Resource,
        changes: &Map<String, Value>,
        _req: &Request,
    ) -> CseResult<()> {
        check_privileges(changes.iter().map(|(k, v)| (k.clone(), v.clone())))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn malformed_rules_are_rejected() {
        let ok = vec![("pv".to_owned(), json!({"acr": [{"acor": ["all"], "acop": 2}]}))];
        assert!(check_privileges(ok.into_iter()).is_ok());
        let bad = vec![("pvs".to_owned(), json!({"acr": "everyone"}))];
        assert!(check_privileges(bad.into_iter()).is_err());
    }
}
