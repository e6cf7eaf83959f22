//! Access control decisions.
//!
//! The effective rule set for a target is, in order of precedence: the
//! target's own self-privileges (`pvs`) when the target is a policy; the
//! policies its `acpi` references; the `acpi` of the nearest ancestor
//! Container; the configured default rules. A request is authorized when at
//! least one rule matches it. Unmatched requests may still be granted by a
//! dynamic authorization server when that is enabled and the branch names
//! one through `daci`.

use std::sync::Arc;

use chrono::Utc;
use cse_core::acp::ALL_ORIGINATORS;
use cse_core::address::normalize;
use cse_core::{
    AccessControlOperations, AccessControlRule, CseError, CseIdentity, CseResult, Privileges,
    Request, Resource, ResourceType, Target,
};
use serde_json::{json, Value};

use crate::service::config::CseConfig;
use crate::storage::DbSession;
use crate::transport::TransportDomain;

/// Access control engine. Cheap to clone.
#[derive(Clone)]
pub struct AccessControl {
    identity: CseIdentity,
    default_rules: Arc<Vec<AccessControlRule>>,
    dynamic_authorization: bool,
    transport: TransportDomain,
}

impl AccessControl {
    #[must_use]
    pub fn new(config: &CseConfig, transport: TransportDomain) -> Self {
        Self {
            identity: config.identity(),
            default_rules: Arc::new(config.default_acp_rules.clone()),
            dynamic_authorization: config.dynamic_authorization,
            transport,
        }
    }

    /// Authorizes `req` for `operation` on `target`.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when no rule grants the operation; storage errors
    /// while resolving policies are passed through.
    pub async fn authorize(
        &self,
        session: &dyn DbSession,
        target: &Resource,
        req: &Request,
        operation: AccessControlOperations,
    ) -> CseResult<()> {
        if self.check(session, target, req, operation).await? {
            Ok(())
        } else {
            tracing::debug!(fr = %req.from, target = %target.path, acop = operation.0, "access denied");
            Err(CseError::PermissionDenied(format!(
                "{} has no privilege for operation {} on {}",
                req.from, operation.0, target.path
            )))
        }
    }

    /// Whether `req` may perform `operation` on `target`.
    ///
    /// # Errors
    ///
    /// Storage failures other than dangling policy references.
    pub async fn check(
        &self,
        session: &dyn DbSession,
        target: &Resource,
        req: &Request,
        operation: AccessControlOperations,
    ) -> CseResult<bool> {
        if self.is_trusted(req) {
            return Ok(true);
        }

        let rules = self.effective_rules(session, target).await?;
        let originator = self.identity.absolute_originator(&req.from);
        let now = Utc::now();
        let granted = rules.iter().any(|rule| {
            rule.originators
                .iter()
                .any(|o| o == ALL_ORIGINATORS || self.identity.absolute_originator(o) == originator)
                && rule.operations.intersects(operation)
                && rule.authentication_satisfied(req.flags.authenticated)
                && rule.context_permits(now, req.source_address)
        });
        if granted {
            return Ok(true);
        }

        if self.dynamic_authorization {
            return self.dynamic_grant(session, target, req, operation).await;
        }
        Ok(false)
    }

    fn is_trusted(&self, req: &Request) -> bool {
        req.flags.internal || req.flags.cascading || self.identity.is_self(&req.from)
    }

    async fn effective_rules(
        &self,
        session: &dyn DbSession,
        target: &Resource,
    ) -> CseResult<Vec<AccessControlRule>> {
        if target.resource_type == ResourceType::AccessControlPolicy {
            let pvs = target.attr("pvs").cloned().unwrap_or(Value::Null);
            return Ok(Privileges::from_value(&pvs)?.rules);
        }

        let mut acpi = target.acpi();
        if acpi.is_empty() {
            acpi = inherited_acpi(session, target).await?;
        }
        if acpi.is_empty() {
            return Ok(self.default_rules.as_ref().clone());
        }

        let mut rules = Vec::new();
        for id in acpi {
            let Ok(Target::Local(local)) = normalize(&id, &self.identity) else {
                tracing::debug!(acpi = %id, "skipping policy hosted elsewhere");
                continue;
            };
            match session.get(&local).await {
                Ok(policy) if policy.resource_type == ResourceType::AccessControlPolicy => {
                    let pv = policy.attr("pv").cloned().unwrap_or(Value::Null);
                    rules.extend(Privileges::from_value(&pv)?.rules);
                }
                Ok(other) => {
                    tracing::warn!(acpi = %id, ty = %other.resource_type, "acpi names a non-policy resource");
                }
                Err(e) if e.is_not_found() => {
                    tracing::warn!(acpi = %id, target = %target.path, "dangling policy reference");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(rules)
    }

    /// Consults the dynamic authorization server named by the nearest `daci`
    /// on the branch. Grants are one-shot and not cached.
    async fn dynamic_grant(
        &self,
        session: &dyn DbSession,
        target: &Resource,
        req: &Request,
        operation: AccessControlOperations,
    ) -> CseResult<bool> {
        let servers = consultation_servers(session, target).await?;
        if servers.is_empty() {
            return Ok(false);
        }

        let content = json!({
            "m2m:sdrq": {
                "dai": {
                    "cro": req.from,
                    "tg": self.identity.qualify(&target.path),
                    "trt": target.resource_type.code(),
                    "acop": operation.0,
                }
            }
        });
        let consult = Request::notify(target.path.clone(), self.identity.sp_relative_id(), content);
        match self.transport.send_notify(&consult, &servers).await {
            Ok(resp) if resp.is_success() => {
                let granted = resp
                    .content
                    .as_ref()
                    .and_then(|c| c.pointer("/m2m:sdrp/dai/gp"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                tracing::debug!(fr = %req.from, target = %target.path, granted, "dynamic authorization answered");
                Ok(granted)
            }
            Ok(resp) => {
                tracing::warn!(rsc = resp.status.code(), "dynamic authorization refused");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(error = %e, "dynamic authorization server unreachable");
                Ok(false)
            }
        }
    }
}

/// `acpi` of the nearest ancestor Container carrying one.
async fn inherited_acpi(session: &dyn DbSession, target: &Resource) -> CseResult<Vec<String>> {
    let mut parent_id = target.parent_id.clone();
    while let Some(id) = parent_id {
        let parent = session.get(&id).await?;
        if parent.resource_type != ResourceType::Container {
            break;
        }
        let acpi = parent.acpi();
        if !acpi.is_empty() {
            return Ok(acpi);
        }
        parent_id = parent.parent_id;
    }
    Ok(Vec::new())
}

/// `daci` endpoints of the target or its nearest ancestor that has some.
async fn consultation_servers(session: &dyn DbSession, target: &Resource) -> CseResult<Vec<String>> {
    let daci = target.attr_list("daci");
    if !daci.is_empty() {
        return Ok(daci);
    }
    let mut parent_id = target.parent_id.clone();
    while let Some(id) = parent_id {
        let parent = session.get(&id).await?;
        let daci = parent.attr_list("daci");
        if !daci.is_empty() {
            return Ok(daci);
        }
        parent_id = parent.parent_id;
    }
    Ok(Vec::new())
}

#[cfg(test)]
mod tests {
    use cse_core::{time, Operation, ResponseStatusCode, Response};

    use super::*;
    use crate::storage::{Database, MemoryDb};
    use crate::testing::RecordingAdapter;
    use crate::transport::ClientAdapter;

    fn resource(ty: ResourceType, ri: &str, path: &str, parent: Option<&str>) -> Resource {
        let mut r = Resource::new(ty, time::now());
        r.resource_id = ri.into();
        r.resource_name = path.rsplit('/').next().unwrap_or(path).into();
        r.path = path.into();
        r.parent_id = parent.map(str::to_owned);
        r
    }

    fn policy(ri: &str, path: &str, parent: &str, pv: Value) -> Resource {
        let mut acp = resource(ResourceType::AccessControlPolicy, ri, path, Some(parent));
        acp.set_attr("pv", pv);
        acp.set_attr("pvs", json!({"acr": [{"acor": ["Cadmin"], "acop": 63}]}));
        acp
    }

    async fn tree() -> Arc<dyn DbSession> {
        let db = MemoryDb::new();
        let s = db.begin().await.unwrap();
        s.store(&resource(ResourceType::CseBase, "mn-cse-1", "onem2m", None))
            .await
            .unwrap();
        s.store(&policy(
            "acp-ro",
            "onem2m/readonly",
            "mn-cse-1",
            json!({"acr": [{"acor": ["all"], "acop": 2}]}),
        ))
        .await
        .unwrap();
        s.store(&policy(
            "acp-owner",
            "onem2m/owner",
            "mn-cse-1",
            json!({"acr": [{"acor": ["Cowner"], "acop": 63}]}),
        ))
        .await
        .unwrap();
        let mut cnt = resource(ResourceType::Container, "cnt1", "onem2m/data", Some("mn-cse-1"));
        cnt.set_attr("acpi", json!(["acp-ro"]));
        s.store(&cnt).await.unwrap();
        s.store(&resource(ResourceType::ContentInstance, "cin1", "onem2m/data/cin1", Some("cnt1")))
            .await
            .unwrap();
        let mut owned = resource(ResourceType::Container, "cnt2", "onem2m/owned", Some("mn-cse-1"));
        owned.set_attr("acpi", json!(["/mn-cse-1/acp-owner"]));
        s.store(&owned).await.unwrap();
        s
    }

    fn engine(config: &CseConfig) -> AccessControl {
        AccessControl::new(config, TransportDomain::new(Vec::new()))
    }

    fn op(o: Operation) -> AccessControlOperations {
        AccessControlOperations::for_operation(o, false)
    }

    #[tokio::test]
    async fn all_retrieve_rule_allows_only_retrieve() {
        let s = tree().await;
        let acl = engine(&CseConfig::default());
        let cnt = s.get("onem2m/data").await.unwrap();
        for originator in ["Calice", "Cbob", "/in-cse/Cx"] {
            let req = Request::retrieve("onem2m/data", originator);
            assert!(acl.check(s.as_ref(), &cnt, &req, op(Operation::Retrieve)).await.unwrap());
            for denied in [Operation::Create, Operation::Update, Operation::Delete] {
                assert!(!acl.check(s.as_ref(), &cnt, &req, op(denied)).await.unwrap());
            }
        }
    }

    #[tokio::test]
    async fn originator_scoped_rule_denies_others() {
        let s = tree().await;
        let acl = engine(&CseConfig::default());
        let owned = s.get("onem2m/owned").await.unwrap();
        let owner = Request::retrieve("onem2m/owned", "Cowner");
        let qualified_owner = Request::retrieve("onem2m/owned", "//openmtc.org/mn-cse-1/Cowner");
        let stranger = Request::retrieve("onem2m/owned", "Cstranger");
        let ops = op(Operation::Delete);
        assert!(acl.check(s.as_ref(), &owned, &owner, ops).await.unwrap());
        assert!(acl.check(s.as_ref(), &owned, &qualified_owner, ops).await.unwrap());
        let err = acl
            .authorize(s.as_ref(), &owned, &stranger, ops)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), ResponseStatusCode::OriginatorHasNoPrivilege);
    }

    #[tokio::test]
    async fn content_instances_inherit_container_policies() {
        let s = tree().await;
        let acl = engine(&CseConfig::default());
        let cin = s.get("cin1").await.unwrap();
        let req = Request::delete("onem2m/data/cin1", "Calice");
        assert!(!acl.check(s.as_ref(), &cin, &req, op(Operation::Delete)).await.unwrap());
        assert!(acl.check(s.as_ref(), &cin, &req, op(Operation::Retrieve)).await.unwrap());
    }

    #[tokio::test]
    async fn policies_guard_themselves_with_self_privileges() {
        let s = tree().await;
        let acl = engine(&CseConfig::default());
        let acp = s.get("acp-ro").await.unwrap();
        let admin = Request::update("onem2m/readonly", "Cadmin", json!({}));
        let anyone = Request::update("onem2m/readonly", "Calice", json!({}));
        assert!(acl.check(s.as_ref(), &acp, &admin, op(Operation::Update)).await.unwrap());
        assert!(!acl.check(s.as_ref(), &acp, &anyone, op(Operation::Update)).await.unwrap());
    }

    #[tokio::test]
    async fn defaults_apply_without_acpi_and_self_is_trusted() {
        let s = tree().await;
        let config = CseConfig {
            default_acp_rules: vec![AccessControlRule::allow_all(AccessControlOperations::RETRIEVE)],
            ..CseConfig::default()
        };
        let acl = engine(&config);
        let base = s.get("onem2m").await.unwrap();
        let ae = Request::create("onem2m", "C", ResourceType::Ae, json!({}));
        assert!(!acl.check(s.as_ref(), &base, &ae, op(Operation::Create)).await.unwrap());
        let me = Request::create("onem2m", "/mn-cse-1", ResourceType::Ae, json!({}));
        assert!(acl.check(s.as_ref(), &base, &me, op(Operation::Create)).await.unwrap());
        let internal = Request::create("onem2m", "Cx", ResourceType::Ae, json!({})).internal();
        assert!(acl.check(s.as_ref(), &base, &internal, op(Operation::Create)).await.unwrap());
    }

    #[tokio::test]
    async fn discovery_needs_its_own_bit() {
        let s = tree().await;
        let acl = engine(&CseConfig::default());
        let cnt = s.get("onem2m/data").await.unwrap();
        let req = Request::retrieve("onem2m/data", "Calice");
        let discover = AccessControlOperations::for_operation(Operation::Retrieve, true);
        assert!(!acl.check(s.as_ref(), &cnt, &req, discover).await.unwrap());
    }

    #[tokio::test]
    async fn dynamic_authorization_grants_once_per_request() {
        let s = tree().await;
        let mut base = s.get("onem2m").await.unwrap();
        base.set_attr("daci", json!(["mock://das"]));
        s.update(&base, Some(&["daci"])).await.unwrap();

        let adapter = RecordingAdapter::with(|_, req| {
            let granted = req
                .content
                .as_ref()
                .and_then(|c| c.pointer("/m2m:sdrq/dai/cro"))
                .and_then(Value::as_str)
                == Some("Ctrusted");
            Ok(Response::new(
                ResponseStatusCode::Ok,
                req,
                Some(json!({"m2m:sdrp": {"dai": {"gp": granted}}})),
            ))
        });
        let config = CseConfig {
            dynamic_authorization: true,
            ..CseConfig::default()
        };
        let acl = AccessControl::new(
            &config,
            TransportDomain::new(vec![adapter.clone() as Arc<dyn ClientAdapter>]),
        );
        let owned = s.get("onem2m/owned").await.unwrap();
        let trusted = Request::update("onem2m/owned", "Ctrusted", json!({}));
        let other = Request::update("onem2m/owned", "Cother", json!({}));
        assert!(acl.check(s.as_ref(), &owned, &trusted, op(Operation::Update)).await.unwrap());
        assert!(!acl.check(s.as_ref(), &owned, &other, op(Operation::Update)).await.unwrap());
        assert!(acl.check(s.as_ref(), &owned, &trusted, op(Operation::Update)).await.unwrap());
        assert_eq!(adapter.calls().len(), 3);
    }
}
