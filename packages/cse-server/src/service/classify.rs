//! Request classification: checks the originator and decides whether a
//! request is served here or forwarded to another CSE.

use cse_core::address::normalize;
use cse_core::{CseError, CseIdentity, CseResult, Operation, Request, ResourceType, Target};

use crate::transport::TransportDomain;

/// Where a request goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Served by this node at the given CSE-relative path or resource ID.
    Local(String),
    /// Relayed unchanged to another CSE.
    Forward { cse_id: String },
}

/// Whether `originator` is exactly a known peer CSE-ID (SP-relative or
/// absolute form).
fn is_peer_cse(originator: &str, transport: &TransportDomain) -> bool {
    let id = match originator.strip_prefix("//") {
        Some(abs) => abs.split_once('/').map_or("", |(_, rest)| rest),
        None => originator.trim_start_matches('/'),
    };
    !id.is_empty() && !id.contains('/') && transport.is_peer(id)
}

/// Validates the originator of `req`, marks requests relayed by peer CSEs as
/// forwarded and routes the target.
///
/// # Errors
///
/// `BadRequest` for a missing originator or malformed target,
/// `Impersonation` for an outside request claiming this node's identity.
pub fn classify(
    req: &mut Request,
    identity: &CseIdentity,
    transport: &TransportDomain,
) -> CseResult<Route> {
    if !req.flags.internal {
        if req.from.is_empty() {
            let registering_ae =
                req.operation == Operation::Create && req.resource_type == Some(ResourceType::Ae);
            if !registering_ae {
                return Err(CseError::BadRequest("originator missing".into()));
            }
        } else if identity.is_self(&req.from) {
            return Err(CseError::Impersonation(format!(
                "{} is this CSE's own identity",
                req.from
            )));
        }
        if is_peer_cse(&req.from, transport) {
            req.flags.forwarded = true;
        }
    }

    match normalize(&req.to, identity)? {
        Target::Local(path) => Ok(Route::Local(path)),
        Target::Remote { cse_id } => Ok(Route::Forward { cse_id }),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn setup() -> (CseIdentity, TransportDomain) {
        let transport = TransportDomain::new(Vec::new());
        transport.add_peer("in-cse", vec!["http://in:8000".into()], "onem2m", true);
        (CseIdentity::new("openmtc.org", "mn-cse-1", "onem2m"), transport)
    }

    #[test]
    fn equivalent_local_forms_route_to_one_path() {
        let (me, transport) = setup();
        for to in [
            "//openmtc.org/mn-cse-1/onem2m/app",
            "/mn-cse-1/onem2m/app",
            "onem2m/app",
            "./app",
        ] {
            let mut req = Request::retrieve(to, "Cx");
            assert_eq!(
                classify(&mut req, &me, &transport).unwrap(),
                Route::Local("onem2m/app".into()),
                "{to}"
            );
        }
    }

    #[test]
    fn foreign_targets_are_forwarded() {
        let (me, transport) = setup();
        let mut req = Request::retrieve("/in-cse/onem2m/app", "Cx");
        assert_eq!(
            classify(&mut req, &me, &transport).unwrap(),
            Route::Forward {
                cse_id: "in-cse".into()
            }
        );
    }

    #[test]
    fn originator_rules() {
        let (me, transport) = setup();

        let mut anonymous = Request::retrieve("onem2m", "");
        assert!(classify(&mut anonymous, &me, &transport).is_err());

        let mut register = Request::create("onem2m", "", ResourceType::Ae, json!({}));
        assert!(classify(&mut register, &me, &transport).is_ok());

        let mut spoof = Request::retrieve("onem2m", "/mn-cse-1");
        assert!(matches!(
            classify(&mut spoof, &me, &transport),
            Err(CseError::Impersonation(_))
        ));

        let mut own = Request::retrieve("onem2m", "/mn-cse-1").internal();
        assert!(classify(&mut own, &me, &transport).is_ok());

        let mut peer = Request::update("onem2m/x", "//openmtc.org/in-cse", json!({}));
        classify(&mut peer, &me, &transport).unwrap();
        assert!(peer.flags.forwarded);

        let mut peer_ae = Request::update("onem2m/x", "/in-cse/Cae", json!({}));
        classify(&mut peer_ae, &me, &transport).unwrap();
        assert!(!peer_ae.flags.forwarded);
    }
}
