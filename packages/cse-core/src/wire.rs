//! Long/short name tables for primitive fields, resource attributes, resource
//! types and filter criteria. The tables are part of wire compatibility: every
//! entry is bidirectional and must not be altered.

use serde_json::{Map, Value};

/// Request/response primitive parameters.
pub const PRIMITIVE_NAMES: &[(&str, &str)] = &[
    ("operation", "op"),
    ("to", "to"),
    ("from", "fr"),
    ("requestIdentifier", "rqi"),
    ("resourceType", "ty"),
    ("primitiveContent", "pc"),
    ("filterCriteria", "fc"),
    ("responseType", "rt"),
    ("resultContent", "rcn"),
    ("eventCategory", "ec"),
    ("discoveryResultType", "drt"),
    ("groupRequestIdentifier", "gid"),
    ("responseStatusCode", "rsc"),
    ("originatingTimestamp", "ot"),
    ("requestExpirationTimestamp", "rqet"),
    ("resultExpirationTimestamp", "rset"),
    ("operationExecutionTime", "oet"),
    ("deliveryAggregation", "da"),
];

/// Resource attribute names, including nested complex-type members.
pub const ATTRIBUTE_NAMES: &[(&str, &str)] = &[
    ("resourceName", "rn"),
    ("resourceType", "ty"),
    ("resourceID", "ri"),
    ("parentID", "pi"),
    ("creationTime", "ct"),
    ("lastModifiedTime", "lt"),
    ("expirationTime", "et"),
    ("labels", "lbl"),
    ("accessControlPolicyIDs", "acpi"),
    ("announceTo", "at"),
    ("announcedAttribute", "aa"),
    ("stateTag", "st"),
    ("creator", "cr"),
    ("maxNrOfInstances", "mni"),
    ("maxByteSize", "mbs"),
    ("maxInstanceAge", "mia"),
    ("currentNrOfInstances", "cni"),
    ("currentByteSize", "cbs"),
    ("oldest", "ol"),
    ("latest", "la"),
    ("contentInfo", "cnf"),
    ("contentSize", "cs"),
    ("content", "con"),
    ("ontologyRef", "or"),
    ("appName", "apn"),
    ("App-ID", "api"),
    ("AE-ID", "aei"),
    ("pointOfAccess", "poa"),
    ("requestReachability", "rr"),
    ("nodeLink", "nl"),
    ("contentSerialization", "csz"),
    ("cseType", "cst"),
    ("CSE-ID", "csi"),
    ("supportedResourceType", "srt"),
    ("CSEBase", "cb"),
    ("descendantCSEs", "dcse"),
    ("link", "lnk"),
    ("privileges", "pv"),
    ("selfPrivileges", "pvs"),
    ("accessControlRules", "acr"),
    ("accessControlOriginators", "acor"),
    ("accessControlOperations", "acop"),
    ("accessControlContexts", "acco"),
    ("accessControlWindow", "actw"),
    ("accessControlIpAddresses", "acip"),
    ("ipv4Addresses", "ipv4"),
    ("ipv6Addresses", "ipv6"),
    ("accessControlAuthenticationFlag", "acaf"),
    ("dynamicAuthorizationConsultationIDs", "daci"),
    ("eventNotificationCriteria", "enc"),
    ("expirationCounter", "exc"),
    ("notificationURI", "nu"),
    ("groupID", "gpi"),
    ("notificationForwardingURI", "nfu"),
    ("batchNotify", "bn"),
    ("number", "num"),
    ("duration", "dur"),
    ("rateLimit", "rl"),
    ("pendingNotification", "pn"),
    ("notificationStoragePriority", "nsp"),
    ("latestNotify", "ln"),
    ("notificationContentType", "nct"),
    ("notificationEventCat", "nec"),
    ("subscriberURI", "su"),
    ("notificationEventType", "net"),
    ("notificationEvent", "nev"),
    ("representation", "rep"),
    ("subscriptionReference", "sur"),
    ("subscriptionDeletion", "sud"),
    ("verificationRequest", "vrq"),
    ("creatorOriginator", "cro"),
    ("grantPrivileges", "gp"),
    ("dynamicAuthorizationInfo", "dai"),
    ("targetedResourceType", "trt"),
    ("targetedResource", "tg"),
];

/// Resource and complex type names (used after the `m2m:` prefix).
pub const TYPE_NAMES: &[(&str, &str)] = &[
    ("accessControlPolicy", "acp"),
    ("AE", "ae"),
    ("container", "cnt"),
    ("contentInstance", "cin"),
    ("CSEBase", "cb"),
    ("remoteCSE", "csr"),
    ("subscription", "sub"),
    ("accessControlPolicyAnnc", "acpA"),
    ("AEAnnc", "aeA"),
    ("containerAnnc", "cntA"),
    ("notification", "sgn"),
    ("aggregatedNotification", "agn"),
    ("URIList", "uril"),
    ("responsePrimitive", "rsp"),
    ("requestPrimitive", "rqp"),
    ("debugInfo", "dbg"),
    ("securityInfo", "sdrq"),
    ("securityInfoResponse", "sdrp"),
];

/// Filter criteria condition names.
pub const FILTER_NAMES: &[(&str, &str)] = &[
    ("createdBefore", "crb"),
    ("createdAfter", "cra"),
    ("modifiedSince", "ms"),
    ("unmodifiedSince", "us"),
    ("stateTagSmaller", "sts"),
    ("stateTagBigger", "stb"),
    ("expireBefore", "exb"),
    ("expireAfter", "exa"),
    ("labels", "lbl"),
    ("resourceType", "ty"),
    ("sizeAbove", "sza"),
    ("sizeBelow", "szb"),
    ("contentType", "cty"),
    ("limit", "lim"),
    ("attribute", "atr"),
    ("filterUsage", "fu"),
    ("level", "lvl"),
    ("offset", "ofst"),
];

fn lookup<'a>(table: &'a [(&'a str, &'a str)], name: &str, to_short: bool) -> Option<&'a str> {
    table.iter().find_map(|(long, short)| {
        if to_short && *long == name {
            Some(*short)
        } else if !to_short && *short == name {
            Some(*long)
        } else {
            None
        }
    })
}

#[must_use]
pub fn short_name<'a>(table: &'a [(&'a str, &'a str)], long: &str) -> Option<&'a str> {
    lookup(table, long, true)
}

#[must_use]
pub fn long_name<'a>(table: &'a [(&'a str, &'a str)], short: &str) -> Option<&'a str> {
    lookup(table, short, false)
}

fn translate_key(key: &str, to_short: bool) -> String {
    if let Some(type_name) = key.strip_prefix("m2m:") {
        return lookup(TYPE_NAMES, type_name, to_short)
            .map_or_else(|| key.to_owned(), |n| format!("m2m:{n}"));
    }
    lookup(ATTRIBUTE_NAMES, key, to_short).map_or_else(|| key.to_owned(), str::to_owned)
}

fn translate(value: Value, to_short: bool) -> Value {
    match value {
        Value::Object(map) => Value::Object(translate_map(map, to_short)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| translate(item, to_short))
                .collect(),
        ),
        other => other,
    }
}

fn translate_map(map: Map<String, Value>, to_short: bool) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| (translate_key(&key, to_short), translate(value, to_short)))
        .collect()
}

/// Rewrites every known long attribute/type name in `value` to its short alias.
/// Unknown keys pass through unchanged.
#[must_use]
pub fn to_short(value: Value) -> Value {
    translate(value, true)
}

/// Rewrites every known short attribute/type name in `value` to its long form.
#[must_use]
pub fn to_long(value: Value) -> Value {
    translate(value, false)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    #[test]
    fn tables_are_bijective() {
        for table in [PRIMITIVE_NAMES, ATTRIBUTE_NAMES, TYPE_NAMES, FILTER_NAMES] {
            let longs: HashSet<_> = table.iter().map(|(l, _)| *l).collect();
            let shorts: HashSet<_> = table.iter().map(|(_, s)| *s).collect();
            assert_eq!(longs.len(), table.len());
            assert_eq!(shorts.len(), table.len());
        }
    }

    #[test]
    fn primitive_names_are_fixed() {
        assert_eq!(short_name(PRIMITIVE_NAMES, "requestIdentifier"), Some("rqi"));
        assert_eq!(long_name(PRIMITIVE_NAMES, "fr"), Some("from"));
        assert_eq!(short_name(ATTRIBUTE_NAMES, "maxNrOfInstances"), Some("mni"));
        assert_eq!(long_name(FILTER_NAMES, "lim"), Some("limit"));
    }

    #[test]
    fn nested_representation_translates() {
        let long = json!({
            "m2m:accessControlPolicy": {
                "resourceName": "acp1",
                "privileges": {"accessControlRules": [
                    {"accessControlOriginators": ["all"], "accessControlOperations": 2}
                ]}
            }
        });
        let short = to_short(long.clone());
        assert_eq!(short["m2m:acp"]["pv"]["acr"][0]["acop"], 2);
        assert_eq!(to_long(short), long);
    }

    fn attribute_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[a-zA-Z0-9/_-]{0,12}".prop_map(Value::from),
            prop::collection::vec("[a-z]{1,6}", 0..4).prop_map(Value::from),
        ]
    }

    proptest! {
        #[test]
        fn short_attributes_survive_long_round_trip(
            picks in prop::collection::btree_map(0..ATTRIBUTE_NAMES.len(), attribute_value(), 1..12)
        ) {
            let attrs: Map<String, Value> = picks
                .into_iter()
                .map(|(i, v)| (ATTRIBUTE_NAMES[i].1.to_owned(), v))
                .collect();
            let original = Value::Object(attrs);
            prop_assert_eq!(to_short(to_long(original.clone())), original);
        }
    }
}
