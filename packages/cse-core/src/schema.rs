//! Static per-type attribute schema.
//!
//! Every resource type has one [`TypeSchema`] describing its attributes
//! (short name, value kind, access class, mandatory flag), its capabilities
//! and the child types it may hold. Representations are validated against
//! the table instead of intercepting attribute writes at runtime.

use serde_json::{Map, Value};

use crate::error::{CseError, CseResult};
use crate::resource::ResourceType;

// ---------------------------------------------------------------------------
// Attribute descriptors
// ---------------------------------------------------------------------------

/// Who may write an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessClass {
    /// Assigned by the system; clients never write it.
    ReadOnly,
    /// Set once by the client on create, fixed afterwards.
    WriteOnce,
    /// Writable on create and update.
    ReadWrite,
}

/// Semantic value kind, checked on every client write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Integer,
    Boolean,
    Timestamp,
    StringList,
    Object,
    Any,
}

impl ValueKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::String | Self::Timestamp => value.is_string(),
            Self::Integer => value.is_u64() || value.is_i64(),
            Self::Boolean => value.is_boolean(),
            Self::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            Self::Object => value.is_object(),
            Self::Any => true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AttributeDef {
    pub name: &'static str,
    pub kind: ValueKind,
    pub access: AccessClass,
    pub mandatory: bool,
}

const fn attr(name: &'static str, kind: ValueKind, access: AccessClass) -> AttributeDef {
    AttributeDef {
        name,
        kind,
        access,
        mandatory: false,
    }
}

const fn required(name: &'static str, kind: ValueKind, access: AccessClass) -> AttributeDef {
    AttributeDef {
        name,
        kind,
        access,
        mandatory: true,
    }
}

use AccessClass::{ReadOnly as RO, ReadWrite as RW, WriteOnce as WO};
use ValueKind::{
    Any, Boolean, Integer, Object, String as Str, StringList as List, Timestamp as Ts,
};

const COMMON: &[AttributeDef] = &[
    attr("ty", Integer, RO),
    attr("ri", Str, RO),
    attr("rn", Str, WO),
    attr("pi", Str, RO),
    attr("ct", Ts, RO),
    attr("lt", Ts, RO),
    attr("lbl", List, RW),
];

const EXPIRING: &[AttributeDef] = &[attr("et", Ts, RW)];
const ACL_HOLDER: &[AttributeDef] = &[attr("acpi", List, RW)];
const ANNOUNCEABLE: &[AttributeDef] = &[attr("at", List, RW), attr("aa", List, RW)];
const DYNAMIC_AUTH: &[AttributeDef] = &[attr("daci", List, RW)];

const CSE_BASE: &[AttributeDef] = &[
    attr("cst", Integer, RO),
    attr("csi", Str, RO),
    attr("srt", Any, RO),
    attr("poa", List, RO),
    attr("nl", Str, RW),
];

const REMOTE_CSE: &[AttributeDef] = &[
    attr("cst", Integer, WO),
    attr("poa", List, RW),
    required("cb", Str, WO),
    required("csi", Str, WO),
    required("rr", Boolean, RW),
    attr("nl", Str, RW),
    attr("dcse", List, RW),
];

const AE: &[AttributeDef] = &[
    attr("apn", Str, RW),
    required("api", Str, WO),
    attr("aei", Str, RO),
    attr("poa", List, RW),
    attr("or", Str, RW),
    attr("nl", Str, RW),
    attr("rr", Boolean, RW),
    attr("csz", List, RW),
];

const CONTAINER: &[AttributeDef] = &[
    attr("st", Integer, RO),
    attr("cr", Str, RO),
    attr("mni", Integer, RW),
    attr("mbs", Integer, RW),
    attr("mia", Integer, RW),
    attr("cni", Integer, RO),
    attr("cbs", Integer, RO),
    attr("or", Str, RW),
    attr("ol", Str, RO),
    attr("la", Str, RO),
];

const CONTENT_INSTANCE: &[AttributeDef] = &[
    attr("st", Integer, RO),
    attr("cr", Str, RO),
    attr("cnf", Str, WO),
    attr("cs", Integer, RO),
    attr("or", Str, WO),
    required("con", Any, WO),
];

const SUBSCRIPTION: &[AttributeDef] = &[
    attr("enc", Object, RW),
    attr("exc", Integer, RW),
    required("nu", List, RW),
    attr("gpi", Str, WO),
    attr("nfu", Str, RW),
    attr("bn", Object, RW),
    attr("rl", Object, RW),
    attr("pn", Integer, RW),
    attr("nsp", Integer, RW),
    attr("ln", Boolean, RW),
    attr("nct", Integer, RW),
    attr("cr", Str, RO),
    attr("su", Str, WO),
];

const ACP: &[AttributeDef] = &[required("pv", Object, RW), required("pvs", Object, RW)];

const ANNOUNCED_COMMON: &[AttributeDef] = &[required("lnk", Str, WO)];

const AE_ANNC: &[AttributeDef] = &[
    attr("api", Str, WO),
    attr("aei", Str, WO),
    attr("poa", List, RW),
    attr("apn", Str, RW),
];

const CONTAINER_ANNC: &[AttributeDef] = &[
    attr("mni", Integer, RW),
    attr("mbs", Integer, RW),
    attr("mia", Integer, RW),
    attr("st", Integer, RO),
];

const ACP_ANNC: &[AttributeDef] = &[attr("pv", Object, RW), attr("pvs", Object, RW)];

// ---------------------------------------------------------------------------
// TypeSchema
// ---------------------------------------------------------------------------

/// Capabilities a type composes; engines test these instead of the concrete type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub expiring: bool,
    pub acl_holder: bool,
    pub announceable: bool,
    pub subscribable: bool,
}

#[derive(Debug)]
pub struct TypeSchema {
    pub resource_type: ResourceType,
    pub capabilities: Capabilities,
    /// Flexible types keep attributes the table does not describe.
    pub flexible: bool,
    pub children: &'static [ResourceType],
    groups: &'static [&'static [AttributeDef]],
}

impl TypeSchema {
    /// All attributes of the type, common ones first.
    pub fn attributes(&self) -> impl Iterator<Item = &'static AttributeDef> + '_ {
        self.groups.iter().flat_map(|group| group.iter())
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&'static AttributeDef> {
        self.attributes().find(|def| def.name == name)
    }

    #[must_use]
    pub fn allows_child(&self, child: ResourceType) -> bool {
        self.children.contains(&child)
    }
}

const fn caps(expiring: bool, acl_holder: bool, announceable: bool, subscribable: bool) -> Capabilities {
    Capabilities {
        expiring,
        acl_holder,
        announceable,
        subscribable,
    }
}

use ResourceType as T;

static SCHEMAS: [TypeSchema; 10] = [
    TypeSchema {
        resource_type: T::AccessControlPolicy,
        capabilities: caps(true, false, true, true),
        flexible: false,
        children: &[T::Subscription],
        groups: &[COMMON, EXPIRING, ANNOUNCEABLE, ACP],
    },
    TypeSchema {
        resource_type: T::Ae,
        capabilities: caps(true, true, true, true),
        flexible: false,
        children: &[T::Container, T::Subscription, T::AccessControlPolicy],
        groups: &[COMMON, EXPIRING, ACL_HOLDER, ANNOUNCEABLE, DYNAMIC_AUTH, AE],
    },
    TypeSchema {
        resource_type: T::Container,
        capabilities: caps(true, true, true, true),
        flexible: false,
        children: &[T::Container, T::ContentInstance, T::Subscription],
        groups: &[COMMON, EXPIRING, ACL_HOLDER, ANNOUNCEABLE, DYNAMIC_AUTH, CONTAINER],
    },
    TypeSchema {
        resource_type: T::ContentInstance,
        capabilities: caps(true, false, false, false),
        flexible: false,
        children: &[],
        groups: &[COMMON, EXPIRING, CONTENT_INSTANCE],
    },
    TypeSchema {
        resource_type: T::CseBase,
        capabilities: caps(false, true, false, true),
        flexible: false,
        children: &[
            T::RemoteCse,
            T::Ae,
            T::Container,
            T::AccessControlPolicy,
            T::Subscription,
        ],
        groups: &[COMMON, ACL_HOLDER, DYNAMIC_AUTH, CSE_BASE],
    },
    TypeSchema {
        resource_type: T::RemoteCse,
        capabilities: caps(true, true, false, true),
        flexible: false,
        children: &[
            T::AeAnnc,
            T::ContainerAnnc,
            T::AccessControlPolicyAnnc,
            T::Container,
            T::Subscription,
        ],
        groups: &[COMMON, EXPIRING, ACL_HOLDER, REMOTE_CSE],
    },
    TypeSchema {
        resource_type: T::Subscription,
        capabilities: caps(true, true, false, false),
        flexible: false,
        children: &[],
        groups: &[COMMON, EXPIRING, ACL_HOLDER, SUBSCRIPTION],
    },
    TypeSchema {
        resource_type: T::AccessControlPolicyAnnc,
        capabilities: caps(true, false, false, false),
        flexible: true,
        children: &[],
        groups: &[COMMON, EXPIRING, ANNOUNCED_COMMON, ACL_HOLDER, ACP_ANNC],
    },
    TypeSchema {
        resource_type: T::AeAnnc,
        capabilities: caps(true, true, false, true),
        flexible: true,
        children: &[T::ContainerAnnc, T::AccessControlPolicyAnnc, T::Subscription],
        groups: &[COMMON, EXPIRING, ANNOUNCED_COMMON, ACL_HOLDER, AE_ANNC],
    },
    TypeSchema {
        resource_type: T::ContainerAnnc,
        capabilities: caps(true, true, false, true),
        flexible: true,
        children: &[T::ContainerAnnc, T::Subscription],
        groups: &[COMMON, EXPIRING, ANNOUNCED_COMMON, ACL_HOLDER, CONTAINER_ANNC],
    },
];

/// Schema for a resource type.
#[must_use]
pub fn schema_for(ty: ResourceType) -> &'static TypeSchema {
    SCHEMAS
        .iter()
        .find(|schema| schema.resource_type == ty)
        .unwrap_or(&SCHEMAS[0])
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Operation a representation is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

/// Validates a client representation against the type's schema.
///
/// Unknown attributes are dropped unless the type is flexible. Read-only
/// attributes (and write-once attributes on update) are rejected unless
/// `privileged` (internal or forwarded requests). On create every mandatory
/// attribute must be present. Returns the accepted attributes.
///
/// # Errors
///
/// Returns `BadRequest` on a forbidden, missing or mistyped attribute.
pub fn validate(
    ty: ResourceType,
    attrs: Map<String, Value>,
    mode: WriteMode,
    privileged: bool,
) -> CseResult<Map<String, Value>> {
    let schema = schema_for(ty);
    let mut accepted = Map::new();

    for (name, value) in attrs {
        let Some(def) = schema.attribute(&name) else {
            if schema.flexible {
                accepted.insert(name, value);
            } else {
                tracing::debug!(attribute = %name, ty = %ty, "dropping unknown attribute");
            }
            continue;
        };

        if !privileged {
            match (def.access, mode) {
                (AccessClass::ReadOnly, _) => {
                    return Err(CseError::BadRequest(format!(
                        "attribute {name} is read-only"
                    )));
                }
                (AccessClass::WriteOnce, WriteMode::Update) => {
                    return Err(CseError::BadRequest(format!(
                        "attribute {name} can only be set on create"
                    )));
                }
                _ => {}
            }
        }

        if value.is_null() {
            if mode == WriteMode::Update && def.mandatory {
                return Err(CseError::BadRequest(format!(
                    "mandatory attribute {name} cannot be removed"
                )));
            }
        } else if !def.kind.accepts(&value) {
            return Err(CseError::BadRequest(format!(
                "attribute {name} has the wrong type"
            )));
        }

        accepted.insert(name, value);
    }

    if mode == WriteMode::Create {
        if let Some(missing) = schema
            .attributes()
            .find(|def| def.mandatory && !accepted.get(def.name).is_some_and(|v| !v.is_null()))
        {
            return Err(CseError::BadRequest(format!(
                "mandatory attribute {} is missing",
                missing.name
            )));
        }
    }

    Ok(accepted)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn every_type_has_a_schema() {
        for ty in ResourceType::ALL {
            assert_eq!(schema_for(ty).resource_type, ty);
        }
    }

    #[test]
    fn unknown_attributes_are_dropped() {
        let out = validate(
            ResourceType::Container,
            obj(json!({"mni": 5, "bogus": true})),
            WriteMode::Create,
            false,
        )
        .unwrap();
        assert!(out.contains_key("mni"));
        assert!(!out.contains_key("bogus"));
    }

    #[test]
    fn flexible_types_keep_unknown_attributes() {
        let out = validate(
            ResourceType::ContainerAnnc,
            obj(json!({"lnk": "/in-cse/cnt1", "custom": 1})),
            WriteMode::Create,
            false,
        )
        .unwrap();
        assert!(out.contains_key("custom"));
    }

    #[test]
    fn read_only_rejected_unless_privileged() {
        let attrs = obj(json!({"cni": 3}));
        assert!(validate(ResourceType::Container, attrs.clone(), WriteMode::Create, false).is_err());
        assert!(validate(ResourceType::Container, attrs, WriteMode::Create, true).is_ok());
    }

    #[test]
    fn write_once_forbidden_on_update() {
        let attrs = obj(json!({"api": "other"}));
        assert!(validate(ResourceType::Ae, attrs.clone(), WriteMode::Update, false).is_err());
        assert!(validate(ResourceType::Ae, attrs, WriteMode::Update, true).is_ok());
    }

    #[test]
    fn mandatory_enforced_on_create() {
        let err = validate(ResourceType::Ae, obj(json!({"rn": "x"})), WriteMode::Create, false)
            .unwrap_err();
        assert!(err.to_string().contains("api"));
        assert!(validate(ResourceType::Ae, obj(json!({"api": "a"})), WriteMode::Create, false).is_ok());
    }

    #[test]
    fn kinds_are_checked() {
        let err = validate(
            ResourceType::Container,
            obj(json!({"mni": "ten"})),
            WriteMode::Create,
            false,
        );
        assert!(err.is_err());
    }

    #[test]
    fn child_types_follow_table() {
        assert!(schema_for(ResourceType::Container).allows_child(ResourceType::ContentInstance));
        assert!(!schema_for(ResourceType::ContentInstance).allows_child(ResourceType::Container));
        assert!(schema_for(ResourceType::Container).capabilities.subscribable);
        assert!(!schema_for(ResourceType::ContentInstance).capabilities.subscribable);
    }
}
