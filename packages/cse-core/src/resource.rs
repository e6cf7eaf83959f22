//! Resource model: resource types and the stored resource record.
//!
//! Common attributes are typed fields. Type-specific attributes live in an
//! ordered map keyed by their short wire name and are described by the static
//! table in [`crate::schema`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CseError, CseResult};
use crate::time;

/// Type-specific attributes keyed by short name.
pub type Attributes = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// ResourceType
// ---------------------------------------------------------------------------

/// Resource types hosted by the node, with their numeric `ty` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum ResourceType {
    AccessControlPolicy,
    Ae,
    Container,
    ContentInstance,
    CseBase,
    RemoteCse,
    Subscription,
    AccessControlPolicyAnnc,
    AeAnnc,
    ContainerAnnc,
}

impl ResourceType {
    pub const ALL: [ResourceType; 10] = [
        Self::AccessControlPolicy,
        Self::Ae,
        Self::Container,
        Self::ContentInstance,
        Self::CseBase,
        Self::RemoteCse,
        Self::Subscription,
        Self::AccessControlPolicyAnnc,
        Self::AeAnnc,
        Self::ContainerAnnc,
    ];

    #[must_use]
    pub fn code(self) -> u32 {
        match self {
            Self::AccessControlPolicy => 1,
            Self::Ae => 2,
            Self::Container => 3,
            Self::ContentInstance => 4,
            Self::CseBase => 5,
            Self::RemoteCse => 16,
            Self::Subscription => 23,
            Self::AccessControlPolicyAnnc => 10_001,
            Self::AeAnnc => 10_002,
            Self::ContainerAnnc => 10_003,
        }
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.code() == code)
    }

    /// Short type name, as used after the `m2m:` prefix.
    #[must_use]
    pub fn short_name(self) -> &'static str {
        match self {
            Self::AccessControlPolicy => "acp",
            Self::Ae => "ae",
            Self::Container => "cnt",
            Self::ContentInstance => "cin",
            Self::CseBase => "cb",
            Self::RemoteCse => "csr",
            Self::Subscription => "sub",
            Self::AccessControlPolicyAnnc => "acpA",
            Self::AeAnnc => "aeA",
            Self::ContainerAnnc => "cntA",
        }
    }

    /// Root element name wrapping a representation, e.g. `m2m:cnt`.
    #[must_use]
    pub fn root_key(self) -> String {
        format!("m2m:{}", self.short_name())
    }

    /// Announced counterpart of an announceable type.
    #[must_use]
    pub fn announced(self) -> Option<Self> {
        match self {
            Self::AccessControlPolicy => Some(Self::AccessControlPolicyAnnc),
            Self::Ae => Some(Self::AeAnnc),
            Self::Container => Some(Self::ContainerAnnc),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_announced(self) -> bool {
        matches!(
            self,
            Self::AccessControlPolicyAnnc | Self::AeAnnc | Self::ContainerAnnc
        )
    }
}

impl From<ResourceType> for u32 {
    fn from(ty: ResourceType) -> Self {
        ty.code()
    }
}

impl TryFrom<u32> for ResourceType {
    type Error = String;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unsupported resource type {code}"))
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.short_name())
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A node of the resource tree as persisted by the DB session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub resource_name: String,
    /// `None` only for the CSE base.
    pub parent_id: Option<String>,
    /// Structured CSE-relative path, e.g. `onem2m/MYAPP/data`.
    pub path: String,
    pub creation_time: DateTime<Utc>,
    pub last_modified_time: DateTime<Utc>,
    pub expiration_time: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub attributes: Attributes,
}

impl Resource {
    /// Creates an empty resource of the given type stamped with `now`.
    #[must_use]
    pub fn new(resource_type: ResourceType, now: DateTime<Utc>) -> Self {
        Self {
            resource_type,
            resource_id: String::new(),
            resource_name: String::new(),
            parent_id: None,
            path: String::new(),
            creation_time: now,
            last_modified_time: now,
            expiration_time: None,
            labels: Vec::new(),
            attributes: Attributes::new(),
        }
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    #[must_use]
    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attr(name).and_then(Value::as_str)
    }

    #[must_use]
    pub fn attr_u64(&self, name: &str) -> Option<u64> {
        self.attr(name).and_then(Value::as_u64)
    }

    #[must_use]
    pub fn attr_bool(&self, name: &str) -> Option<bool> {
        self.attr(name).and_then(Value::as_bool)
    }

    /// String list attribute; a lone string is treated as a one-element list.
    #[must_use]
    pub fn attr_list(&self, name: &str) -> Vec<String> {
        match self.attr(name) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<Value>) {
        self.attributes.insert(name.to_owned(), value.into());
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// Access control policy IDs (`acpi`).
    #[must_use]
    pub fn acpi(&self) -> Vec<String> {
        self.attr_list("acpi")
    }

    /// CSE-IDs this resource is announced to (`at`).
    #[must_use]
    pub fn announce_to(&self) -> Vec<String> {
        self.attr_list("at")
    }

    #[must_use]
    pub fn state_tag(&self) -> Option<u64> {
        self.attr_u64("st")
    }

    /// Applies one attribute from a request representation. Common attributes
    /// go to their typed field; `null` removes an optional attribute.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` when a common attribute has the wrong shape.
    pub fn apply(&mut self, name: &str, value: Value) -> CseResult<()> {
        match name {
            "rn" => {
                self.resource_name = value
                    .as_str()
                    .ok_or_else(|| CseError::BadRequest("rn must be a string".into()))?
                    .to_owned();
            }
            "et" => {
                self.expiration_time = match value {
                    Value::Null => None,
                    Value::String(s) => Some(time::parse(&s)?),
                    _ => return Err(CseError::BadRequest("et must be a timestamp".into())),
                };
            }
            "lbl" => {
                self.labels = match value {
                    Value::Null => Vec::new(),
                    Value::Array(items) => {
                        let mut labels: Vec<String> = Vec::with_capacity(items.len());
                        for item in items {
                            let label = item
                                .as_str()
                                .ok_or_else(|| CseError::BadRequest("lbl must be strings".into()))?;
                            if !labels.iter().any(|l| l == label) {
                                labels.push(label.to_owned());
                            }
                        }
                        labels
                    }
                    _ => return Err(CseError::BadRequest("lbl must be a list".into())),
                };
            }
            _ => {
                if value.is_null() {
                    self.attributes.remove(name);
                } else {
                    self.attributes.insert(name.to_owned(), value);
                }
            }
        }
        Ok(())
    }

    /// Flat short-name attribute map including the common attributes.
    #[must_use]
    pub fn to_attributes(&self) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("ty".into(), Value::from(self.resource_type.code()));
        out.insert("ri".into(), Value::from(self.resource_id.clone()));
        out.insert("rn".into(), Value::from(self.resource_name.clone()));
        out.insert(
            "pi".into(),
            self.parent_id.clone().map_or(Value::Null, Value::from),
        );
        out.insert("ct".into(), Value::from(time::format(self.creation_time)));
        out.insert("lt".into(), Value::from(time::format(self.last_modified_time)));
        if let Some(et) = self.expiration_time {
            out.insert("et".into(), Value::from(time::format(et)));
        }
        if !self.labels.is_empty() {
            out.insert("lbl".into(), Value::from(self.labels.clone()));
        }
        for (name, value) in &self.attributes {
            out.insert(name.clone(), value.clone());
        }
        out
    }

    /// Full representation wrapped in the type's root element.
    #[must_use]
    pub fn representation(&self) -> Value {
        let mut root = Map::new();
        root.insert(
            self.resource_type.root_key(),
            Value::Object(self.to_attributes()),
        );
        Value::Object(root)
    }

    /// Representation restricted to the given attribute names.
    #[must_use]
    pub fn projection(&self, names: &[String]) -> Value {
        let mut attrs = self.to_attributes();
        attrs.retain(|k, _| names.iter().any(|n| n == k));
        let mut root = Map::new();
        root.insert(self.resource_type.root_key(), Value::Object(attrs));
        Value::Object(root)
    }
}

/// Extracts the attribute object from request content, which may be wrapped
/// in the type's root element (`{"m2m:cnt": {...}}`) or bare.
///
/// # Errors
///
/// Returns `ContentsUnacceptable` if the content is not a JSON object or is
/// wrapped in a root element of a different type.
pub fn content_attributes(content: &Value, ty: ResourceType) -> CseResult<Map<String, Value>> {
    let Value::Object(map) = content else {
        return Err(CseError::ContentsUnacceptable(
            "primitive content must be an object".into(),
        ));
    };
    let root = ty.root_key();
    if let Some(inner) = map.get(&root) {
        return match inner {
            Value::Object(attrs) => Ok(attrs.clone()),
            _ => Err(CseError::ContentsUnacceptable(format!(
                "{root} must be an object"
            ))),
        };
    }
    if let Some(other) = map.keys().find(|k| k.starts_with("m2m:")) {
        return Err(CseError::ContentsUnacceptable(format!(
            "expected {root}, got {other}"
        )));
    }
    Ok(map.clone())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn type_codes_round_trip() {
        for ty in ResourceType::ALL {
            assert_eq!(ResourceType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(ResourceType::from_code(99), None);
        assert_eq!(ResourceType::Container.root_key(), "m2m:cnt");
        assert_eq!(ResourceType::Ae.announced(), Some(ResourceType::AeAnnc));
    }

    #[test]
    fn apply_routes_common_attributes() {
        let mut res = Resource::new(ResourceType::Container, time::now());
        res.apply("rn", json!("temp")).unwrap();
        res.apply("lbl", json!(["a", "b", "a"])).unwrap();
        res.apply("et", json!("20301231T000000")).unwrap();
        res.apply("mni", json!(10)).unwrap();

        assert_eq!(res.resource_name, "temp");
        assert_eq!(res.labels, vec!["a", "b"]);
        assert!(res.expiration_time.is_some());
        assert_eq!(res.attr_u64("mni"), Some(10));

        res.apply("mni", Value::Null).unwrap();
        assert!(res.attr("mni").is_none());
        assert!(res.apply("lbl", json!("oops")).is_err());
    }

    #[test]
    fn content_may_be_wrapped_or_bare() {
        let wrapped = json!({"m2m:ae": {"api": "myApp"}});
        let bare = json!({"api": "myApp"});
        let a = content_attributes(&wrapped, ResourceType::Ae).unwrap();
        let b = content_attributes(&bare, ResourceType::Ae).unwrap();
        assert_eq!(a, b);

        let wrong = json!({"m2m:cnt": {}});
        assert!(content_attributes(&wrong, ResourceType::Ae).is_err());
    }

    #[test]
    fn representation_is_rooted_and_projectable() {
        let mut res = Resource::new(ResourceType::Ae, time::now());
        res.resource_id = "Cabc".into();
        res.resource_name = "MYAPP".into();
        res.set_attr("api", "myApp");

        let rep = res.representation();
        assert_eq!(rep["m2m:ae"]["api"], "myApp");
        assert_eq!(rep["m2m:ae"]["ty"], 2);

        let proj = res.projection(&["api".to_string()]);
        assert_eq!(proj, json!({"m2m:ae": {"api": "myApp"}}));
    }
}
