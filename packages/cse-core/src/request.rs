//! Protocol-neutral request/response envelope.
//!
//! Both are transient: constructed per call by a binding (HTTP, internal
//! engines) and never persisted.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CseError;
use crate::resource::ResourceType;
use crate::status::ResponseStatusCode;
use crate::time;

/// Length of auto-generated request identifiers.
pub const REQUEST_ID_LEN: usize = 16;

/// Generates a random alphanumeric request identifier.
#[must_use]
pub fn generate_request_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(REQUEST_ID_LEN)
        .map(char::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $code:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(into = "u8", try_from = "u8")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            #[must_use]
            pub fn code(self) -> u8 {
                match self {
                    $(Self::$variant => $code),+
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> Self {
                value.code()
            }
        }

        impl TryFrom<u8> for $name {
            type Error = String;

            fn try_from(code: u8) -> Result<Self, Self::Error> {
                match code {
                    $($code => Ok(Self::$variant),)+
                    other => Err(format!("invalid {} {other}", stringify!($name))),
                }
            }
        }
    };
}

wire_enum!(
    /// Request operation (`op`).
    Operation {
        Create = 1,
        Retrieve = 2,
        Update = 3,
        Delete = 4,
        Notify = 5,
    }
);

wire_enum!(
    /// Filter usage (`fu`): plain conditional retrieve vs. discovery.
    FilterUsage {
        Discovery = 1,
        ConditionalRetrieval = 2,
    }
);

wire_enum!(
    /// Response type (`rt`). Only blocking semantics are served; the other
    /// values are accepted and answered synchronously.
    ResponseType {
        BlockingRequest = 1,
        NonBlockingSynch = 2,
        NonBlockingAsynch = 3,
        FlexBlocking = 4,
    }
);

wire_enum!(
    /// Result content (`rcn`).
    ResultContent {
        Nothing = 0,
        Attributes = 1,
        HierarchicalAddress = 2,
        HierarchicalAddressAttributes = 3,
        AttributesAndChildResources = 4,
        AttributesAndChildResourceReferences = 5,
        ChildResourceReferences = 6,
        OriginalResource = 7,
        ChildResources = 8,
    }
);

wire_enum!(
    /// Discovery result type (`drt`).
    DiscoveryResultType {
        Structured = 1,
        Unstructured = 2,
    }
);

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Retrieve => "retrieve",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Notify => "notify",
        }
    }
}

// ---------------------------------------------------------------------------
// FilterCriteria
// ---------------------------------------------------------------------------

/// Predicate set narrowing a retrieve or discovery (`fc`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    #[serde(rename = "crb", with = "time::serde_opt", skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(rename = "cra", with = "time::serde_opt", skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(rename = "ms", with = "time::serde_opt", skip_serializing_if = "Option::is_none")]
    pub modified_since: Option<DateTime<Utc>>,
    #[serde(rename = "us", with = "time::serde_opt", skip_serializing_if = "Option::is_none")]
    pub unmodified_since: Option<DateTime<Utc>>,
    #[serde(rename = "sts", skip_serializing_if = "Option::is_none")]
    pub state_tag_smaller: Option<u64>,
    #[serde(rename = "stb", skip_serializing_if = "Option::is_none")]
    pub state_tag_bigger: Option<u64>,
    #[serde(rename = "exb", with = "time::serde_opt", skip_serializing_if = "Option::is_none")]
    pub expire_before: Option<DateTime<Utc>>,
    #[serde(rename = "exa", with = "time::serde_opt", skip_serializing_if = "Option::is_none")]
    pub expire_after: Option<DateTime<Utc>>,
    #[serde(rename = "lbl", skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,
    #[serde(rename = "ty", skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<ResourceType>,
    #[serde(rename = "sza", skip_serializing_if = "Option::is_none")]
    pub size_above: Option<u64>,
    #[serde(rename = "szb", skip_serializing_if = "Option::is_none")]
    pub size_below: Option<u64>,
    #[serde(rename = "lim", skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(rename = "fu", skip_serializing_if = "Option::is_none")]
    pub filter_usage: Option<FilterUsage>,
    #[serde(rename = "lvl", skip_serializing_if = "Option::is_none")]
    pub level: Option<usize>,
    #[serde(rename = "ofst", skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
}

impl FilterCriteria {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn is_discovery(&self) -> bool {
        self.filter_usage == Some(FilterUsage::Discovery)
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Processing flags that never travel on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Issued by this node's own engines.
    pub internal: bool,
    /// Relayed by a peer CSE on behalf of its originator.
    pub forwarded: bool,
    /// Part of a recursive delete; the parent update is fired by the root only.
    pub cascading: bool,
    /// The binding authenticated the originator.
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "op")]
    pub operation: Operation,
    pub to: String,
    #[serde(rename = "fr", default)]
    pub from: String,
    #[serde(rename = "rqi", default = "generate_request_id")]
    pub request_identifier: String,
    #[serde(rename = "ty", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<ResourceType>,
    #[serde(rename = "pc", default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(rename = "fc", default, skip_serializing_if = "FilterCriteria::is_empty")]
    pub filter_criteria: FilterCriteria,
    #[serde(rename = "rt", default, skip_serializing_if = "Option::is_none")]
    pub response_type: Option<ResponseType>,
    #[serde(rename = "rcn", default, skip_serializing_if = "Option::is_none")]
    pub result_content: Option<ResultContent>,
    #[serde(rename = "ec", default, skip_serializing_if = "Option::is_none")]
    pub event_category: Option<u32>,
    #[serde(rename = "drt", default, skip_serializing_if = "Option::is_none")]
    pub discovery_result_type: Option<DiscoveryResultType>,
    #[serde(rename = "gid", default, skip_serializing_if = "Option::is_none")]
    pub group_request_identifier: Option<String>,
    #[serde(
        rename = "rqet",
        default,
        with = "time::serde_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub request_expiration: Option<DateTime<Utc>>,
    /// Attribute projection requested by the binding.
    #[serde(skip)]
    pub attribute_list: Vec<String>,
    #[serde(skip)]
    pub flags: RequestFlags,
    #[serde(skip)]
    pub source_address: Option<IpAddr>,
}

impl Request {
    /// Creates a request with a freshly generated identifier.
    #[must_use]
    pub fn new(operation: Operation, to: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            operation,
            to: to.into(),
            from: from.into(),
            request_identifier: generate_request_id(),
            resource_type: None,
            content: None,
            filter_criteria: FilterCriteria::default(),
            response_type: None,
            result_content: None,
            event_category: None,
            discovery_result_type: None,
            group_request_identifier: None,
            request_expiration: None,
            attribute_list: Vec::new(),
            flags: RequestFlags::default(),
            source_address: None,
        }
    }

    #[must_use]
    pub fn create(
        to: impl Into<String>,
        from: impl Into<String>,
        ty: ResourceType,
        content: Value,
    ) -> Self {
        let mut req = Self::new(Operation::Create, to, from);
        req.resource_type = Some(ty);
        req.content = Some(content);
        req
    }

    #[must_use]
    pub fn retrieve(to: impl Into<String>, from: impl Into<String>) -> Self {
        Self::new(Operation::Retrieve, to, from)
    }

    #[must_use]
    pub fn update(to: impl Into<String>, from: impl Into<String>, content: Value) -> Self {
        let mut req = Self::new(Operation::Update, to, from);
        req.content = Some(content);
        req
    }

    #[must_use]
    pub fn delete(to: impl Into<String>, from: impl Into<String>) -> Self {
        Self::new(Operation::Delete, to, from)
    }

    #[must_use]
    pub fn notify(to: impl Into<String>, from: impl Into<String>, content: Value) -> Self {
        let mut req = Self::new(Operation::Notify, to, from);
        req.content = Some(content);
        req
    }

    /// Marks the request as issued by this node itself.
    #[must_use]
    pub fn internal(mut self) -> Self {
        self.flags.internal = true;
        self
    }

    #[must_use]
    pub fn with_filter(mut self, filter: FilterCriteria) -> Self {
        self.filter_criteria = filter;
        self
    }

    /// Internal or forwarded requests may write system attributes.
    #[must_use]
    pub fn is_privileged(&self) -> bool {
        self.flags.internal || self.flags.forwarded
    }

    /// Effective result content, defaulting to attributes.
    #[must_use]
    pub fn result_content(&self) -> ResultContent {
        self.result_content.unwrap_or(ResultContent::Attributes)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "rsc")]
    pub status: ResponseStatusCode,
    #[serde(rename = "rqi", default)]
    pub request_identifier: String,
    #[serde(rename = "pc", default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    /// Echo of the request originator.
    #[serde(rename = "to", default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(rename = "fr", default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Discovery stopped at the limit with further matches remaining.
    #[serde(skip)]
    pub truncated: bool,
}

impl Response {
    /// Builds a response echoing the request's identifier and originator.
    #[must_use]
    pub fn new(status: ResponseStatusCode, request: &Request, content: Option<Value>) -> Self {
        Self {
            status,
            request_identifier: request.request_identifier.clone(),
            content,
            to: Some(request.from.clone()),
            from: None,
            truncated: false,
        }
    }

    /// Builds an error response carrying the message as debug info.
    #[must_use]
    pub fn from_error(err: &CseError, request_identifier: &str, originator: &str) -> Self {
        Self {
            status: err.status_code(),
            request_identifier: request_identifier.to_owned(),
            content: Some(json!({ "m2m:dbg": err.to_string() })),
            to: Some(originator.to_owned()),
            from: None,
            truncated: false,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Resource attributes from a response representation, if any.
    #[must_use]
    pub fn resource_attributes(&self) -> Option<&serde_json::Map<String, Value>> {
        let Value::Object(root) = self.content.as_ref()? else {
            return None;
        };
        root.iter()
            .find(|(key, _)| key.starts_with("m2m:"))
            .and_then(|(_, inner)| inner.as_object())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_sixteen_alphanumerics() {
        let id = generate_request_id();
        assert_eq!(id.len(), REQUEST_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_request_id());
    }

    #[test]
    fn request_deserializes_from_short_names() {
        let raw = json!({
            "op": 1,
            "to": "onem2m",
            "fr": "Cmyself",
            "ty": 3,
            "pc": {"m2m:cnt": {"rn": "data"}},
            "fc": {"lbl": ["a"], "fu": 1, "lim": 5}
        });
        let req: Request = serde_json::from_value(raw).unwrap();
        assert_eq!(req.operation, Operation::Create);
        assert_eq!(req.resource_type, Some(ResourceType::Container));
        assert_eq!(req.request_identifier.len(), REQUEST_ID_LEN);
        assert!(req.filter_criteria.is_discovery());
        assert_eq!(req.filter_criteria.limit, Some(5));
        assert!(!req.flags.internal);
    }

    #[test]
    fn response_echoes_request() {
        let req = Request::retrieve("onem2m", "Cabc");
        let resp = Response::new(ResponseStatusCode::Ok, &req, None);
        assert_eq!(resp.request_identifier, req.request_identifier);
        assert_eq!(resp.to.as_deref(), Some("Cabc"));

        let err = Response::from_error(&CseError::not_found("x"), "rq1", "Cabc");
        assert_eq!(err.status, ResponseStatusCode::NotFound);
        assert!(err.content.unwrap()["m2m:dbg"].is_string());
    }

    #[test]
    fn filter_criteria_timestamps_use_wire_format() {
        let raw = json!({"crb": "20240101T000000", "sts": 4});
        let fc: FilterCriteria = serde_json::from_value(raw).unwrap();
        assert!(fc.created_before.is_some());
        let back = serde_json::to_value(&fc).unwrap();
        assert_eq!(back["crb"], "20240101T000000");
        assert!(back.get("cra").is_none());
    }
}
