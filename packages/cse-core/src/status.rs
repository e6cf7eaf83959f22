//! Response status codes and their transport-level mapping.

use serde::{Deserialize, Serialize};

/// Four-digit response status code carried in every response primitive (`rsc`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum ResponseStatusCode {
    Accepted,
    Ok,
    Created,
    Deleted,
    Updated,
    BadRequest,
    NotFound,
    OperationNotAllowed,
    RequestTimeout,
    SubscriptionCreatorHasNoPrivilege,
    ContentsUnacceptable,
    OriginatorHasNoPrivilege,
    Conflict,
    OriginatorHasNotRegistered,
    SecurityAssociationRequired,
    InvalidChildResourceType,
    InternalServerError,
    NotImplemented,
    TargetNotReachable,
    ReceiverHasNoPrivilege,
    AlreadyExists,
    TargetNotSubscribable,
}

impl ResponseStatusCode {
    /// Numeric code as it appears on the wire.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Accepted => 1000,
            Self::Ok => 2000,
            Self::Created => 2001,
            Self::Deleted => 2002,
            Self::Updated => 2004,
            Self::BadRequest => 4000,
            Self::NotFound => 4004,
            Self::OperationNotAllowed => 4005,
            Self::RequestTimeout => 4008,
            Self::SubscriptionCreatorHasNoPrivilege => 4101,
            Self::ContentsUnacceptable => 4102,
            Self::OriginatorHasNoPrivilege => 4103,
            Self::Conflict => 4105,
            Self::OriginatorHasNotRegistered => 4106,
            Self::SecurityAssociationRequired => 4107,
            Self::InvalidChildResourceType => 4108,
            Self::InternalServerError => 5000,
            Self::NotImplemented => 5001,
            Self::TargetNotReachable => 5103,
            Self::ReceiverHasNoPrivilege => 5105,
            Self::AlreadyExists => 5106,
            Self::TargetNotSubscribable => 5203,
        }
    }

    /// Looks up a status code by its numeric value.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        let status = match code {
            1000 => Self::Accepted,
            2000 => Self::Ok,
            2001 => Self::Created,
            2002 => Self::Deleted,
            2004 => Self::Updated,
            4000 => Self::BadRequest,
            4004 => Self::NotFound,
            4005 => Self::OperationNotAllowed,
            4008 => Self::RequestTimeout,
            4101 => Self::SubscriptionCreatorHasNoPrivilege,
            4102 => Self::ContentsUnacceptable,
            4103 => Self::OriginatorHasNoPrivilege,
            4105 => Self::Conflict,
            4106 => Self::OriginatorHasNotRegistered,
            4107 => Self::SecurityAssociationRequired,
            4108 => Self::InvalidChildResourceType,
            5000 => Self::InternalServerError,
            5001 => Self::NotImplemented,
            5103 => Self::TargetNotReachable,
            5105 => Self::ReceiverHasNoPrivilege,
            5106 => Self::AlreadyExists,
            5203 => Self::TargetNotSubscribable,
            _ => return None,
        };
        Some(status)
    }

    /// HTTP status the code maps to in the HTTP binding.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::Accepted => 202,
            Self::Ok | Self::Deleted | Self::Updated => 200,
            Self::Created => 201,
            Self::BadRequest | Self::ContentsUnacceptable => 400,
            Self::NotFound | Self::TargetNotReachable => 404,
            Self::OperationNotAllowed => 405,
            Self::RequestTimeout => 408,
            Self::SubscriptionCreatorHasNoPrivilege
            | Self::OriginatorHasNoPrivilege
            | Self::OriginatorHasNotRegistered
            | Self::SecurityAssociationRequired
            | Self::InvalidChildResourceType
            | Self::ReceiverHasNoPrivilege
            | Self::TargetNotSubscribable => 403,
            Self::Conflict | Self::AlreadyExists => 409,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
        }
    }

    /// Whether the code reports success (1xxx or 2xxx).
    #[must_use]
    pub fn is_success(self) -> bool {
        self.code() < 3000
    }
}

impl From<ResponseStatusCode> for u16 {
    fn from(status: ResponseStatusCode) -> Self {
        status.code()
    }
}

impl TryFrom<u16> for ResponseStatusCode {
    type Error = String;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Self::from_code(code).ok_or_else(|| format!("unknown response status code {code}"))
    }
}

impl std::fmt::Display for ResponseStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documented_codes_map_to_http() {
        assert_eq!(ResponseStatusCode::Created.code(), 2001);
        assert_eq!(ResponseStatusCode::Created.http_status(), 201);
        assert_eq!(ResponseStatusCode::Ok.http_status(), 200);
        assert_eq!(ResponseStatusCode::NotFound.http_status(), 404);
        assert_eq!(ResponseStatusCode::Conflict.code(), 4105);
        assert_eq!(ResponseStatusCode::Conflict.http_status(), 409);
        assert_eq!(ResponseStatusCode::AlreadyExists.code(), 5106);
        assert_eq!(ResponseStatusCode::InternalServerError.http_status(), 500);
    }

    #[test]
    fn serializes_as_number() {
        let json = serde_json::to_string(&ResponseStatusCode::Deleted).unwrap();
        assert_eq!(json, "2002");
        let back: ResponseStatusCode = serde_json::from_str("4103").unwrap();
        assert_eq!(back, ResponseStatusCode::OriginatorHasNoPrivilege);
        assert!(serde_json::from_str::<ResponseStatusCode>("1234").is_err());
    }

    #[test]
    fn success_classification() {
        assert!(ResponseStatusCode::Updated.is_success());
        assert!(!ResponseStatusCode::TargetNotReachable.is_success());
    }
}
