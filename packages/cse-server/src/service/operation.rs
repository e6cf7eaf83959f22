//! Pipeline-level errors and well-known service names.

use cse_core::{Response, ResponseStatusCode};
use serde_json::json;

/// Names under which the node's managed services register.
pub mod service_names {
    pub const METHOD_DOMAIN: &str = "method-domain";
    pub const REGISTRATION: &str = "registration";
}

/// Failures raised by the middleware around the Method Domain rather than by
/// request processing itself.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("node overloaded, try again later")]
    Overloaded,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    #[must_use]
    pub fn status_code(&self) -> ResponseStatusCode {
        match self {
            Self::Timeout { .. } => ResponseStatusCode::RequestTimeout,
            Self::Overloaded | Self::Internal(_) => ResponseStatusCode::InternalServerError,
        }
    }

    /// Converts the failure into the response the originator receives.
    #[must_use]
    pub fn into_response(self, request_identifier: &str, originator: &str) -> Response {
        Response {
            status: self.status_code(),
            request_identifier: request_identifier.to_owned(),
            content: Some(json!({ "m2m:dbg": self.to_string() })),
            to: Some(originator.to_owned()),
            from: None,
            truncated: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_errors_map_to_status_codes() {
        let timeout = OperationError::Timeout { timeout_ms: 50 }.into_response("rq", "Cx");
        assert_eq!(timeout.status, ResponseStatusCode::RequestTimeout);
        assert_eq!(timeout.request_identifier, "rq");

        let shed = OperationError::Overloaded.into_response("rq", "Cx");
        assert_eq!(shed.status, ResponseStatusCode::InternalServerError);
        assert!(shed.content.unwrap()["m2m:dbg"]
            .as_str()
            .unwrap()
            .contains("overloaded"));
    }
}
