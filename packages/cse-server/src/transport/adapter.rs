//! Client adapter seam: one implementation per URL scheme.

use async_trait::async_trait;
use cse_core::{Request, Response};

/// Failure to obtain any protocol response from an endpoint.
///
/// Protocol-level errors (a peer answering 4004, say) are not transport
/// errors; they come back as a [`Response`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no client adapter for {0}")]
    UnsupportedScheme(String),
    #[error("{endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },
    #[error("invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },
}

/// Outbound client for the URL schemes it registers.
///
/// Used as `Arc<dyn ClientAdapter>`.
#[async_trait]
pub trait ClientAdapter: Send + Sync {
    /// URL schemes this adapter serves, e.g. `["http", "https"]`.
    fn schemes(&self) -> &[&'static str];

    /// Delivers `request` to `endpoint` and returns the peer's response.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when no response could be obtained.
    async fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError>;
}

/// Scheme of an endpoint URL, lowercased.
#[must_use]
pub fn scheme_of(endpoint: &str) -> Option<String> {
    endpoint
        .split_once("://")
        .map(|(scheme, _)| scheme.to_ascii_lowercase())
        .filter(|scheme| !scheme.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_is_lowercased_prefix() {
        assert_eq!(scheme_of("HTTP://10.0.0.1:8000").as_deref(), Some("http"));
        assert_eq!(scheme_of("mqtt://broker").as_deref(), Some("mqtt"));
        assert_eq!(scheme_of("/mn-cse/onem2m"), None);
        assert_eq!(scheme_of("://x"), None);
    }
}
