//! HTTP client adapter.
//!
//! Mirrors the inbound binding: the operation maps to the HTTP method,
//! `from`/`rqi`/`rqet` travel as `X-M2M-*` headers, create requests carry
//! `ty` in the content type and filter criteria become query parameters.
//! Notifications are posted to the endpoint URL as-is.

use std::time::Duration;

use async_trait::async_trait;
use cse_core::{time, wire, Operation, Request, Response, ResponseStatusCode};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;

use super::adapter::{ClientAdapter, TransportError};

pub const HEADER_ORIGIN: &str = "X-M2M-Origin";
pub const HEADER_REQUEST_ID: &str = "X-M2M-RI";
pub const HEADER_STATUS: &str = "X-M2M-RSC";
pub const HEADER_EXPIRATION: &str = "X-M2M-RQET";

const JSON: &str = "application/json";

/// `reqwest`-backed adapter for `http` and `https` endpoints.
#[derive(Debug, Clone)]
pub struct HttpClientAdapter {
    client: Client,
}

impl HttpClientAdapter {
    /// # Errors
    ///
    /// Fails if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

/// HTTP path for a target address: `/~/cse/...` for SP-relative,
/// `/_/sp/cse/...` for absolute, `/...` otherwise.
#[must_use]
pub fn target_path(to: &str) -> String {
    if let Some(abs) = to.strip_prefix("//") {
        format!("/_/{abs}")
    } else if to.starts_with('/') {
        format!("/~{to}")
    } else {
        format!("/{to}")
    }
}

fn method_for(op: Operation) -> Method {
    match op {
        Operation::Create | Operation::Notify => Method::POST,
        Operation::Retrieve => Method::GET,
        Operation::Update => Method::PUT,
        Operation::Delete => Method::DELETE,
    }
}

fn query_pairs(request: &Request) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    if let Some(rcn) = request.result_content {
        pairs.push(("rcn".to_owned(), rcn.code().to_string()));
    }
    if let Some(drt) = request.discovery_result_type {
        pairs.push(("drt".to_owned(), drt.code().to_string()));
    }
    if let Ok(Value::Object(fc)) = serde_json::to_value(&request.filter_criteria) {
        for (key, value) in fc {
            match value {
                Value::Array(items) => {
                    for item in items {
                        pairs.push((key.clone(), scalar(&item)));
                    }
                }
                other => pairs.push((key, scalar(&other))),
            }
        }
    }
    pairs
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Status for a peer that omitted `X-M2M-RSC`.
fn status_from_http(status: StatusCode) -> ResponseStatusCode {
    match status.as_u16() {
        200 => ResponseStatusCode::Ok,
        201 => ResponseStatusCode::Created,
        202 => ResponseStatusCode::Accepted,
        400 => ResponseStatusCode::BadRequest,
        403 => ResponseStatusCode::OriginatorHasNoPrivilege,
        404 => ResponseStatusCode::NotFound,
        405 => ResponseStatusCode::OperationNotAllowed,
        408 => ResponseStatusCode::RequestTimeout,
        409 => ResponseStatusCode::Conflict,
        501 => ResponseStatusCode::NotImplemented,
        _ => ResponseStatusCode::InternalServerError,
    }
}

#[async_trait]
impl ClientAdapter for HttpClientAdapter {
    fn schemes(&self) -> &[&'static str] {
        &["http", "https"]
    }

    async fn send(&self, endpoint: &str, request: &Request) -> Result<Response, TransportError> {
        let url = if request.operation == Operation::Notify {
            endpoint.to_owned()
        } else {
            format!("{}{}", endpoint.trim_end_matches('/'), target_path(&request.to))
        };
        let unreachable = |e: reqwest::Error| TransportError::Unreachable {
            endpoint: endpoint.to_owned(),
            reason: e.to_string(),
        };

        let content_type = match request.resource_type {
            Some(ty) if request.operation == Operation::Create => format!("{JSON};ty={}", ty.code()),
            _ => JSON.to_owned(),
        };
        let mut builder = self
            .client
            .request(method_for(request.operation), &url)
            .header(HEADER_ORIGIN, &request.from)
            .header(HEADER_REQUEST_ID, &request.request_identifier)
            .header(ACCEPT, JSON)
            .query(&query_pairs(request));
        if let Some(rqet) = request.request_expiration {
            builder = builder.header(HEADER_EXPIRATION, time::format(rqet));
        }
        if let Some(content) = &request.content {
            let body = serde_json::to_vec(content).map_err(|e| TransportError::InvalidResponse {
                endpoint: endpoint.to_owned(),
                reason: format!("unencodable request content: {e}"),
            })?;
            builder = builder.header(CONTENT_TYPE, content_type).body(body);
        }

        tracing::debug!(url = %url, rqi = %request.request_identifier, op = request.operation.as_str(), "sending");
        let resp = builder.send().await.map_err(unreachable)?;

        let http_status = resp.status();
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let status = header(HEADER_STATUS)
            .and_then(|v| v.parse::<u16>().ok())
            .and_then(ResponseStatusCode::from_code)
            .unwrap_or_else(|| status_from_http(http_status));
        let rqi = header(HEADER_REQUEST_ID).unwrap_or_else(|| request.request_identifier.clone());

        let bytes = resp.bytes().await.map_err(unreachable)?;
        let content = if bytes.is_empty() {
            None
        } else {
            let value: Value =
                serde_json::from_slice(&bytes).map_err(|e| TransportError::InvalidResponse {
                    endpoint: endpoint.to_owned(),
                    reason: e.to_string(),
                })?;
            Some(wire::to_short(value))
        };

        Ok(Response {
            status,
            request_identifier: rqi,
            content,
            to: Some(request.from.clone()),
            from: None,
            truncated: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use cse_core::{FilterCriteria, FilterUsage, ResourceType, ResultContent};

    use super::*;

    #[test]
    fn target_paths_follow_binding_prefixes() {
        assert_eq!(target_path("//openmtc.org/in-cse/onem2m"), "/_/openmtc.org/in-cse/onem2m");
        assert_eq!(target_path("/in-cse/onem2m/app"), "/~/in-cse/onem2m/app");
        assert_eq!(target_path("onem2m/app"), "/onem2m/app");
    }

    #[test]
    fn filter_criteria_become_repeated_query_pairs() {
        let mut req = Request::retrieve("/in-cse/onem2m", "Cx").with_filter(FilterCriteria {
            labels: vec!["a".into(), "b".into()],
            resource_types: vec![ResourceType::Container],
            filter_usage: Some(FilterUsage::Discovery),
            limit: Some(5),
            ..FilterCriteria::default()
        });
        req.result_content = Some(ResultContent::Attributes);
        let pairs = query_pairs(&req);
        let has = |k: &str, v: &str| pairs.iter().any(|(pk, pv)| pk == k && pv == v);
        assert!(has("rcn", "1"));
        assert!(has("lbl", "a"));
        assert!(has("lbl", "b"));
        assert!(has("ty", "3"));
        assert!(has("fu", "1"));
        assert!(has("lim", "5"));
    }

    #[test]
    fn operations_map_to_methods() {
        assert_eq!(method_for(Operation::Create), Method::POST);
        assert_eq!(method_for(Operation::Notify), Method::POST);
        assert_eq!(method_for(Operation::Retrieve), Method::GET);
        assert_eq!(method_for(Operation::Update), Method::PUT);
        assert_eq!(method_for(Operation::Delete), Method::DELETE);
    }

    #[test]
    fn http_fallback_statuses() {
        assert_eq!(status_from_http(StatusCode::CREATED), ResponseStatusCode::Created);
        assert_eq!(status_from_http(StatusCode::CONFLICT), ResponseStatusCode::Conflict);
        assert_eq!(
            status_from_http(StatusCode::BAD_GATEWAY),
            ResponseStatusCode::InternalServerError
        );
    }
}
