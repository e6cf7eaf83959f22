//! oneM2M HTTP binding.
//!
//! Every path outside the health endpoints is a resource address. The method
//! selects the operation (`POST` with a `ty` content-type parameter creates,
//! `POST` without one notifies), `X-M2M-*` headers carry the envelope fields
//! and the query string carries filter criteria and result options. The
//! response status is the HTTP mapping of the oneM2M code, which itself
//! travels in `X-M2M-RSC`.

use std::net::SocketAddr;

use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use cse_core::request::generate_request_id;
use cse_core::{
    time, wire, CseError, CseResult, FilterCriteria, Operation, Request, ResourceType, Response,
};
use serde_json::{Map, Value};

use super::AppState;
use crate::transport::http::{HEADER_EXPIRATION, HEADER_ORIGIN, HEADER_REQUEST_ID, HEADER_STATUS};

const JSON: &str = "application/json";

/// Query keys holding a single integer.
const INTEGER_KEYS: &[&str] = &["sts", "stb", "sza", "szb", "lim", "fu", "lvl", "ofst"];
/// Query keys holding a wire timestamp.
const TIMESTAMP_KEYS: &[&str] = &["crb", "cra", "ms", "us", "exb", "exa"];

/// Handles one oneM2M request over HTTP.
pub async fn onem2m_handler(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> axum::response::Response {
    if !state.shutdown.health_state().accepts_requests() {
        return plain(StatusCode::SERVICE_UNAVAILABLE);
    }
    let _in_flight = state.shutdown.in_flight_guard();

    let (parts, body) = request.into_parts();
    let Ok(bytes) = to_bytes(body, state.config.max_body_bytes).await else {
        return plain(StatusCode::PAYLOAD_TOO_LARGE);
    };
    let source = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip());

    let response = match parse_request(&parts.method, &parts.uri, &parts.headers, &bytes) {
        Ok(mut req) => {
            req.source_address = source;
            state.pipeline.dispatch(req).await
        }
        Err(e) => {
            let rqi = header(&parts.headers, HEADER_REQUEST_ID).unwrap_or_default();
            let from = header(&parts.headers, HEADER_ORIGIN).unwrap_or_default();
            tracing::debug!(uri = %parts.uri, error = %e, "unparseable request");
            Response::from_error(&e, &rqi, &from)
        }
    };
    into_http(&response)
}

fn plain(status: StatusCode) -> axum::response::Response {
    axum::response::Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_default()
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Maps an HTTP path to a oneM2M address: `/~/cse/..` is SP-relative,
/// `/_/sp/cse/..` absolute, anything else CSE-relative.
#[must_use]
pub fn address_from_path(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/_/") {
        format!("//{rest}")
    } else if let Some(rest) = path.strip_prefix("/~") {
        if rest.is_empty() {
            "/".to_owned()
        } else {
            rest.to_owned()
        }
    } else {
        path.trim_start_matches('/').to_owned()
    }
}

/// The `ty` parameter of `application/json;ty=N`.
fn resource_type_of(headers: &HeaderMap) -> CseResult<Option<ResourceType>> {
    let Some(content_type) = header(headers, CONTENT_TYPE.as_str()) else {
        return Ok(None);
    };
    let Some(param) = content_type
        .split(';')
        .skip(1)
        .map(str::trim)
        .find_map(|p| p.strip_prefix("ty="))
    else {
        return Ok(None);
    };
    param
        .parse::<u32>()
        .ok()
        .and_then(ResourceType::from_code)
        .map(Some)
        .ok_or_else(|| CseError::BadRequest(format!("unknown resource type {param:?}")))
}

/// Builds the request envelope from the HTTP parts.
///
/// # Errors
///
/// `BadRequest` for an unsupported method, an unknown `ty`, malformed query
/// values or timestamps, or a body that is not JSON.
pub fn parse_request(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    body: &[u8],
) -> CseResult<Request> {
    let resource_type = resource_type_of(headers)?;
    let operation = if *method == Method::POST {
        if resource_type.is_some() {
            Operation::Create
        } else {
            Operation::Notify
        }
    } else if *method == Method::GET {
        Operation::Retrieve
    } else if *method == Method::PUT {
        Operation::Update
    } else if *method == Method::DELETE {
        Operation::Delete
    } else {
        return Err(CseError::BadRequest(format!("unsupported method {method}")));
    };

    let from = header(headers, HEADER_ORIGIN).unwrap_or_default();
    let mut req = Request::new(operation, address_from_path(uri.path()), from);
    req.request_identifier = header(headers, HEADER_REQUEST_ID).unwrap_or_else(generate_request_id);
    if operation == Operation::Create {
        req.resource_type = resource_type;
    }
    if let Some(rqet) = header(headers, HEADER_EXPIRATION) {
        req.request_expiration = Some(time::parse(&rqet)?);
    }
    apply_query(&mut req, uri)?;

    if !body.is_empty() {
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| CseError::BadRequest(format!("invalid JSON body: {e}")))?;
        req.content = Some(wire::to_short(value));
    }
    Ok(req)
}

fn apply_query(req: &mut Request, uri: &Uri) -> CseResult<()> {
    let Query(pairs) = Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map_err(|e| CseError::BadRequest(format!("invalid query: {e}")))?;

    let integer = |key: &str, value: &str| {
        value
            .parse::<u64>()
            .map_err(|_| CseError::BadRequest(format!("{key} must be an integer, got {value:?}")))
    };
    let mut fc = Map::new();
    let mut labels = Vec::new();
    let mut types = Vec::new();
    for (key, value) in pairs {
        match key.as_str() {
            "lbl" => labels.push(Value::from(value)),
            "ty" => types.push(Value::from(integer(&key, &value)?)),
            "rcn" => {
                req.result_content = Some(option_code(&key, integer(&key, &value)?)?);
            }
            "drt" => {
                req.discovery_result_type = Some(option_code(&key, integer(&key, &value)?)?);
            }
            "atrl" => req.attribute_list.extend(
                value
                    .split(['+', ',', ' '])
                    .filter(|a| !a.is_empty())
                    .map(str::to_owned),
            ),
            k if INTEGER_KEYS.contains(&k) => {
                fc.insert(key.clone(), Value::from(integer(&key, &value)?));
            }
            k if TIMESTAMP_KEYS.contains(&k) => {
                time::parse(&value)?;
                fc.insert(key.clone(), Value::from(value));
            }
            _ => {}
        }
    }
    if !labels.is_empty() {
        fc.insert("lbl".into(), Value::Array(labels));
    }
    if !types.is_empty() {
        fc.insert("ty".into(), Value::Array(types));
    }
    req.filter_criteria = serde_json::from_value::<FilterCriteria>(Value::Object(fc))
        .map_err(|e| CseError::BadRequest(format!("invalid filter criteria: {e}")))?;
    Ok(())
}

fn option_code<T: serde::de::DeserializeOwned>(key: &str, code: u64) -> CseResult<T> {
    serde_json::from_value(Value::from(code))
        .map_err(|_| CseError::BadRequest(format!("unsupported {key} {code}")))
}

/// Renders a response: mapped HTTP status, `X-M2M-RSC`/`X-M2M-RI`, JSON body.
fn into_http(response: &Response) -> axum::response::Response {
    let status =
        StatusCode::from_u16(response.status.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = response
        .content
        .as_ref()
        .and_then(|content| serde_json::to_vec(content).ok())
        .unwrap_or_default();

    let mut builder = axum::response::Response::builder()
        .status(status)
        .header(HEADER_STATUS, response.status.code().to_string());
    if let Ok(rqi) = HeaderValue::from_str(&response.request_identifier) {
        builder = builder.header(HEADER_REQUEST_ID, rqi);
    }
    if !body.is_empty() {
        builder = builder.header(CONTENT_TYPE, JSON);
    }
    builder.body(Body::from(body)).unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to render response");
        plain(StatusCode::INTERNAL_SERVER_ERROR)
    })
}
