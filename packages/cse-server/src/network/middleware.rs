//! HTTP-level layers around the router.
//!
//! Outermost first:
//!
//! 1. request ID (`x-request-id`, generated when absent)
//! 2. trace span per exchange, tagged with the oneM2M request identifier
//! 3. gzip compression
//! 4. CORS for the four binding methods, exposing the `X-M2M-*` headers
//! 5. exchange timeout (408)
//! 6. body size limit (413)
//! 7. request ID echoed on the response
//!
//! Shedding, request expiration and per-request metrics belong to the
//! pipeline around the Method Domain, not here.

use axum::extract::Request;
use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::Span;

use super::config::NetworkConfig;

const REQUEST_ID: &str = "x-request-id";

fn exchange_span(req: &Request) -> Span {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_owned()
    };
    tracing::info_span!(
        "http",
        method = %req.method(),
        uri = %req.uri(),
        id = %header(REQUEST_ID),
        rqi = %header("x-m2m-ri"),
        origin = %header("x-m2m-origin"),
    )
}

/// Wraps `router` in the binding's HTTP layers.
pub fn with_http_layers<S>(router: Router<S>, config: &NetworkConfig) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    let request_id = HeaderName::from_static(REQUEST_ID);
    router
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(cors(&config.cors_origins))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http().make_span_with(exchange_span))
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
}

fn cors(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins.iter().filter_map(|o| o.parse().ok()))
    };
    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static("x-m2m-rsc"),
            HeaderName::from_static("x-m2m-ri"),
        ])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::routing::{get, post};
    use tower::ServiceExt;

    use super::*;

    fn router(config: &NetworkConfig) -> Router {
        let inner = Router::new()
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "late"
                }),
            )
            .route("/echo", post(|body: String| async move { body }));
        with_http_layers(inner, config)
    }

    #[tokio::test]
    async fn request_ids_are_generated_and_echoed() {
        let resp = router(&NetworkConfig::default())
            .oneshot(Request::get("/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(resp.headers().contains_key(REQUEST_ID));

        let resp = router(&NetworkConfig::default())
            .oneshot(
                Request::get("/missing")
                    .header(REQUEST_ID, "abc")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.headers()[REQUEST_ID], "abc");
    }

    #[tokio::test]
    async fn slow_exchanges_and_large_bodies_are_cut_off() {
        let config = NetworkConfig {
            request_timeout: Duration::from_millis(20),
            max_body_bytes: 8,
            ..NetworkConfig::default()
        };
        let slow = router(&config)
            .oneshot(Request::get("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(slow.status(), StatusCode::REQUEST_TIMEOUT);

        let large = router(&config)
            .oneshot(
                Request::post("/echo")
                    .header("content-length", "64")
                    .body(Body::from(vec![b'x'; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(large.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn explicit_origins_build() {
        let _ = cors(&["http://localhost:3000".into(), "not a url\n".into()]);
    }
}
