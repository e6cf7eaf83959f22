//! Per-request span and metrics.
//!
//! Every request runs inside a `request` span carrying its identifier,
//! operation, target and originator. On completion the span gets the
//! response status code and the following are recorded:
//!
//! - `cse_requests_total{op, rsc}`
//! - `cse_request_failures_total{op, origin}`, `origin` being `client` for
//!   responses outside the 2xxx range and `pipeline` for middleware errors
//! - `cse_request_duration_seconds{op, ty}`, `ty` set for creates only

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use cse_core::{Request, Response};
use tower::{Layer, Service};
use tracing::{info_span, Instrument, Span};

use crate::service::operation::OperationError;

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// What a finished request reports.
struct Outcome {
    rsc: u16,
    failure: Option<&'static str>,
}

impl Outcome {
    fn of(result: &Result<Response, OperationError>) -> Self {
        match result {
            Ok(resp) if resp.is_success() => Self {
                rsc: resp.status.code(),
                failure: None,
            },
            Ok(resp) => Self {
                rsc: resp.status.code(),
                failure: Some("client"),
            },
            Err(e) => Self {
                rsc: e.status_code().code(),
                failure: Some("pipeline"),
            },
        }
    }
}

impl<S> Service<Request> for MetricsService<S>
where
    S: Service<Request, Response = Response, Error = OperationError> + Send,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = OperationError;
    type Future = Pin<Box<dyn Future<Output = Result<Response, OperationError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let op = req.operation.as_str();
        let ty = req
            .resource_type
            .map_or_else(String::new, |ty| ty.short_name().to_owned());
        let span = info_span!(
            "request",
            rqi = %req.request_identifier,
            op,
            to = %req.to,
            fr = %req.from,
            rsc = tracing::field::Empty,
        );
        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let started = Instant::now();
                let result = fut.await;
                let elapsed = started.elapsed();
                let outcome = Outcome::of(&result);

                let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
                Span::current().record("rsc", outcome.rsc);
                tracing::debug!(rsc = outcome.rsc, elapsed_ms, "request complete");

                metrics::counter!("cse_requests_total", "op" => op, "rsc" => outcome.rsc.to_string())
                    .increment(1);
                if let Some(origin) = outcome.failure {
                    metrics::counter!("cse_request_failures_total", "op" => op, "origin" => origin)
                        .increment(1);
                }
                metrics::histogram!("cse_request_duration_seconds", "op" => op, "ty" => ty)
                    .record(elapsed.as_secs_f64());
                result
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use cse_core::ResponseStatusCode;
    use tower::ServiceExt;

    use super::*;

    #[derive(Clone, Copy)]
    struct Fixed(Option<ResponseStatusCode>);

    impl Service<Request> for Fixed {
        type Response = Response;
        type Error = OperationError;
        type Future = Pin<Box<dyn Future<Output = Result<Response, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request) -> Self::Future {
            let status = self.0;
            Box::pin(async move {
                match status {
                    Some(status) => Ok(Response::new(status, &req, None)),
                    None => Err(OperationError::Overloaded),
                }
            })
        }
    }

    #[tokio::test]
    async fn responses_and_errors_pass_through_unchanged() {
        let req = Request::retrieve("onem2m", "Cx");
        let rqi = req.request_identifier.clone();
        let resp = MetricsLayer
            .layer(Fixed(Some(ResponseStatusCode::NotFound)))
            .oneshot(req)
            .await
            .unwrap();
        assert_eq!(resp.status, ResponseStatusCode::NotFound);
        assert_eq!(resp.request_identifier, rqi);

        let err = MetricsLayer
            .layer(Fixed(None))
            .oneshot(Request::retrieve("onem2m", "Cx"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Overloaded));
    }

    #[test]
    fn outcomes_classify_failures() {
        let req = Request::retrieve("onem2m", "Cx");
        let ok = Outcome::of(&Ok(Response::new(ResponseStatusCode::Ok, &req, None)));
        assert_eq!((ok.rsc, ok.failure), (2000, None));
        let denied = Outcome::of(&Ok(Response::new(ResponseStatusCode::OriginatorHasNoPrivilege, &req, None)));
        assert_eq!(denied.failure, Some("client"));
        let shed = Outcome::of(&Err(OperationError::Overloaded));
        assert_eq!(shed.failure, Some("pipeline"));
    }
}
