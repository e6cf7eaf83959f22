//! Pipeline composition: wraps the Method Domain with all middleware layers.

use cse_core::{Request, Response};
use tower::util::BoxCloneSyncService;
use tower::{Service, ServiceBuilder, ServiceExt};

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::service::config::CseConfig;
use crate::service::operation::OperationError;

/// Type-erased, cloneable middleware stack.
#[derive(Clone)]
pub struct RequestPipeline {
    inner: BoxCloneSyncService<Request, Response, OperationError>,
}

impl RequestPipeline {
    /// Runs one request through the stack. Middleware failures are turned
    /// into responses, so exactly one `Response` comes back.
    pub async fn dispatch(&self, req: Request) -> Response {
        let rqi = req.request_identifier.clone();
        let originator = req.from.clone();
        match self.inner.clone().oneshot(req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(rqi = %rqi, error = %e, "request failed in pipeline");
                e.into_response(&rqi, &originator)
            }
        }
    }
}

/// Build the request pipeline around `service`.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `TimeoutLayer` -- request expiration or the configured default
/// 3. `MetricsLayer` -- span, counters and duration histogram
#[must_use]
pub fn build_request_pipeline<S>(service: S, config: &CseConfig) -> RequestPipeline
where
    S: Service<Request, Response = Response, Error = OperationError>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    let stack = ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_requests))
        .layer(TimeoutLayer::new(config.default_request_timeout_ms))
        .layer(MetricsLayer)
        .service(service);
    RequestPipeline {
        inner: BoxCloneSyncService::new(stack),
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use cse_core::ResponseStatusCode;

    use super::*;

    #[derive(Clone)]
    struct StubService {
        delay_ms: u64,
    }

    impl Service<Request> for StubService {
        type Response = Response;
        type Error = OperationError;
        type Future = Pin<Box<dyn Future<Output = Result<Response, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Response::new(ResponseStatusCode::Ok, &req, None))
            })
        }
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let pipeline = build_request_pipeline(StubService { delay_ms: 0 }, &CseConfig::default());
        let resp = pipeline.dispatch(Request::retrieve("onem2m", "Cx")).await;
        assert_eq!(resp.status, ResponseStatusCode::Ok);
    }

    #[tokio::test]
    async fn timeouts_become_responses() {
        let config = CseConfig {
            default_request_timeout_ms: 20,
            ..CseConfig::default()
        };
        let pipeline = build_request_pipeline(StubService { delay_ms: 500 }, &config);
        let req = Request::retrieve("onem2m", "Cx");
        let rqi = req.request_identifier.clone();
        let resp = pipeline.dispatch(req).await;
        assert_eq!(resp.status, ResponseStatusCode::RequestTimeout);
        assert_eq!(resp.request_identifier, rqi);
        assert_eq!(resp.to.as_deref(), Some("Cx"));
    }
}
