//! Timeout middleware for requests.
//!
//! A request carrying a request expiration timestamp (`rqet`) gets the time
//! remaining until then; all others get the configured default.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use cse_core::{Request, Response};
use tower::{Layer, Service};

use crate::service::operation::OperationError;

#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    default_timeout_ms: u64,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(default_timeout_ms: u64) -> Self {
        Self { default_timeout_ms }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            default_timeout_ms: self.default_timeout_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    default_timeout_ms: u64,
}

fn budget_ms(req: &Request, default_ms: u64) -> u64 {
    match req.request_expiration {
        Some(deadline) => u64::try_from((deadline - Utc::now()).num_milliseconds()).unwrap_or(0),
        None => default_ms,
    }
}

impl<S> Service<Request> for TimeoutService<S>
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
        let timeout_ms = budget_ms(&req, self.default_timeout_ms);
        if timeout_ms == 0 {
            return Box::pin(async move { Err(OperationError::Timeout { timeout_ms }) });
        }
        let fut = self.inner.call(req);
        Box::pin(async move {
            match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(OperationError::Timeout { timeout_ms }),
            }
        })
    }
}
