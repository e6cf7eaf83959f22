//! Concurrency cap in front of the Method Domain.
//!
//! A request arriving while `max_concurrent_requests` others are in flight
//! is answered at once with `OperationError::Overloaded`
//! instead of waiting. Requests the node issues to itself are never shed, so
//! refreshes and cascaded work keep going under client load.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use cse_core::{Request, Response};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{Layer, Service};

use crate::service::operation::OperationError;

#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Semaphore>,
    limit: usize,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        let limit = usize::try_from(max_concurrent).unwrap_or(usize::MAX).max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Semaphore>,
    limit: usize,
}

impl<S> LoadShedService<S> {
    fn admit(&self, req: &Request) -> Result<Option<OwnedSemaphorePermit>, OperationError> {
        if req.flags.internal {
            return Ok(None);
        }
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => {
                metrics::gauge!("cse_requests_in_flight").set(self.in_flight() as f64);
                Ok(Some(permit))
            }
            Err(_) => {
                metrics::counter!("cse_requests_shed_total").increment(1);
                tracing::warn!(
                    rqi = %req.request_identifier,
                    fr = %req.from,
                    limit = self.limit,
                    "node overloaded, request shed"
                );
                Err(OperationError::Overloaded)
            }
        }
    }

    /// Client requests currently holding a slot.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

impl<S> Service<Request> for LoadShedService<S>
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
        let permit = match self.admit(&req) {
            Ok(permit) => permit,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        let fut = self.inner.call(req);
        Box::pin(async move {
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use cse_core::ResponseStatusCode;
    use tower::ServiceExt;

    use super::*;

    /// Holds every request until released.
    #[derive(Clone)]
    struct Gate(Arc<Semaphore>);

    impl Service<Request> for Gate {
        type Response = Response;
        type Error = OperationError;
        type Future = Pin<Box<dyn Future<Output = Result<Response, OperationError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request) -> Self::Future {
            let gate = Arc::clone(&self.0);
            Box::pin(async move {
                if let Ok(pass) = gate.acquire().await {
                    pass.forget();
                }
                Ok(Response::new(ResponseStatusCode::Ok, &req, None))
            })
        }
    }

    #[tokio::test]
    async fn full_node_sheds_clients_but_not_itself() {
        let gate = Arc::new(Semaphore::new(0));
        let svc = LoadShedLayer::new(1).layer(Gate(Arc::clone(&gate)));

        let held = tokio::spawn(svc.clone().oneshot(Request::retrieve("onem2m", "Ca")));
        tokio::task::yield_now().await;
        while svc.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let shed = svc.clone().oneshot(Request::retrieve("onem2m", "Cb")).await;
        assert!(matches!(shed, Err(OperationError::Overloaded)));

        let own = tokio::spawn(
            svc.clone()
                .oneshot(Request::retrieve("onem2m", "/mn-cse-1").internal()),
        );
        gate.add_permits(2);
        assert!(own.await.unwrap().is_ok());
        assert!(held.await.unwrap().is_ok());
        assert_eq!(svc.in_flight(), 0);
    }
}
