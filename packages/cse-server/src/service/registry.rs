//! Lifecycle of the node's long-lived services.
//!
//! Services start in registration order and stop in reverse. A service that
//! fails to start stops the ones already started (as a termination, peers are
//! not contacted) before the error is returned.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::config::CseConfig;

/// Handed to every service when it starts.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    pub config: Arc<CseConfig>,
}

#[async_trait]
pub trait ManagedService: Send + Sync {
    fn name(&self) -> &'static str;

    async fn init(&self, ctx: &ServiceContext) -> anyhow::Result<()>;

    /// With `terminate` set the service stops without telling peers.
    async fn shutdown(&self, _terminate: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<Vec<Arc<dyn ManagedService>>>,
    started: Mutex<usize>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: ManagedService + 'static>(&self, service: T) {
        self.services.lock().push(Arc::new(service));
    }

    /// Names in start order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.services.lock().iter().map(|s| s.name()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ManagedService>> {
        self.services.lock().clone()
    }

    /// Starts every service not started yet.
    ///
    /// # Errors
    ///
    /// The first failing `init`, with the service name as context.
    pub async fn init_all(&self, ctx: &ServiceContext) -> anyhow::Result<()> {
        let services = self.snapshot();
        let from = *self.started.lock();
        for (index, service) in services.iter().enumerate().skip(from) {
            if let Err(e) = service.init(ctx).await {
                tracing::error!(service = service.name(), error = %e, "service failed to start");
                if let Err(stop_err) = self.shutdown_all(true).await {
                    tracing::warn!(error = %stop_err, "cleanup after failed start reported errors");
                }
                return Err(e.context(format!("initializing {}", service.name())));
            }
            *self.started.lock() = index + 1;
            tracing::debug!(service = service.name(), "service started");
        }
        Ok(())
    }

    /// Stops the started services, newest first. Every service is asked to
    /// stop even when an earlier one failed.
    ///
    /// # Errors
    ///
    /// The first `shutdown` failure.
    pub async fn shutdown_all(&self, terminate: bool) -> anyhow::Result<()> {
        let services = self.snapshot();
        let started = std::mem::take(&mut *self.started.lock());
        let mut first_error = None;
        for service in services[..started.min(services.len())].iter().rev() {
            if let Err(e) = service.shutdown(terminate).await {
                tracing::warn!(service = service.name(), error = %e, "service shutdown failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
