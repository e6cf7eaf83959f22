//! Binding lifecycle: the health state probes report and the oneM2M handler
//! consults, plus the count of requests handed to the pipeline so a stopping
//! node can finish what it accepted.
//!
//! Starting -> Ready -> Draining -> Stopped

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Only a ready binding hands requests to the pipeline.
    #[must_use]
    pub fn accepts_requests(self) -> bool {
        self == Self::Ready
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<HealthState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            in_flight: Arc::default(),
        }
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    pub fn set_ready(&self) {
        self.transition(HealthState::Ready);
    }

    /// Stops admitting requests. Requests already admitted keep running.
    pub fn trigger_shutdown(&self) {
        self.transition(HealthState::Draining);
    }

    fn transition(&self, next: HealthState) {
        let previous = self.state.swap(Arc::new(next));
        if *previous != next {
            tracing::info!(from = previous.as_str(), to = next.as_str(), "binding state changed");
        }
    }

    /// Marks one request as running until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for the running requests. Returns whether they
    /// all finished; only then does the state become `Stopped`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.in_flight.idle.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();
        if drained {
            self.transition(HealthState::Stopped);
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_a_ready_binding_accepts() {
        let controller = ShutdownController::new();
        assert!(!controller.health_state().accepts_requests());
        controller.set_ready();
        assert!(controller.health_state().accepts_requests());
        controller.trigger_shutdown();
        assert_eq!(controller.health_state().as_str(), "draining");
        assert!(!controller.health_state().accepts_requests());
    }

    #[tokio::test]
    async fn drain_completes_when_the_last_request_finishes() {
        let controller = Arc::new(ShutdownController::new());
        controller.set_ready();
        let first = controller.in_flight_guard();
        let second = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);
        controller.trigger_shutdown();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(second);
        });
        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.in_flight_count(), 0);
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn drain_gives_up_after_the_timeout() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let _stuck = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }
}
