//! HTTP handlers and the state they share.

pub mod health;
pub mod onem2m;

pub use health::{health_handler, liveness_handler, readiness_handler};
pub use onem2m::onem2m_handler;

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::service::RequestPipeline;

/// Shared state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    /// Middleware-wrapped Method Domain.
    pub pipeline: RequestPipeline,
    /// Health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    /// CSE-ID of the node behind the binding, reported by `/health`.
    pub cse_id: Arc<str>,
    pub start_time: Instant,
}
