//! Layers between the bindings and the Method Domain, composed by
//! [`build_request_pipeline`]: shedding, request expiration, span and
//! metrics.

pub mod load_shed;
pub mod metrics;
pub mod pipeline;
pub mod timeout;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_request_pipeline, RequestPipeline};
pub use timeout::TimeoutLayer;
