//! Request processing.
//!
//! 1. **Classification** (`classify`): originator checks, local or forwarded
//! 2. **Middleware** (`middleware`): Tower layers (load shedding, timeout, metrics)
//! 3. **Method Domain** (`domain`): resolution, access control, controllers, events
//! 4. **Controller routing** (`router`): resource type to controller
//! 5. **Background workers** (`worker`): event dispatch, expiration sweeps

pub mod classify;
pub mod config;
pub mod domain;
pub mod middleware;
pub mod operation;
pub mod registry;
pub mod router;
pub mod worker;

pub use classify::{classify, Route};
pub use config::{CseConfig, CseType, RemoteCseConfig};
pub use domain::MethodDomain;
pub use middleware::{build_request_pipeline, RequestPipeline};
pub use operation::{service_names, OperationError};
pub use registry::{ManagedService, ServiceContext, ServiceRegistry};
pub use router::ControllerRegistry;
pub use worker::{BackgroundRunnable, BackgroundWorker};
