//! CSE core: resource model, request primitives, addressing, attribute
//! schema, access rules, and the wire name tables.
//!
//! Everything here is synchronous and free of I/O; the engines that act on
//! these types live in `cse-server`.

pub mod acp;
pub mod address;
pub mod error;
pub mod filter;
pub mod request;
pub mod resource;
pub mod schema;
pub mod status;
pub mod time;
pub mod wire;

pub use acp::{AccessControlOperations, AccessControlRule, Privileges};
pub use address::{CseIdentity, Target};
pub use error::{CseError, CseResult};
pub use request::{
    DiscoveryResultType, FilterCriteria, FilterUsage, Operation, Request, RequestFlags,
    Response, ResponseType, ResultContent,
};
pub use resource::{Attributes, Resource, ResourceType};
pub use schema::{schema_for, TypeSchema, WriteMode};
pub use status::ResponseStatusCode;

