//! Storage behind the resource tree.
//!
//! - [`Database`] / [`DbSession`]: per-request transactional access to the tree
//! - [`engines`]: concrete databases ([`MemoryDb`])
//!
//! The Method Domain owns exactly one session per request and closes it with a
//! single commit or rollback.

pub mod engine;
pub mod engines;

pub use engine::{Database, DbSession};
pub use engines::MemoryDb;
