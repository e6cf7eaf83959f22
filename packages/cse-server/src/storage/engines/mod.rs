//! Concrete [`Database`](super::Database) implementations.

mod memory;

pub use memory::{MemoryDb, MemorySession};
