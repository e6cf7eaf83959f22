//! CSE server: the Method Domain with its resource controllers, the
//! event-driven engines (notification, announcement, registration,
//! expiration), the transport domain and the HTTP binding.

pub mod network;
pub mod node;
pub mod service;
pub mod storage;
pub mod transport;

pub use node::{CseNode, CseNodeBuilder};

#[cfg(test)]
mod testing;
