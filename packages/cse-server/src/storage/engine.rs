//! Database and session traits behind the resource tree.
//!
//! The engine never touches storage directly: each request opens one
//! [`DbSession`] through [`Database::begin`], performs its reads and writes
//! against it, and finishes with exactly one [`commit`](DbSession::commit) or
//! [`rollback`](DbSession::rollback). Cross-session serialization is the
//! implementation's concern.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cse_core::{CseResult, Resource, ResourceType};

/// Factory for per-request sessions.
///
/// Used as `Arc<dyn Database>`.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Opens a new transactional session.
    async fn begin(&self) -> CseResult<Arc<dyn DbSession>>;
}

/// One transaction over the resource tree.
///
/// Methods take `&self` so a session can be shared by the concurrent
/// branches of a recursive delete.
#[async_trait]
pub trait DbSession: Send + Sync {
    /// Inserts a new resource.
    ///
    /// Fails with `Conflict` if the resource ID is taken or a sibling
    /// already carries the same resource name.
    async fn store(&self, resource: &Resource) -> CseResult<()>;

    /// Looks a resource up by structured path, then by resource ID.
    ///
    /// Fails with `NotFound` on a miss.
    async fn get(&self, path_or_id: &str) -> CseResult<Resource>;

    /// Children of `parent_id`, optionally of one type, in creation order.
    async fn get_collection(
        &self,
        resource_type: Option<ResourceType>,
        parent_id: &str,
    ) -> CseResult<Vec<Resource>>;

    async fn get_oldest_content_instance(&self, parent_id: &str) -> CseResult<Option<Resource>>;

    async fn get_latest_content_instance(&self, parent_id: &str) -> CseResult<Option<Resource>>;

    /// Writes back a modified resource. With `fields`, only the named
    /// attributes (short names) are copied over the stored version.
    async fn update(&self, resource: &Resource, fields: Option<&[&str]>) -> CseResult<()>;

    /// Removes a resource. Children are not touched.
    async fn delete(&self, resource: &Resource) -> CseResult<()>;

    /// Resources whose expiration time is at or before `now`.
    async fn get_expired(&self, now: DateTime<Utc>) -> CseResult<Vec<Resource>>;

    /// Makes every write of the session durable. A session closes after the
    /// first commit or rollback; further calls fail.
    async fn commit(&self) -> CseResult<()>;

    /// Discards every write of the session.
    async fn rollback(&self) -> CseResult<()>;
}
