//! In-memory [`Database`] implementation.
//!
//! Committed state sits behind one [`RwLock`], indexed by resource ID, by
//! structured path and by parent. Each session buffers its writes in a private
//! overlay that reads see first; commit re-checks uniqueness against the
//! committed state and applies the overlay atomically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cse_core::{CseError, CseResult, Resource, ResourceType};
use parking_lot::{Mutex, RwLock};

use crate::storage::engine::{Database, DbSession};

#[derive(Debug, Clone)]
struct Entry {
    /// Insertion sequence; orders children by creation.
    seq: u64,
    resource: Resource,
}

#[derive(Debug, Default)]
struct Tree {
    by_id: HashMap<String, Entry>,
    by_path: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
}

#[derive(Debug, Default)]
struct Overlay {
    /// `None` marks a deletion.
    writes: HashMap<String, Option<Entry>>,
    created: HashSet<String>,
    closed: bool,
}

/// Shared in-memory resource tree.
#[derive(Debug, Clone, Default)]
pub struct MemoryDb {
    tree: Arc<RwLock<Tree>>,
    seq: Arc<AtomicU64>,
}

impl MemoryDb {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tree.read().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Database for MemoryDb {
    async fn begin(&self) -> CseResult<Arc<dyn DbSession>> {
        Ok(Arc::new(MemorySession {
            tree: Arc::clone(&self.tree),
            seq: Arc::clone(&self.seq),
            overlay: Mutex::new(Overlay::default()),
        }))
    }
}

/// Session over a [`MemoryDb`].
pub struct MemorySession {
    tree: Arc<RwLock<Tree>>,
    seq: Arc<AtomicU64>,
    overlay: Mutex<Overlay>,
}

// ---------------------------------------------------------------------------
// Visibility helpers: overlay first, committed state second
// ---------------------------------------------------------------------------

fn visible_by_id(tree: &Tree, overlay: &Overlay, id: &str) -> Option<Entry> {
    match overlay.writes.get(id) {
        Some(write) => write.clone(),
        None => tree.by_id.get(id).cloned(),
    }
}

fn visible_by_path(tree: &Tree, overlay: &Overlay, path: &str) -> Option<Entry> {
    let pending = overlay
        .writes
        .values()
        .flatten()
        .find(|e| e.resource.path == path);
    if let Some(entry) = pending {
        return Some(entry.clone());
    }
    tree.by_path
        .get(path)
        .and_then(|id| visible_by_id(tree, overlay, id))
}

fn visible_children(tree: &Tree, overlay: &Overlay, parent_id: &str) -> Vec<Entry> {
    let mut out: Vec<Entry> = tree
        .children
        .get(parent_id)
        .into_iter()
        .flatten()
        .filter_map(|id| visible_by_id(tree, overlay, id))
        .collect();
    out.extend(
        overlay
            .writes
            .iter()
            .filter(|(id, _)| !tree.by_id.contains_key(*id))
            .filter_map(|(_, write)| write.clone())
            .filter(|e| e.resource.parent_id.as_deref() == Some(parent_id)),
    );
    out.sort_by_key(|e| e.seq);
    out
}

fn merge_fields(mut base: Resource, from: &Resource, fields: &[&str]) -> Resource {
    for field in fields {
        match *field {
            "lt" => base.last_modified_time = from.last_modified_time,
            "et" => base.expiration_time = from.expiration_time,
            "lbl" => base.labels.clone_from(&from.labels),
            name => match from.attributes.get(name) {
                Some(value) => {
                    base.attributes.insert(name.to_owned(), value.clone());
                }
                None => {
                    base.attributes.remove(name);
                }
            },
        }
    }
    base
}

fn closed() -> CseError {
    CseError::Internal(anyhow!("database session already closed"))
}

impl MemorySession {
    fn with_view<T>(&self, f: impl FnOnce(&Tree, &Overlay) -> T) -> CseResult<T> {
        let overlay = self.overlay.lock();
        if overlay.closed {
            return Err(closed());
        }
        let tree = self.tree.read();
        Ok(f(&tree, &overlay))
    }

    fn collection(
        &self,
        resource_type: Option<ResourceType>,
        parent_id: &str,
    ) -> CseResult<Vec<Resource>> {
        self.with_view(|tree, overlay| {
            visible_children(tree, overlay, parent_id)
                .into_iter()
                .map(|e| e.resource)
                .filter(|r| resource_type.is_none_or(|ty| r.resource_type == ty))
                .collect()
        })
    }
}

#[async_trait]
impl DbSession for MemorySession {
    async fn store(&self, resource: &Resource) -> CseResult<()> {
        let mut overlay = self.overlay.lock();
        if overlay.closed {
            return Err(closed());
        }
        {
            let tree = self.tree.read();
            if visible_by_id(&tree, &overlay, &resource.resource_id).is_some() {
                return Err(CseError::Conflict(format!(
                    "resource ID {} already in use",
                    resource.resource_id
                )));
            }
            let name_taken = match &resource.parent_id {
                Some(parent) => visible_children(&tree, &overlay, parent)
                    .iter()
                    .any(|e| e.resource.resource_name == resource.resource_name),
                None => visible_by_path(&tree, &overlay, &resource.path).is_some(),
            };
            if name_taken {
                return Err(CseError::Conflict(format!(
                    "resource name {} already in use",
                    resource.resource_name
                )));
            }
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        overlay.created.insert(resource.resource_id.clone());
        overlay.writes.insert(
            resource.resource_id.clone(),
            Some(Entry {
                seq,
                resource: resource.clone(),
            }),
        );
        Ok(())
    }

    async fn get(&self, path_or_id: &str) -> CseResult<Resource> {
        self.with_view(|tree, overlay| {
            visible_by_path(tree, overlay, path_or_id)
                .or_else(|| visible_by_id(tree, overlay, path_or_id))
                .map(|e| e.resource)
        })?
        .ok_or_else(|| CseError::not_found(path_or_id))
    }

    async fn get_collection(
        &self,
        resource_type: Option<ResourceType>,
        parent_id: &str,
    ) -> CseResult<Vec<Resource>> {
        self.collection(resource_type, parent_id)
    }

    async fn get_oldest_content_instance(&self, parent_id: &str) -> CseResult<Option<Resource>> {
        Ok(self
            .collection(Some(ResourceType::ContentInstance), parent_id)?
            .into_iter()
            .next())
    }

    async fn get_latest_content_instance(&self, parent_id: &str) -> CseResult<Option<Resource>> {
        Ok(self
            .collection(Some(ResourceType::ContentInstance), parent_id)?
            .pop())
    }

    async fn update(&self, resource: &Resource, fields: Option<&[&str]>) -> CseResult<()> {
        let mut overlay = self.overlay.lock();
        if overlay.closed {
            return Err(closed());
        }
        let existing = {
            let tree = self.tree.read();
            visible_by_id(&tree, &overlay, &resource.resource_id)
        }
        .ok_or_else(|| CseError::not_found(&resource.resource_id))?;

        let merged = match fields {
            None => resource.clone(),
            Some(fields) => merge_fields(existing.resource, resource, fields),
        };
        overlay.writes.insert(
            resource.resource_id.clone(),
            Some(Entry {
                seq: existing.seq,
                resource: merged,
            }),
        );
        Ok(())
    }

    async fn delete(&self, resource: &Resource) -> CseResult<()> {
        let mut overlay = self.overlay.lock();
        if overlay.closed {
            return Err(closed());
        }
        let exists = {
            let tree = self.tree.read();
            visible_by_id(&tree, &overlay, &resource.resource_id).is_some()
        };
        if !exists {
            return Err(CseError::not_found(&resource.resource_id));
        }
        overlay.writes.insert(resource.resource_id.clone(), None);
        Ok(())
    }

    async fn get_expired(&self, now: DateTime<Utc>) -> CseResult<Vec<Resource>> {
        self.with_view(|tree, overlay| {
            let ids: HashSet<&String> = tree.by_id.keys().chain(overlay.writes.keys()).collect();
            let mut expired: Vec<Entry> = ids
                .into_iter()
                .filter_map(|id| visible_by_id(tree, overlay, id))
                .filter(|e| e.resource.expiration_time.is_some_and(|et| et <= now))
                .collect();
            expired.sort_by_key(|e| e.seq);
            expired.into_iter().map(|e| e.resource).collect()
        })
    }

    async fn commit(&self) -> CseResult<()> {
        let mut overlay = self.overlay.lock();
        if overlay.closed {
            return Err(closed());
        }
        overlay.closed = true;
        let writes = std::mem::take(&mut overlay.writes);
        let created = std::mem::take(&mut overlay.created);

        let mut tree = self.tree.write();
        for id in &created {
            let Some(Some(entry)) = writes.get(id) else {
                continue;
            };
            if tree.by_id.contains_key(id) || tree.by_path.contains_key(&entry.resource.path) {
                return Err(CseError::Conflict(format!(
                    "resource {} was created concurrently",
                    entry.resource.path
                )));
            }
        }

        for (id, write) in writes {
            match write {
                Some(entry) => {
                    if !tree.by_id.contains_key(&id) {
                        if !created.contains(&id) {
                            tracing::debug!(ri = %id, "dropping update of concurrently deleted resource");
                            continue;
                        }
                        if let Some(parent) = &entry.resource.parent_id {
                            tree.children.entry(parent.clone()).or_default().push(id.clone());
                        }
                    }
                    tree.by_path.insert(entry.resource.path.clone(), id.clone());
                    tree.by_id.insert(id, entry);
                }
                None => {
                    let Some(entry) = tree.by_id.remove(&id) else {
                        continue;
                    };
                    tree.by_path.remove(&entry.resource.path);
                    if let Some(parent) = &entry.resource.parent_id {
                        if let Some(siblings) = tree.children.get_mut(parent) {
                            siblings.retain(|c| *c != id);
                        }
                    }
                    tree.children.remove(&id);
                }
            }
        }
        Ok(())
    }

    async fn rollback(&self) -> CseResult<()> {
        let mut overlay = self.overlay.lock();
        if overlay.closed {
            return Err(closed());
        }
        overlay.closed = true;
        overlay.writes.clear();
        overlay.created.clear();
        Ok(())
    }
}
