//! Domain events and their fan-out to the event-driven engines.
//!
//! The Method Domain buffers events while a request runs and publishes them
//! once the transaction has committed. An [`EventDispatcher`] running on a
//! [`BackgroundWorker`](crate::service::worker::BackgroundWorker) hands each
//! event to every consumer that accepts the resource type, and forwards the
//! worker's periodic tick for time-driven work such as batch flushes.

use std::sync::Arc;

use async_trait::async_trait;
use cse_core::{Request, Resource, ResourceType};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::service::worker::BackgroundRunnable;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// A committed change to the resource tree.
#[derive(Debug, Clone)]
pub struct DomainEvent {
    pub kind: EventKind,
    /// State after the change (before it, for deletions).
    pub resource: Resource,
    /// The request that caused the change.
    pub request: Arc<Request>,
    /// For a parent update fired by a child create or delete, the child's type.
    pub child_type: Option<ResourceType>,
}

impl DomainEvent {
    #[must_use]
    pub fn new(kind: EventKind, resource: Resource, request: Arc<Request>) -> Self {
        Self {
            kind,
            resource,
            request,
            child_type: None,
        }
    }
}

// ---------------------------------------------------------------------------
// EventSink
// ---------------------------------------------------------------------------

/// Publishing side of the event channel.
///
/// Never blocks the publisher: when the channel is full, delivery moves to a
/// spawned task, because consumers themselves issue requests that publish.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<DomainEvent>,
}

impl EventSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<DomainEvent>) -> Self {
        Self { tx }
    }

    pub fn publish(&self, event: DomainEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(event).await.is_err() {
                        tracing::debug!("event channel closed, dropping event");
                    }
                });
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(ri = %event.resource.resource_id, "event channel closed, dropping event");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// EventConsumer
// ---------------------------------------------------------------------------

/// An engine reacting to committed changes.
///
/// Consumers are best-effort: they log their own failures and never report
/// them back to the request that caused the event.
#[async_trait]
pub trait EventConsumer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resource types this consumer wants to see.
    fn accepts(&self, _resource_type: ResourceType) -> bool {
        true
    }

    async fn on_event(&self, event: &DomainEvent);

    /// Periodic hook driven by the dispatcher's tick.
    async fn on_tick(&self) {}
}

// ---------------------------------------------------------------------------
// EventDispatcher
// ---------------------------------------------------------------------------

/// Delivers events to consumers in publication order.
pub struct EventDispatcher {
    consumers: Vec<Arc<dyn EventConsumer>>,
}

impl EventDispatcher {
    #[must_use]
    pub fn new(consumers: Vec<Arc<dyn EventConsumer>>) -> Self {
        Self { consumers }
    }
}

#[async_trait]
impl BackgroundRunnable for EventDispatcher {
    type Task = DomainEvent;

    async fn run(&mut self, event: DomainEvent) {
        tracing::trace!(
            kind = event.kind.as_str(),
            ri = %event.resource.resource_id,
            ty = %event.resource.resource_type,
            "dispatching event"
        );
        for consumer in &self.consumers {
            if consumer.accepts(event.resource.resource_type) {
                consumer.on_event(&event).await;
            }
        }
    }

    async fn on_tick(&mut self) {
        for consumer in &self.consumers {
            consumer.on_tick().await;
        }
    }

    async fn shutdown(&mut self) {
        tracing::debug!(consumers = self.consumers.len(), "event dispatcher stopped");
    }
}
