//! Notification engine.
//!
//! Keeps a watch per active subscription and turns committed changes into
//! NOTIFY requests for the subscriptions whose event criteria match. Batched
//! subscriptions accumulate notifications and flush them as one aggregated
//! request once the batch is full or its duration has elapsed; the duration
//! check runs on the dispatcher tick.

use std::time::Duration;

use async_trait::async_trait;
use cse_core::{
    filter, CseError, CseResult, FilterCriteria, Request, Resource, ResourceType, Response,
};
use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use super::events::{DomainEvent, EventConsumer, EventKind};
use super::MethodDomain;

// ---------------------------------------------------------------------------
// Subscription parameters
// ---------------------------------------------------------------------------

/// Notification event type (`net`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEventType {
    UpdateOfResource,
    DeleteOfResource,
    CreateOfDirectChild,
    DeleteOfDirectChild,
}

impl NotificationEventType {
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::UpdateOfResource => 1,
            Self::DeleteOfResource => 2,
            Self::CreateOfDirectChild => 3,
            Self::DeleteOfDirectChild => 4,
        }
    }

    #[must_use]
    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::UpdateOfResource),
            2 => Some(Self::DeleteOfResource),
            3 => Some(Self::CreateOfDirectChild),
            4 => Some(Self::DeleteOfDirectChild),
            _ => None,
        }
    }
}

/// Effective event criteria (`enc`) of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct EventCriteria {
    pub event_types: Vec<NotificationEventType>,
    /// Time, label and size predicates over the changed resource.
    pub filter: FilterCriteria,
}

impl Default for EventCriteria {
    fn default() -> Self {
        Self {
            event_types: vec![NotificationEventType::UpdateOfResource],
            filter: FilterCriteria::default(),
        }
    }
}

impl EventCriteria {
    /// Parses an `enc` object. A missing or empty `net` means update only.
    ///
    /// # Errors
    ///
    /// `BadRequest` for a non-object, an unknown event type or malformed
    /// predicates.
    pub fn from_value(value: &Value) -> CseResult<Self> {
        let Value::Object(map) = value else {
            return Err(CseError::BadRequest("enc must be an object".into()));
        };
        let mut event_types = match map.get("net") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(codes)) => codes
                .iter()
                .map(|code| {
                    code.as_u64()
                        .and_then(NotificationEventType::from_code)
                        .ok_or_else(|| {
                            CseError::BadRequest(format!("unsupported notification event type {code}"))
                        })
                })
                .collect::<CseResult<Vec<_>>>()?,
            Some(_) => return Err(CseError::BadRequest("net must be a list".into())),
        };
        if event_types.is_empty() {
            event_types.push(NotificationEventType::UpdateOfResource);
        }

        let mut predicates: Map<String, Value> = map.clone();
        predicates.remove("net");
        let filter = serde_json::from_value(Value::Object(predicates))
            .map_err(|e| CseError::BadRequest(format!("invalid enc: {e}")))?;
        Ok(Self {
            event_types,
            filter,
        })
    }

    #[must_use]
    pub fn wants(&self, event_type: NotificationEventType, resource: &Resource) -> bool {
        self.event_types.contains(&event_type) && filter::matches(&self.filter, resource)
    }
}

/// Batching parameters (`bn`): flush after `number` notifications or after
/// `duration`, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchNotify {
    pub number: Option<usize>,
    pub duration: Option<Duration>,
}

impl BatchNotify {
    /// Parses a `bn` object; `dur` is in seconds.
    ///
    /// # Errors
    ///
    /// `BadRequest` unless at least one of a positive `num` and a positive
    /// `dur` is given.
    pub fn from_value(value: &Value) -> CseResult<Self> {
        let Value::Object(map) = value else {
            return Err(CseError::BadRequest("bn must be an object".into()));
        };
        let positive = |key: &str| -> CseResult<Option<u64>> {
            match map.get(key) {
                None | Some(Value::Null) => Ok(None),
                Some(v) => match v.as_u64() {
                    Some(n) if n > 0 => Ok(Some(n)),
                    _ => Err(CseError::BadRequest(format!("bn.{key} must be a positive integer"))),
                },
            }
        };
        let number = positive("num")?.map(|n| usize::try_from(n).unwrap_or(usize::MAX));
        let duration = positive("dur")?.map(Duration::from_secs);
        if number.is_none() && duration.is_none() {
            return Err(CseError::BadRequest("bn needs num or dur".into()));
        }
        Ok(Self { number, duration })
    }
}

// ---------------------------------------------------------------------------
// Watches
// ---------------------------------------------------------------------------

struct Watch {
    parent_id: String,
    /// Qualified address of the subscription, sent as `sur`.
    sur: String,
    criteria: EventCriteria,
    targets: Vec<String>,
    subscriber: Vec<String>,
    batch: Option<BatchNotify>,
    pending: Vec<Value>,
    batch_started: Option<Instant>,
    exc: Option<u64>,
    remaining: Option<u64>,
    /// Deleted as part of its parent's delete; kept until the parent's own
    /// delete notification went out.
    doomed: bool,
}

/// One outbound notification, possibly aggregated.
struct Outgoing {
    sub_id: String,
    targets: Vec<String>,
    content: Value,
    /// The expiration counter ran out; the subscription goes after sending.
    exhausted: bool,
}

fn parse_watch(sub: &Resource, sur: String) -> CseResult<Watch> {
    let criteria = match sub.attr("enc") {
        Some(enc) if !enc.is_null() => EventCriteria::from_value(enc)?,
        _ => EventCriteria::default(),
    };
    let batch = match sub.attr("bn") {
        Some(bn) if !bn.is_null() => Some(BatchNotify::from_value(bn)?),
        _ => None,
    };
    let exc = sub.attr_u64("exc");
    Ok(Watch {
        parent_id: sub.parent_id.clone().unwrap_or_default(),
        sur,
        criteria,
        targets: sub.attr_list("nu"),
        subscriber: sub.attr_list("su"),
        batch,
        pending: Vec::new(),
        batch_started: None,
        exc,
        remaining: exc,
        doomed: false,
    })
}

impl Watch {
    /// Takes over the parameters of an updated subscription, keeping the
    /// pending batch. The expiration counter restarts only when it changed.
    fn refresh(&mut self, updated: Watch) {
        if updated.exc != self.exc {
            self.remaining = updated.exc;
        }
        self.exc = updated.exc;
        self.criteria = updated.criteria;
        self.targets = updated.targets;
        self.subscriber = updated.subscriber;
        self.batch = updated.batch;
    }

    fn record(
        &mut self,
        sub_id: &str,
        event_type: NotificationEventType,
        resource: &Resource,
    ) -> Option<Outgoing> {
        if self.remaining == Some(0) {
            return None;
        }
        let exhausted = match &mut self.remaining {
            Some(n) => {
                *n -= 1;
                *n == 0
            }
            None => false,
        };
        let sgn = json!({
            "nev": { "rep": resource.representation(), "net": event_type.code() },
            "sur": self.sur,
        });

        let Some(batch) = self.batch else {
            return Some(Outgoing {
                sub_id: sub_id.to_owned(),
                targets: self.targets.clone(),
                content: json!({ "m2m:sgn": sgn }),
                exhausted,
            });
        };
        if self.pending.is_empty() {
            self.batch_started = Some(Instant::now());
        }
        self.pending.push(sgn);
        let full = batch.number.is_some_and(|n| self.pending.len() >= n);
        (full || exhausted).then(|| self.flush(sub_id, exhausted))
    }

    fn flush(&mut self, sub_id: &str, exhausted: bool) -> Outgoing {
        self.batch_started = None;
        let entries = std::mem::take(&mut self.pending);
        Outgoing {
            sub_id: sub_id.to_owned(),
            targets: self.targets.clone(),
            content: json!({ "m2m:agn": { "m2m:sgn": entries } }),
            exhausted,
        }
    }

    fn flush_due(&mut self, sub_id: &str, now: Instant) -> Option<Outgoing> {
        let duration = self.batch.and_then(|b| b.duration)?;
        let started = self.batch_started?;
        if self.pending.is_empty() || now.duration_since(started) < duration {
            return None;
        }
        Some(self.flush(sub_id, false))
    }
}

// ---------------------------------------------------------------------------
// NotificationEngine
// ---------------------------------------------------------------------------

/// Event consumer delivering subscription notifications.
pub struct NotificationEngine {
    domain: MethodDomain,
    watches: DashMap<String, Watch>,
}

impl NotificationEngine {
    #[must_use]
    pub fn new(domain: MethodDomain) -> Self {
        Self {
            domain,
            watches: DashMap::new(),
        }
    }

    /// Number of subscriptions currently watched.
    #[must_use]
    pub fn watched(&self) -> usize {
        self.watches.len()
    }

    fn track(&self, event: &DomainEvent) {
        let sub = &event.resource;
        let sub_id = sub.resource_id.clone();
        match event.kind {
            EventKind::Created | EventKind::Updated => {
                let sur = self.domain.core().identity.qualify(&sub.path);
                match parse_watch(sub, sur) {
                    Ok(watch) => match self.watches.get_mut(&sub_id) {
                        Some(mut existing) => existing.refresh(watch),
                        None => {
                            tracing::debug!(sub = %sub_id, parent = %watch.parent_id, "watching subscription");
                            self.watches.insert(sub_id, watch);
                        }
                    },
                    Err(e) => tracing::warn!(sub = %sub_id, error = %e, "ignoring unusable subscription"),
                }
            }
            EventKind::Deleted => {
                let mut outgoing = Vec::new();
                if event.request.flags.cascading {
                    if let Some(mut watch) = self.watches.get_mut(&sub_id) {
                        watch.doomed = true;
                        outgoing.extend(deletion_notice(&sub_id, &watch));
                    }
                } else if let Some((_, mut watch)) = self.watches.remove(&sub_id) {
                    if !watch.pending.is_empty() {
                        outgoing.push(watch.flush(&sub_id, false));
                    }
                    outgoing.extend(deletion_notice(&sub_id, &watch));
                }
                self.deliver_all(outgoing);
            }
        }
    }

    /// Records `event_type` on every watch of `parent_id` that wants it.
    fn collect(
        &self,
        parent_id: &str,
        event_type: NotificationEventType,
        resource: &Resource,
        outgoing: &mut Vec<Outgoing>,
    ) {
        for mut entry in self.watches.iter_mut() {
            let (sub_id, watch) = entry.pair_mut();
            if watch.parent_id != parent_id || !watch.criteria.wants(event_type, resource) {
                continue;
            }
            if watch.doomed && event_type != NotificationEventType::DeleteOfResource {
                continue;
            }
            if let Some(out) = watch.record(sub_id, event_type, resource) {
                outgoing.push(out);
            }
        }
    }

    /// Drops the watches below a deleted resource, flushing what they held.
    fn forget_children_of(&self, parent_id: &str, outgoing: &mut Vec<Outgoing>) {
        let doomed: Vec<String> = self
            .watches
            .iter()
            .filter(|entry| entry.parent_id == parent_id)
            .map(|entry| entry.key().clone())
            .collect();
        for sub_id in doomed {
            if let Some((_, mut watch)) = self.watches.remove(&sub_id) {
                if !watch.pending.is_empty() {
                    outgoing.push(watch.flush(&sub_id, false));
                }
            }
        }
    }

    fn deliver_all(&self, outgoing: Vec<Outgoing>) {
        for out in outgoing {
            let domain = self.domain.clone();
            tokio::spawn(deliver(domain, out));
        }
    }
}

fn deletion_notice(sub_id: &str, watch: &Watch) -> Option<Outgoing> {
    if watch.subscriber.is_empty() {
        return None;
    }
    Some(Outgoing {
        sub_id: sub_id.to_owned(),
        targets: watch.subscriber.clone(),
        content: json!({ "m2m:sgn": { "sud": true, "sur": watch.sur } }),
        exhausted: false,
    })
}

/// Sends one notification to every target concurrently; a failing target
/// does not affect the others.
async fn deliver(domain: MethodDomain, out: Outgoing) {
    let sends = out
        .targets
        .iter()
        .map(|target| send_to(&domain, target, out.content.clone()));
    for (target, result) in out.targets.iter().zip(join_all(sends).await) {
        let outcome = match result {
            Ok(resp) if resp.is_success() => "delivered",
            Ok(resp) => {
                tracing::warn!(sub = %out.sub_id, target = %target, rsc = resp.status.code(), "notification rejected");
                "rejected"
            }
            Err(e) => {
                tracing::warn!(sub = %out.sub_id, target = %target, error = %e, "notification failed");
                "failed"
            }
        };
        metrics::counter!("cse_notifications_total", "outcome" => outcome).increment(1);
    }

    if out.exhausted {
        let from = domain.core().identity.sp_relative_id();
        match domain.process(Request::delete(out.sub_id.clone(), from).internal()).await {
            Ok(_) => tracing::debug!(sub = %out.sub_id, "expiration counter exhausted, subscription removed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(sub = %out.sub_id, error = %e, "failed to remove exhausted subscription"),
        }
    }
}

/// URL targets are notified directly; anything else is addressed like a
/// resource (a local AE, or a remote one through its CSE).
async fn send_to(domain: &MethodDomain, target: &str, content: Value) -> CseResult<Response> {
    let core = domain.core();
    let from = core.identity.sp_relative_id();
    if target.contains("://") {
        let req = Request::notify(target, from, content);
        core.transport.send_notify(&req, &[target.to_owned()]).await
    } else {
        domain
            .process(Request::notify(target, from, content).internal())
            .await
    }
}

#[async_trait]
impl EventConsumer for NotificationEngine {
    fn name(&self) -> &'static str {
        "notification"
    }

    async fn on_event(&self, event: &DomainEvent) {
        let resource = &event.resource;
        if resource.resource_type == ResourceType::Subscription {
            self.track(event);
            return;
        }

        let mut outgoing = Vec::new();
        match event.kind {
            EventKind::Created => {
                if let Some(parent_id) = &resource.parent_id {
                    self.collect(parent_id, NotificationEventType::CreateOfDirectChild, resource, &mut outgoing);
                }
            }
            EventKind::Updated => {
                if event.child_type == Some(ResourceType::Subscription) {
                    return;
                }
                self.collect(&resource.resource_id, NotificationEventType::UpdateOfResource, resource, &mut outgoing);
            }
            EventKind::Deleted => {
                self.collect(&resource.resource_id, NotificationEventType::DeleteOfResource, resource, &mut outgoing);
                self.forget_children_of(&resource.resource_id, &mut outgoing);
                if !event.request.flags.cascading {
                    if let Some(parent_id) = &resource.parent_id {
                        self.collect(parent_id, NotificationEventType::DeleteOfDirectChild, resource, &mut outgoing);
                    }
                }
            }
        }
        self.deliver_all(outgoing);
    }

    async fn on_tick(&self) {
        let now = Instant::now();
        let due: Vec<Outgoing> = self
            .watches
            .iter_mut()
            .filter_map(|mut entry| {
                let (sub_id, watch) = entry.pair_mut();
                watch.flush_due(sub_id, now)
            })
            .collect();
        self.deliver_all(due);
    }
}
