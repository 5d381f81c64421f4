use crate::types::{IndexEntry, JobResult};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Lifecycle notifications exchanged between subsystems
#[derive(Debug, Clone)]
pub enum Event {
    /// A job was enqueued; idle executors should wake
    JobAvailable,
    ExecutorStarted,
    ExecutorStopped,
    JobStarted {
        job_id: String,
    },
    JobCompleted {
        result: JobResult,
    },
    JobFailed {
        job_id: String,
        error: String,
        will_retry: bool,
        kind: FailureKind,
    },
    /// Operations were committed to the index with assigned ordinals
    OperationsWritten {
        entries: Vec<IndexEntry>,
        source_remote: String,
    },
}

/// How a job failed, so listeners can tell recoverable attempts,
/// exhausted or poisoned work, and shutdown aborts apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Failed this attempt; eligible for retry until the budget runs out
    Retryable,
    /// Poisoned work that was already dead-lettered at the point of failure
    Terminal,
    /// Cancelled by an abort signal; the work itself is not at fault
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobAvailable,
    ExecutorStarted,
    ExecutorStopped,
    JobStarted,
    JobCompleted,
    JobFailed,
    OperationsWritten,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::JobAvailable => EventKind::JobAvailable,
            Event::ExecutorStarted => EventKind::ExecutorStarted,
            Event::ExecutorStopped => EventKind::ExecutorStopped,
            Event::JobStarted { .. } => EventKind::JobStarted,
            Event::JobCompleted { .. } => EventKind::JobCompleted,
            Event::JobFailed { .. } => EventKind::JobFailed,
            Event::OperationsWritten { .. } => EventKind::OperationsWritten,
        }
    }
}

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>;
type Handler = Arc<dyn Fn(Event) -> HandlerFuture + Send + Sync>;

/// One or more handlers failed during a single emission
///
/// Every remaining handler still ran; messages are in handler
/// registration order.
#[derive(Debug, Error)]
#[error("{} event handler(s) failed: {failures:?}", failures.len())]
pub struct EmitError {
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct BusInner {
    next_id: u64,
    subscribers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
}

/// In-process typed publish/subscribe dispatcher
///
/// Subscribers for a kind run sequentially in registration order, across
/// suspension points. The subscriber list is snapshotted when an emission
/// starts: a handler added during the emission is not invoked in it, and a
/// handler unsubscribed mid-emission is skipped.
pub struct EventBus {
    inner: Mutex<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                next_id: 0,
                subscribers: HashMap::new(),
            }),
        }
    }

    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |event| Box::pin(handler(event)));
        let mut inner = self.inner.lock().unwrap();
        let id = SubscriptionId(inner.next_id);
        inner.next_id += 1;
        inner.subscribers.entry(kind).or_default().push((id, handler));
        id
    }

    /// Remove a subscription. Idempotent, safe mid-emission.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().unwrap();
        for handlers in inner.subscribers.values_mut() {
            handlers.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    fn is_subscribed(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .subscribers
            .get(&kind)
            .map(|handlers| handlers.iter().any(|(sub_id, _)| *sub_id == id))
            .unwrap_or(false)
    }

    /// Dispatch an event to all current subscribers of its kind
    ///
    /// All handlers run even when earlier ones fail; the error aggregates
    /// every failure in order. Zero subscribers resolves immediately.
    pub async fn emit(&self, event: Event) -> Result<(), EmitError> {
        let kind = event.kind();

        // Snapshot so structural changes during dispatch are deterministic
        let snapshot: Vec<(SubscriptionId, Handler)> = {
            let inner = self.inner.lock().unwrap();
            inner.subscribers.get(&kind).cloned().unwrap_or_default()
        };

        if snapshot.is_empty() {
            return Ok(());
        }

        let mut failures = Vec::new();
        for (id, handler) in snapshot {
            if !self.is_subscribed(kind, id) {
                continue;
            }
            if let Err(e) = handler(event.clone()).await {
                failures.push(e.to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EmitError { failures })
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
