//! In-process event bus
//!
//! `publish` only enqueues onto an unbounded channel, so instrumented callers
//! never wait on subscribers. A single dispatcher task drains the queue in
//! publish order and fans each event out to the matching handlers. Handlers run
//! on the dispatcher task and must stay cheap: consumers that do I/O forward the
//! event into their own channel.

use crate::events::{Event, EventType};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};

pub type Handler = Arc<dyn Fn(Arc<Event>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    /// `None` receives every event type
    filter: Option<EventType>,
    handler: Handler,
}

enum BusMessage {
    Event(Arc<Event>),
    Flush(oneshot::Sender<()>),
}

pub struct EventBus {
    sender: mpsc::UnboundedSender<BusMessage>,
    subscribers: Arc<RwLock<Vec<Subscription>>>,
    next_id: AtomicU64,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher on the current runtime
    pub fn spawn() -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribers: Arc<RwLock<Vec<Subscription>>> = Arc::new(RwLock::new(Vec::new()));

        let handle = tokio::spawn(dispatch_loop(rx, subscribers.clone()));

        Arc::new(Self {
            sender: tx,
            subscribers,
            next_id: AtomicU64::new(1),
            dispatcher: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue an event for asynchronous fan-out (never blocks)
    pub fn publish(&self, event: Event) {
        crate::metrics::record_event_published(event.event_type.as_str());
        if self.sender.send(BusMessage::Event(Arc::new(event))).is_err() {
            tracing::debug!("Event bus dispatcher stopped, dropping event");
        }
    }

    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) + Send + Sync + 'static,
    {
        self.add_subscription(Some(event_type), Arc::new(handler))
    }

    /// Subscribe to every event type
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) + Send + Sync + 'static,
    {
        self.add_subscription(None, Arc::new(handler))
    }

    fn add_subscription(&self, filter: Option<EventType>, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Subscription { id, filter, handler });
        tracing::debug!(
            event_type = filter.map(|t| t.as_str()).unwrap_or("*"),
            "Subscribed handler"
        );
        id
    }

    /// Returns false when the subscription was already gone
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|p| p.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Number of handlers that receive `event_type` (wildcards included)
    pub fn subscriber_count(&self, event_type: EventType) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|s| s.filter.is_none() || s.filter == Some(event_type))
            .count()
    }

    pub fn clear_subscribers(&self) {
        self.subscribers.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    /// Wait until every event published before this call has been delivered
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(BusMessage::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Deliver what is queued, then stop the dispatcher
    pub async fn shutdown(&self) {
        self.flush().await;
        let handle = self.dispatcher.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<BusMessage>,
    subscribers: Arc<RwLock<Vec<Subscription>>>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            BusMessage::Event(event) => deliver(&subscribers, event),
            BusMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::info!("Event bus dispatcher shutting down");
}

fn deliver(subscribers: &RwLock<Vec<Subscription>>, event: Arc<Event>) {
    // Snapshot the handlers so a handler may (un)subscribe without deadlocking
    let handlers: Vec<Handler> = subscribers
        .read()
        .unwrap_or_else(|p| p.into_inner())
        .iter()
        .filter(|s| s.filter.is_none() || s.filter == Some(event.event_type))
        .map(|s| s.handler.clone())
        .collect();

    for handler in handlers {
        let ev = event.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(ev))) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                event_type = %event.event_type,
                panic = %message,
                "Event handler panicked"
            );
            crate::metrics::record_handler_panic(event.event_type.as_str());
        }
    }
}
