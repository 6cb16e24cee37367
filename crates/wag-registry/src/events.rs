//! Typed event dispatch.
//!
//! One watch pump runs per key prefix. Raw events flow through a bounded
//! queue into a fan-out task that invokes every listener registered on the
//! prefix sequentially, in registration order, decoding values into each
//! listener's declared type first. When the listeners fall behind and the
//! queue fills, further events are dropped (counted, observable via
//! metrics) rather than stalling the watch. Decode and listener errors are
//! logged and never cancel the subscription.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;
use wag_store::EventKind;
use wag_store::SortOrder;
use wag_store::Store;
use wag_store::StoreError;
use wag_store::WatchEvent;
use wag_store::WatchStream;

use crate::RegistryError;

/// Error type listeners report; logged, never fatal to the subscription.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Counters for dispatcher behaviour that must stay observable.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    events_dropped: AtomicU64,
    decode_failures: AtomicU64,
    listener_errors: AtomicU64,
}

impl DispatcherMetrics {
    /// Events discarded because a prefix's listeners could not keep up.
    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Events discarded because a value failed to decode.
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    /// Listener invocations that returned an error.
    pub fn listener_errors(&self) -> u64 {
        self.listener_errors.load(Ordering::Relaxed)
    }
}

/// Registration options.
#[derive(Debug, Clone, Copy)]
pub struct ListenerOptions {
    /// Emit a synthetic `Created` for every currently present key at
    /// registration time. The reconciler relies on this on startup and
    /// after a cluster rejoin.
    pub replay_existing: bool,
    /// Bound on undelivered events for the prefix before the pump starts
    /// dropping them. The first registration on a prefix fixes its queue
    /// size.
    pub queue_capacity: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            replay_existing: false,
            queue_capacity: 1024,
        }
    }
}

/// Handle to a registered listener. Dropping it leaves the subscription
/// running; call [`ListenerHandle::cancel`] to stop it. A cancelled
/// listener receives no further events and is pruned by the fan-out task.
pub struct ListenerHandle {
    cancelled: Arc<AtomicBool>,
}

impl ListenerHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

type BoxedInvocation = Pin<Box<dyn Future<Output = ()> + Send>>;
type ErasedListener = Box<dyn Fn(WatchEvent) -> BoxedInvocation + Send + Sync>;

struct Registered {
    cancelled: Arc<AtomicBool>,
    invoke: ErasedListener,
}

enum HubMessage {
    Event(WatchEvent),
    Register { listener: Registered, replay: bool },
}

struct DecodedEvent<T> {
    key: String,
    current: T,
    previous: T,
    kind: EventKind,
}

/// Fans store watch events out to typed listeners.
pub struct EventDispatcher {
    store: Arc<dyn Store>,
    metrics: Arc<DispatcherMetrics>,
    hubs: Mutex<HashMap<String, mpsc::Sender<HubMessage>>>,
}

impl EventDispatcher {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            metrics: Arc::new(DispatcherMetrics::default()),
            hubs: Mutex::new(HashMap::new()),
        })
    }

    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        self.metrics.clone()
    }

    /// Watch a key prefix, decoding values into `T` before invoking the
    /// listener as `listener(key, current, previous, kind)`.
    ///
    /// All listeners registered on one prefix share a single watch and are
    /// invoked one after another, in registration order, for every event.
    /// `Deleted` events carry the last known value as `current` and
    /// `T::default()` as `previous`.
    pub async fn register_listener<T, F, Fut>(
        &self,
        prefix: &str,
        options: ListenerOptions,
        listener: F,
    ) -> Result<ListenerHandle, RegistryError>
    where
        T: DeserializeOwned + Default + Send + 'static,
        F: Fn(String, T, T, EventKind) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ListenerError>> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));

        let metrics = self.metrics.clone();
        let invoke: ErasedListener = Box::new(move |event: WatchEvent| -> BoxedInvocation {
            let Some(decoded) = decode_event::<T>(&metrics, event) else {
                return Box::pin(async {});
            };
            let key = decoded.key.clone();
            let invocation = listener(decoded.key, decoded.current, decoded.previous, decoded.kind);
            let metrics = metrics.clone();
            Box::pin(async move {
                if let Err(err) = invocation.await {
                    metrics.listener_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %err, "event listener failed");
                }
            })
        });

        let queue_tx = self.hub(prefix, options.queue_capacity);
        queue_tx
            .send(HubMessage::Register {
                listener: Registered {
                    cancelled: cancelled.clone(),
                    invoke,
                },
                replay: options.replay_existing,
            })
            .await
            .map_err(|_| StoreError::Cancelled)?;

        Ok(ListenerHandle { cancelled })
    }

    /// The shared pump and fan-out pair for a prefix, started on first use.
    fn hub(&self, prefix: &str, queue_capacity: usize) -> mpsc::Sender<HubMessage> {
        let mut hubs = self.hubs.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(queue_tx) = hubs.get(prefix) {
            return queue_tx.clone();
        }

        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let stream = self.store.watch(prefix);
        tokio::spawn(pump_events(stream, queue_tx.clone(), self.metrics.clone(), prefix.to_string()));
        tokio::spawn(run_listeners(queue_rx, self.store.clone(), prefix.to_string()));
        hubs.insert(prefix.to_string(), queue_tx.clone());
        queue_tx
    }
}

/// Move raw watch events into the prefix queue without ever blocking on a
/// slow listener; a full queue costs the event, not the watch.
async fn pump_events(
    mut stream: WatchStream,
    queue_tx: mpsc::Sender<HubMessage>,
    metrics: Arc<DispatcherMetrics>,
    prefix: String,
) {
    while let Some(event) = stream.next().await {
        match queue_tx.try_send(HubMessage::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(message)) => {
                metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
                if let HubMessage::Event(event) = message {
                    warn!(prefix = %prefix, key = %event.key, "listeners lagging, dropping event");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return,
        }
    }
    debug!(prefix = %prefix, "watch closed");
}

/// Serial fan-out: one event at a time, every live listener in
/// registration order.
///
/// Replay for a newly registered listener also runs here, so the listener
/// set can never change while an event is mid-flight and nothing written
/// between the replay read and the registration can be lost (at worst a
/// key is seen twice, which listeners tolerate).
async fn run_listeners(mut queue_rx: mpsc::Receiver<HubMessage>, store: Arc<dyn Store>, prefix: String) {
    let mut listeners: Vec<Registered> = Vec::new();
    while let Some(message) = queue_rx.recv().await {
        match message {
            HubMessage::Register { listener, replay } => {
                if replay {
                    replay_existing(&store, &prefix, &listener).await;
                }
                listeners.push(listener);
            }
            HubMessage::Event(event) => {
                for registered in &listeners {
                    if registered.cancelled.load(Ordering::Relaxed) {
                        continue;
                    }
                    (registered.invoke)(event.clone()).await;
                }
                listeners.retain(|registered| !registered.cancelled.load(Ordering::Relaxed));
            }
        }
    }
}

/// Deliver a synthetic `Created` per present key to one listener.
async fn replay_existing(store: &Arc<dyn Store>, prefix: &str, listener: &Registered) {
    let entries = match store.list(prefix, SortOrder::Ascending).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(prefix = %prefix, error = %err, "unable to read keys for replay");
            return;
        }
    };
    for entry in entries {
        let event = WatchEvent {
            kind: EventKind::Created,
            key: entry.key.clone(),
            revision: entry.mod_revision,
            entry,
            previous: None,
        };
        (listener.invoke)(event).await;
    }
}

fn decode_value<T: DeserializeOwned>(metrics: &DispatcherMetrics, key: &str, value: &str) -> Option<T> {
    match serde_json::from_str(value) {
        Ok(decoded) => Some(decoded),
        Err(err) => {
            metrics.decode_failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %err, "dropping undecodable event");
            None
        }
    }
}

fn decode_event<T: DeserializeOwned + Default>(
    metrics: &DispatcherMetrics,
    event: WatchEvent,
) -> Option<DecodedEvent<T>> {
    let current = decode_value::<T>(metrics, &event.key, &event.entry.value)?;
    let previous = match (&event.kind, &event.previous) {
        (EventKind::Modified, Some(previous)) => decode_value::<T>(metrics, &event.key, &previous.value)?,
        _ => T::default(),
    };
    Some(DecodedEvent {
        key: event.key,
        current,
        previous,
        kind: event.kind,
    })
}
