//! State Bus
//!
//! A small publish/subscribe primitive for live state values, shared by the
//! companion link and the state aggregation layer.
//!
//! # Behavior
//!
//! - New subscribers immediately receive the latest published value (if any).
//! - `publish` suppresses a value equal to the last one published, so a
//!   stream never carries the same state twice in a row. `publish_always`
//!   bypasses the comparison for change notifications that must fire on
//!   every replacement.
//! - The bus counts subscribers and invokes an optional hook when the last
//!   one goes away, which lets an owner connect on first subscription and
//!   release resources on last cancellation.
//! - `complete` ends every stream after its queued values are drained;
//!   later publishes are dropped.

use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Hook invoked when the subscriber count drops to zero.
type IdleHook = Arc<dyn Fn() + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    tx: mpsc::UnboundedSender<T>,
}

struct BusInner<T> {
    latest: Option<T>,
    subscribers: Vec<Subscriber<T>>,
    next_id: u64,
    completed: bool,
    on_idle: Option<IdleHook>,
}

/// A shared holder for the latest value of some state, fanned out to any
/// number of [`StateStream`] subscribers.
pub struct StateBus<T> {
    inner: Arc<Mutex<BusInner<T>>>,
}

impl<T: Clone + PartialEq> StateBus<T> {
    /// Create an empty bus. The first subscriber receives nothing until the
    /// first publish.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                latest: None,
                subscribers: Vec::new(),
                next_id: 0,
                completed: false,
                on_idle: None,
            })),
        }
    }

    /// Create a bus holding an initial value, replayed to every subscriber.
    pub fn with_initial(value: T) -> Self {
        let bus = Self::new();
        bus.inner.lock().unwrap().latest = Some(value);
        bus
    }

    /// Install the hook invoked whenever the subscriber count drops to zero.
    /// The hook runs outside the bus lock, so it may call back into the bus.
    pub fn set_on_idle(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.lock().unwrap().on_idle = Some(Arc::new(hook));
    }

    /// Publish a value unless it equals the latest published value.
    pub fn publish(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.completed {
            return;
        }
        if inner.latest.as_ref() == Some(&value) {
            return;
        }
        Self::broadcast(&mut inner, value);
    }

    /// Publish a value even when it equals the latest one.
    pub fn publish_always(&self, value: T) {
        let mut inner = self.inner.lock().unwrap();
        if inner.completed {
            return;
        }
        Self::broadcast(&mut inner, value);
    }

    fn broadcast(inner: &mut BusInner<T>, value: T) {
        inner
            .subscribers
            .retain(|sub| sub.tx.send(value.clone()).is_ok());
        inner.latest = Some(value);
    }

    /// Subscribe to the bus. The latest value (if any) is delivered first.
    ///
    /// Subscribing to a completed bus yields the latest value and then the
    /// end of the stream.
    pub fn subscribe(&self) -> StateStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        if let Some(latest) = &inner.latest {
            let _ = tx.send(latest.clone());
        }
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.completed {
            inner.subscribers.push(Subscriber { id, tx });
        }
        StateStream {
            rx,
            id,
            inner: Arc::clone(&self.inner),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }

    /// Latest published value, if any.
    pub fn latest(&self) -> Option<T> {
        self.inner.lock().unwrap().latest.clone()
    }

    /// End every stream. Queued values are still delivered; subsequent
    /// publishes are dropped.
    pub fn complete(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.completed {
            return;
        }
        debug!("state bus completed");
        inner.completed = true;
        inner.subscribers.clear();
    }

    /// Whether `complete` has been called.
    pub fn is_completed(&self) -> bool {
        self.inner.lock().unwrap().completed
    }
}

impl<T: Clone + PartialEq> Default for StateBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscription to a [`StateBus`]. Dropping the stream unsubscribes; when
/// the last stream is dropped the bus's idle hook fires.
pub struct StateStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    id: u64,
    inner: Arc<Mutex<BusInner<T>>>,
}

impl<T> StateStream<T> {
    /// Wait for the next value. Returns `None` once the bus has completed
    /// and all queued values were consumed.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Take the next value without waiting, if one is already queued.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for StateStream<T> {
    fn drop(&mut self) {
        let hook = {
            let mut inner = self.inner.lock().unwrap();
            let before = inner.subscribers.len();
            inner.subscribers.retain(|sub| sub.id != self.id);
            let removed = inner.subscribers.len() < before;
            if removed && inner.subscribers.is_empty() && !inner.completed {
                inner.on_idle.clone()
            } else {
                None
            }
        };
        if let Some(hook) = hook {
            hook();
        }
    }
}
