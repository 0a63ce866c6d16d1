use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::warn;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback<T>,
}

struct Registry<T> {
    subscribers: Mutex<Vec<Subscriber<T>>>,
    history: Mutex<VecDeque<T>>,
    capacity: usize,
    next_id: AtomicU64,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
}

impl<T: Send + 'static> Detach for Registry<T> {
    fn detach(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }
}

/// Handle for one registered callback.
///
/// Dropping the handle leaves the callback registered; call
/// [`Subscription::unsubscribe`] to revoke it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<dyn Detach>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Revoke the callback. No delivery starts after this returns, including
    /// deliveries of an item already being fanned out to other subscribers.
    pub fn unsubscribe(self) {
        self.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            registry.detach(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Synchronous fan-out to independently revocable subscribers, with a
/// bounded history of recent items for inspection.
///
/// History is never replayed to new subscribers.
pub struct Dispatcher<T> {
    registry: Arc<Registry<T>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T: Clone + Send + 'static> Dispatcher<T> {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::with_capacity(history_capacity)),
                capacity: history_capacity,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback. Registering the same callback twice yields two
    /// independent subscriptions.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.registry.subscribers.lock().push(Subscriber {
            id,
            active: Arc::clone(&active),
            callback: Arc::new(callback),
        });

        let registry: Arc<dyn Detach> = self.registry.clone();
        Subscription {
            id,
            active,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Deliver `item` to every active subscriber in registration order.
    /// A panicking callback is logged and skipped; later subscribers still
    /// receive the item.
    pub fn dispatch(&self, item: &T) {
        self.remember(item);

        let snapshot: Vec<(u64, Arc<AtomicBool>, Callback<T>)> = self
            .registry
            .subscribers
            .lock()
            .iter()
            .map(|s| (s.id, Arc::clone(&s.active), Arc::clone(&s.callback)))
            .collect();

        for (id, active, callback) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(item))).is_err() {
                warn!(subscriber = id, "subscriber panicked; continuing fan-out");
            }
        }
    }

    fn remember(&self, item: &T) {
        if self.registry.capacity == 0 {
            return;
        }
        let mut history = self.registry.history.lock();
        if history.len() == self.registry.capacity {
            history.pop_front();
        }
        history.push_back(item.clone());
    }

    /// Most recent items, oldest first.
    pub fn recent(&self) -> Vec<T> {
        self.registry.history.lock().iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.lock().len()
    }
}
