//! Lightweight publish-subscribe primitive.
//!
//! [`Signal`] is a synchronous observer list: subscribers register a callback
//! and receive every emitted event until their [`Subscription`] handle is
//! dropped. Dropping the handle detaches the callback, so registration is
//! scoped and cannot leak past the subscriber's lifetime.
//!
//! Callbacks run synchronously on the emitting task and must not block or
//! suspend. Work that needs to yield belongs on a worker task, not in a
//! subscriber.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SignalInner<T> {
    subscribers: Mutex<Vec<(u64, Callback<T>)>>,
    next_id: AtomicU64,
}

/// A synchronous broadcast point for events of type `T`.
pub struct Signal<T> {
    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T> {
    /// Create a signal with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback. The returned handle detaches it on drop.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
        T: 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(callback)));

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
                }
            })),
        }
    }

    /// Deliver an event to every current subscriber.
    ///
    /// The subscriber list is snapshotted before delivery, so callbacks may
    /// freely subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &T) {
        let callbacks: Vec<Callback<T>> = {
            let subscribers = self.inner.subscribers.lock();
            subscribers.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(event);
        }
    }

    /// Number of currently attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an attached callback. Dropping it detaches the callback.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Detach explicitly. Equivalent to dropping the handle.
    pub fn detach(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
