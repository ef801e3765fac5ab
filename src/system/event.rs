//! One-shot and reusable completion notifiers
//!
//! `OnceEvent` is a send-once, many-wait notifier that carries a payload to
//! every waiter. `Flag` is a reusable set/clear event used by the output
//! queue multiplexer and restart trackers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A single-fire event carrying a cloneable payload.
///
/// Firing more than once is ignored; the first payload wins. All current and
/// future waiters observe the fired value.
pub struct OnceEvent<T> {
    inner: Arc<OnceInner<T>>,
}

struct OnceInner<T> {
    value: Mutex<Option<T>>,
    fired: AtomicBool,
    notify: Notify,
}

impl<T: Clone> OnceEvent<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(OnceInner {
                value: Mutex::new(None),
                fired: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Fire the event with the given payload. Later calls are no-ops.
    pub fn fire(&self, value: T) {
        {
            let mut slot = self.inner.value.lock();
            if slot.is_some() {
                return;
            }
            *slot = Some(value);
        }
        self.inner.fired.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_fired(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// Wait until the event fires and return the payload.
    pub async fn wait(&self) -> T {
        loop {
            // Register before checking to avoid a lost wakeup.
            let notified = self.inner.notify.notified();
            if let Some(value) = self.inner.value.lock().clone() {
                return value;
            }
            notified.await;
        }
    }

    /// Return the payload if the event has fired.
    pub fn peek(&self) -> Option<T> {
        self.inner.value.lock().clone()
    }
}

impl<T> Clone for OnceEvent<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for OnceEvent<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for OnceEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceEvent")
            .field("fired", &self.inner.fired.load(Ordering::SeqCst))
            .finish()
    }
}

/// A reusable event flag with set/clear semantics.
pub struct Flag {
    inner: Arc<FlagInner>,
}

struct FlagInner {
    set: AtomicBool,
    notify: Notify,
}

impl Flag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FlagInner {
                set: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn set(&self) {
        self.inner.set.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn clear(&self) {
        self.inner.set.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::SeqCst)
    }

    /// Wait until the flag becomes set.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl Clone for Flag {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flag").field("set", &self.is_set()).finish()
    }
}
