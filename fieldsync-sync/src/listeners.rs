//! Small pub-sub utility shared by the engine, the orchestrator and the
//! connectivity monitor.
//!
//! Listeners run outside the registry lock, so a listener may subscribe or
//! unsubscribe from inside its own callback. A panicking listener is logged
//! and skipped; the remaining listeners still run and the notifier never
//! sees the panic.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::warn;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: u64,
    entries: Vec<(u64, Callback<E>)>,
}

/// A set of listeners for events of type `E`.
pub struct Listeners<E> {
    name: &'static str,
    registry: Arc<Mutex<Registry<E>>>,
}

impl<E: 'static> Listeners<E> {
    /// `name` tags log lines about misbehaving listeners.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Registers a listener. Keep the returned handle to unsubscribe later;
    /// dropping it leaves the listener registered.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = {
            let mut reg = self.lock();
            let id = reg.next_id;
            reg.next_id += 1;
            reg.entries.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Registry<E>>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    let mut reg = registry.lock().unwrap_or_else(PoisonError::into_inner);
                    reg.entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    /// Calls every listener with `event`, isolating panics.
    pub fn notify(&self, event: &E) {
        let snapshot: Vec<Callback<E>> = self
            .lock()
            .entries
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (*callback)(event))) {
                warn!("[{}] listener panicked: {}", self.name, panic_message(&*panic));
            }
        }
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry<E>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E> fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Handle returned by [`Listeners::subscribe`].
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Removes the listener. Safe to call after the notifier is gone.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
