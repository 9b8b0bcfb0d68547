//! Listener registries and subscription guards.
//!
//! Every emitter (the state and each reactive node) owns one [`ListenerSet`].
//! There is no global registry: a listener lives exactly as long as the
//! [`Subscription`] returned when it was registered, or until the owner
//! clears its set.
//!
//! # Invariants
//!
//! 1. Listeners are invoked in registration order.
//! 2. No borrow of the registry is held while a listener runs, so listeners
//!    may subscribe, unsubscribe or trigger further notifications.
//! 3. A listener removed while a notification round is in progress is not
//!    invoked later in that round.
//! 4. A panicking listener is logged and skipped; delivery continues with the
//!    next listener.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::{Rc, Weak};

type Listener<T> = Rc<dyn Fn(&T)>;

struct Registry<T: ?Sized> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

impl<T: ?Sized> Registry<T> {
    fn contains(&self, id: u64) -> bool {
        self.entries.iter().any(|(entry_id, _)| *entry_id == id)
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(entry_id, _)| *entry_id != id);
    }
}

/// An ordered set of callbacks owned by a single emitter.
pub struct ListenerSet<T: ?Sized> {
    /// Emitter name used in diagnostics.
    label: &'static str,
    registry: Rc<RefCell<Registry<T>>>,
}

impl<T: ?Sized + 'static> ListenerSet<T> {
    /// Create an empty set. `label` names the emitter in log output.
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            registry: Rc::new(RefCell::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or the set is cleared.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe(&self, listener: impl Fn(&T) + 'static) -> Subscription {
        let listener: Listener<T> = Rc::new(listener);
        let id = {
            let mut registry = self.registry.borrow_mut();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, listener));
            id
        };

        let registry: Weak<RefCell<Registry<T>>> = Rc::downgrade(&self.registry);
        Subscription::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.borrow_mut().remove(id);
            }
        })
    }

    /// Invoke every listener with `payload`.
    pub fn notify(&self, payload: &T) {
        let snapshot: Vec<(u64, Listener<T>)> = self
            .registry
            .borrow()
            .entries
            .iter()
            .map(|(id, listener)| (*id, Rc::clone(listener)))
            .collect();

        for (id, listener) in snapshot {
            // Unsubscribed by an earlier listener in this round.
            if !self.registry.borrow().contains(id) {
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| listener(payload)));
            if let Err(cause) = outcome {
                tracing::error!(
                    emitter = self.label,
                    "listener panicked: {}",
                    panic_message(cause.as_ref())
                );
            }
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.registry.borrow().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.borrow().entries.is_empty()
    }

    /// Drop every listener. Outstanding [`Subscription`]s become inert.
    pub fn clear(&self) {
        // Listeners may own subscriptions to this very set; drop them after
        // the borrow is released.
        let entries = std::mem::take(&mut self.registry.borrow_mut().entries);
        drop(entries);
    }
}

impl<T: ?Sized> std::fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("label", &self.label)
            .field("listeners", &self.registry.borrow().entries.len())
            .finish()
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = cause.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Guard for a registered listener.
///
/// Dropping the guard (or calling [`unsubscribe`](Subscription::unsubscribe))
/// removes the listener. If the emitter is already gone this is a no-op.
#[must_use = "dropping the subscription unregisters the listener"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Remove the listener now.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
