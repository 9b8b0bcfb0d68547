//! Shared state - the key/value store every quality is checked against.
//!
//! [`State`] is a cheap, cloneable handle to a single store. It is the only
//! source of change events in the engine: every effective mutation bumps the
//! store's revision and notifies subscribers (immediately, or once at the end
//! of the outermost [`batch`](State::batch)).

mod batch;

pub use batch::BatchScope;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::listeners::{ListenerSet, Subscription};
use crate::value::Value;

struct StateInner {
    values: RefCell<HashMap<String, Value>>,
    listeners: ListenerSet<State>,
    /// Bumped once per effective mutation.
    revision: Cell<u64>,
    batch_depth: Cell<u32>,
    /// A mutation happened inside the current batch.
    pending: Cell<bool>,
}

/// Handle to a shared, observable key/value store.
///
/// Cloning a `State` creates a new handle to the **same** store.
#[derive(Clone)]
pub struct State {
    inner: Rc<StateInner>,
}

impl State {
    /// Create a new empty state.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(StateInner {
                values: RefCell::new(HashMap::new()),
                listeners: ListenerSet::new("state"),
                revision: Cell::new(0),
                batch_depth: Cell::new(0),
                pending: Cell::new(false),
            }),
        }
    }

    /// Insert or update a key.
    ///
    /// Subscribers are notified only if the key is new or the value differs
    /// from the current one.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();

        let changed = {
            let mut values = self.inner.values.borrow_mut();
            match values.get(&key) {
                Some(current) if *current == value => false,
                _ => {
                    values.insert(key, value);
                    true
                }
            }
        };

        if changed {
            self.commit();
        }
    }

    /// Remove a key, returning its previous value.
    ///
    /// Subscribers are notified only if the key existed.
    pub fn delete(&self, key: &str) -> Option<Value> {
        let removed = self.inner.values.borrow_mut().remove(key);
        if removed.is_some() {
            self.commit();
        }
        removed
    }

    /// Get a copy of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.values.borrow().get(key).cloned()
    }

    /// Check if a key exists.
    pub fn exists(&self, key: &str) -> bool {
        self.inner.values.borrow().contains_key(key)
    }

    /// Number of keys.
    pub fn size(&self) -> usize {
        self.inner.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.values.borrow().is_empty()
    }

    /// All keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.inner.values.borrow().keys().cloned().collect()
    }

    /// Copy of the whole mapping.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner.values.borrow().clone()
    }

    /// Set several keys as a single batch (at most one notification).
    pub fn extend<K, V>(&self, pairs: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.batch(|| {
            for (key, value) in pairs {
                self.set(key, value);
            }
        });
    }

    /// Register a change listener. The listener receives this state.
    #[must_use = "dropping the subscription unregisters the listener"]
    pub fn subscribe(&self, listener: impl Fn(&State) + 'static) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Remove every listener, including those held by reactive nodes.
    pub fn clear_listeners(&self) {
        self.inner.listeners.clear();
    }

    /// Run `f` with notifications deferred.
    ///
    /// At most one notification is issued when the outermost batch ends, and
    /// only if something actually changed. If `f` panics, the flush still
    /// happens while unwinding and the panic then continues to the caller.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _scope = self.batch_scope();
        f()
    }

    /// Open a batch that lasts until the returned guard is dropped.
    pub fn batch_scope(&self) -> BatchScope {
        BatchScope::enter(self.clone())
    }

    /// Whether a batch is currently open.
    pub fn in_batch(&self) -> bool {
        self.inner.batch_depth.get() > 0
    }

    /// Monotonic mutation counter. Caches stamp their results with it.
    pub fn revision(&self) -> u64 {
        self.inner.revision.get()
    }

    /// Create a non-owning handle.
    pub fn downgrade(&self) -> WeakState {
        WeakState {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Whether two handles point at the same store.
    pub fn ptr_eq(&self, other: &State) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn commit(&self) {
        let revision = self.inner.revision.get() + 1;
        self.inner.revision.set(revision);

        if self.in_batch() {
            self.inner.pending.set(true);
        } else {
            self.flush(revision);
        }
    }

    fn flush(&self, revision: u64) {
        tracing::trace!(
            revision,
            listeners = self.inner.listeners.len(),
            "state changed"
        );
        self.inner.listeners.notify(self);
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("values", &*self.inner.values.borrow())
            .field("revision", &self.inner.revision.get())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

/// Non-owning handle to a [`State`].
///
/// Reactive nodes hold their binding through this so they never keep a store
/// alive on their own.
#[derive(Clone, Default)]
pub struct WeakState {
    inner: Weak<StateInner>,
}

impl WeakState {
    /// Get a strong handle if the store still exists.
    pub fn upgrade(&self) -> Option<State> {
        self.inner.upgrade().map(|inner| State { inner })
    }

    /// Whether this handle points at `state`.
    pub fn is(&self, state: &State) -> bool {
        Weak::ptr_eq(&self.inner, &Rc::downgrade(&state.inner))
    }
}

impl std::fmt::Debug for WeakState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakState")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}
