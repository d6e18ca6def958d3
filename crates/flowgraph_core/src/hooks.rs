// SPDX-License-Identifier: MIT OR Apache-2.0
//! Ordered listener pipelines for lifecycle notification and value middleware.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

type Taps<F> = Arc<Mutex<TapList<F>>>;

struct TapList<F> {
    entries: Vec<(u64, F)>,
    next_id: u64,
}

impl<F> TapList<F> {
    fn insert(&mut self, tap: F) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, tap));
        id
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|(tap_id, _)| *tap_id != id);
    }
}

impl<F> Default for TapList<F> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }
}

/// Handle returned by [`Hook::subscribe`] and [`SequentialHook::subscribe`].
///
/// Call [`unsubscribe`](Subscription::unsubscribe) to remove the tap; dropping
/// the handle leaves the tap registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    fn new<F: Send + Sync + 'static>(taps: Taps<F>, id: u64) -> Self {
        Self {
            cancel: Some(Box::new(move || taps.lock().remove(id))),
        }
    }

    /// Remove the associated tap from its hook.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// A notification hook: every tap receives the same event payload, return
/// values are discarded, and taps fire in registration order.
///
/// Clones share the same tap list, so a hook stored on a cloned structure
/// keeps its registrations. The tap list is snapshotted before invocation,
/// so a tap may subscribe or unsubscribe (including itself) while the hook
/// runs; such changes take effect from the next emission.
pub struct Hook<T> {
    taps: Taps<Callback<T>>,
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

impl<T: 'static> Hook<T> {
    /// Create an empty hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it stays registered until the returned
    /// [`Subscription`] is unsubscribed.
    pub fn subscribe<F>(&self, tap: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.taps.lock().insert(Arc::new(tap));
        Subscription::new(Arc::clone(&self.taps), id)
    }

    /// Invoke every tap, in registration order, with a shared reference to
    /// `event`. The lock is released before taps run.
    pub fn emit(&self, event: &T) {
        let snapshot: Vec<Callback<T>> = {
            let taps = self.taps.lock();
            taps.entries.iter().map(|(_, tap)| Arc::clone(tap)).collect()
        };
        for tap in snapshot {
            tap(event);
        }
    }

    /// Number of registered taps.
    pub fn len(&self) -> usize {
        self.taps.lock().entries.len()
    }

    /// Whether no taps are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Hook<T> {
    fn clone(&self) -> Self {
        Self {
            taps: Arc::clone(&self.taps),
        }
    }
}

impl<T> Default for Hook<T> {
    fn default() -> Self {
        Self {
            taps: Arc::default(),
        }
    }
}

impl<T> fmt::Debug for Hook<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("taps", &self.taps.lock().entries.len())
            .finish()
    }
}

/// A value-transforming middleware chain: [`execute`](Self::execute) threads a
/// value through every tap in registration order, each tap's return value
/// becoming the next tap's input. A tap returning `None` vetoes the chain.
pub struct SequentialHook<T> {
    taps: Taps<Middleware<T>>,
}

type Middleware<T> = Arc<dyn Fn(T) -> Option<T> + Send + Sync>;

impl<T: 'static> SequentialHook<T> {
    /// Create an empty hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a middleware tap.
    pub fn subscribe<F>(&self, tap: F) -> Subscription
    where
        F: Fn(T) -> Option<T> + Send + Sync + 'static,
    {
        let id = self.taps.lock().insert(Arc::new(tap));
        Subscription::new(Arc::clone(&self.taps), id)
    }

    /// Thread `value` through the chain. Returns the final value, or `None`
    /// if any tap vetoed. The lock is released before taps run.
    pub fn execute(&self, value: T) -> Option<T> {
        let snapshot: Vec<Middleware<T>> = {
            let taps = self.taps.lock();
            taps.entries.iter().map(|(_, tap)| Arc::clone(tap)).collect()
        };
        let mut current = value;
        for tap in snapshot {
            current = tap(current)?;
        }
        Some(current)
    }

    /// Number of registered taps.
    pub fn len(&self) -> usize {
        self.taps.lock().entries.len()
    }

    /// Whether no taps are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for SequentialHook<T> {
    fn clone(&self) -> Self {
        Self {
            taps: Arc::clone(&self.taps),
        }
    }
}

impl<T> Default for SequentialHook<T> {
    fn default() -> Self {
        Self {
            taps: Arc::default(),
        }
    }
}

impl<T> fmt::Debug for SequentialHook<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequentialHook")
            .field("taps", &self.taps.lock().entries.len())
            .finish()
    }
}
