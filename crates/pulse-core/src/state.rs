//! Observable state cells.
//!
//! Each cell has one writer (the task that owns the transport session) and
//! any number of readers. Readers get the current value on subscribe and every
//! later update; intermediate values a slow reader misses are not buffered.

use tokio::sync::watch;

/// A single-writer, last-value-wins observable value.
#[derive(Debug)]
pub struct StateCell<T> {
    tx: watch::Sender<T>,
}

impl<T> StateCell<T> {
    /// Create a cell holding `initial`.
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    /// Subscribe to the current value and all later updates.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Replace the value and notify readers, even if it is unchanged.
    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Modify the value in place; readers are notified only when `f` returns `true`.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        self.tx.send_if_modified(f)
    }

    /// Borrow the current value.
    pub fn borrow(&self) -> watch::Ref<'_, T> {
        self.tx.borrow()
    }
}

impl<T: Clone> StateCell<T> {
    /// Clone out the current value.
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}

impl<T: PartialEq> StateCell<T> {
    /// Replace the value, notifying readers only if it changed.
    pub fn set_if_changed(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                false
            } else {
                *current = value;
                true
            }
        })
    }
}

impl<T: Default> Default for StateCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
