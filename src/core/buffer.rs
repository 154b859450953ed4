//! Single-slot keep-latest buffer between a serial reader and the poll loop.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Holds at most one value. A new value replaces any unread one.
#[derive(Debug)]
pub struct SingleSlot<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for SingleSlot<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> SingleSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores `value` and returns the unread value it displaced, if any.
    pub fn put(&self, value: T) -> Option<T> {
        self.lock().replace(value)
    }

    /// Removes and returns the stored value.
    pub fn take(&self) -> Option<T> {
        self.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_none()
    }
}
