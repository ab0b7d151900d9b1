//! Capture-side state and the persistent queue.

/// Event builder and policy rejections.
pub mod builder;
/// Identity and foreground-session tracking.
pub mod identity;
/// Super-properties and duration timers.
pub mod properties;
/// Durable FIFO of queue records.
pub mod queue;
/// Persisted sequence-number allocation.
pub mod sequence;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a producer panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
