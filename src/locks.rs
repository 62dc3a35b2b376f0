// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-tolerant lock helpers.
//!
//! A download worker that panics while holding its task lock must not take the
//! registry, the event bus, or any other download down with it. These helpers
//! recover the guard from a poisoned lock and log the event instead of
//! propagating the panic into every later caller.
//!
//! ```no_run
//! use std::sync::{Mutex, RwLock};
//! use torrentctl::locks::{resilient_lock, resilient_read, resilient_write};
//!
//! let categories = RwLock::new(vec![1, 2, 3]);
//! assert_eq!(resilient_read(&categories).len(), 3);
//! resilient_write(&categories).push(4);
//!
//! let handle = Mutex::new(Some(7u64));
//! let taken = resilient_lock(&handle).take();
//! assert_eq!(taken, Some(7));
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "torrentctl::locks",
                event = "LOCK_POISONED_READ",
                "RwLock poisoned during read; a worker panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "torrentctl::locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock poisoned during write; a worker panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
///
/// Used for the per-download lock that serializes engine calls on one handle.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "torrentctl::locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex poisoned; a worker panicked while holding it. Recovering."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resilient_read_write_roundtrip() {
        let lock = RwLock::new(vec!["downloading"]);
        resilient_write(&lock).push("queued");
        assert_eq!(*resilient_read(&lock), vec!["downloading", "queued"]);
    }

    #[test]
    fn test_resilient_write_recovers_poisoned_rwlock() {
        let lock = Arc::new(RwLock::new(0u32));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let mut guard = lock_clone.write().unwrap();
            *guard = 1;
            panic!("intentional panic to poison lock");
        });
        let _ = handle.join();

        assert!(lock.is_poisoned());
        *resilient_write(&lock) += 1;
        assert_eq!(*resilient_read(&lock), 2);
    }

    #[test]
    fn test_resilient_lock_recovers_poisoned_mutex() {
        let lock = Arc::new(Mutex::new(Some(42u64)));
        let lock_clone = Arc::clone(&lock);

        let handle = thread::spawn(move || {
            let _guard = lock_clone.lock().unwrap();
            panic!("worker died mid-tick");
        });
        let _ = handle.join();

        assert_eq!(resilient_lock(&lock).take(), Some(42));
        assert!(resilient_lock(&lock).is_none());
    }
}
