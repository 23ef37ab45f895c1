//! Per-address sharing of physical connections.
//!
//! Every logical client for the same [`SocketAddress`] receives the same
//! `Arc<T>`; the registry counts outstanding handles and tears the shared
//! instance down when the last one is released.
//!
//! ```text
//! acquire(A) ──► { A: (instance, 1) }      creates instance
//! acquire(A) ──► { A: (instance, 2) }      shares it
//! release(A) ──► { A: (instance, 1) }      not the last one: keep
//! release(A) ──► { }                       last one: shutdown()
//! ```
//!
//! The map is guarded by its own mutex because a release racing with a
//! new acquire for the same address must see a consistent count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::address::SocketAddress;

/// Resources that can be shared through a [`SharedRegistry`].
pub trait SharedResource: Send + Sync + 'static {
    /// Release the underlying connection. Called once, after the last
    /// handle has been released.
    fn shutdown(&self);
}

struct Entry<T> {
    instance: Arc<T>,
    refcount: usize,
}

/// Address-keyed registry of reference-counted shared instances.
pub struct SharedRegistry<T: SharedResource> {
    entries: Mutex<HashMap<SocketAddress, Entry<T>>>,
}

impl<T: SharedResource> std::fmt::Debug for SharedRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("addresses", &self.lock().len())
            .finish()
    }
}

impl<T: SharedResource> Default for SharedRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SharedResource> SharedRegistry<T> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddress, Entry<T>>> {
        // Counts stay consistent even if a holder panicked mid-update.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Share the instance for `address`, creating it with `make` on first use.
    pub fn acquire(&self, address: &SocketAddress, make: impl FnOnce() -> T) -> Arc<T> {
        let mut entries = self.lock();
        let entry = entries.entry(address.clone()).or_insert_with(|| {
            log::debug!("[Registry] Creating shared instance for {address}");
            Entry {
                instance: Arc::new(make()),
                refcount: 0,
            }
        });
        entry.refcount += 1;
        Arc::clone(&entry.instance)
    }

    /// Give back one handle to `instance`.
    ///
    /// Returns `true` if this was the last handle and the instance was shut
    /// down. Releasing an instance that has already been replaced is a no-op.
    pub fn release(&self, address: &SocketAddress, instance: &Arc<T>) -> bool {
        let removed = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(address) else {
                return false;
            };
            if !Arc::ptr_eq(&entry.instance, instance) {
                return false;
            }
            if entry.refcount > 1 {
                entry.refcount -= 1;
                log::debug!(
                    "[Registry] {address} still has {} handle(s), not closing yet",
                    entry.refcount
                );
                return false;
            }
            entries.remove(address)
        };

        // Shut down outside the lock; shutdown may log or touch other state.
        if let Some(entry) = removed {
            log::debug!("[Registry] Last handle for {address} released, closing");
            entry.instance.shutdown();
            return true;
        }
        false
    }

    /// Outstanding handles for `address` (0 when absent).
    pub fn refcount(&self, address: &SocketAddress) -> usize {
        self.lock().get(address).map_or(0, |e| e.refcount)
    }

    /// True if `address` currently has a live shared instance.
    pub fn contains(&self, address: &SocketAddress) -> bool {
        self.lock().contains_key(address)
    }
}
