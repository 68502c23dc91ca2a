//! Per-ticket creation guard.
//!
//! External events for one ticket can arrive concurrently, and the remote challenge-create call
//! is not idempotent, so the null→pending→successful transition must be serialized inside the
//! process. The guard is a keyed set with compare-and-set inserts; the permit removes its key on
//! drop, so every exit path (success, caught failure, panic unwinding) releases the slot.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use bridge_core::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CreationGuard {
    keys: Arc<DashMap<String, ()>>,
}

impl CreationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the key or fail with `Conflict` if a creation is already in flight.
    pub fn acquire(&self, key: &str) -> Result<CreationPermit> {
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(_) => Err(Error::conflict(format!(
                "challenge creation already in progress for {key}"
            ))),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(CreationPermit {
                    keys: self.keys.clone(),
                    key: key.to_string(),
                })
            }
        }
    }

    /// Forcibly release a key, e.g. when a ticket is recreated from scratch.
    pub fn clear(&self, key: &str) {
        self.keys.remove(key);
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.keys.contains_key(key)
    }
}

#[derive(Debug)]
pub struct CreationPermit {
    keys: Arc<DashMap<String, ()>>,
    key: String,
}

impl Drop for CreationPermit {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}
