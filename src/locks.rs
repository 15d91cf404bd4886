//! Keyed async mutual exclusion
//!
//! Each key (asset id, wallet id, idempotency key) gets its own mutex, so
//! operations on different keys never contend. Guards may be held across
//! `.await` points.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::{LedgerError, LedgerResult};

type SlotTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// A family of mutexes addressed by string key.
///
/// A key's slot lives only while some guard holds or waits for it.
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    slots: SlotTable,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> LedgerResult<KeyGuard> {
        let slot = {
            let mut slots = self
                .slots
                .lock()
                .map_err(|_| LedgerError::Storage("lock table poisoned".to_string()))?;
            SlotRef {
                key: key.to_string(),
                mutex: slots.entry(key.to_string()).or_default().clone(),
                slots: self.slots.clone(),
            }
        };

        let guard = slot.mutex.clone().lock_owned().await;
        Ok(KeyGuard {
            _guard: guard,
            slot,
        })
    }

    /// Number of keys currently held or awaited
    pub fn active_keys(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }
}

/// A handle on one table entry; the entry is evicted when the last handle
/// goes away.
#[derive(Debug)]
struct SlotRef {
    key: String,
    mutex: Arc<AsyncMutex<()>>,
    slots: SlotTable,
}

impl Drop for SlotRef {
    fn drop(&mut self) {
        // Handles are only cloned under the table lock, so two references
        // (the table and this handle) means nobody else wants the key.
        if let Ok(mut slots) = self.slots.lock() {
            let idle = slots
                .get(&self.key)
                .map(|m| Arc::ptr_eq(m, &self.mutex) && Arc::strong_count(m) == 2)
                .unwrap_or(false);
            if idle {
                slots.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one key; released on drop
#[derive(Debug)]
pub struct KeyGuard {
    // Declared first so the mutex is released before the slot is checked
    _guard: OwnedMutexGuard<()>,
    slot: SlotRef,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.slot.key
    }

    /// Fail unless this guard protects `key`
    pub(crate) fn ensure_covers(&self, key: &str) -> LedgerResult<()> {
        if self.slot.key != key {
            return Err(LedgerError::InvariantViolation(format!(
                "Operation on '{}' attempted while holding the lock for '{}'",
                key, self.slot.key
            )));
        }
        Ok(())
    }
}
