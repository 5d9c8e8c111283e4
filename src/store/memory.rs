use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{StateStore, StoredValue};
use crate::clock::{Clock, MonotonicClock};
use crate::StoreError;

#[derive(Debug, Clone)]
struct Slot {
    value: String,
    expires_at: Option<u64>,
}

/// Simple in-memory store. Every operation holds one mutex, which makes each
/// of them atomic with respect to all keys (stronger than the trait requires).
///
/// Expiry is lazy: an expired slot is treated as absent on access and dropped
/// by [`InMemoryStore::purge_expired`].
#[derive(Clone, Debug)]
pub struct InMemoryStore {
    data: Arc<Mutex<HashMap<String, Slot>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self { data: Arc::default(), clock: Arc::new(MonotonicClock::default()) }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive TTLs from `clock` instead of the process monotonic clock.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Drop `key` as if the store evicted it.
    pub fn evict(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Remove every expired slot; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        let before = guard.len();
        guard.retain(|_, slot| !is_expired(slot, now));
        before - guard.len()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now_millis();
        self.lock().values().filter(|slot| !is_expired(slot, now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        // A panic while holding the lock cannot leave a slot half-written.
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expiry(&self, now: u64, ttl: Duration) -> Option<u64> {
        let ttl = u64::try_from(ttl.as_millis()).ok()?;
        now.checked_add(ttl)
    }
}

fn is_expired(slot: &Slot, now: u64) -> bool {
    slot.expires_at.map_or(false, |at| at <= now)
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn increment_with_expiry(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        let live = guard.get(key).filter(|slot| !is_expired(slot, now)).cloned();
        let (current, expires_at) = match live {
            Some(slot) => {
                let current = slot.value.parse::<i64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                (current, slot.expires_at)
            }
            None => (0, self.expiry(now, ttl)),
        };
        let next = current.saturating_add(delta);
        guard.insert(key.to_string(), Slot { value: next.to_string(), expires_at });
        Ok(next)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut guard = self.lock();
        let current = guard.get(key).filter(|slot| !is_expired(slot, now)).map(|s| s.value.as_str());
        if current != expected {
            return Ok(false);
        }
        let expires_at = self.expiry(now, ttl);
        guard.insert(key.to_string(), Slot { value: new.to_string(), expires_at });
        Ok(true)
    }

    async fn get_with_ttl(&self, key: &str) -> Result<Option<StoredValue>, StoreError> {
        let now = self.clock.now_millis();
        let guard = self.lock();
        Ok(guard.get(key).filter(|slot| !is_expired(slot, now)).map(|slot| StoredValue {
            value: slot.value.clone(),
            ttl: slot.expires_at.map(|at| Duration::from_millis(at - now)),
        }))
    }
}
