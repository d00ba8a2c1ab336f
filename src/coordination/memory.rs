//! In-process [`CoordinationStore`] for tests and single-node embedding.
//!
//! Expiry is measured with [`tokio::time::Instant`], so a test running on a
//! paused runtime (`#[tokio::test(start_paused = true)]`) can step TTLs and
//! retry back-offs forward deterministically with `tokio::time::advance`.
//!
//! Two hooks let tests reproduce conditions a real deployment only hits by
//! accident: [`MemoryStore::set_unavailable`] makes every call fail as if
//! the network were down, and [`MemoryStore::set_read_barrier`] parks every
//! `get` on a barrier so concurrent readers can be lined up before any of
//! them writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Barrier;
use tokio::time::Instant;

use crate::coordination::store::CoordinationStore;
use crate::error::{ttl_millis, CoordinationError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
    read_barrier: Mutex<Option<Arc<Barrier>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent call fail with [`CoordinationError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Park every `get` on `barrier` after it has read, or clear the hook.
    pub fn set_read_barrier(&self, barrier: Option<Arc<Barrier>>) {
        *lock(&self.read_barrier) = barrier;
    }

    /// Remaining lifetime of `key`, or `None` if it is absent or expired.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = lock(&self.entries);
        entries
            .get(key)
            .filter(|e| e.expires_at > now)
            .map(|e| e.expires_at - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock(&self.entries)
            .values()
            .filter(|e| e.expires_at > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinationError::Unavailable(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "memory store marked unavailable",
            ))));
        }
        Ok(())
    }

    /// Lock the map and drop `key` if its TTL has elapsed.
    fn live_entries(&self, key: &str) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = lock(&self.entries);
        if entries
            .get(key)
            .is_some_and(|e| e.expires_at <= Instant::now())
        {
            entries.remove(key);
        }
        entries
    }

    /// Lock the map for a write, first dropping every expired entry.
    fn swept_entries(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let now = Instant::now();
        let mut entries = lock(&self.entries);
        entries.retain(|_, e| e.expires_at > now);
        entries
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not wedge every other caller.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn expiry(ttl: Duration) -> Result<Instant> {
    let millis = ttl_millis(ttl)?;
    Ok(Instant::now() + Duration::from_millis(millis as u64))
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_available()?;
        let value = self.live_entries(key).get(key).map(|e| e.value.clone());

        let barrier = lock(&self.read_barrier).clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        self.check_available()?;
        let expires_at = expiry(ttl)?;
        self.swept_entries().insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        self.check_available()?;
        Ok(u64::from(self.live_entries(key).remove(key).is_some()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self.live_entries(key).contains_key(key))
    }

    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool> {
        self.check_available()?;
        let expires_at = expiry(ttl)?;
        let mut entries = self.swept_entries();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(true)
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        self.check_available()?;
        let mut entries = self.live_entries(key);
        match entries.get(key) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}
