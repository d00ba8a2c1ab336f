//! The store capabilities the coordination primitives are built on.
//!
//! Every implementation must make [`CoordinationStore::set_if_absent`] and
//! [`CoordinationStore::delete_if_equals`] single atomic operations on the
//! store side.  The plain [`get`](CoordinationStore::get) /
//! [`set_with_ttl`](CoordinationStore::set_with_ttl) pair is only used by the
//! best-effort semaphore, which tolerates the race between them.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Raw value at `key`, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditionally set `key = value`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Delete `key`.  Returns the number of keys removed (0 or 1).
    async fn delete(&self, key: &str) -> Result<u64>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Atomically set `key = value` with `ttl` only if `key` is absent.
    /// Returns `true` if this call created the key.
    async fn set_if_absent(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool>;

    /// Atomically delete `key` only if its current value equals `expected`.
    /// Returns `true` if the key was deleted.
    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Round-trip to the store, used by health checks.
    async fn ping(&self) -> Result<()>;

    /// Release connections.  Further calls may fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
