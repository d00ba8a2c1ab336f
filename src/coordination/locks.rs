//! Token-owned distributed locks.
//!
//! A lock is a store key created with SET NX plus a TTL, holding a random
//! [`LockToken`].  Only a release that presents the same token deletes the
//! key, so a holder whose TTL ran out cannot delete the lock a new holder
//! has since taken.  The TTL is the only crash recovery: a holder that dies
//! without releasing blocks others for at most that long.
//!
//! Waiting is a fixed-interval poll.  There is no queue: when several
//! callers wait on the same key, whichever polls first after it frees up
//! wins, and a caller can in principle lose every race.  Bound the wait with
//! [`AcquireOptions`] when that matters.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::coordination::clients::StoreHandle;
use crate::error::{ttl_millis, validate_key, CoordinationError, Result};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Proof of ownership for one acquisition of a lock key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LockToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// How long and how often [`acquire_lock_with`] keeps trying.
///
/// The default polls every [`DEFAULT_RETRY_INTERVAL`] forever.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    pub retry_interval: Duration,
    /// Give up once this much time has passed since the first attempt.
    pub timeout: Option<Duration>,
    /// Give up after this many failed attempts.
    pub max_attempts: Option<u32>,
    pub cancel: Option<CancellationToken>,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            timeout: None,
            max_attempts: None,
            cancel: None,
        }
    }
}

impl AcquireOptions {
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Make one attempt to take `key` for `ttl`.
///
/// Returns the new token if the key was free, `None` if someone holds it.
pub async fn try_acquire_lock(
    handle: &StoreHandle,
    key: &str,
    ttl: Duration,
) -> Result<Option<LockToken>> {
    validate_key(key)?;
    let token = LockToken::generate();
    let acquired = handle
        .store()
        .set_if_absent(key, token.as_str().as_bytes(), ttl)
        .await?;
    debug!(store = handle.name(), %key, acquired, "try_acquire_lock");
    if acquired {
        handle.metrics().lock_acquisitions.inc();
        Ok(Some(token))
    } else {
        Ok(None)
    }
}

/// Block until `key` is ours, retrying every 100ms with no upper bound.
///
/// Store errors are returned immediately rather than retried.
pub async fn acquire_lock(handle: &StoreHandle, key: &str, ttl: Duration) -> Result<LockToken> {
    acquire_lock_with(handle, key, ttl, &AcquireOptions::default()).await
}

/// Like [`acquire_lock`], but bounded by `options`.
///
/// One token is generated per call and reused across attempts.  Fails with
/// [`CoordinationError::LockTimeout`] when the deadline or attempt budget
/// runs out, and with [`CoordinationError::Cancelled`] when the cancellation
/// token fires while waiting.
pub async fn acquire_lock_with(
    handle: &StoreHandle,
    key: &str,
    ttl: Duration,
    options: &AcquireOptions,
) -> Result<LockToken> {
    validate_key(key)?;
    ttl_millis(ttl)?;

    let token = LockToken::generate();
    let started = Instant::now();
    // A timeout too large to represent is no deadline at all.
    let deadline = options.timeout.and_then(|t| started.checked_add(t));
    let mut attempts: u32 = 0;

    loop {
        if options.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(cancelled(handle, key));
        }

        attempts = attempts.saturating_add(1);
        if handle
            .store()
            .set_if_absent(key, token.as_str().as_bytes(), ttl)
            .await?
        {
            handle.metrics().lock_acquisitions.inc();
            debug!(
                store = handle.name(),
                %key,
                attempts,
                waited = ?started.elapsed(),
                "lock acquired"
            );
            return Ok(token);
        }

        if options.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(timed_out(handle, key, attempts, started));
        }

        let mut pause = options.retry_interval;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out(handle, key, attempts, started));
            }
            pause = pause.min(remaining);
        }

        handle.metrics().lock_retries.inc();
        if attempts == 1 {
            debug!(store = handle.name(), %key, "lock held elsewhere, waiting");
        } else {
            trace!(store = handle.name(), %key, attempts, "lock still held");
        }

        match &options.cancel {
            Some(cancel) => {
                tokio::select! {
                    () = cancel.cancelled() => return Err(cancelled(handle, key)),
                    () = tokio::time::sleep(pause) => {}
                }
            }
            None => tokio::time::sleep(pause).await,
        }
    }
}

fn timed_out(handle: &StoreHandle, key: &str, attempts: u32, started: Instant) -> CoordinationError {
    let elapsed = started.elapsed();
    handle.metrics().lock_timeouts.inc();
    warn!(store = handle.name(), %key, attempts, ?elapsed, "gave up waiting for lock");
    CoordinationError::LockTimeout {
        key: key.to_string(),
        attempts,
        elapsed,
    }
}

fn cancelled(handle: &StoreHandle, key: &str) -> CoordinationError {
    handle.metrics().lock_timeouts.inc();
    debug!(store = handle.name(), %key, "lock acquisition cancelled");
    CoordinationError::Cancelled {
        key: key.to_string(),
    }
}

/// Release `key` if it is still held under `token`.
///
/// Returns `true` if the key was deleted.  `false` means the lock had
/// already expired, possibly to be re-acquired by someone else, whose lock
/// is left untouched.
pub async fn release_lock(handle: &StoreHandle, key: &str, token: &LockToken) -> Result<bool> {
    validate_key(key)?;
    let released = handle
        .store()
        .delete_if_equals(key, token.as_str().as_bytes())
        .await?;
    handle.metrics().record_release(released);
    if released {
        debug!(store = handle.name(), %key, "lock released");
    } else {
        warn!(store = handle.name(), %key, "lock release: key missing or owned by another holder");
    }
    Ok(released)
}

/// Wait until `key` no longer exists or `timeout` elapses.
///
/// Returns `true` if the key went away in time.  This only observes the key;
/// it does not take the lock.
pub async fn wait_for_release(handle: &StoreHandle, key: &str, timeout: Duration) -> Result<bool> {
    validate_key(key)?;
    let deadline = Instant::now().checked_add(timeout);

    if !handle.store().exists(key).await? {
        return Ok(true);
    }

    loop {
        let pause = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                RELEASE_POLL_INTERVAL.min(remaining)
            }
            None => RELEASE_POLL_INTERVAL,
        };

        tokio::time::sleep(pause).await;

        if !handle.store().exists(key).await? {
            debug!(store = handle.name(), %key, "wait_for_release: lock released");
            return Ok(true);
        }
    }

    warn!(store = handle.name(), %key, ?timeout, "wait_for_release: timed out");
    Ok(false)
}

/// Run `work` while holding `key`.
///
/// The lock is released after `work` finishes.  A failed or no-op release is
/// logged and otherwise ignored: the work has already run, and the TTL
/// removes whatever is left.
pub async fn with_lock<F, Fut, T>(
    handle: &StoreHandle,
    key: &str,
    ttl: Duration,
    options: &AcquireOptions,
    work: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let token = acquire_lock_with(handle, key, ttl, options).await?;
    let output = work().await;

    match release_lock(handle, key, &token).await {
        Ok(true) => {}
        Ok(false) => warn!(
            store = handle.name(),
            %key,
            ?ttl,
            "lock expired before the guarded work finished"
        ),
        Err(e) => warn!(store = handle.name(), %key, error = %e, "failed to release lock"),
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::coordination::memory::MemoryStore;
    use crate::coordination::store::CoordinationStore;

    fn handle(store: &Arc<MemoryStore>) -> StoreHandle {
        StoreHandle::standalone("test", store.clone())
    }

    #[tokio::test]
    async fn try_acquire_fails_while_held() {
        let store = MemoryStore::new();
        let h = handle(&store);
        let ttl = Duration::from_secs(30);

        let token = try_acquire_lock(&h, "k", ttl).await.unwrap().unwrap();
        assert!(try_acquire_lock(&h, "k", ttl).await.unwrap().is_none());
        assert!(release_lock(&h, "k", &token).await.unwrap());
        assert!(try_acquire_lock(&h, "k", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tokens_are_unique_per_acquisition() {
        let store = MemoryStore::new();
        let h = handle(&store);
        let ttl = Duration::from_secs(30);

        let first = acquire_lock(&h, "a", ttl).await.unwrap();
        let second = acquire_lock(&h, "b", ttl).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(
            store.get("a").await.unwrap(),
            Some(first.as_str().as_bytes().to_vec())
        );
    }

    #[tokio::test]
    async fn release_with_wrong_token_keeps_lock() {
        let store = MemoryStore::new();
        let h = handle(&store);

        let token = acquire_lock(&h, "k", Duration::from_secs(30)).await.unwrap();
        let stranger = LockToken::from("not-the-holder".to_string());
        assert!(!release_lock(&h, "k", &stranger).await.unwrap());
        assert!(store.exists("k").await.unwrap());
        assert!(release_lock(&h, "k", &token).await.unwrap());
    }

    #[tokio::test]
    async fn release_of_absent_key_is_a_no_op() {
        let store = MemoryStore::new();
        let h = handle(&store);
        let token = LockToken::from("whatever".to_string());
        assert!(!release_lock(&h, "never-held", &token).await.unwrap());
        assert!(!release_lock(&h, "never-held", &token).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_bounds_the_wait() {
        let store = MemoryStore::new();
        let h = handle(&store);
        acquire_lock(&h, "k", Duration::from_secs(60)).await.unwrap();

        let started = Instant::now();
        let options = AcquireOptions::default().timeout(Duration::from_secs(1));
        let err = acquire_lock_with(&h, "k", Duration::from_secs(60), &options)
            .await
            .unwrap_err();

        match err {
            CoordinationError::LockTimeout { attempts, .. } => {
                assert!((10..=11).contains(&attempts), "attempts = {attempts}")
            }
            other => panic!("unexpected error: {other}"),
        }
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(1), "waited {waited:?}");
        assert!(waited < Duration::from_millis(1_100), "waited {waited:?}");
        assert_eq!(h.metrics().lock_timeouts.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_budget_bounds_the_wait() {
        let store = MemoryStore::new();
        let h = handle(&store);
        acquire_lock(&h, "k", Duration::from_secs(60)).await.unwrap();

        let options = AcquireOptions::default().max_attempts(3);
        let err = acquire_lock_with(&h, "k", Duration::from_secs(60), &options)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::LockTimeout { attempts: 3, .. }));
        assert_eq!(h.metrics().lock_retries.get(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_wait() {
        let store = MemoryStore::new();
        let h = handle(&store);
        acquire_lock(&h, "k", Duration::from_secs(60)).await.unwrap();

        let cancel = CancellationToken::new();
        let options = AcquireOptions::default().cancel_on(cancel.clone());
        let waiter = {
            let h = h.clone();
            tokio::spawn(async move {
                acquire_lock_with(&h, "k", Duration::from_secs(60), &options).await
            })
        };

        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinationError::Cancelled { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_timeout_means_no_deadline() {
        let store = MemoryStore::new();
        let h = handle(&store);
        let ttl = Duration::from_secs(5);

        let options = AcquireOptions::default().timeout(Duration::MAX);
        let first = acquire_lock_with(&h, "k", ttl, &options).await.unwrap();

        // Still waits for the holder's TTL rather than giving up.
        let second = acquire_lock_with(&h, "k", ttl, &options).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(h.metrics().lock_timeouts.get(), 0);

        assert!(wait_for_release(&h, "absent", Duration::from_secs(u64::MAX))
            .await
            .unwrap());
        assert!(wait_for_release(&h, "k", Duration::MAX).await.unwrap());
    }

    #[tokio::test]
    async fn zero_ttl_is_rejected_before_touching_the_store() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let h = handle(&store);
        let err = acquire_lock(&h, "k", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn store_outage_is_not_retried() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let h = handle(&store);
        let err = acquire_lock(&h, "k", Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(h.metrics().lock_retries.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_release_sees_expiry() {
        let store = MemoryStore::new();
        let h = handle(&store);
        acquire_lock(&h, "k", Duration::from_secs(2)).await.unwrap();

        assert!(!wait_for_release(&h, "k", Duration::from_secs(1)).await.unwrap());
        assert!(wait_for_release(&h, "k", Duration::from_secs(5)).await.unwrap());
        assert!(wait_for_release(&h, "absent", Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn with_lock_releases_after_work() {
        let store = MemoryStore::new();
        let h = handle(&store);

        let seen = with_lock(
            &h,
            "k",
            Duration::from_secs(30),
            &AcquireOptions::default(),
            || async { store.exists("k").await.unwrap() },
        )
        .await
        .unwrap();

        assert!(seen, "key must be held while the work runs");
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(h.metrics().lock_acquisitions.get(), 1);
    }
}
