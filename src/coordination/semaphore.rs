//! Single-slot, TTL-bounded claim flags.
//!
//! A semaphore here answers "is someone already doing this?", for example
//! "has this task been enqueued in the last few minutes?".  It is not a
//! counting semaphore and, in the default [`SemaphoreMode::BestEffort`] mode,
//! not a mutual-exclusion primitive either: the check and the claim are two
//! separate round-trips, so two callers racing on an absent key can both
//! observe it absent and both be told they claimed it.  Use
//! [`SemaphoreMode::Atomic`] or [`crate::coordination::locks`] when a double
//! claim is not acceptable.
//!
//! Whatever the mode, the TTL caps how long a claim whose owner crashed can
//! block everyone else.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::coordination::clients::StoreHandle;
use crate::error::{validate_key, Result};

/// Value written to claimed keys.
pub const SENTINEL: &[u8] = b"1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemaphoreMode {
    /// GET, then SET if nothing was there.  Racing callers may both win.
    #[default]
    BestEffort,
    /// A single SET NX.  At most one racing caller wins.
    Atomic,
}

/// Claim `key` for `ttl`.
///
/// Returns `true` if the caller now holds the claim and `false` if the key
/// was already claimed.  A store holding an empty value counts as unclaimed.
pub async fn create_semaphore(
    handle: &StoreHandle,
    key: &str,
    ttl: Duration,
    mode: SemaphoreMode,
) -> Result<bool> {
    validate_key(key)?;
    let store = handle.store();

    let acquired = match mode {
        SemaphoreMode::BestEffort => {
            let current = store.get(key).await?;
            if current.is_some_and(|v| !v.is_empty()) {
                false
            } else {
                store.set_with_ttl(key, SENTINEL, ttl).await?;
                true
            }
        }
        SemaphoreMode::Atomic => store.set_if_absent(key, SENTINEL, ttl).await?,
    };

    handle.metrics().record_claim(acquired);
    debug!(store = handle.name(), %key, ?ttl, ?mode, acquired, "create_semaphore");
    Ok(acquired)
}

/// Drop the claim on `key`.  Deleting an unclaimed key is a no-op.
pub async fn delete_semaphore(handle: &StoreHandle, key: &str) -> Result<()> {
    validate_key(key)?;
    let removed = handle.store().delete(key).await?;
    debug!(store = handle.name(), %key, removed, "delete_semaphore");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;

    use super::*;
    use crate::coordination::memory::MemoryStore;
    use crate::coordination::store::CoordinationStore;

    fn handle(store: &Arc<MemoryStore>) -> StoreHandle {
        StoreHandle::standalone("test", store.clone())
    }

    #[tokio::test]
    async fn second_claim_is_refused() {
        let store = MemoryStore::new();
        let h = handle(&store);
        let ttl = Duration::from_secs(60);

        for mode in [SemaphoreMode::BestEffort, SemaphoreMode::Atomic] {
            let key = format!("enqueue:{mode:?}");
            assert!(create_semaphore(&h, &key, ttl, mode).await.unwrap());
            assert!(!create_semaphore(&h, &key, ttl, mode).await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn claim_lapses_after_ttl() {
        let store = MemoryStore::new();
        let h = handle(&store);
        let ttl = Duration::from_secs(5);

        assert!(create_semaphore(&h, "k", ttl, SemaphoreMode::BestEffort)
            .await
            .unwrap());
        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(!create_semaphore(&h, "k", ttl, SemaphoreMode::BestEffort)
            .await
            .unwrap());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(create_semaphore(&h, "k", ttl, SemaphoreMode::BestEffort)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn empty_value_counts_as_unclaimed() {
        let store = MemoryStore::new();
        let h = handle(&store);
        store
            .set_with_ttl("k", b"", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(
            create_semaphore(&h, "k", Duration::from_secs(60), SemaphoreMode::BestEffort)
                .await
                .unwrap()
        );
        assert_eq!(store.get("k").await.unwrap(), Some(SENTINEL.to_vec()));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        let h = handle(&store);
        delete_semaphore(&h, "never-created").await.unwrap();

        assert!(
            create_semaphore(&h, "k", Duration::from_secs(60), SemaphoreMode::Atomic)
                .await
                .unwrap()
        );
        delete_semaphore(&h, "k").await.unwrap();
        delete_semaphore(&h, "k").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn best_effort_claims_can_both_win() {
        let store = MemoryStore::new();
        store.set_read_barrier(Some(Arc::new(Barrier::new(2))));
        let (h1, h2) = (handle(&store), handle(&store));
        let ttl = Duration::from_secs(60);

        // Both readers see the key absent before either writes.
        let (a, b) = tokio::join!(
            create_semaphore(&h1, "race", ttl, SemaphoreMode::BestEffort),
            create_semaphore(&h2, "race", ttl, SemaphoreMode::BestEffort),
        );
        assert!(a.unwrap());
        assert!(b.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn atomic_claims_have_one_winner() {
        let store = MemoryStore::new();
        let (h1, h2) = (handle(&store), handle(&store));
        let ttl = Duration::from_secs(60);

        let (a, b) = tokio::join!(
            create_semaphore(&h1, "race", ttl, SemaphoreMode::Atomic),
            create_semaphore(&h2, "race", ttl, SemaphoreMode::Atomic),
        );
        assert_ne!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn store_outage_propagates() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let h = handle(&store);
        let err = create_semaphore(
            &h,
            "k",
            Duration::from_secs(1),
            SemaphoreMode::BestEffort,
        )
        .await
        .unwrap_err();
        assert!(err.is_unavailable());
    }
}
