//! Distributed coordination backed by KeyDB (Redis-compatible).
//!
//! Provides token-owned locks and best-effort semaphores for worker
//! processes that share nothing but a key-value store.  Every primitive
//! takes a [`clients::StoreHandle`]; the [`clients::StoreRegistry`] hands
//! those out by logical store name.

pub mod clients;
pub mod locks;
pub mod memory;
pub mod redis;
pub mod semaphore;
pub mod store;

pub use clients::{StoreHandle, StoreRegistry, StoredValue};
pub use locks::{
    acquire_lock, acquire_lock_with, release_lock, try_acquire_lock, wait_for_release, with_lock,
    AcquireOptions, LockToken,
};
pub use semaphore::{create_semaphore, delete_semaphore, SemaphoreMode};
pub use store::CoordinationStore;
