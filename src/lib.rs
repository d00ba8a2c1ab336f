//! Locks and semaphores for worker fleets that share a KeyDB / Redis store.
//!
//! ```no_run
//! # async fn run() -> keylatch::error::Result<()> {
//! use std::time::Duration;
//!
//! use keylatch::coordination::{acquire_lock, release_lock, StoreRegistry};
//!
//! let config = keylatch::config::load_config("/etc/keylatch/config.yaml")
//!     .expect("config");
//! let registry = StoreRegistry::from_config(&config);
//! let store = registry.get_interface("default").await?;
//!
//! let token = acquire_lock(&store, "job:42", Duration::from_secs(5)).await?;
//! // ... critical section ...
//! release_lock(&store, "job:42", &token).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordination;
pub mod error;
pub mod health;
pub mod metrics;

pub use error::{CoordinationError, Result};
