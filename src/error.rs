//! Error type shared by every coordination primitive.
//!
//! The variants separate "the store could not be reached" from "the store
//! answered with an error" so callers can decide whether an outage means
//! "assume not locked" or is fatal.

use std::time::Duration;

use fred::error::ErrorKind;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = CoordinationError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// The logical store name is neither configured nor registered.
    #[error("no store configured under the name '{name}'")]
    UnknownStore { name: String },

    /// Connection parameters for a store are invalid.
    #[error("invalid store configuration: {0}")]
    Config(String),

    /// The store could not be reached (network, timeout, reconnect backlog).
    #[error("coordination store unavailable: {0}")]
    Unavailable(#[source] BoxError),

    /// The store was reachable but rejected the command.
    #[error("coordination store error: {0}")]
    Store(#[source] BoxError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A value read through a UTF-8 decoding handle was not valid UTF-8.
    #[error("value stored at '{key}' is not valid UTF-8")]
    Decode { key: String },

    /// The caller-supplied deadline or attempt budget ran out.
    #[error("gave up acquiring lock '{key}' after {attempts} attempts ({elapsed:?})")]
    LockTimeout {
        key: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("acquisition of lock '{key}' was cancelled")]
    Cancelled { key: String },
}

impl CoordinationError {
    /// `true` when the store itself is unreachable, as opposed to the caller
    /// or the configuration being wrong.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// `true` for errors raised at the configuration boundary.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::UnknownStore { .. } | Self::Config(_))
    }
}

impl From<fred::error::Error> for CoordinationError {
    fn from(err: fred::error::Error) -> Self {
        match err.kind() {
            ErrorKind::IO | ErrorKind::Timeout | ErrorKind::Canceled | ErrorKind::Backpressure => {
                Self::Unavailable(Box::new(err))
            }
            ErrorKind::Config => Self::Config(err.to_string()),
            _ => Self::Store(Box::new(err)),
        }
    }
}

/// Reject keys and TTLs the store would refuse anyway.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CoordinationError::InvalidArgument(
            "store key must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Convert a TTL to whole milliseconds, rejecting anything that rounds to 0.
pub(crate) fn ttl_millis(ttl: Duration) -> Result<i64> {
    let millis = ttl.as_millis();
    if millis == 0 {
        return Err(CoordinationError::InvalidArgument(format!(
            "TTL must be at least 1ms, got {ttl:?}"
        )));
    }
    Ok(i64::try_from(millis).unwrap_or(i64::MAX))
}
