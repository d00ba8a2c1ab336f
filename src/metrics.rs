use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReleaseLabels {
    pub outcome: ReleaseOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ReleaseOutcome {
    Released,
    /// The key was gone or held under another token.
    NotOwner,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClaimLabels {
    pub outcome: ClaimOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum ClaimOutcome {
    Acquired,
    Busy,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the coordination primitives.
pub struct Metrics {
    // -- locks --
    pub lock_acquisitions: Counter,
    pub lock_retries: Counter,
    pub lock_timeouts: Counter,
    pub lock_releases: Family<ReleaseLabels, Counter>,

    // -- semaphores --
    pub semaphore_claims: Family<ClaimLabels, Counter>,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let lock_acquisitions = Counter::default();
        registry.register(
            "keylatch_lock_acquisitions",
            "Distributed lock acquisitions",
            lock_acquisitions.clone(),
        );

        let lock_retries = Counter::default();
        registry.register(
            "keylatch_lock_retries",
            "Acquisition attempts that found the lock held and backed off",
            lock_retries.clone(),
        );

        let lock_timeouts = Counter::default();
        registry.register(
            "keylatch_lock_timeouts",
            "Acquisitions abandoned on deadline, attempt budget or cancellation",
            lock_timeouts.clone(),
        );

        let lock_releases = Family::<ReleaseLabels, Counter>::default();
        registry.register(
            "keylatch_lock_releases",
            "Lock releases by outcome",
            lock_releases.clone(),
        );

        let semaphore_claims = Family::<ClaimLabels, Counter>::default();
        registry.register(
            "keylatch_semaphore_claims",
            "Semaphore claim attempts by outcome",
            semaphore_claims.clone(),
        );

        Self {
            lock_acquisitions,
            lock_retries,
            lock_timeouts,
            lock_releases,
            semaphore_claims,
        }
    }

    pub(crate) fn record_release(&self, released: bool) {
        let outcome = if released {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::NotOwner
        };
        self.lock_releases
            .get_or_create(&ReleaseLabels { outcome })
            .inc();
    }

    pub(crate) fn record_claim(&self, acquired: bool) {
        let outcome = if acquired {
            ClaimOutcome::Acquired
        } else {
            ClaimOutcome::Busy
        };
        self.semaphore_claims
            .get_or_create(&ClaimLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, shared by every
/// [`StoreHandle`](crate::coordination::clients::StoreHandle).
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = prometheus_client::encoding::text::encode(&mut out, &self.registry);
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
