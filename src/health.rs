use std::collections::BTreeMap;

use serde::Serialize;

use crate::coordination::clients::StoreRegistry;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub stores: BTreeMap<String, CheckResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

async fn check_store(registry: &StoreRegistry, name: &str) -> CheckResult {
    let handle = match registry.get_interface(name).await {
        Ok(handle) => handle,
        Err(e) => return CheckResult::unhealthy(format!("connect failed: {e}")),
    };
    match handle.store().ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

fn aggregate_status(stores: &BTreeMap<String, CheckResult>) -> HealthStatus {
    let healthy = stores.values().filter(|c| c.ok).count();
    if healthy == stores.len() && healthy > 0 {
        HealthStatus::Ok
    } else if healthy > 0 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Unhealthy
    }
}

/// PING every store the registry knows about.
///
/// `Ok` when all answer, `Degraded` when only some do, `Unhealthy` when none
/// do (or none are configured).
pub async fn check_stores(registry: &StoreRegistry) -> HealthReport {
    let mut stores = BTreeMap::new();
    for name in registry.names().await {
        let result = check_store(registry, &name).await;
        stores.insert(name, result);
    }
    let status = aggregate_status(&stores);
    HealthReport { status, stores }
}
