//! Deployment-time configuration read from the operator environment.

use crate::crd::PostgresUpgradeSpec;

/// Environment variable holding the default pg_upgrade container image.
pub const UPGRADE_IMAGE_ENV: &str = "RELATED_IMAGE_PGUPGRADE";

/// Environment variable holding a comma-separated list of feature gates.
pub const FEATURE_GATES_ENV: &str = "FEATURE_GATES";

/// Feature gate deriving pg_upgrade worker count from CPU limits.
pub const FEATURE_CPU_CONCURRENCY: &str = "UpgradeCPUConcurrency";

/// Resolves the container image for upgrade jobs. The spec field wins;
/// otherwise the operator-wide related image applies. Empty strings count as
/// unset. `None` means the request cannot proceed until one of the two is
/// provided.
pub fn upgrade_image(spec: &PostgresUpgradeSpec) -> Option<String> {
    spec.image
        .clone()
        .filter(|image| !image.is_empty())
        .or_else(|| {
            std::env::var(UPGRADE_IMAGE_ENV)
                .ok()
                .filter(|image| !image.is_empty())
        })
}

/// Reports whether a named feature gate is enabled in the environment.
pub fn feature_enabled(gate: &str) -> bool {
    std::env::var(FEATURE_GATES_ENV)
        .map(|gates| gates_contain(&gates, gate))
        .unwrap_or(false)
}

fn gates_contain(gates: &str, gate: &str) -> bool {
    gates.split(',').any(|entry| {
        let entry = entry.trim();
        entry == gate || entry.strip_suffix("=true").is_some_and(|name| name == gate)
    })
}
