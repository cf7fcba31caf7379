//! Registration gate consulted before an upgrade may begin.
//!
//! Token validation itself lives outside this controller; reconciliation only
//! needs the boolean answer. The gate is consulted once per reconcile, before
//! any cluster state is observed, and a positive answer blocks the upgrade
//! with a TokenRequired condition and a warning event.

use crate::crd::PostgresUpgrade;

/// Answers whether registration is mandatory and unsatisfied for an upgrade.
pub trait Registration: Send + Sync {
    /// True only when the upgrade must not proceed until a valid
    /// registration token is provided.
    fn required(&self, upgrade: &PostgresUpgrade) -> bool;
}

/// Registration gate that never blocks. Used when the operator runs without
/// a token validator.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenRegistration;

impl Registration for OpenRegistration {
    fn required(&self, _upgrade: &PostgresUpgrade) -> bool {
        false
    }
}
