//! Status condition bookkeeping for PostgresUpgrade.
//!
//! Two condition types carry the whole user-visible state of an upgrade:
//! `Progressing` reports why the upgrade is or is not moving, and `Succeeded`
//! is terminal in either polarity. Setting a condition whose status is
//! unchanged must not update `LastTransitionTime`, so repeated reconciles
//! with unchanged inputs leave the status byte-identical.

use chrono::Utc;
use kube::Resource;

use crate::crd::{Condition, PostgresUpgrade};

/// Condition type: the upgrade is moving (or blocked, with a reason).
pub const PROGRESSING: &str = "Progressing";

/// Condition type: terminal outcome of the upgrade.
pub const SUCCEEDED: &str = "Succeeded";

/// Machine-readable reasons reported through the Progressing condition.
pub mod reason {
    /// Registration is mandatory and unsatisfied.
    pub const TOKEN_REQUIRED: &str = "TokenRequired";
    /// The spec cannot be acted on as written.
    pub const INVALID: &str = "Invalid";
    /// Observing cluster state failed; retried with backoff.
    pub const ERROR_OBSERVING_WORLD: &str = "ErrorObservingWorld";
    /// The target PostgresCluster does not exist.
    pub const CLUSTER_NOT_FOUND: &str = "ClusterNotFound";
    /// The cluster spec already declares the target version without us.
    pub const RESOLVED: &str = "PostgresUpgradeResolved";
    /// The cluster status already reports the target version.
    pub const COMPLETED: &str = "PostgresUpgradeCompleted";
    /// Waiting for the cluster to be fully shut down.
    pub const NOT_SHUTDOWN: &str = "PostgresClusterNotShutdown";
    /// The cluster has not identified its startup instance.
    pub const PRIMARY_NOT_IDENTIFIED: &str = "PostgresClusterPrimaryNotIdentified";
    /// The cluster's applied version does not match fromPostgresVersion.
    pub const INVALID_FOR_CLUSTER: &str = "PostgresUpgradeInvalidForCluster";
    /// The cluster's allow-upgrade annotation does not name this upgrade.
    pub const MISSING_ANNOTATION: &str = "PostgresClusterMissingRequiredAnnotation";
    /// All gates pass; jobs are being driven to completion.
    pub const PROGRESSING: &str = "PostgresUpgradeProgressing";
    /// A one-shot job failed; the upgrade is over.
    pub const FAILED: &str = "PostgresUpgradeFailed";
    /// Everything completed and the new version is committed.
    pub const SUCCEEDED: &str = "PostgresUpgradeSucceeded";
}

impl Condition {
    /// Builds a condition stamped with the upgrade's current generation and
    /// the present time. `set` preserves the prior transition time when the
    /// status turns out to be unchanged.
    pub fn for_upgrade(
        upgrade: &PostgresUpgrade,
        type_: &str,
        status: &str,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: Utc::now().to_rfc3339(),
            observed_generation: upgrade.meta().generation,
        }
    }
}

/// Finds a condition by type.
pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|condition| condition.type_ == type_)
}

/// Inserts or updates a condition. An existing condition of the same type
/// keeps its LastTransitionTime unless the status itself changed.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions
        .iter_mut()
        .find(|existing| existing.type_ == condition.type_)
    {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Marks the upgrade blocked: Progressing=False with a specific reason.
pub fn block(
    conditions: &mut Vec<Condition>,
    upgrade: &PostgresUpgrade,
    reason: &str,
    message: impl Into<String>,
) {
    set(
        conditions,
        Condition::for_upgrade(upgrade, PROGRESSING, "False", reason, message),
    );
}

/// Resets Progressing to its generic moving state, but only when the current
/// reason is the given one (or no Progressing condition exists yet). A gate
/// that stops failing clears its own reason without clobbering a later
/// gate's report.
pub fn set_progressing_if_reason_was(
    conditions: &mut Vec<Condition>,
    upgrade: &PostgresUpgrade,
    prior_reason: &str,
) {
    let applies = match find(conditions, PROGRESSING) {
        Some(condition) => condition.reason == prior_reason,
        None => true,
    };
    if applies {
        set(
            conditions,
            Condition::for_upgrade(
                upgrade,
                PROGRESSING,
                "True",
                reason::PROGRESSING,
                format!(
                    "Upgrade progressing for cluster {}",
                    upgrade.spec.postgres_cluster_name
                ),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn upgrade() -> PostgresUpgrade {
        let mut upgrade = PostgresUpgrade::new(
            "pg14-to-15",
            crate::crd::PostgresUpgradeSpec {
                postgres_cluster_name: "hippo".to_string(),
                from_postgres_version: 14,
                to_postgres_version: 15,
                image: None,
                image_pull_policy: None,
                image_pull_secrets: None,
                resources: None,
                transfer_method: None,
                jobs: None,
                affinity: None,
                tolerations: None,
                priority_class_name: None,
                fetch_key_command: None,
                metadata: None,
            },
        );
        upgrade.metadata = ObjectMeta {
            name: Some("pg14-to-15".to_string()),
            generation: Some(2),
            ..Default::default()
        };
        upgrade
    }

    #[test]
    fn unchanged_status_keeps_transition_time() {
        let upgrade = upgrade();
        let mut conditions = Vec::new();

        let mut first =
            Condition::for_upgrade(&upgrade, PROGRESSING, "False", reason::NOT_SHUTDOWN, "wait");
        first.last_transition_time = "2024-01-01T00:00:00+00:00".to_string();
        set(&mut conditions, first);

        block(&mut conditions, &upgrade, reason::PRIMARY_NOT_IDENTIFIED, "still waiting");

        let condition = find(&conditions, PROGRESSING).unwrap();
        assert_eq!(condition.reason, reason::PRIMARY_NOT_IDENTIFIED);
        assert_eq!(condition.last_transition_time, "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn changed_status_moves_transition_time() {
        let upgrade = upgrade();
        let mut conditions = Vec::new();

        let mut first =
            Condition::for_upgrade(&upgrade, PROGRESSING, "False", reason::NOT_SHUTDOWN, "wait");
        first.last_transition_time = "2024-01-01T00:00:00+00:00".to_string();
        set(&mut conditions, first);

        set_progressing_if_reason_was(&mut conditions, &upgrade, reason::NOT_SHUTDOWN);

        let condition = find(&conditions, PROGRESSING).unwrap();
        assert_eq!(condition.status, "True");
        assert_ne!(condition.last_transition_time, "2024-01-01T00:00:00+00:00");
    }

    #[test]
    fn reset_skips_unrelated_reasons() {
        let upgrade = upgrade();
        let mut conditions = Vec::new();
        block(&mut conditions, &upgrade, reason::MISSING_ANNOTATION, "no claim");

        set_progressing_if_reason_was(&mut conditions, &upgrade, reason::NOT_SHUTDOWN);

        let condition = find(&conditions, PROGRESSING).unwrap();
        assert_eq!(condition.reason, reason::MISSING_ANNOTATION);
        assert_eq!(condition.status, "False");
    }

    #[test]
    fn reset_applies_when_no_condition_exists() {
        let upgrade = upgrade();
        let mut conditions = Vec::new();

        set_progressing_if_reason_was(&mut conditions, &upgrade, "");

        let condition = find(&conditions, PROGRESSING).unwrap();
        assert_eq!(condition.status, "True");
        assert_eq!(condition.reason, reason::PROGRESSING);
        assert_eq!(condition.observed_generation, Some(2));
    }
}
