//! The ordered, short-circuiting gate chain that decides whether an upgrade
//! may make progress, and what the next unit of work is.
//!
//! Both entry points are pure over their inputs: `preflight` runs before any
//! cluster state is read, `assess` runs over one World snapshot. Each failing
//! gate records its reason on the Progressing condition and stops; a gate
//! that stops failing resets only its own reason. Ordering matters: later
//! gates assume everything earlier already passed, so the reported reason is
//! always the earliest failing gate's.

use kube::ResourceExt;

use crate::controller::conditions::{self, reason};
use crate::controller::jobs::{self, job_completed, job_failed};
use crate::controller::world::World;
use crate::crd::{Condition, PostgresUpgrade};
use crate::naming::Naming;

/// Whether reconciliation continues past the preflight gates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Proceed,
    Halt,
}

/// The single unit of work selected once every gate passes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Work {
    /// Nothing to do; a gate blocked or the upgrade is finished.
    None,
    /// Stale Patroni endpoints must be removed before anything else.
    DeleteStaleEndpoints,
    /// The pg_upgrade job is missing or not yet complete.
    ApplyUpgradeJob,
    /// Some former replica still lacks a completed remove-data job.
    ApplyRemoveDataJobs,
    /// Everything ran; commit the new version to the cluster status.
    CommitClusterVersion,
}

/// Gates 1-4: checks that need no cluster state. `image` is the resolved
/// upgrade image, `registration_required` the authorization gate's answer.
pub fn preflight(
    upgrade: &PostgresUpgrade,
    registration_required: bool,
    image: Option<&str>,
    conditions: &mut Vec<Condition>,
) -> Flow {
    // Gate 1: Succeeded in either polarity is terminal. Nothing is written,
    // so replays leave the status byte-identical.
    if conditions::find(conditions, conditions::SUCCEEDED).is_some() {
        return Flow::Halt;
    }

    // Gate 2: registration. An upgrade already underway is allowed to
    // finish even when a token expires mid-flight.
    let mid_upgrade = conditions::find(conditions, conditions::PROGRESSING).is_some();
    if registration_required && !mid_upgrade {
        conditions::block(
            conditions,
            upgrade,
            reason::TOKEN_REQUIRED,
            "Registration token required before upgrading",
        );
        return Flow::Halt;
    }
    conditions::set_progressing_if_reason_was(conditions, upgrade, reason::TOKEN_REQUIRED);

    // Gate 3: version ordering.
    if upgrade.spec.from_postgres_version >= upgrade.spec.to_postgres_version {
        conditions::block(
            conditions,
            upgrade,
            reason::INVALID,
            format!(
                "Cannot upgrade from postgres version {} to {}",
                upgrade.spec.from_postgres_version, upgrade.spec.to_postgres_version
            ),
        );
        return Flow::Halt;
    }

    // Gate 4: the jobs must be runnable as written.
    if image.is_none() {
        conditions::block(
            conditions,
            upgrade,
            reason::INVALID,
            "Upgrade image must be set on the spec or via RELATED_IMAGE_PGUPGRADE",
        );
        return Flow::Halt;
    }
    if jobs::parse_affinity(&upgrade.spec).is_err() {
        conditions::block(
            conditions,
            upgrade,
            reason::INVALID,
            "spec.affinity is not a valid Kubernetes Affinity",
        );
        return Flow::Halt;
    }
    conditions::set_progressing_if_reason_was(conditions, upgrade, reason::INVALID);

    Flow::Proceed
}

/// Gates 5-12 plus work selection, over one World snapshot.
pub fn assess(
    upgrade: &PostgresUpgrade,
    world: &World,
    naming: &Naming,
    conditions: &mut Vec<Condition>,
) -> Work {
    // Gate 5: the cluster must exist. Absence is reported, not retried;
    // creating the cluster wakes this upgrade through the watch.
    if let Some(message) = &world.cluster_not_found {
        conditions::block(conditions, upgrade, reason::CLUSTER_NOT_FOUND, message.clone());
        return Work::None;
    }
    conditions::set_progressing_if_reason_was(conditions, upgrade, reason::CLUSTER_NOT_FOUND);
    let Some(cluster) = &world.cluster else {
        return Work::None;
    };

    let upgrade_name = upgrade.name_any();
    let upgrade_job = world.jobs.get(&naming.upgrade_job_name(&upgrade_name));
    let upgrade_job_complete = upgrade_job.is_some_and(job_completed);
    let upgrade_job_failed = upgrade_job.is_some_and(job_failed);

    let mut remove_data_failed = false;
    let mut remove_data_completed = 0i64;
    for job in world.jobs.values() {
        if job.labels().get(naming.label_role).map(String::as_str)
            == Some(naming.role_remove_data)
        {
            if job_completed(job) {
                remove_data_completed += 1;
            } else if job_failed(job) {
                remove_data_failed = true;
            }
        }
    }
    let remove_data_complete = remove_data_completed == world.replicas_expected;

    let spec_version = cluster.spec.postgres_version;
    let status_version = cluster
        .status
        .as_ref()
        .map(|status| status.postgres_version)
        .unwrap_or_default();

    // Gate 6: someone already moved the spec version without our job having
    // run. That is resolution by other means, explicitly not success.
    if spec_version == upgrade.spec.to_postgres_version && !upgrade_job_complete {
        conditions::block(
            conditions,
            upgrade,
            reason::RESOLVED,
            format!("PostgresCluster {} is already set to version {spec_version}", cluster.name_any()),
        );
        return Work::None;
    }

    // Gate 7: the applied version already matches the target. Succeeded is
    // only declared once every generated job also finished.
    if status_version == upgrade.spec.to_postgres_version {
        conditions::block(
            conditions,
            upgrade,
            reason::COMPLETED,
            format!("PostgresCluster {} is running version {status_version}", cluster.name_any()),
        );
        if upgrade_job_complete && remove_data_complete {
            conditions::set(
                conditions,
                Condition::for_upgrade(
                    upgrade,
                    conditions::SUCCEEDED,
                    "True",
                    reason::SUCCEEDED,
                    format!(
                        "PostgresCluster {} upgraded to version {status_version}",
                        cluster.name_any()
                    ),
                ),
            );
        }
        return Work::None;
    }

    // Gate 8: a running database cannot be upgraded in place.
    if !world.cluster_shutdown {
        conditions::block(
            conditions,
            upgrade,
            reason::NOT_SHUTDOWN,
            "PostgresCluster instances still running",
        );
        return Work::None;
    }
    conditions::set_progressing_if_reason_was(conditions, upgrade, reason::NOT_SHUTDOWN);

    // Gate 9: pg_upgrade runs against the primary's data directory, so the
    // cluster has to know which instance that is.
    if world.cluster_primary.is_none() {
        conditions::block(
            conditions,
            upgrade,
            reason::PRIMARY_NOT_IDENTIFIED,
            "PostgresCluster primary instance not identified",
        );
        return Work::None;
    }
    conditions::set_progressing_if_reason_was(conditions, upgrade, reason::PRIMARY_NOT_IDENTIFIED);

    // Gate 10: the cluster must actually run the version this upgrade
    // expects to start from.
    if spec_version != upgrade.spec.from_postgres_version {
        conditions::block(
            conditions,
            upgrade,
            reason::INVALID_FOR_CLUSTER,
            format!(
                "Current postgres version is {spec_version}, but upgrade expects {}",
                upgrade.spec.from_postgres_version
            ),
        );
        return Work::None;
    }
    conditions::set_progressing_if_reason_was(conditions, upgrade, reason::INVALID_FOR_CLUSTER);

    // Gate 11: the cluster must name this upgrade in its allow-upgrade
    // annotation, so two upgrades can never race over one cluster.
    let claimed = cluster
        .annotations()
        .get(naming.annotation_allow_upgrade)
        .is_some_and(|claimant| claimant.trim() == upgrade_name);
    if !claimed {
        conditions::block(
            conditions,
            upgrade,
            reason::MISSING_ANNOTATION,
            format!(
                "PostgresCluster {} must have an annotation {}: {upgrade_name}",
                cluster.name_any(),
                naming.annotation_allow_upgrade
            ),
        );
        return Work::None;
    }
    conditions::set_progressing_if_reason_was(conditions, upgrade, reason::MISSING_ANNOTATION);

    // Gate 12: one-shot jobs are never retried. A failure ends this upgrade
    // for good; only a new PostgresUpgrade starts over.
    if upgrade_job_failed || remove_data_failed {
        let message = if upgrade_job_failed {
            "pg_upgrade job failed"
        } else {
            "removing old data failed"
        };
        conditions::set(
            conditions,
            Condition::for_upgrade(upgrade, conditions::SUCCEEDED, "False", reason::FAILED, message),
        );
        return Work::None;
    }

    // Work selection, in priority order. Stale Patroni endpoints go first:
    // after pg_upgrade changes the system identifier they would poison the
    // restarted cluster's consensus state. Deleting them here is safe only
    // because gates 8 and 9 guaranteed everything is stopped.
    if !world.patroni_endpoints.is_empty() {
        return Work::DeleteStaleEndpoints;
    }
    if !upgrade_job_complete {
        return Work::ApplyUpgradeJob;
    }
    if !remove_data_complete {
        return Work::ApplyRemoveDataJobs;
    }
    Work::CommitClusterVersion
}
