//! Reconciliation driver for PostgresUpgrade.
//!
//! Every wake re-derives everything from authoritative state: preflight
//! gates, one World observation, the assessment gates, then at most one unit
//! of work. Nothing is remembered between wakes; idempotence comes from
//! forced server-side apply and from conditions that only move when their
//! content moves.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{DeleteParams, Patch, PatchParams, Preconditions, PropagationPolicy};
use kube::runtime::controller::Action;
use kube::runtime::events::{Event, EventType};
use kube::runtime::reflector::ObjectRef;
use kube::{Api, ResourceExt};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::config;
use crate::controller::conditions::{self, reason};
use crate::controller::context::Context;
use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::gates::{self, Flow, Work};
use crate::controller::jobs;
use crate::controller::world::{self, World};
use crate::crd::{Condition, PostgresCluster, PostgresUpgrade};
use crate::naming::FIELD_MANAGER;

/// How quickly a reconcile re-runs after deleting stale endpoints, to
/// confirm they are gone before any job is generated.
const ENDPOINT_RECHECK: Duration = Duration::from_secs(1);

/// Reconcile one PostgresUpgrade. Called by the controller runtime for every
/// watch event touching the upgrade, its jobs, or its cluster.
pub async fn reconcile(upgrade: Arc<PostgresUpgrade>, ctx: Arc<Context>) -> Result<Action> {
    let started = Instant::now();
    let namespace = upgrade.namespace().unwrap_or_default();
    let name = upgrade.name_any();

    let result = reconcile_inner(&upgrade, &ctx).await;

    if let Some(health) = &ctx.health {
        match &result {
            Ok(_) => {
                health.metrics.record_reconcile(
                    &namespace,
                    &name,
                    started.elapsed().as_secs_f64(),
                );
                health
                    .last_reconcile
                    .store(chrono::Utc::now().timestamp() as u64, Ordering::Relaxed);
            }
            Err(_) => health.metrics.record_error(&namespace, &name),
        }
    }
    result
}

#[instrument(skip_all, fields(
    namespace = %upgrade.namespace().unwrap_or_default(),
    name = %upgrade.name_any(),
))]
async fn reconcile_inner(upgrade: &PostgresUpgrade, ctx: &Context) -> Result<Action> {
    let namespace = upgrade.namespace().unwrap_or_default();
    let before = upgrade
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default();
    let mut conditions = before.clone();

    let registration_required = ctx.registration.required(upgrade);
    let image = config::upgrade_image(&upgrade.spec);
    if gates::preflight(
        upgrade,
        registration_required,
        image.as_deref(),
        &mut conditions,
    ) == Flow::Halt
    {
        if blocked_on(&conditions, reason::TOKEN_REQUIRED) {
            warn_token_required(ctx, upgrade).await;
        }
        patch_conditions(ctx, &namespace, upgrade, &before, &conditions).await?;
        return Ok(Action::await_change());
    }

    let world = match world::observe_world(&ctx.client, upgrade, &ctx.naming).await {
        Ok(world) => {
            conditions::set_progressing_if_reason_was(
                &mut conditions,
                upgrade,
                reason::ERROR_OBSERVING_WORLD,
            );
            world
        }
        Err(error) => {
            conditions::block(
                &mut conditions,
                upgrade,
                reason::ERROR_OBSERVING_WORLD,
                error.to_string(),
            );
            // Best effort: the retry happens regardless of whether the
            // condition lands.
            let _ = patch_conditions(ctx, &namespace, upgrade, &before, &conditions).await;
            return Err(error);
        }
    };

    let work = gates::assess(upgrade, &world, &ctx.naming, &mut conditions);
    patch_conditions(ctx, &namespace, upgrade, &before, &conditions).await?;
    execute(upgrade, ctx, &namespace, &world, work).await
}

/// Runs the selected unit of work. Each arm is individually idempotent.
async fn execute(
    upgrade: &PostgresUpgrade,
    ctx: &Context,
    namespace: &str,
    world: &World,
    work: Work,
) -> Result<Action> {
    match work {
        Work::None => Ok(Action::await_change()),

        Work::DeleteStaleEndpoints => {
            let endpoints: Api<Endpoints> = Api::namespaced(ctx.client.clone(), namespace);
            for endpoint in &world.patroni_endpoints {
                info!(endpoint = %endpoint.name_any(), "Deleting stale Patroni endpoints");
                delete_exact(
                    &endpoints,
                    endpoint.name_any(),
                    endpoint.uid(),
                    endpoint.resource_version(),
                    None,
                )
                .await?;
            }
            // Re-observe promptly so job generation only starts once the
            // consensus state is confirmed gone.
            Ok(Action::requeue(ENDPOINT_RECHECK))
        }

        Work::ApplyUpgradeJob => {
            // Gate 9 guaranteed a primary; a missing one here means the
            // snapshot went stale mid-pass, so wait for the next one.
            let Some(primary) = &world.cluster_primary else {
                return Ok(Action::await_change());
            };
            let job = jobs::generate_upgrade_job(upgrade, primary, &ctx.naming)?;
            info!(job = %job.name_any(), "Applying pg_upgrade job");
            apply_job(ctx, namespace, &job).await?;
            Ok(Action::await_change())
        }

        Work::ApplyRemoveDataJobs => {
            for replica in &world.cluster_replicas {
                let job = jobs::generate_remove_data_job(upgrade, replica, &ctx.naming)?;
                debug!(job = %job.name_any(), "Applying remove-data job");
                apply_job(ctx, namespace, &job).await?;
            }
            Ok(Action::await_change())
        }

        Work::CommitClusterVersion => {
            // Replica-create backup jobs reference the old system identifier;
            // removing them forces a fresh base backup after restart.
            let jobs_api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
            for job in world.jobs.values() {
                if jobs::is_replica_create_backup(job, &ctx.naming) {
                    info!(job = %job.name_any(), "Deleting replica-create backup job");
                    delete_exact(
                        &jobs_api,
                        job.name_any(),
                        job.uid(),
                        job.resource_version(),
                        Some(PropagationPolicy::Background),
                    )
                    .await?;
                }
            }

            let clusters: Api<PostgresCluster> = Api::namespaced(ctx.client.clone(), namespace);
            let patch = json!({
                "status": {
                    "postgresVersion": upgrade.spec.to_postgres_version,
                    "pgbackrest": { "repos": null },
                }
            });
            info!(
                cluster = %upgrade.spec.postgres_cluster_name,
                version = upgrade.spec.to_postgres_version,
                "Committing upgraded version to cluster status"
            );
            clusters
                .patch_status(
                    &upgrade.spec.postgres_cluster_name,
                    &status_params(),
                    &Patch::Merge(&patch),
                )
                .await?;
            Ok(Action::await_change())
        }
    }
}

/// Forced server-side apply under this operator's field manager. Resending
/// an unchanged job is a no-op on the server.
async fn apply_job(ctx: &Context, namespace: &str, job: &Job) -> Result<()> {
    let api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
    let name = job.name_any();
    // Apply patches require TypeMeta, which typed objects do not serialize.
    let mut value = serde_json::to_value(job)?;
    value["apiVersion"] = json!("batch/v1");
    value["kind"] = json!("Job");
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&value),
    )
    .await?;
    Ok(())
}

/// Deletes an object only if it is still exactly the observed one. A missing
/// object or a precondition conflict is fine: either way the next observation
/// decides what happens.
async fn delete_exact<K>(
    api: &Api<K>,
    name: String,
    uid: Option<String>,
    resource_version: Option<String>,
    propagation_policy: Option<PropagationPolicy>,
) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let params = DeleteParams {
        preconditions: Some(Preconditions {
            uid,
            resource_version,
        }),
        propagation_policy,
        ..Default::default()
    };
    match api.delete(&name, &params).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 || response.code == 409 => Ok(()),
        Err(error) => Err(error.into()),
    }
}

async fn patch_conditions(
    ctx: &Context,
    namespace: &str,
    upgrade: &PostgresUpgrade,
    before: &[Condition],
    conditions: &[Condition],
) -> Result<()> {
    if before == conditions {
        return Ok(());
    }
    let api: Api<PostgresUpgrade> = Api::namespaced(ctx.client.clone(), namespace);
    let patch = json!({ "status": { "conditions": conditions } });
    api.patch_status(
        &upgrade.name_any(),
        &status_params(),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Status patches carry the same field manager as applies, so managedFields
/// attribute every write to this operator.
fn status_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn blocked_on(conditions: &[Condition], reason: &str) -> bool {
    conditions::find(conditions, conditions::PROGRESSING)
        .is_some_and(|condition| condition.reason == reason && condition.status == "False")
}

async fn warn_token_required(ctx: &Context, upgrade: &PostgresUpgrade) {
    let event = Event {
        type_: EventType::Warning,
        reason: "TokenRequired".to_string(),
        note: Some("Registration token required before upgrading".to_string()),
        action: "Upgrading".to_string(),
        secondary: None,
    };
    let reference = ObjectRef::from_obj(upgrade).into();
    if let Err(error) = ctx.recorder.publish(&event, &reference).await {
        warn!(error = %error, "Unable to publish TokenRequired event");
    }
}

/// Called by the controller runtime when `reconcile` returns an error.
/// Transient I/O is the only thing that propagates this far; everything a
/// user can act on was already absorbed into conditions.
pub fn error_policy(upgrade: Arc<PostgresUpgrade>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(
        name = %upgrade.name_any(),
        error = %error,
        "Reconciliation failed, backing off"
    );
    Action::requeue(BackoffConfig::default().delay_for_attempt(0))
}
