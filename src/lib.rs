pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod naming;

pub use controller::{
    BackoffConfig, Context, Error, Flow, Result, Work, World, error_policy, reconcile,
};
pub use crd::{PostgresCluster, PostgresUpgrade};
pub use health::{HealthState, Metrics};
pub use naming::Naming;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::runtime::Controller;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Upgrades to requeue when a PostgresCluster changes: every known upgrade
/// in the cluster's namespace whose spec names it. More than one upgrade may
/// target the same cluster; the gate chain sorts out which one may act.
pub fn upgrades_for_cluster(
    upgrades: Vec<Arc<PostgresUpgrade>>,
    cluster: &PostgresCluster,
) -> Vec<ObjectRef<PostgresUpgrade>> {
    let cluster_name = cluster.name_any();
    let namespace = cluster.namespace();
    upgrades
        .into_iter()
        .filter(|upgrade| {
            upgrade.spec.postgres_cluster_name == cluster_name
                && upgrade.namespace() == namespace
        })
        .map(|upgrade| ObjectRef::from_obj(upgrade.as_ref()))
        .collect()
}

/// Run the upgrade controller (cluster-wide).
///
/// Watches PostgresUpgrade resources, the jobs they generate, and the
/// PostgresCluster objects they target. It can be called from main.rs or
/// spawned as a background task during integration tests.
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controller(client: Client, health_state: Option<Arc<HealthState>>) {
    run_controller_scoped(client, health_state, None).await
}

/// Run the upgrade controller with optional namespace scoping.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace.
/// When `namespace` is `None`, watches resources cluster-wide.
///
/// Use the scoped version for integration tests to enable parallel test execution.
pub async fn run_controller_scoped(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    namespace: Option<&str>,
) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for PostgresUpgrade resources (scope: {})",
        scope_msg
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), health_state));

    // Set up APIs for the controller (namespaced or cluster-wide)
    let upgrades: Api<PostgresUpgrade> = scoped_api(client.clone(), namespace);
    let jobs: Api<Job> = scoped_api(client.clone(), namespace);
    let clusters: Api<PostgresCluster> = scoped_api(client.clone(), namespace);

    // Configure watcher to handle dynamic resource creation
    // Use any_semantic() for more reliable resource discovery in test environments
    let watcher_config = WatcherConfig::default().any_semantic();

    // Create and run the controller
    // Watch PostgresUpgrade, the jobs it owns, and the target clusters
    let controller = Controller::new(upgrades, watcher_config.clone());

    // Cluster events wake every upgrade that names the cluster, read from
    // the controller's own reflector store. Matching on the spec rather than
    // the allow-upgrade annotation means an upgrade blocked on a cluster
    // that does not exist yet (or is not annotated yet) still wakes when
    // the cluster appears.
    let store = controller.store();
    let cluster_upgrades = move |cluster: PostgresCluster| {
        upgrades_for_cluster(store.state(), &cluster)
    };

    controller
        .owns(jobs, watcher_config.clone())
        .watches(clusters, watcher_config, cluster_upgrades)
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    tracing::debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // ObjectNotFound/NotFound errors are expected after deletion when
                    // related watch events trigger reconciliation for a deleted object.
                    // Log these at debug level instead of error.
                    let is_not_found = matches!(
                        &e,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _)
                            if format!("{:?}", err).contains("NotFound")
                    );
                    if is_not_found {
                        tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        tracing::error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("Controller stream ended unexpectedly");
}
