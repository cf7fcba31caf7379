//! Snapshot of the cluster objects an upgrade decision is made against.
//!
//! Every reconcile observes the world from scratch: the target
//! PostgresCluster plus every Endpoints, Job, and StatefulSet carrying the
//! cluster label. The snapshot is owned by exactly one reconcile invocation
//! and never cached across wakes; staleness is tolerated by re-observing,
//! not by remembering.

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::ListParams;
use kube::{Api, Client, Resource, ResourceExt};

use crate::controller::error::Result;
use crate::crd::{PostgresCluster, PostgresUpgrade};
use crate::naming::Naming;

/// Observed state of one cluster, as of one reconcile invocation.
#[derive(Default)]
pub struct World {
    /// The target cluster, when it exists.
    pub cluster: Option<PostgresCluster>,
    /// Set instead of an error when the cluster does not exist; the cluster
    /// may not have been created yet, so absence is reported, not retried.
    pub cluster_not_found: Option<String>,
    /// True when the cluster is fully stopped: shutdown requested, the
    /// request acted on, and every instance set at zero replicas.
    pub cluster_shutdown: bool,
    /// The startup (primary) instance's StatefulSet, once identified.
    pub cluster_primary: Option<StatefulSet>,
    /// Every other instance StatefulSet.
    pub cluster_replicas: Vec<StatefulSet>,
    /// Number of instances expected to need data removal: one fewer than
    /// the instance count. -1 until instances are observed, so an empty
    /// world never counts as "all removals complete".
    pub replicas_expected: i64,
    /// Patroni DCS endpoints still present for the cluster.
    pub patroni_endpoints: Vec<Endpoints>,
    /// Jobs belonging to the cluster, keyed by name.
    pub jobs: HashMap<String, Job>,
}

impl World {
    /// Assembles a snapshot from raw listings. Split from the API calls so
    /// the derivations can be exercised without a server.
    pub fn from_parts(
        cluster: Option<PostgresCluster>,
        cluster_not_found: Option<String>,
        endpoints: Vec<Endpoints>,
        jobs: Vec<Job>,
        statefulsets: Vec<StatefulSet>,
        naming: &Naming,
    ) -> Self {
        let mut world = World {
            cluster,
            cluster_not_found,
            ..Default::default()
        };
        world.populate_patroni_endpoints(endpoints, naming);
        world.populate_jobs(jobs);
        world.populate_statefulsets(statefulsets, naming);
        world.populate_shutdown();
        world
    }

    fn populate_patroni_endpoints(&mut self, endpoints: Vec<Endpoints>, naming: &Naming) {
        self.patroni_endpoints = endpoints
            .into_iter()
            .filter(|endpoint| endpoint.labels().contains_key(naming.label_patroni))
            .collect();
    }

    fn populate_jobs(&mut self, jobs: Vec<Job>) {
        self.jobs = jobs
            .into_iter()
            .map(|job| (job.name_any(), job))
            .collect();
    }

    fn populate_statefulsets(&mut self, statefulsets: Vec<StatefulSet>, naming: &Naming) {
        self.replicas_expected = -1;
        let Some(cluster) = &self.cluster else {
            return;
        };
        let startup = cluster
            .status
            .as_ref()
            .and_then(|status| status.startup_instance.clone())
            .unwrap_or_default();

        for statefulset in statefulsets {
            if !statefulset.labels().contains_key(naming.label_instance) {
                continue;
            }
            self.replicas_expected += 1;
            // Until the cluster knows its startup instance, nothing can be
            // classified as primary or replica.
            if startup.is_empty() {
                continue;
            }
            if statefulset.name_any() == startup {
                self.cluster_primary = Some(statefulset);
            } else {
                self.cluster_replicas.push(statefulset);
            }
        }
    }

    fn populate_shutdown(&mut self) {
        self.cluster_shutdown = false;
        let Some(cluster) = &self.cluster else {
            return;
        };
        let Some(status) = &cluster.status else {
            return;
        };
        let requested = cluster.spec.shutdown.unwrap_or(false);
        let acted_on = status.observed_generation == cluster.meta().generation;
        if requested && acted_on {
            self.cluster_shutdown = status
                .instance_sets
                .iter()
                .all(|instance_set| instance_set.replicas == 0);
        }
    }
}

/// Observes the world for one upgrade: the target cluster by name, and the
/// cluster's Endpoints, Jobs, and StatefulSets by label selector. A missing
/// cluster is folded into the snapshot; any other failure propagates and is
/// retried with backoff.
pub async fn observe_world(
    client: &Client,
    upgrade: &PostgresUpgrade,
    naming: &Naming,
) -> Result<World> {
    let namespace = upgrade.namespace().unwrap_or_default();
    let cluster_name = &upgrade.spec.postgres_cluster_name;
    let params = ListParams::default().labels(&naming.cluster_selector(cluster_name));

    let clusters: Api<PostgresCluster> = Api::namespaced(client.clone(), &namespace);
    let (cluster, cluster_not_found) = match clusters.get_opt(cluster_name).await? {
        Some(cluster) => (Some(cluster), None),
        None => (
            None,
            Some(format!("PostgresCluster {namespace}/{cluster_name} not found")),
        ),
    };

    let endpoints: Api<Endpoints> = Api::namespaced(client.clone(), &namespace);
    let jobs: Api<Job> = Api::namespaced(client.clone(), &namespace);
    let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);

    Ok(World::from_parts(
        cluster,
        cluster_not_found,
        endpoints.list(&params).await?.items,
        jobs.list(&params).await?.items,
        statefulsets.list(&params).await?.items,
        naming,
    ))
}
