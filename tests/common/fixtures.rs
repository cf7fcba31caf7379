//! Test fixtures and builders for PostgresUpgrade scenarios
//!
//! The builders produce objects in the state the controller would observe
//! them: clusters with status, instance StatefulSets with a database
//! container, and jobs with completion conditions.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    Container, Endpoints, PodSpec, PodTemplateSpec, SecurityContext, Volume, VolumeMount,
};
use kube::core::ObjectMeta;
use postgres_upgrade_operator::Naming;
use postgres_upgrade_operator::crd::{
    InstanceSetStatus, PostgresCluster, PostgresClusterSpec, PostgresClusterStatus,
    PostgresUpgrade, PostgresUpgradeSpec, PostgresUpgradeStatus,
};

/// A minimal valid upgrade spec. Tests mutate fields as needed.
pub fn upgrade_spec(cluster: &str, from: i32, to: i32) -> PostgresUpgradeSpec {
    PostgresUpgradeSpec {
        postgres_cluster_name: cluster.to_string(),
        from_postgres_version: from,
        to_postgres_version: to,
        image: Some("registry.example.com/crunchy-upgrade:latest".to_string()),
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
    }
}

/// An upgrade as it would be observed from the API server: named,
/// namespaced, persisted (UID), at generation 1.
pub fn upgrade(name: &str, cluster: &str, from: i32, to: i32) -> PostgresUpgrade {
    let mut upgrade = PostgresUpgrade::new(name, upgrade_spec(cluster, from, to));
    upgrade.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        uid: Some("upgrade-uid-1234".to_string()),
        generation: Some(1),
        ..Default::default()
    };
    upgrade.status = Some(PostgresUpgradeStatus::default());
    upgrade
}

/// Builder for PostgresCluster test fixtures
pub struct ClusterBuilder {
    name: String,
    spec_version: i32,
    status_version: i32,
    shutdown: Option<bool>,
    generation: i64,
    observed_generation: i64,
    startup_instance: Option<String>,
    instance_replicas: Vec<i32>,
    allow_upgrade: Option<String>,
}

impl ClusterBuilder {
    pub fn new(name: &str, version: i32) -> Self {
        Self {
            name: name.to_string(),
            spec_version: version,
            status_version: version,
            shutdown: None,
            generation: 1,
            observed_generation: 1,
            startup_instance: None,
            instance_replicas: vec![0],
            allow_upgrade: None,
        }
    }

    /// A cluster that has fully cleared every precondition for `upgrade_name`:
    /// shut down, primary known, annotation in place.
    pub fn ready_for(name: &str, version: i32, upgrade_name: &str, primary: &str) -> Self {
        Self::new(name, version)
            .shutdown(true)
            .startup_instance(primary)
            .allow_upgrade(upgrade_name)
    }

    pub fn shutdown(mut self, shutdown: bool) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn startup_instance(mut self, instance: &str) -> Self {
        self.startup_instance = Some(instance.to_string());
        self
    }

    pub fn allow_upgrade(mut self, upgrade_name: &str) -> Self {
        self.allow_upgrade = Some(upgrade_name.to_string());
        self
    }

    pub fn spec_version(mut self, version: i32) -> Self {
        self.spec_version = version;
        self
    }

    pub fn status_version(mut self, version: i32) -> Self {
        self.status_version = version;
        self
    }

    pub fn observed_generation(mut self, observed: i64) -> Self {
        self.observed_generation = observed;
        self
    }

    pub fn instance_replicas(mut self, replicas: Vec<i32>) -> Self {
        self.instance_replicas = replicas;
        self
    }

    pub fn build(self) -> PostgresCluster {
        let naming = Naming::default();
        let mut annotations = BTreeMap::new();
        if let Some(upgrade_name) = &self.allow_upgrade {
            annotations.insert(
                naming.annotation_allow_upgrade.to_string(),
                upgrade_name.clone(),
            );
        }
        let mut cluster = PostgresCluster::new(
            &self.name,
            PostgresClusterSpec {
                postgres_version: self.spec_version,
                shutdown: self.shutdown,
            },
        );
        cluster.metadata = ObjectMeta {
            name: Some(self.name.clone()),
            namespace: Some("default".to_string()),
            uid: Some("cluster-uid-5678".to_string()),
            generation: Some(self.generation),
            annotations: Some(annotations),
            ..Default::default()
        };
        cluster.status = Some(PostgresClusterStatus {
            postgres_version: self.status_version,
            startup_instance: self.startup_instance,
            observed_generation: Some(self.observed_generation),
            instance_sets: self
                .instance_replicas
                .iter()
                .enumerate()
                .map(|(index, replicas)| InstanceSetStatus {
                    name: format!("instance{}", index + 1),
                    replicas: *replicas,
                })
                .collect(),
            pgbackrest: None,
        });
        cluster
    }
}

/// An instance StatefulSet whose pod template carries a database container,
/// its data volume, and a pod-level service account.
pub fn instance(cluster: &str, name: &str) -> StatefulSet {
    let naming = Naming::default();
    StatefulSet {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(BTreeMap::from([
                (naming.label_cluster.to_string(), cluster.to_string()),
                (naming.label_instance.to_string(), name.to_string()),
            ])),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    service_account_name: Some(format!("{cluster}-instance")),
                    containers: vec![
                        Container {
                            name: "database".to_string(),
                            security_context: Some(SecurityContext {
                                run_as_non_root: Some(true),
                                ..Default::default()
                            }),
                            volume_mounts: Some(vec![VolumeMount {
                                name: "postgres-data".to_string(),
                                mount_path: "/pgdata".to_string(),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        },
                        Container {
                            name: "replication-cert-copy".to_string(),
                            ..Default::default()
                        },
                    ],
                    init_containers: Some(vec![Container {
                        name: "postgres-startup".to_string(),
                        ..Default::default()
                    }]),
                    volumes: Some(vec![Volume {
                        name: "postgres-data".to_string(),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// A job carrying the controller's role label, in a given terminal state.
pub fn job(cluster: &str, upgrade_name: &str, name: &str, role: &str, state: JobState) -> Job {
    let naming = Naming::default();
    let mut labels = naming.job_labels(cluster, upgrade_name, role);
    labels.insert(naming.label_version.to_string(), "15".to_string());
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("{name}-uid")),
            labels: Some(labels),
            ..Default::default()
        },
        spec: None,
        status: job_status(state),
    }
}

/// A pgBackRest replica-create backup job, as left behind by the cluster
/// controller before shutdown.
pub fn replica_create_backup_job(cluster: &str, name: &str) -> Job {
    let naming = Naming::default();
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("{name}-uid")),
            labels: Some(BTreeMap::from([
                (naming.label_cluster.to_string(), cluster.to_string()),
                (
                    naming.label_backup.to_string(),
                    naming.backup_replica_create.to_string(),
                ),
            ])),
            ..Default::default()
        },
        spec: None,
        status: job_status(JobState::Complete),
    }
}

/// Terminal state of a fixture job.
#[derive(Clone, Copy, Debug)]
pub enum JobState {
    Running,
    Complete,
    Failed,
}

fn job_status(state: JobState) -> Option<JobStatus> {
    let condition_type = match state {
        JobState::Running => return Some(JobStatus::default()),
        JobState::Complete => "Complete",
        JobState::Failed => "Failed",
    };
    Some(JobStatus {
        conditions: Some(vec![JobCondition {
            type_: condition_type.to_string(),
            status: "True".to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    })
}

/// A Patroni DCS endpoints object for the cluster.
pub fn patroni_endpoints(cluster: &str, name: &str) -> Endpoints {
    let naming = Naming::default();
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("{name}-uid")),
            resource_version: Some("100".to_string()),
            labels: Some(BTreeMap::from([
                (naming.label_cluster.to_string(), cluster.to_string()),
                (naming.label_patroni.to_string(), format!("{cluster}-ha")),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}
