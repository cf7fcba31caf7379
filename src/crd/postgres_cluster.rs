//! The slice of the PostgresCluster resource this controller reads and
//! patches.
//!
//! The cluster's own controller manages the full schema; only the fields that
//! gate or commit an upgrade are modelled here. Reconciliation reads
//! `spec.shutdown` and the status to decide whether the cluster is fully
//! stopped, and writes exactly one status patch: the applied version plus a
//! cleared pgBackRest repository status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PostgresCluster spec fields consumed by the upgrade controller.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Major version the cluster is declared to run.
    pub postgres_version: i32,

    /// True when the cluster should be scaled to zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown: Option<bool>,
}

/// PostgresCluster status fields consumed (and partially written) by the
/// upgrade controller.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Major version most recently applied to the data directory.
    #[serde(default)]
    pub postgres_version: i32,

    /// Instance the cluster starts up on; the primary during an upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_instance: Option<String>,

    /// Generation of the spec the cluster controller last acted on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Per-instance-set rollout status.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instance_sets: Vec<InstanceSetStatus>,

    /// pgBackRest repository status; cleared when an upgrade commits so
    /// stanzas are recreated against the new system identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgbackrest: Option<PgBackRestStatus>,
}

/// Replica counts for one named instance set.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSetStatus {
    pub name: String,

    /// Total pods currently belonging to the set.
    #[serde(default)]
    pub replicas: i32,
}

/// pgBackRest backup state tracked on the cluster.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PgBackRestStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoStatus>,
}

/// Per-repository backup state.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct RepoStatus {
    pub name: String,

    /// True once the pgBackRest stanza exists for this repository.
    #[serde(default)]
    pub stanza_created: bool,
}
