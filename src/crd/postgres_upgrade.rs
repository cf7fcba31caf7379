//! PostgresUpgrade CRD for offline major version upgrades using pg_upgrade.
//!
//! An upgrade runs in place against the existing data volumes:
//! 1. The cluster is shut down by its own controller (`spec.shutdown`)
//! 2. A single pg_upgrade job rewrites the primary's data directory
//! 3. One job per former replica removes the old-version data directory
//! 4. The cluster's applied version is committed and it restarts on the
//!    new binaries, re-bootstrapping replicas from a fresh base backup
//!
//! # Safety First Design
//!
//! - Nothing happens until the cluster is fully shut down and a primary
//!   is known
//! - The cluster must carry an allow-upgrade annotation naming this
//!   resource, so two upgrades can never race over one cluster
//! - Jobs never restart; a failed pg_upgrade is terminal and requires a
//!   fresh PostgresUpgrade (and operator intervention) to retry
//! - Replica data directories are only removed after the database
//!   reports "shut down in recovery"

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PostgresUpgrade is the Schema for declaring and tracking one major
/// version upgrade of a PostgresCluster.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres-operator.smoketurner.com",
    version = "v1alpha1",
    kind = "PostgresUpgrade",
    plural = "postgresupgrades",
    shortname = "pgu",
    namespaced,
    status = "PostgresUpgradeStatus",
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.postgresClusterName"}"#,
    printcolumn = r#"{"name":"From", "type":"integer", "jsonPath":".spec.fromPostgresVersion"}"#,
    printcolumn = r#"{"name":"To", "type":"integer", "jsonPath":".spec.toPostgresVersion"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresUpgradeSpec {
    /// Name of the PostgresCluster to upgrade, in the same namespace.
    pub postgres_cluster_name: String,

    /// Major version the cluster currently runs. Must match the cluster's
    /// applied version before any job is generated.
    pub from_postgres_version: i32,

    /// Major version to upgrade to. Must be greater than fromPostgresVersion.
    pub to_postgres_version: i32,

    /// Container image providing both sets of PostgreSQL binaries plus
    /// pg_upgrade. Defaults to the operator's RELATED_IMAGE_PGUPGRADE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Pull policy for the upgrade image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Names of image pull secrets in the same namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_secrets: Option<Vec<String>>,

    /// Compute resources for the pg_upgrade container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// How pg_upgrade transfers data files to the new cluster.
    /// Defaults to Link (hard links, fastest, shares the volume).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_method: Option<TransferMethod>,

    /// Number of parallel pg_upgrade worker processes. When unset, one
    /// worker is used unless the UpgradeCPUConcurrency feature gate derives
    /// a count from the CPU limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobs: Option<i32>,

    /// Kubernetes Affinity applied verbatim to generated job pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,

    /// Tolerations applied to generated job pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    /// Priority class for generated job pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    /// Command run by initdb to fetch the data encryption key when the
    /// cluster uses transparent data encryption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_key_command: Option<String>,

    /// Extra metadata stamped onto generated jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<UpgradeJobMetadata>,
}

/// How pg_upgrade moves data files from the old cluster to the new one.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum TransferMethod {
    /// Hard-link files into the new data directory (no copy, old cluster
    /// becomes unusable once the new one starts).
    #[default]
    Link,
    /// Copy every file.
    Copy,
    /// Copy using copy_file_range for filesystem acceleration.
    CopyFileRange,
    /// Reflink on filesystems that support it.
    Clone,
}

/// Resource requirements for the pg_upgrade container.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequirements {
    /// Resource limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceList>,

    /// Resource requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,
}

/// CPU and memory quantities in Kubernetes quantity syntax.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    /// CPU quantity, e.g. "2" or "2500m".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory quantity, e.g. "4Gi".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

/// Pod toleration, mirrored from core/v1 for schema generation.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key the toleration applies to; empty matches all keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Exists or Equal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    /// Taint value matched when operator is Equal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// NoSchedule, PreferNoSchedule, or NoExecute; empty matches all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    /// How long a NoExecute taint is tolerated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Labels and annotations copied onto generated jobs.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeJobMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Status of the PostgresUpgrade. The two conditions are the whole user
/// interface: Progressing reports why the upgrade is or is not moving, and
/// Succeeded, once present with either polarity, is terminal.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PostgresUpgradeStatus {
    /// Kubernetes-style conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Kubernetes-style status condition.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. "Progressing".
    #[serde(rename = "type")]
    pub type_: String,

    /// "True", "False", or "Unknown".
    pub status: String,

    /// Machine-readable reason for the last transition.
    pub reason: String,

    /// Human-readable message.
    pub message: String,

    /// RFC3339 timestamp of the last status change.
    pub last_transition_time: String,

    /// Generation of the spec this condition was computed against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
