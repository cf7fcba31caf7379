//! Naming scheme shared by every component that reads or writes cluster
//! objects.
//!
//! Label keys, annotation keys, well-known values, and the deterministic name
//! functions for generated jobs are carried in one immutable value rather than
//! scattered as globals, so a test can substitute a scheme wholesale and the
//! rest of the controller cannot drift out of step with itself.

use std::collections::BTreeMap;

/// Field manager recorded on every server-side apply and status patch.
pub const FIELD_MANAGER: &str = "postgres-upgrade-operator";

/// The label and annotation vocabulary of a PostgreSQL cluster deployment.
#[derive(Clone, Copy, Debug)]
pub struct Naming {
    /// Label naming the PostgresCluster an object belongs to.
    pub label_cluster: &'static str,
    /// Label naming the PostgresUpgrade that generated an object.
    pub label_upgrade: &'static str,
    /// Label carrying the role of a generated job.
    pub label_role: &'static str,
    /// Label carrying the PostgreSQL version an upgrade job produces.
    pub label_version: &'static str,
    /// Label present on Patroni-managed DCS endpoints.
    pub label_patroni: &'static str,
    /// Label present on instance StatefulSets.
    pub label_instance: &'static str,
    /// Label on pgBackRest jobs carrying the backup type.
    pub label_backup: &'static str,
    /// Annotation on a PostgresCluster naming the one PostgresUpgrade allowed
    /// to act on it.
    pub annotation_allow_upgrade: &'static str,
    /// kubectl annotation selecting the container logs default to.
    pub annotation_default_container: &'static str,
    /// Role value of the pg_upgrade job.
    pub role_upgrade: &'static str,
    /// Role value of remove-data jobs.
    pub role_remove_data: &'static str,
    /// Backup-type value of replica-create backup jobs.
    pub backup_replica_create: &'static str,
    /// Name of the database container inside instance pod templates.
    pub container_database: &'static str,
}

const DEFAULT: Naming = Naming {
    label_cluster: "postgres-operator.smoketurner.com/cluster",
    label_upgrade: "postgres-operator.smoketurner.com/pgupgrade",
    label_role: "postgres-operator.smoketurner.com/role",
    label_version: "postgres-operator.smoketurner.com/version",
    label_patroni: "postgres-operator.smoketurner.com/patroni",
    label_instance: "postgres-operator.smoketurner.com/instance",
    label_backup: "postgres-operator.smoketurner.com/pgbackrest-backup",
    annotation_allow_upgrade: "postgres-operator.smoketurner.com/allow-upgrade",
    annotation_default_container: "kubectl.kubernetes.io/default-container",
    role_upgrade: "pgupgrade",
    role_remove_data: "removedata",
    backup_replica_create: "replica-create",
    container_database: "database",
};

impl Default for Naming {
    fn default() -> Self {
        DEFAULT
    }
}

impl Naming {
    /// Name of the single pg_upgrade job generated for an upgrade request.
    pub fn upgrade_job_name(&self, upgrade_name: &str) -> String {
        format!("{upgrade_name}-pgdata")
    }

    /// Name of the remove-data job generated for one former replica.
    pub fn remove_data_job_name(&self, upgrade_name: &str, instance_name: &str) -> String {
        format!("{upgrade_name}-{instance_name}")
    }

    /// Label selector matching every object belonging to a cluster.
    pub fn cluster_selector(&self, cluster_name: &str) -> String {
        format!("{}={}", self.label_cluster, cluster_name)
    }

    /// Labels stamped on every job this controller generates.
    pub fn job_labels(
        &self,
        cluster_name: &str,
        upgrade_name: &str,
        role: &str,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([
            (self.label_cluster.to_string(), cluster_name.to_string()),
            (self.label_upgrade.to_string(), upgrade_name.to_string()),
            (self.label_role.to_string(), role.to_string()),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_names_are_deterministic() {
        let naming = Naming::default();
        assert_eq!(naming.upgrade_job_name("pg14-to-15"), "pg14-to-15-pgdata");
        assert_eq!(
            naming.remove_data_job_name("pg14-to-15", "hippo-instance1-abcd"),
            "pg14-to-15-hippo-instance1-abcd"
        );
    }

    #[test]
    fn cluster_selector_uses_cluster_label() {
        let naming = Naming::default();
        assert_eq!(
            naming.cluster_selector("hippo"),
            "postgres-operator.smoketurner.com/cluster=hippo"
        );
    }

    #[test]
    fn job_labels_carry_cluster_upgrade_and_role() {
        let naming = Naming::default();
        let labels = naming.job_labels("hippo", "pg14-to-15", naming.role_upgrade);
        assert_eq!(labels[naming.label_cluster], "hippo");
        assert_eq!(labels[naming.label_upgrade], "pg14-to-15");
        assert_eq!(labels[naming.label_role], "pgupgrade");
    }
}
