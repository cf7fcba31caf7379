//! Job generation for pg_upgrade and old-data removal.
//!
//! Both factories copy the pod template of an existing instance StatefulSet
//! so generated pods mount the same volumes, run under the same service
//! account and pod security context, and land on the same nodes as the
//! database they operate on. The containers are then replaced with a single
//! one running a fixed bash procedure. Jobs run exactly once: BackoffLimit
//! is zero and pods never restart, because a half-finished pg_upgrade must
//! be inspected by a human, not retried blindly.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, LocalObjectReference, PodSpec, PodTemplateSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ObjectMeta;
use kube::{Resource, ResourceExt};

use crate::config;
use crate::controller::error::{Error, Result};
use crate::crd::{PostgresUpgrade, PostgresUpgradeSpec, TransferMethod};
use crate::naming::Naming;

/// Builds the pg_upgrade Job for an upgrade request, copying the pod
/// template of the startup (primary) instance.
pub fn generate_upgrade_job(
    upgrade: &PostgresUpgrade,
    startup: &StatefulSet,
    naming: &Naming,
) -> Result<Job> {
    let mut pod = pod_spec_from(startup);
    let database = database_container(&pod, startup, naming)?;

    let parallelism = job_parallelism(upgrade, config::feature_enabled(config::FEATURE_CPU_CONCURRENCY));
    pod.containers = vec![Container {
        name: database.name.clone(),
        security_context: database.security_context.clone(),
        volume_mounts: database.volume_mounts.clone(),
        image: config::upgrade_image(&upgrade.spec),
        image_pull_policy: upgrade.spec.image_pull_policy.clone(),
        resources: upgrade.spec.resources.as_ref().map(convert_resources),
        command: Some(upgrade_command(&upgrade.spec, parallelism)),
        ..Default::default()
    }];
    apply_scheduling(&mut pod, &upgrade.spec);

    build_job(
        upgrade,
        naming.upgrade_job_name(&upgrade.name_any()),
        naming.role_upgrade,
        pod,
        naming,
    )
}

/// Builds one remove-data Job for a former replica, copying that replica's
/// pod template so the job mounts the replica's data volume.
pub fn generate_remove_data_job(
    upgrade: &PostgresUpgrade,
    replica: &StatefulSet,
    naming: &Naming,
) -> Result<Job> {
    let mut pod = pod_spec_from(replica);
    let database = database_container(&pod, replica, naming)?;

    pod.containers = vec![Container {
        name: database.name.clone(),
        security_context: database.security_context.clone(),
        volume_mounts: database.volume_mounts.clone(),
        image: config::upgrade_image(&upgrade.spec),
        image_pull_policy: upgrade.spec.image_pull_policy.clone(),
        resources: upgrade.spec.resources.as_ref().map(convert_resources),
        command: Some(remove_data_command(&upgrade.spec)),
        ..Default::default()
    }];
    apply_scheduling(&mut pod, &upgrade.spec);

    build_job(
        upgrade,
        naming.remove_data_job_name(&upgrade.name_any(), &replica.name_any()),
        naming.role_remove_data,
        pod,
        naming,
    )
}

fn pod_spec_from(statefulset: &StatefulSet) -> PodSpec {
    let mut pod = statefulset
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.clone())
        .unwrap_or_default();
    pod.init_containers = None;
    pod.ephemeral_containers = None;
    pod.restart_policy = Some("Never".to_string());
    pod
}

fn database_container(
    pod: &PodSpec,
    statefulset: &StatefulSet,
    naming: &Naming,
) -> Result<Container> {
    pod.containers
        .iter()
        .find(|container| container.name == naming.container_database)
        .cloned()
        .ok_or_else(|| Error::MissingDatabaseContainer {
            statefulset: statefulset.name_any(),
            container: naming.container_database.to_string(),
        })
}

fn build_job(
    upgrade: &PostgresUpgrade,
    name: String,
    role: &str,
    pod: PodSpec,
    naming: &Naming,
) -> Result<Job> {
    let mut labels = naming.job_labels(
        &upgrade.spec.postgres_cluster_name,
        &upgrade.name_any(),
        role,
    );
    labels.insert(
        naming.label_version.to_string(),
        upgrade.spec.to_postgres_version.to_string(),
    );
    let mut annotations = BTreeMap::from([(
        naming.annotation_default_container.to_string(),
        naming.container_database.to_string(),
    )]);
    if let Some(metadata) = &upgrade.spec.metadata {
        labels.extend(metadata.labels.clone());
        annotations.extend(metadata.annotations.clone());
    }

    let mut job_metadata = ObjectMeta {
        namespace: upgrade.namespace(),
        name: Some(name),
        labels: Some(labels.clone()),
        annotations: Some(annotations.clone()),
        ..Default::default()
    };
    set_controller_reference(&mut job_metadata, controller_reference(upgrade)?)?;

    Ok(Job {
        metadata: job_metadata,
        spec: Some(JobSpec {
            // One attempt only. Retrying pg_upgrade against a half-rewritten
            // data directory is a data-loss hazard.
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Owner reference tying a generated job to the upgrade for garbage
/// collection. Non-blocking: deleting the upgrade must not hang on job
/// finalization.
fn controller_reference(upgrade: &PostgresUpgrade) -> Result<OwnerReference> {
    let mut reference = upgrade
        .controller_owner_ref(&())
        .ok_or_else(|| Error::MissingUid(upgrade.name_any()))?;
    reference.block_owner_deletion = None;
    Ok(reference)
}

/// Installs `owner` as the controlling owner of `metadata`. Another
/// controller already claiming the object is an externally triggerable
/// condition, so it surfaces as an error rather than a panic.
pub fn set_controller_reference(metadata: &mut ObjectMeta, owner: OwnerReference) -> Result<()> {
    let references = metadata.owner_references.get_or_insert_with(Vec::new);
    if let Some(existing) = references
        .iter()
        .find(|reference| reference.controller == Some(true) && reference.uid != owner.uid)
    {
        return Err(Error::OwnershipConflict {
            child: metadata.name.clone().unwrap_or_default(),
            owner: format!("{}/{}", existing.kind, existing.name),
        });
    }
    references.retain(|reference| reference.uid != owner.uid);
    references.push(owner);
    Ok(())
}

/// True for the pgBackRest backup job that created the cluster's replicas.
/// It references the old system identifier, so committing the new version
/// deletes it to force a fresh base backup after restart.
pub fn is_replica_create_backup(job: &Job, naming: &Naming) -> bool {
    job.labels().get(naming.label_backup).map(String::as_str)
        == Some(naming.backup_replica_create)
}

/// True when the job reports a Complete condition.
pub fn job_completed(job: &Job) -> bool {
    has_true_condition(job, "Complete")
}

/// True when the job reports a Failed condition.
pub fn job_failed(job: &Job) -> bool {
    has_true_condition(job, "Failed")
}

fn has_true_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == type_ && condition.status == "True")
        })
}

/// Parses the spec's affinity override into a typed Affinity. Checked during
/// validation so job generation can assume it parses.
pub fn parse_affinity(spec: &PostgresUpgradeSpec) -> Result<Option<Affinity>, serde_json::Error> {
    spec.affinity
        .as_ref()
        .map(|value| serde_json::from_value(value.clone()))
        .transpose()
}

fn apply_scheduling(pod: &mut PodSpec, spec: &PostgresUpgradeSpec) {
    if let Ok(Some(affinity)) = parse_affinity(spec) {
        pod.affinity = Some(affinity);
    }
    if let Some(tolerations) = &spec.tolerations {
        pod.tolerations = Some(tolerations.iter().map(convert_toleration).collect());
    }
    if let Some(priority_class_name) = &spec.priority_class_name {
        pod.priority_class_name = Some(priority_class_name.clone());
    }
    if let Some(secrets) = &spec.image_pull_secrets {
        pod.image_pull_secrets = Some(
            secrets
                .iter()
                .map(|name| LocalObjectReference { name: name.clone() })
                .collect(),
        );
    }
}

fn convert_toleration(
    toleration: &crate::crd::Toleration,
) -> k8s_openapi::api::core::v1::Toleration {
    k8s_openapi::api::core::v1::Toleration {
        key: toleration.key.clone(),
        operator: toleration.operator.clone(),
        value: toleration.value.clone(),
        effect: toleration.effect.clone(),
        toleration_seconds: toleration.toleration_seconds,
    }
}

fn convert_resources(
    resources: &crate::crd::ResourceRequirements,
) -> k8s_openapi::api::core::v1::ResourceRequirements {
    k8s_openapi::api::core::v1::ResourceRequirements {
        limits: resources.limits.as_ref().map(quantity_map),
        requests: resources.requests.as_ref().map(quantity_map),
        ..Default::default()
    }
}

fn quantity_map(list: &crate::crd::ResourceList) -> BTreeMap<String, Quantity> {
    let mut map = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        map.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        map.insert("memory".to_string(), Quantity(memory.clone()));
    }
    map
}

/// Number of pg_upgrade worker processes. An explicit spec value wins;
/// otherwise, behind the UpgradeCPUConcurrency gate, one less than the whole
/// CPUs granted by the limit, floor 1.
pub fn job_parallelism(upgrade: &PostgresUpgrade, cpu_concurrency: bool) -> i64 {
    if let Some(jobs) = upgrade.spec.jobs {
        return i64::from(jobs.max(1));
    }
    if cpu_concurrency {
        let cpu_limit = upgrade
            .spec
            .resources
            .as_ref()
            .and_then(|resources| resources.limits.as_ref())
            .and_then(|limits| limits.cpu.as_deref());
        if let Some(millicores) = cpu_limit.and_then(parse_cpu_millicores) {
            return (millicores / 1000 - 1).max(1);
        }
    }
    1
}

fn parse_cpu_millicores(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse::<i64>().ok();
    }
    let cores: f64 = quantity.parse().ok()?;
    if cores.is_sign_negative() {
        return None;
    }
    Some((cores * 1000.0).round() as i64)
}

fn transfer_method_flag(method: Option<TransferMethod>) -> &'static str {
    match method.unwrap_or_default() {
        TransferMethod::Link => "--link",
        TransferMethod::Copy => "--copy",
        TransferMethod::CopyFileRange => "--copy-file-range",
        TransferMethod::Clone => "--clone",
    }
}

/// Entrypoint of the pg_upgrade container. Invoked as
/// `bash -ceu -- <script> upgrade <from> <to>`; `-eu` aborts on the first
/// failing command or unset variable. The procedure must work under an
/// arbitrary non-root UID, so it first maps the running identity to the
/// "postgres" user through nss_wrapper.
pub fn upgrade_command(spec: &PostgresUpgradeSpec, parallelism: i64) -> Vec<String> {
    let method = transfer_method_flag(spec.transfer_method);
    let jobs = format!("--jobs={parallelism}");

    let mut initdb =
        String::from(r#"/usr/pgsql-"${new_version}"/bin/initdb -k -D /pgdata/pg"${new_version}""#);
    if let Some(command) = spec.fetch_key_command.as_deref().filter(|c| !c.is_empty()) {
        initdb.push_str(&format!(r#" --encryption-key-command "{command}""#));
    }

    let pg_upgrade = format!(
        "time /usr/pgsql-\"${{new_version}}\"/bin/pg_upgrade \\\n\
         --old-bindir /usr/pgsql-\"${{old_version}}\"/bin --new-bindir /usr/pgsql-\"${{new_version}}\"/bin \\\n\
         --old-datadir /pgdata/pg\"${{old_version}}\" --new-datadir /pgdata/pg\"${{new_version}}\" {method} {jobs}"
    );

    let script = [
        r#"declare -r data_volume='/pgdata' old_version="$1" new_version="$2""#,
        r#"printf 'Performing PostgreSQL upgrade from version "%s" to "%s" ...\n\n' "$@""#,
        // The running UID may be arbitrary. Remap it (and the first GID) to
        // "postgres" so initdb and pg_upgrade see the expected user.
        r#"gid=$(id -G); NSS_WRAPPER_GROUP=$(mktemp)"#,
        r#"(sed "/^postgres:x:/ d; /^[^:]*:x:${gid%% *}:/ d" /etc/group"#,
        r#"echo "postgres:x:${gid%% *}:") > "${NSS_WRAPPER_GROUP}""#,
        r#"uid=$(id -u); NSS_WRAPPER_PASSWD=$(mktemp)"#,
        r#"(sed "/^postgres:x:/ d; /^[^:]*:x:${uid}:/ d" /etc/passwd"#,
        r#"echo "postgres:x:${uid}:${gid%% *}::${data_volume}:") > "${NSS_WRAPPER_PASSWD}""#,
        r#"export LD_PRELOAD='libnss_wrapper.so' NSS_WRAPPER_GROUP NSS_WRAPPER_PASSWD"#,
        r#"cd /pgdata || exit"#,
        r#"echo -e "Step 1: Making new pgdata directory...\n""#,
        r#"mkdir /pgdata/pg"${new_version}""#,
        r#"echo -e "Step 2: Initializing new pgdata directory...\n""#,
        &initdb,
        r#"echo -e "\nStep 3: Setting the expected permissions on the old pgdata directory...\n""#,
        r#"chmod 700 /pgdata/pg"${old_version}""#,
        r#"echo -e "Step 4: Copying shared_preload_libraries setting to new postgresql.conf file...\n""#,
        r#"libraries=$(/usr/pgsql-"${old_version}"/bin/postgres -D /pgdata/pg"${old_version}" -C shared_preload_libraries)"#,
        r#"echo "shared_preload_libraries = '${libraries//\'/\'\'}'" >> /pgdata/pg"${new_version}"/postgresql.conf"#,
        r#"echo -e "Step 5: Running pg_upgrade check...\n""#,
        &format!("{pg_upgrade} --check"),
        r#"echo -e "\nStep 6: Running pg_upgrade...\n""#,
        &pg_upgrade,
        // Patroni's dynamic configuration must follow the data directory,
        // or replication needs a fresh bootstrap of cluster settings.
        r#"echo -e "\nStep 7: Copying patroni.dynamic.json...\n""#,
        r#"cp /pgdata/pg"${old_version}"/patroni.dynamic.json /pgdata/pg"${new_version}""#,
        r#"echo -e "\npg_upgrade Job Complete!""#,
    ]
    .join("\n");

    vec![
        "bash".to_string(),
        "-ceu".to_string(),
        "--".to_string(),
        script,
        "upgrade".to_string(),
        spec.from_postgres_version.to_string(),
        spec.to_postgres_version.to_string(),
    ]
}

/// Entrypoint of a remove-data container. Invoked as
/// `bash -ceu -- <script> remove <from>`. Refuses to delete anything unless
/// pg_controldata reports exactly "shut down in recovery": any other state
/// means the directory may be live.
pub fn remove_data_command(spec: &PostgresUpgradeSpec) -> Vec<String> {
    let script = [
        r#"declare -r old_version="$1""#,
        r#"printf 'Removing PostgreSQL data dir for pg%s...\n\n' "$@""#,
        r#"echo -e "Checking the directory exists and isn't being used...\n""#,
        r#"cd /pgdata || exit"#,
        r#"if [ "$(/usr/pgsql-"${old_version}"/bin/pg_controldata /pgdata/pg"${old_version}" | grep -c "shut down in recovery")" -ne 1 ]; then echo -e "Directory in use, cannot remove..."; exit 1; fi"#,
        r#"echo -e "Removing old pgdata directory...\n""#,
        // realpath resolves the pg_wal symlink so the write-ahead log is
        // removed even when it lives on another volume.
        r#"rm -rf /pgdata/pg"${old_version}" "$(realpath /pgdata/pg${old_version}/pg_wal)""#,
        r#"echo -e "Remove Data Job Complete!""#,
    ]
    .join("\n");

    vec![
        "bash".to_string(),
        "-ceu".to_string(),
        "--".to_string(),
        script,
        "remove".to_string(),
        spec.from_postgres_version.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus};

    fn spec() -> PostgresUpgradeSpec {
        PostgresUpgradeSpec {
            postgres_cluster_name: "hippo".to_string(),
            from_postgres_version: 14,
            to_postgres_version: 15,
            image: Some("upgrade-image".to_string()),
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

    fn upgrade_with(spec: PostgresUpgradeSpec) -> PostgresUpgrade {
        PostgresUpgrade::new("pg14-to-15", spec)
    }

    #[test]
    fn upgrade_command_wires_versions_through_argv() {
        let command = upgrade_command(&spec(), 1);
        assert_eq!(command[0], "bash");
        assert_eq!(command[1], "-ceu");
        assert_eq!(command[2], "--");
        assert_eq!(command[4], "upgrade");
        assert_eq!(command[5], "14");
        assert_eq!(command[6], "15");
    }

    #[test]
    fn upgrade_script_defaults_to_hard_links() {
        let command = upgrade_command(&spec(), 1);
        assert!(command[3].contains("--link --jobs=1"));
        assert!(!command[3].contains("--encryption-key-command"));
    }

    #[test]
    fn upgrade_script_honors_transfer_method_and_jobs() {
        let mut spec = spec();
        spec.transfer_method = Some(TransferMethod::CopyFileRange);
        let command = upgrade_command(&spec, 4);
        assert!(command[3].contains("--copy-file-range --jobs=4"));
    }

    #[test]
    fn upgrade_script_passes_fetch_key_command_to_initdb() {
        let mut spec = spec();
        spec.fetch_key_command = Some("fetch-key".to_string());
        let command = upgrade_command(&spec, 1);
        assert!(command[3].contains(r#"initdb -k -D /pgdata/pg"${new_version}" --encryption-key-command "fetch-key""#));
    }

    #[test]
    fn upgrade_script_runs_check_before_upgrade() {
        let command = upgrade_command(&spec(), 1);
        let script = &command[3];
        let check = script.find("--check").unwrap();
        let real = script.rfind("Step 6").unwrap();
        assert!(check < real);
    }

    #[test]
    fn remove_script_guards_on_control_data() {
        let command = remove_data_command(&spec());
        assert_eq!(command[4], "remove");
        assert_eq!(command[5], "14");
        assert!(command[3].contains(r#"grep -c "shut down in recovery""#));
        assert!(command[3].contains("exit 1"));
        assert!(command[3].contains(r#"rm -rf /pgdata/pg"${old_version}""#));
        assert!(command[3].contains("realpath"));
    }

    #[test]
    fn explicit_jobs_value_wins() {
        let mut spec = spec();
        spec.jobs = Some(3);
        assert_eq!(job_parallelism(&upgrade_with(spec), true), 3);
    }

    #[test]
    fn zero_jobs_is_clamped_to_one() {
        let mut spec = spec();
        spec.jobs = Some(0);
        assert_eq!(job_parallelism(&upgrade_with(spec), true), 1);
    }

    #[test]
    fn cpu_limit_derives_parallelism_behind_the_gate() {
        let mut spec = spec();
        spec.resources = Some(crate::crd::ResourceRequirements {
            limits: Some(crate::crd::ResourceList {
                cpu: Some("4".to_string()),
                memory: None,
            }),
            requests: None,
        });
        let upgrade = upgrade_with(spec);
        assert_eq!(job_parallelism(&upgrade, true), 3);
        assert_eq!(job_parallelism(&upgrade, false), 1);
    }

    #[test]
    fn fractional_cpus_floor_to_one_worker() {
        let mut spec = spec();
        spec.resources = Some(crate::crd::ResourceRequirements {
            limits: Some(crate::crd::ResourceList {
                cpu: Some("2500m".to_string()),
                memory: None,
            }),
            requests: None,
        });
        assert_eq!(job_parallelism(&upgrade_with(spec), true), 1);
    }

    #[test]
    fn millicore_parsing() {
        assert_eq!(parse_cpu_millicores("2"), Some(2000));
        assert_eq!(parse_cpu_millicores("2500m"), Some(2500));
        assert_eq!(parse_cpu_millicores("0.5"), Some(500));
        assert_eq!(parse_cpu_millicores("bogus"), None);
    }

    #[test]
    fn job_condition_predicates() {
        let complete = Job {
            status: Some(JobStatus {
                conditions: Some(vec![JobCondition {
                    type_: "Complete".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(job_completed(&complete));
        assert!(!job_failed(&complete));

        let fresh = Job::default();
        assert!(!job_completed(&fresh));
        assert!(!job_failed(&fresh));
    }

    #[test]
    fn controller_reference_conflict_is_an_error() {
        let mut metadata = ObjectMeta {
            name: Some("pg14-to-15-pgdata".to_string()),
            owner_references: Some(vec![OwnerReference {
                api_version: "batch/v1".to_string(),
                kind: "CronJob".to_string(),
                name: "someone-else".to_string(),
                uid: "other-uid".to_string(),
                controller: Some(true),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let owner = OwnerReference {
            api_version: "postgres-operator.smoketurner.com/v1alpha1".to_string(),
            kind: "PostgresUpgrade".to_string(),
            name: "pg14-to-15".to_string(),
            uid: "upgrade-uid".to_string(),
            controller: Some(true),
            ..Default::default()
        };
        let err = set_controller_reference(&mut metadata, owner).unwrap_err();
        assert!(matches!(err, Error::OwnershipConflict { .. }));
    }
}
