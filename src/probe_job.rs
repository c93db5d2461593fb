use k8s_openapi::api::{
    batch::v1::{
        Job,
        JobSpec,
    },
    core::v1::{
        Container,
        PodSpec,
        PodTemplateSpec,
    },
};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub const DEFAULT_PROBE_IMAGE: &str = "busybox:latest";
pub const PROBE_CONTAINER_NAME: &str = "dns-check";

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const PROBE_NAME: &str = "dns-probe";
pub const MANAGER_NAME: &str = "coredns-monitor-operator";

/// Selects every probe job created by this operator.
pub fn probe_job_selector() -> String {
    format!("{NAME_LABEL}={PROBE_NAME},{MANAGED_BY_LABEL}={MANAGER_NAME}")
}

/// There is at most one probe job per monitor, so the name is derived from the monitor alone.
pub fn probe_job_name(monitor_name: &str) -> String {
    format!("{PROBE_NAME}-{}", monitor_name.to_lowercase())
}

/// One-shot job resolving `test_domain`. The container exits non-zero when resolution fails and the job never retries.
///
/// Owner references are left to the caller.
pub fn build_probe_job(name: &str, namespace: &str, test_domain: &str, image: &str) -> Job {
    let labels = BTreeMap::from([
        (NAME_LABEL.to_string(), PROBE_NAME.to_string()),
        (MANAGED_BY_LABEL.to_string(), MANAGER_NAME.to_string()),
    ]);

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: PROBE_CONTAINER_NAME.to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec![
                            "/bin/sh".to_string(),
                            "-c".to_string(),
                            format!("nslookup {test_domain} || exit 1"),
                        ]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    /// Attempt still pending or running.
    Running,
    /// Deletion already requested by an earlier pass.
    Terminating,
    Succeeded,
    Failed,
}

pub fn probe_state(job: &Job) -> ProbeState {
    if job.metadata.deletion_timestamp.is_some() {
        return ProbeState::Terminating;
    }

    let Some(status) = job.status.as_ref() else {
        return ProbeState::Running;
    };

    let has_condition = |type_: &str| {
        status.conditions.as_ref().map_or(false, |conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == type_ && condition.status == "True")
        })
    };

    if has_condition("Complete") || status.succeeded.unwrap_or(0) > 0 {
        ProbeState::Succeeded
    } else if has_condition("Failed") || status.failed.unwrap_or(0) > 0 {
        ProbeState::Failed
    } else {
        ProbeState::Running
    }
}
