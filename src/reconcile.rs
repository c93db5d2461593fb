use crate::{
    context::Context,
    engine::{
        self,
        Observation,
        Outcome,
        Scale,
        Step,
    },
    probe_job::probe_job_name,
    resources::{
        DNSMonitor,
        MonitorSettings,
    },
    store::StoreError,
};
use chrono::prelude::*;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    runtime::reflector::ObjectRef,
    Resource as _,
    ResourceExt as _,
};
use std::{
    hash::{
        DefaultHasher,
        Hash as _,
        Hasher as _,
    },
    time::Duration,
};
use tracing::instrument;

pub const MONITOR_NAME_LABEL: &str = "infra.sharduljunagade.github.io/monitor-name";
pub const MONITOR_NAMESPACE_LABEL: &str = "infra.sharduljunagade.github.io/monitor-namespace";
pub const PROBE_JOB_FINALIZER: &str = "infra.sharduljunagade.github.io/probe-job-cleanup";

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("unable to read DNSMonitor: {0}")]
    GetMonitor(#[source] StoreError),
    #[error("unable to list DNS pods: {0}")]
    ListPods(#[source] StoreError),
    #[error("unable to read probe job: {0}")]
    GetProbeJob(#[source] StoreError),
    #[error("unable to delete probe job: {0}")]
    DeleteProbeJob(#[source] StoreError),
    #[error("DNSMonitor has no {0}")]
    MissingMetadata(&'static str),
}

/// Summary of a finished pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    pub outcome: Outcome,
    pub scaled: Option<Scale>,
    pub requeue_after: Duration,
}

/// Runs one reconciliation pass for the monitor `namespace/name`.
///
/// Returns `Ok(None)` when the monitor no longer exists. Only failures to observe pods or the probe job abort a
/// pass, every mutation is best-effort and retried on the next interval.
#[instrument(level = "debug", skip_all, fields(namespace = %namespace, name = %name))]
pub async fn reconcile_monitor(
    ctx: &Context,
    namespace: &str,
    name: &str,
    now: DateTime<Utc>,
) -> Result<Option<PassReport>, ReconcileError> {
    let Some(monitor) = ctx
        .store
        .get_monitor(namespace, name)
        .await
        .map_err(ReconcileError::GetMonitor)?
    else {
        debug!("DNSMonitor {namespace}/{name} is gone, nothing to do");
        return Ok(None);
    };

    let settings = monitor.spec.settings();
    let mut status = monitor.status.clone().unwrap_or_default();

    let scaled = enforce_replicas(ctx, &settings).await;
    if let Some(scale) = scaled {
        status.last_action = Some(scale.describe());
    }

    let pods = ctx
        .store
        .list_pods(&settings.namespace, &ctx.dns.pod_selector)
        .await
        .map_err(ReconcileError::ListPods)?;
    if pods.is_empty() {
        warn!(
            "no DNS pods match {:?} in namespace {}",
            ctx.dns.pod_selector, settings.namespace
        );
    }

    let job_name = probe_job_name(name);
    let probe_job = ctx
        .store
        .get_job(&settings.namespace, &job_name)
        .await
        .map_err(ReconcileError::GetProbeJob)?;

    let decision = engine::decide(Observation {
        monitor_name: name,
        generation: monitor.metadata.generation,
        settings: &settings,
        status,
        status_changed: scaled.is_some(),
        pods: &pods,
        probe_job: probe_job.as_ref(),
        probe_job_name: &job_name,
        probe_image: &ctx.dns.probe_image,
        now,
    });

    info!(outcome = ?decision.outcome, steps = decision.steps.len(), "DNSMonitor {namespace}/{name} evaluated");

    for step in decision.steps {
        dispatch(ctx, &monitor, &settings, step).await;
    }

    if decision.persist {
        if let Err(err) = ctx.store.update_status(&monitor, &decision.status).await {
            warn!("unable to update status of DNSMonitor {namespace}/{name}, retrying next interval: {err}");
        }
    }

    Ok(Some(PassReport {
        outcome: decision.outcome,
        scaled,
        requeue_after: decision.requeue_after,
    }))
}

/// Raises the DNS deployment to the configured replica floor. Never fails the pass.
async fn enforce_replicas(ctx: &Context, settings: &MonitorSettings) -> Option<Scale> {
    let desired = settings.desired_replicas?;
    let ns = &settings.namespace;
    let name = &ctx.dns.deployment;

    let mut deployment = match ctx.store.get_deployment(ns, name).await {
        Ok(Some(deployment)) => deployment,
        Ok(None) => {
            warn!("DNS deployment {ns}/{name} not found, cannot enforce {desired} replicas");
            return None;
        }
        Err(err) => {
            warn!("unable to read DNS deployment {ns}/{name}: {err}");
            return None;
        }
    };

    let current = deployment.spec.as_ref().and_then(|spec| spec.replicas);
    let scale = engine::scale_target(current, Some(desired))?;
    deployment.spec.get_or_insert_with(Default::default).replicas = Some(scale.to);

    match ctx.store.update_deployment(&deployment).await {
        Ok(()) => {
            info!(from = scale.from, to = scale.to, "scaled DNS deployment {ns}/{name}");
            Some(scale)
        }
        Err(err) => {
            warn!("unable to scale DNS deployment {ns}/{name} to {desired} replicas: {err}");
            None
        }
    }
}

async fn dispatch(ctx: &Context, monitor: &DNSMonitor, settings: &MonitorSettings, step: Step<'_>) {
    let ns = &settings.namespace;
    match step {
        Step::DeletePod(pod) => {
            let pod_name = pod.name_any();
            match ctx.store.delete_pod(pod).await {
                Ok(()) => info!("deleted DNS pod {ns}/{pod_name}"),
                Err(StoreError::NotFound) => debug!("DNS pod {ns}/{pod_name} already gone"),
                Err(err) => error!("unable to delete DNS pod {ns}/{pod_name}: {err}"),
            }
        }

        Step::DeleteProbeJob(job) => {
            let job_name = job.name_any();
            match ctx.store.delete_job(job).await {
                Ok(()) | Err(StoreError::NotFound) => debug!("removed finished probe job {ns}/{job_name}"),
                Err(err) => warn!("unable to remove finished probe job {ns}/{job_name}: {err}"),
            }
        }

        Step::CreateProbeJob(job) => {
            let job = attach_monitor(job, monitor);
            let job_name = job.name_any();
            match ctx.store.create_job(&job).await {
                Ok(()) => info!("created probe job {ns}/{job_name}"),
                Err(StoreError::AlreadyExists) => debug!("probe job {ns}/{job_name} already exists"),
                Err(err) => error!("unable to create probe job {ns}/{job_name}, retrying next interval: {err}"),
            }
        }
    }
}

/// Removes the monitor's probe job before the monitor itself goes away.
///
/// Jobs in the monitor's own namespace are also garbage collected through their owner reference, jobs in the DNS
/// namespace are only reachable through their labels. A job with the same name that belongs to another monitor is
/// left alone.
#[instrument(level = "debug", skip_all, fields(namespace = ?monitor.namespace(), name = %monitor.name_any()))]
pub async fn cleanup_monitor(ctx: &Context, monitor: &DNSMonitor) -> Result<(), ReconcileError> {
    let settings = monitor.spec.settings();
    let job_name = probe_job_name(&monitor.name_any());
    let ns = &settings.namespace;

    let Some(job) = ctx
        .store
        .get_job(ns, &job_name)
        .await
        .map_err(ReconcileError::GetProbeJob)?
    else {
        debug!("no probe job {ns}/{job_name} left to clean up");
        return Ok(());
    };

    if monitor_for_probe_job(job.clone()) != Some(ObjectRef::from_obj(monitor)) {
        warn!("probe job {ns}/{job_name} belongs to another DNSMonitor, leaving it in place");
        return Ok(());
    }

    match ctx.store.delete_job(&job).await {
        Ok(()) => info!("deleted probe job {ns}/{job_name} of removed DNSMonitor"),
        Err(StoreError::NotFound) => debug!("probe job {ns}/{job_name} already gone"),
        Err(err) => return Err(ReconcileError::DeleteProbeJob(err)),
    }

    Ok(())
}

/// Change key of a monitor event. Status writes leave it untouched, so the controller's own writes do not trigger
/// another pass; spec edits, finalizer changes and deletion do.
pub fn monitor_trigger_key(monitor: &DNSMonitor) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    monitor.metadata.uid.hash(&mut hasher);
    monitor.metadata.generation.hash(&mut hasher);
    monitor.metadata.finalizers.hash(&mut hasher);
    monitor.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

/// Links a probe job to its monitor via labels and, when both live in the same namespace, a controller owner
/// reference. Cross-namespace owner references are invalid and would get the job garbage collected right away.
pub fn attach_monitor(mut job: Job, monitor: &DNSMonitor) -> Job {
    let monitor_ns = monitor.namespace().unwrap_or_default();
    let labels = job.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(MONITOR_NAME_LABEL.to_string(), monitor.name_any());
    labels.insert(MONITOR_NAMESPACE_LABEL.to_string(), monitor_ns.clone());

    if job.metadata.namespace.as_deref() == Some(monitor_ns.as_str()) {
        match monitor.controller_owner_ref(&()) {
            Some(oref) => job.metadata.owner_references = Some(vec![oref]),
            None => warn!("DNSMonitor {} has no uid, probe job left without owner", monitor.name_any()),
        }
    } else {
        debug!("probe job namespace differs from DNSMonitor namespace {monitor_ns}, skipping owner reference");
    }

    job
}

/// Maps a probe job event back to the monitor that created it.
pub fn monitor_for_probe_job(job: Job) -> Option<ObjectRef<DNSMonitor>> {
    let labels = job.metadata.labels.as_ref()?;
    let name = labels.get(MONITOR_NAME_LABEL)?;
    let ns = labels.get(MONITOR_NAMESPACE_LABEL)?;
    Some(ObjectRef::new(name).within(ns))
}
