//! Pure decision logic of a reconciliation pass.
//!
//! Nothing in here talks to the cluster: the pass driver in [`crate::reconcile`] reads the current state, hands it
//! to [`decide`] and dispatches the returned [`Step`]s. Every branch requeues after the configured probe interval so
//! the loop keeps running without external triggers.

use crate::{
    conditions::healthy_condition,
    probe_job::{
        build_probe_job,
        probe_state,
        ProbeState,
    },
    readiness::is_pod_ready,
    resources::{
        DNSMonitorStatus,
        MonitorSettings,
    },
};
use chrono::prelude::*;
use k8s_openapi::{
    api::{
        batch::v1::Job,
        core::v1::Pod,
    },
    apimachinery::pkg::apis::meta::v1::Time,
};
use std::time::Duration;

pub const RESTART_ACTION: &str = "Restarted CoreDNS pods due to DNS failures";

/// Replica change that brings the DNS deployment up to its configured floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    pub from: i32,
    pub to: i32,
}

impl Scale {
    pub fn describe(&self) -> String {
        format!("Scaled CoreDNS from {} to {} replicas", self.from, self.to)
    }
}

/// Only ever scales up. A deployment without a replica count is treated as having none.
pub fn scale_target(current: Option<i32>, desired: Option<i32>) -> Option<Scale> {
    let desired = desired?;
    let current = current.unwrap_or(0);
    (current < desired).then_some(Scale {
        from: current,
        to: desired,
    })
}

/// Everything a pass observed, after the scale step ran.
pub struct Observation<'a> {
    pub monitor_name: &'a str,
    pub generation: Option<i64>,
    pub settings: &'a MonitorSettings,
    pub status: DNSMonitorStatus,
    /// The status already differs from the persisted one (e.g. a scale was recorded).
    pub status_changed: bool,
    pub pods: &'a [Pod],
    pub probe_job: Option<&'a Job>,
    pub probe_job_name: &'a str,
    pub probe_image: &'a str,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum Step<'a> {
    DeletePod(&'a Pod),
    DeleteProbeJob(&'a Job),
    CreateProbeJob(Job),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    UnreadyPodsDeleted { count: usize },
    ProbeInFlight,
    ProbeStarted,
    ProbeSucceeded,
    ProbeFailed { fail_count: u32 },
    Restarted { pods: usize },
}

#[derive(Debug)]
pub struct Decision<'a> {
    pub outcome: Outcome,
    pub steps: Vec<Step<'a>>,
    pub status: DNSMonitorStatus,
    /// Whether `status` has to be written back.
    pub persist: bool,
    pub requeue_after: Duration,
}

pub fn decide(observation: Observation<'_>) -> Decision<'_> {
    let Observation {
        monitor_name,
        generation,
        settings,
        mut status,
        status_changed,
        pods,
        probe_job,
        probe_job_name,
        probe_image,
        now,
    } = observation;

    let requeue_after = settings.probe_interval;
    let decision = |outcome, steps, status, persist| Decision {
        outcome,
        steps,
        status,
        persist,
        requeue_after,
    };

    // Readiness problems take priority over probing.
    let unready = pods.iter().filter(|pod| !is_pod_ready(pod)).collect::<Vec<_>>();
    if !unready.is_empty() {
        let message = format!("Deleted {} unready CoreDNS pods", unready.len());
        record(&mut status, false, "PodsUnready", &message, now, generation);
        status.last_action = Some(after_scale(&status, status_changed, message));
        return decision(
            Outcome::UnreadyPodsDeleted { count: unready.len() },
            unready.into_iter().map(Step::DeletePod).collect(),
            status,
            true,
        );
    }

    let mut steps = Vec::new();
    let outcome = match probe_job.map(|job| (job, probe_state(job))) {
        Some((_, ProbeState::Running | ProbeState::Terminating)) => {
            status.last_checked = Some(Time(now));
            return decision(Outcome::ProbeInFlight, steps, status, true);
        }

        Some((job, ProbeState::Succeeded)) => {
            status.fail_count = 0;
            let message = format!("{} resolved", settings.test_domain);
            record(&mut status, true, "ProbeSucceeded", message, now, generation);
            steps.push(Step::DeleteProbeJob(job));
            Outcome::ProbeSucceeded
        }

        Some((job, ProbeState::Failed)) => {
            status.fail_count = status.fail_count.saturating_add(1);
            let message = format!(
                "{} failed to resolve {} time(s) in a row",
                settings.test_domain, status.fail_count
            );
            record(&mut status, false, "ProbeFailed", message, now, generation);
            steps.push(Step::DeleteProbeJob(job));
            Outcome::ProbeFailed {
                fail_count: status.fail_count,
            }
        }

        None if status.fail_count < settings.failure_threshold => {
            let job = build_probe_job(probe_job_name, &settings.namespace, &settings.test_domain, probe_image);
            if status_changed {
                status.last_checked = Some(Time(now));
            }
            return decision(
                Outcome::ProbeStarted,
                vec![Step::CreateProbeJob(job)],
                status,
                status_changed,
            );
        }

        // Threshold reached by an earlier pass whose restart never got persisted, or the threshold was lowered.
        None => {
            debug!(%monitor_name, fail_count = status.fail_count, "pending restart without probe job");
            Outcome::ProbeFailed {
                fail_count: status.fail_count,
            }
        }
    };

    if status.fail_count < settings.failure_threshold {
        return decision(outcome, steps, status, true);
    }

    steps.extend(pods.iter().map(Step::DeletePod));
    let message = format!(
        "{} consecutive probe failures reached threshold {}",
        status.fail_count, settings.failure_threshold
    );
    record(&mut status, false, "Restarted", message, now, generation);
    status.fail_count = 0;
    status.last_action = Some(after_scale(&status, status_changed, RESTART_ACTION.to_string()));

    decision(Outcome::Restarted { pods: pods.len() }, steps, status, true)
}

/// Keeps a scale recorded earlier in the same pass visible next to the pass's own action.
fn after_scale(status: &DNSMonitorStatus, status_changed: bool, action: String) -> String {
    match status.last_action.as_deref().filter(|_| status_changed) {
        Some(scaled) => format!("{scaled}; {action}"),
        None => action,
    }
}

fn record(
    status: &mut DNSMonitorStatus,
    healthy: bool,
    reason: &str,
    message: impl ToString,
    now: DateTime<Utc>,
    generation: Option<i64>,
) {
    let condition = healthy_condition(status, healthy, reason, message, now, generation);
    status.healthy = healthy;
    status.conditions = Some(vec![condition]);
    status.last_checked = Some(Time(now));
}
