#[macro_use]
extern crate tracing;

use chrono::Utc;
use clap::Parser;
use coredns_monitor_operator::{
    context::{
        self,
        DnsTarget,
    },
    probe_job,
    reconcile::{
        self,
        ReconcileError,
    },
    resources::{
        self,
        DNSMonitor,
    },
    store::KubeStore,
};
use context::Context;
use eyre::Result;
use futures::StreamExt as _;
use k8s_openapi::api::batch::v1::Job;
use kube::{
    runtime::{
        controller::Action,
        finalizer,
        finalizer::Event,
        reflector,
        watcher,
        Controller,
        WatchStreamExt as _,
    },
    Api,
    CustomResourceExt as _,
    ResourceExt as _,
};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
enum Args {
    /// Print the DNSMonitor CRD.
    Crds,
    /// Run the operator.
    Controller(ArgsController),
    /// Print the probe job that would be created for a monitor.
    ProbeJob(ArgsProbeJob),
}

#[derive(Parser)]
struct ArgsController {
    #[clap(
        long,
        env = "DNS_DEPLOYMENT",
        help = "Name of the DNS deployment in the monitored namespace",
        default_value = context::DEFAULT_DNS_DEPLOYMENT
    )]
    dns_deployment: String,

    #[clap(
        long,
        env = "DNS_POD_SELECTOR",
        help = "Label selector matching the DNS pods",
        default_value = context::DEFAULT_DNS_POD_SELECTOR
    )]
    dns_pod_selector: String,

    #[clap(
        long,
        env = "PROBE_IMAGE",
        help = "Image of the probe container, needs /bin/sh and nslookup",
        default_value = probe_job::DEFAULT_PROBE_IMAGE
    )]
    probe_image: String,

    #[clap(long, env = "LOG_JSON", help = "Log as JSON lines")]
    log_json: bool,
}

#[derive(Parser)]
struct ArgsProbeJob {
    #[clap(help = "Name of the DNSMonitor")]
    monitor: String,

    #[clap(long, default_value = resources::DEFAULT_NAMESPACE)]
    namespace: String,

    #[clap(long, default_value = resources::DEFAULT_TEST_DOMAIN)]
    test_domain: String,

    #[clap(long, default_value = probe_job::DEFAULT_PROBE_IMAGE)]
    probe_image: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    match Args::parse() {
        Args::Crds => {
            init_tracing(false);
            let yaml = serde_yaml::to_string(&DNSMonitor::crd())?;
            print!("{yaml}")
        }
        Args::Controller(args) => {
            init_tracing(args.log_json);
            run_controller(args).await?;
        }
        Args::ProbeJob(args) => {
            init_tracing(false);
            let job = probe_job::build_probe_job(
                &probe_job::probe_job_name(&args.monitor),
                &args.namespace,
                &args.test_domain,
                &args.probe_image,
            );
            print!("{}", serde_yaml::to_string(&job)?);
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn run_controller(
    ArgsController {
        dns_deployment,
        dns_pod_selector,
        probe_image,
        log_json: _,
    }: ArgsController,
) -> Result<()> {
    let client = kube::Client::try_default().await?;

    let monitors = Api::<DNSMonitor>::all(client.clone());
    let probe_jobs = Api::<Job>::all(client.clone());

    let operator = Arc::new(Operator {
        client: client.clone(),
        monitor: Context {
            store: Arc::new(KubeStore::new(client)),
            dns: DnsTarget {
                deployment: dns_deployment,
                pod_selector: dns_pod_selector,
                probe_image,
            },
        },
    });

    info!(dns = ?operator.monitor.dns, "Starting controller");

    // status-only updates are filtered out, the requeue interval and probe job events drive the cadence
    let (reader, writer) = reflector::store();
    let monitor_events = watcher(monitors, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .applied_objects()
        .predicate_filter(reconcile::monitor_trigger_key);

    Controller::for_stream(monitor_events, reader)
        // probe jobs may live outside the monitor's namespace, so they are mapped back by label instead of owner
        .watches(
            probe_jobs,
            watcher::Config::default().labels(&probe_job::probe_job_selector()),
            reconcile::monitor_for_probe_job,
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, operator)
        .for_each(|msg| async move {
            match msg {
                Ok((object, action)) => debug!("Reconciled {object}: {action:?}"),
                Err(err) => warn!("Reconcile failed: {err}"),
            }
        })
        .await;

    info!("Controller stopped");

    Ok(())
}

/// Shared state of the running controller.
struct Operator {
    client: kube::Client,
    monitor: Context,
}

async fn reconcile(
    monitor: Arc<DNSMonitor>,
    ctx: Arc<Operator>,
) -> Result<Action, finalizer::Error<ReconcileError>> {
    let ns = monitor
        .namespace()
        .ok_or(finalizer::Error::ApplyFailed(ReconcileError::MissingMetadata("namespace")))?;
    let api: Api<DNSMonitor> = Api::namespaced(ctx.client.clone(), &ns);

    finalizer(&api, reconcile::PROBE_JOB_FINALIZER, monitor, |event| async {
        match event {
            Event::Apply(monitor) => apply(&monitor, &ctx.monitor).await,
            Event::Cleanup(monitor) => reconcile::cleanup_monitor(&ctx.monitor, &monitor)
                .await
                .map(|()| Action::await_change()),
        }
    })
    .await
}

async fn apply(monitor: &DNSMonitor, ctx: &Context) -> Result<Action, ReconcileError> {
    let ns = monitor
        .namespace()
        .ok_or(ReconcileError::MissingMetadata("namespace"))?;
    let name = monitor
        .metadata
        .name
        .as_deref()
        .ok_or(ReconcileError::MissingMetadata("name"))?;

    match reconcile::reconcile_monitor(ctx, &ns, name, Utc::now()).await? {
        Some(report) => Ok(Action::requeue(report.requeue_after)),
        None => Ok(Action::await_change()),
    }
}

/// Failed passes are retried on the monitor's regular probe interval.
fn error_policy(monitor: Arc<DNSMonitor>, err: &finalizer::Error<ReconcileError>, _ctx: Arc<Operator>) -> Action {
    let interval = monitor.spec.settings().probe_interval;
    error!("Error reconciling DNSMonitor {}: {err}, retrying in {interval:?}", monitor.name_any());
    Action::requeue(interval)
}
