use crate::{
    core::Allowlist,
    env::{self, ControllerMetrics, EnvConfig, EnvReconciler, GatewayReconciler, TrackedGateways},
    k8s::{workload::Images, KubeCluster},
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{future::Future, time::Duration};
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "ephemerator", about = "Ephemeral environment controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "ephemerator=info,warn",
        env = "EPHEMERATOR_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The base domain under which environments are published.
    #[clap(long, env = "GATEWAY_HOST")]
    gateway_host: String,

    /// Image for the docker-in-docker container.
    #[clap(long, env = "DIND_IMAGE")]
    dind_image: String,

    /// Image for the container that runs the requested repo.
    #[clap(long, env = "TILT_UPPER_IMAGE")]
    tilt_upper_image: String,

    /// YAML describing the repos that may be run, e.g.
    /// `{repoBase: tilt-dev, repoNames: [tilt-avatars]}`.
    #[clap(long, env = "ALLOWLIST")]
    allowlist: String,

    /// Bounds each command run inside an environment.
    #[clap(long, default_value = "30")]
    exec_timeout_secs: u64,

    /// How long an environment lives when its request sets no expiration.
    #[clap(long, default_value = "900")]
    default_lease_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            gateway_host,
            dind_image,
            tilt_upper_image,
            allowlist,
            exec_timeout_secs,
            default_lease_secs,
        } = self;

        let allowlist = parse_allowlist(&allowlist)?;
        let config = EnvConfig {
            allowlist,
            images: Images {
                runtime: dind_image,
                primary: tilt_upper_image,
            },
            lease: Duration::from_secs(default_lease_secs),
            exec_timeout: Duration::from_secs(exec_timeout_secs),
        };

        let mut prom = <Registry>::default();
        let metrics = ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let client = runtime.client();
        let cluster = KubeCluster::new(client.clone());

        let environments = env::run(
            env::env::controller(client.clone()),
            client.clone(),
            EnvReconciler::new(cluster.clone(), config),
            metrics.clone(),
        );
        spawn_until_shutdown(&runtime, environments, info_span!("environments"));

        let tracked = TrackedGateways::default();
        let gateways = env::run(
            env::gateway::controller(client.clone(), tracked.clone()),
            client,
            GatewayReconciler::new(cluster, &gateway_host, tracked),
            metrics,
        );
        spawn_until_shutdown(&runtime, gateways, info_span!("gateways"));

        info!(%gateway_host, "Controllers started");

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Runs a controller in the background until the runtime begins shutting
/// down. Passes still in flight at that point are dropped.
fn spawn_until_shutdown<S>(
    runtime: &kubert::Runtime<S>,
    controller: impl Future<Output = ()> + Send + 'static,
    span: tracing::Span,
) {
    let shutdown = runtime.shutdown_handle();
    tokio::spawn(
        async move {
            tokio::select! {
                _ = controller => tracing::warn!("Controller stopped"),
                _release = shutdown.signaled() => info!("Shutting down"),
            }
        }
        .instrument(span),
    );
}

fn parse_allowlist(yaml: &str) -> Result<Allowlist> {
    if yaml.trim().is_empty() {
        bail!("allowlist must not be empty");
    }
    serde_yaml::from_str(yaml).context("failed to parse allowlist")
}
