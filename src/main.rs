//! Consul KV operator - syncs Consul KV values into Kubernetes Secrets

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use consul_kv_operator::backoff::BackoffConfig;
use consul_kv_operator::controller::{error_policy, reconcile, Context};
use consul_kv_operator::crd::{crd_yaml, KVSecret};
use consul_kv_operator::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use consul_kv_operator::FIELD_MANAGER;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Consul KV operator - keeps Kubernetes Secrets in sync with Consul KV
#[derive(Parser, Debug)]
#[command(name = "consul-kv-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Only watch KVSecrets in this namespace (default: all namespaces)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Refresh interval for KVSecrets that declare none
    #[arg(long, env = "DEFAULT_REFRESH_SECS", default_value = "60")]
    default_refresh_secs: u64,

    /// Timeout for a single Consul request
    #[arg(long, env = "CONSUL_TIMEOUT_SECS", default_value = "10")]
    consul_timeout_secs: u64,

    /// Do not install the KVSecret CRD on startup
    #[arg(long)]
    skip_crd_install: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    log_format: LogFormat,

    /// Requeue delay after the first failed cycle
    #[arg(long, env = "ERROR_BACKOFF_INITIAL_SECS", default_value = "5")]
    error_backoff_initial_secs: u64,

    /// Upper bound for the requeue delay after failures
    #[arg(long, env = "ERROR_BACKOFF_MAX_SECS", default_value = "300")]
    error_backoff_max_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self::parse_from(["controller"])
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - aws-lc-rs backs both kube and reqwest TLS
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crd_yaml()?);
        return Ok(());
    }

    let args = match cli.command {
        Some(Commands::Controller(args)) => args,
        None => ControllerArgs::default(),
    };

    init_telemetry(TelemetryConfig {
        format: args.log_format,
        ..Default::default()
    })?;

    run_controller(args).await
}

/// Ensure the KVSecret CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply.
/// This ensures the CRD version always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing KVSecret CRD...");
    crds.patch(KVSecret::crd_name(), &params, &Patch::Apply(&KVSecret::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install KVSecret CRD: {}", e))?;

    tracing::info!("KVSecret CRD installed/updated");
    Ok(())
}

/// Run the KVSecret controller until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if !args.skip_crd_install {
        ensure_crds_installed(&client).await?;
    }

    let ctx = Arc::new(
        Context::builder(client.clone())
            .request_timeout(Duration::from_secs(args.consul_timeout_secs))
            .default_refresh(Duration::from_secs(args.default_refresh_secs))
            .backoff(BackoffConfig::new(
                Duration::from_secs(args.error_backoff_initial_secs),
                Duration::from_secs(args.error_backoff_max_secs),
            ))
            .build()?,
    );

    let (kv_secrets, secrets): (Api<KVSecret>, Api<Secret>) = match &args.namespace {
        Some(ns) => {
            tracing::info!(namespace = %ns, "Watching a single namespace");
            (
                Api::namespaced(client.clone(), ns),
                Api::namespaced(client.clone(), ns),
            )
        }
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    tracing::info!(
        default_refresh_secs = args.default_refresh_secs,
        "Starting KVSecret controller"
    );

    let watcher_config = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    Controller::new(kv_secrets, watcher_config.clone())
        .owns(secrets, watcher_config)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("KVSecret"))
        .await;

    tracing::info!("Controller stopped");
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
