//! Experiment Run controller - keeps Run states in line with their pods

mod startup;

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};
use kube::CustomResourceExt;
use tokio_util::sync::CancellationToken;

use experiment_common::crd::Run;
use experiment_common::telemetry::{init_telemetry, TelemetryConfig};
use experiment_common::RUN_NAME_LABEL;
use experiment_run::update::DEFAULT_PATCH_ATTEMPTS;
use experiment_run::{ControllerConfig, RunController};

/// Watches pods of experiment Runs and records each Run's aggregate state
#[derive(Parser, Debug)]
#[command(name = "experiment-run-controller", version, about, long_about = None)]
struct Cli {
    /// Generate the Run CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Install or update the Run CRD before starting
    #[arg(long, env = "RUN_CONTROLLER_INSTALL_CRD")]
    install_crd: bool,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "RUN_CONTROLLER_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Address of the Kubernetes API server. Overrides any value in kubeconfig.
    #[arg(long, env = "RUN_CONTROLLER_MASTER")]
    master: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "RUN_CONTROLLER_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Patch attempts per Run state update
    #[arg(long, env = "RUN_CONTROLLER_PATCH_ATTEMPTS", default_value_t = DEFAULT_PATCH_ATTEMPTS)]
    patch_attempts: u32,

    /// Pod label whose value names the owning Run
    #[arg(long, env = "RUN_CONTROLLER_OWNER_LABEL", default_value = RUN_NAME_LABEL)]
    owner_label: String,

    /// Reconcile a Run when one of its pods is deleted
    #[arg(
        long,
        env = "RUN_CONTROLLER_RECONCILE_ON_POD_DELETE",
        default_value_t = true,
        action = ArgAction::Set
    )]
    reconcile_on_pod_delete: bool,

    /// Seconds to wait for the initial pod and Run lists
    #[arg(long, env = "RUN_CONTROLLER_CACHE_SYNC_TIMEOUT_SECS", default_value_t = 120)]
    cache_sync_timeout_secs: u64,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            patch_attempts: self.patch_attempts,
            owner_label: self.owner_label.clone(),
            reconcile_on_pod_delete: self.reconcile_on_pod_delete,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout_secs),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Run::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    let client =
        startup::create_client(cli.kubeconfig.as_deref(), cli.master.as_deref()).await?;

    if cli.install_crd {
        startup::ensure_run_crd(&client).await?;
    }

    let config = cli.controller_config();
    tracing::info!(
        workers = config.workers,
        patch_attempts = config.patch_attempts,
        owner_label = %config.owner_label,
        reconcile_on_pod_delete = config.reconcile_on_pod_delete,
        "Starting Run controller"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            wait_for_signal().await;
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    RunController::new(client, config).run(shutdown).await?;
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
