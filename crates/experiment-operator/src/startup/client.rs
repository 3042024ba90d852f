//! kube client construction

use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

/// Default connect timeout for the kube client
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for the kube client. Watches time out server-side before this.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a client from an explicit kubeconfig, or the in-cluster/default
/// configuration when none is given. `master` replaces the API server URL.
pub async fn create_client(kubeconfig: Option<&Path>, master: Option<&str>) -> anyhow::Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("failed to load kubeconfig")?
        }
        None => Config::infer()
            .await
            .context("failed to infer kube config")?,
    };

    if let Some(master) = master {
        config.cluster_url = master
            .parse()
            .with_context(|| format!("invalid API server address {master:?}"))?;
    }
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    tracing::info!(cluster_url = %config.cluster_url, "Connecting to Kubernetes API server");
    Client::try_from(config).context("failed to create kube client")
}
