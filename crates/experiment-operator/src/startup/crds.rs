//! Run CRD installation using server-side apply

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use experiment_common::crd::{Run, RUN_CRD_NAME};
use experiment_common::retry::{retry_with_backoff, RetryConfig};
use experiment_common::{Error, FIELD_MANAGER};

/// Attempts made before CRD installation is considered fatal
const INSTALL_ATTEMPTS: u32 = 5;

/// Install or update the Run CRD so its schema matches this binary
pub async fn ensure_run_crd(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let crd = Run::crd();

    tracing::info!(crd = RUN_CRD_NAME, "Installing Run CRD...");
    retry_with_backoff(
        &RetryConfig::with_max_attempts(INSTALL_ATTEMPTS),
        "install-run-crd",
        Error::is_retryable,
        || {
            let (crds, params, crd) = (&crds, &params, &crd);
            async move {
                crds.patch(RUN_CRD_NAME, params, &Patch::Apply(crd))
                    .await
                    .map_err(Error::from)
            }
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", RUN_CRD_NAME, e))?;

    tracing::info!(crd = RUN_CRD_NAME, "Run CRD installed/updated");
    Ok(())
}
