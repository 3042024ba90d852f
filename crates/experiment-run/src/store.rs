//! Access to Runs and Pods
//!
//! Reconciliation only needs three operations from the cluster. They sit
//! behind [`RunStore`] so the handler can be driven by a mock in tests and
//! never touches generated clients directly.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{Selector, SelectorExt};
use kube::runtime::reflector::Store;
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use experiment_common::crd::{Run, RunState};
use experiment_common::{Error, FIELD_MANAGER};

use crate::update::state_patch;

/// Trait abstracting the reads and writes reconciliation performs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Get a Run, or `None` if it does not exist
    async fn get_run(&self, namespace: &str, name: &str) -> Result<Option<Run>, Error>;

    /// List the pods in `namespace` whose labels match `selector`
    async fn list_pods(&self, namespace: &str, selector: &Selector)
        -> Result<Vec<Arc<Pod>>, Error>;

    /// Set `spec.state` of a Run with a single JSON patch operation
    async fn patch_run_state(
        &self,
        namespace: &str,
        name: &str,
        state: RunState,
    ) -> Result<Run, Error>;
}

/// Production store: Runs are read from and written to the API server,
/// Pods are listed from the informer cache.
pub struct KubeRunStore {
    client: Client,
    pods: Store<Pod>,
}

impl KubeRunStore {
    /// Create a store over a client and a synced pod cache
    pub fn new(client: Client, pods: Store<Pod>) -> Self {
        Self { client, pods }
    }
}

#[async_trait]
impl RunStore for KubeRunStore {
    async fn get_run(&self, namespace: &str, name: &str) -> Result<Option<Run>, Error> {
        let api: Api<Run> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<Arc<Pod>>, Error> {
        let pods = matching_pods(self.pods.state(), namespace, selector);
        debug!(namespace, ?selector, count = pods.len(), "listed pods from cache");
        Ok(pods)
    }

    async fn patch_run_state(
        &self,
        namespace: &str,
        name: &str,
        state: RunState,
    ) -> Result<Run, Error> {
        let api: Api<Run> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let patch = state_patch(state)?;
        Ok(api
            .patch(name, &params, &Patch::Json::<()>(patch))
            .await?)
    }
}

/// Filter cached pods down to one namespace and a label selector
fn matching_pods(pods: Vec<Arc<Pod>>, namespace: &str, selector: &Selector) -> Vec<Arc<Pod>> {
    pods.into_iter()
        .filter(|pod| pod.namespace().as_deref() == Some(namespace))
        .filter(|pod| selector.matches(pod.labels()))
        .collect()
}
