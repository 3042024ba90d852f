//! Run reconciliation
//!
//! Level-triggered: every pass re-reads the Run and its pods and recomputes
//! the state from scratch. Nothing about earlier passes is remembered, so a
//! dropped or duplicated notification only costs an extra read.

use std::sync::Arc;

use kube::core::Selector;
use tracing::{debug, info, warn};

use experiment_common::crd::RunState;
use experiment_common::keys::split_key;
use experiment_common::Error;

use crate::aggregate::{aggregate, PodPhase};
use crate::store::RunStore;
use crate::update::{save_with_retries, SaveOutcome, DEFAULT_PATCH_ATTEMPTS};

/// Shared context for reconcile workers
pub struct Context {
    /// Where Runs and Pods are read from and written to
    pub store: Arc<dyn RunStore>,
    /// Patch attempts per state write
    pub patch_attempts: u32,
}

impl Context {
    /// Create a context over `store`
    pub fn new(store: Arc<dyn RunStore>, patch_attempts: u32) -> Self {
        Self {
            store,
            patch_attempts,
        }
    }

    /// Context with the default patch budget
    pub fn with_store(store: Arc<dyn RunStore>) -> Self {
        Self::new(store, DEFAULT_PATCH_ATTEMPTS)
    }
}

/// Why a reconcile stopped before computing a state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The Run no longer exists
    NotFound,
    /// The Run is in a state the controller never leaves
    Terminal(RunState),
    /// The Run has no state yet and not all of its pods exist
    NotReady {
        /// Pods found
        observed: usize,
        /// Pods the Run asks for
        expected: usize,
    },
}

/// What a successful reconcile did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing was computed
    Skipped(SkipReason),
    /// Computed state matched the stored one, nothing written
    Unchanged(RunState),
    /// State was written
    Updated {
        /// Previous state
        from: RunState,
        /// New state
        to: RunState,
    },
}

/// Reconcile the Run addressed by `key` (`namespace/name`)
pub async fn reconcile(key: &str, ctx: &Context) -> Result<ReconcileOutcome, Error> {
    let (namespace, name) = split_key(key)?;

    let Some(mut run) = ctx.store.get_run(namespace, name).await? else {
        debug!(run = %key, "run no longer exists");
        return Ok(ReconcileOutcome::Skipped(SkipReason::NotFound));
    };

    let current = run.spec.state;
    if current.is_terminal() {
        debug!(run = %key, state = %current, "run is in a terminal state");
        return Ok(ReconcileOutcome::Skipped(SkipReason::Terminal(current)));
    }
    if current == RunState::Unrecognized {
        warn!(run = %key, "run carries an unknown state token, recomputing it");
    }

    let selector = Selector::try_from(run.spec.pod_selector.clone())
        .map_err(|e| Error::invalid_selector(key, e.to_string()))?;
    let pods = ctx.store.list_pods(namespace, &selector).await?;

    let expected = usize::try_from(run.spec.pod_count).ok();
    if let Some(expected) = expected {
        if current.is_unset() && pods.len() < expected {
            debug!(
                run = %key,
                observed = pods.len(),
                expected,
                "waiting for all pods to be created"
            );
            return Ok(ReconcileOutcome::Skipped(SkipReason::NotReady {
                observed: pods.len(),
                expected,
            }));
        }
    }

    let target = match expected {
        Some(expected) => {
            let phases: Vec<PodPhase> = pods.iter().map(|p| PodPhase::of(p)).collect();
            aggregate(&phases, expected)
        }
        None => {
            warn!(run = %key, pod_count = run.spec.pod_count, "negative pod count can never be satisfied");
            RunState::Failed
        }
    };

    if let (RunState::Failed, Some(expected)) = (target, expected) {
        if pods.len() != expected {
            warn!(run = %key, observed = pods.len(), expected, "run has the wrong number of pods");
        } else if let Some(failed) = pods.iter().find(|p| PodPhase::of(p) == PodPhase::Failed) {
            let status = failed.status.as_ref();
            warn!(
                run = %key,
                pod = failed.metadata.name.as_deref().unwrap_or_default(),
                reason = status.and_then(|s| s.reason.as_deref()).unwrap_or_default(),
                message = status.and_then(|s| s.message.as_deref()).unwrap_or_default(),
                "pod failed"
            );
        }
    }

    if target == current {
        debug!(run = %key, state = %current, "state not changed, no update required");
        return Ok(ReconcileOutcome::Unchanged(current));
    }

    let saved = save_with_retries(ctx.store.as_ref(), &mut run, target, ctx.patch_attempts).await?;
    Ok(match saved {
        SaveOutcome::Written => {
            info!(run = %key, from = %current, to = %target, "run state updated");
            ReconcileOutcome::Updated {
                from: current,
                to: target,
            }
        }
        SaveOutcome::Unchanged | SaveOutcome::Converged => ReconcileOutcome::Unchanged(run.spec.state),
        SaveOutcome::Deleted => ReconcileOutcome::Skipped(SkipReason::NotFound),
        SaveOutcome::Superseded(state) => ReconcileOutcome::Skipped(SkipReason::Terminal(state)),
    })
}
