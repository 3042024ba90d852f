//! Folding observed pod phases into a single Run state
//!
//! The result depends only on the multiset of phases and the expected pod
//! count, never on the Run's previous state. Reconciliation can therefore
//! recompute it from scratch on every pass.

use k8s_openapi::api::core::v1::Pod;

use experiment_common::crd::RunState;

/// Phase of a pod as reported in `status.phase`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PodPhase {
    /// Accepted but not all containers are running
    Pending,
    /// Bound to a node with at least one container running
    Running,
    /// All containers terminated successfully
    Succeeded,
    /// All containers terminated, at least one in failure
    Failed,
    /// State could not be obtained
    Unknown,
}

impl PodPhase {
    /// Read the phase of a pod. A pod without a recognized phase is `Unknown`.
    pub fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Default)]
struct PhaseTally {
    waiting: usize,
    succeeded: usize,
}

/// Compute the Run state for a set of pod phases.
///
/// - wrong number of pods → `Failed`
/// - any pod failed → `Failed`
/// - any pod pending or unknown → `Queued`
/// - all pods succeeded → `Complete`
/// - otherwise → `Running`
pub fn aggregate(phases: &[PodPhase], expected_count: usize) -> RunState {
    if phases.len() != expected_count {
        return RunState::Failed;
    }

    let mut tally = PhaseTally::default();
    for phase in phases {
        match phase {
            PodPhase::Failed => return RunState::Failed,
            PodPhase::Pending | PodPhase::Unknown => tally.waiting += 1,
            PodPhase::Succeeded => tally.succeeded += 1,
            PodPhase::Running => {}
        }
    }

    if tally.waiting > 0 {
        RunState::Queued
    } else if tally.succeeded == phases.len() {
        RunState::Complete
    } else {
        RunState::Running
    }
}
