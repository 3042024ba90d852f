//! Writing a Run's state back to the API server
//!
//! Only `spec.state` is ever written, through a one-operation JSON patch, so
//! concurrent writers touching other fields never conflict with us. The
//! retrying variant re-reads the Run between attempts and stops early when
//! someone else already converged it.

use kube::ResourceExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use experiment_common::crd::{Run, RunState};
use experiment_common::keys::object_key;
use experiment_common::Error;

use crate::store::RunStore;

/// JSON pointer of the field the controller owns
pub const STATE_PATH: &str = "/spec/state";

/// Default number of patch attempts in [`save_with_retries`]
pub const DEFAULT_PATCH_ATTEMPTS: u32 = 3;

/// One JSON patch operation on the state field
#[derive(Debug, Clone, PartialEq, Serialize)]
struct StatePatchOp {
    /// Always `add`; it also replaces an existing value
    op: &'static str,
    path: &'static str,
    value: RunState,
}

impl StatePatchOp {
    fn set(value: RunState) -> Self {
        Self {
            op: "add",
            path: STATE_PATH,
            value,
        }
    }
}

/// Build the patch document `[{"op":"add","path":"/spec/state","value":...}]`
pub fn state_patch(state: RunState) -> Result<json_patch::Patch, Error> {
    let body = serde_json::to_value([StatePatchOp::set(state)])?;
    Ok(serde_json::from_value(body)?)
}

fn run_ref(run: &Run) -> Result<(String, String), Error> {
    let name = run.name_any();
    match run.namespace() {
        Some(namespace) => Ok((namespace, name)),
        None => Err(Error::invalid_key(name, "run has no namespace")),
    }
}

/// How [`save_with_retries`] ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The Run already carried the target state, nothing was sent
    Unchanged,
    /// Our patch was applied
    Written,
    /// Another writer set the target state first
    Converged,
    /// The Run was deleted before a patch went through
    Deleted,
    /// Another writer moved the Run to this terminal state
    Superseded(RunState),
}

/// Patch the state once. On success `run` is updated in place.
///
/// Returns whether a write was issued.
async fn update_state(
    store: &dyn RunStore,
    run: &mut Run,
    target: RunState,
) -> Result<bool, Error> {
    let (namespace, name) = run_ref(run)?;
    if run.spec.state == target {
        debug!(run = %object_key(&namespace, &name), state = %target, "state not changed, no update required");
        return Ok(false);
    }

    store.patch_run_state(&namespace, &name, target).await?;
    run.spec.state = target;
    Ok(true)
}

/// Patch the state, retrying up to `max_attempts` times.
///
/// After each failed attempt the Run is fetched again. The loop stops
/// without error when the fresh copy already carries `target`, when it has
/// been deleted, or when it reached a terminal state another writer set;
/// the returned [`SaveOutcome`] says which. `run` is only modified when the
/// stored state is known.
pub async fn save_with_retries(
    store: &dyn RunStore,
    run: &mut Run,
    target: RunState,
    max_attempts: u32,
) -> Result<SaveOutcome, Error> {
    let (namespace, name) = run_ref(run)?;
    let key = object_key(&namespace, &name);
    if run.spec.state == target {
        debug!(run = %key, state = %target, "state not changed, no update required");
        return Ok(SaveOutcome::Unchanged);
    }

    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;

        let err = match update_state(store, run, target).await {
            Ok(true) => return Ok(SaveOutcome::Written),
            Ok(false) => return Ok(SaveOutcome::Unchanged),
            Err(e) => e,
        };

        warn!(run = %key, attempt, max_attempts, error = %err, "run state patch failed");
        if attempt >= max_attempts {
            return Err(Error::retries_exhausted(key, attempt, err));
        }

        match store.get_run(&namespace, &name).await {
            Ok(None) => {
                info!(run = %key, "run deleted while updating its state");
                return Ok(SaveOutcome::Deleted);
            }
            Ok(Some(fresh)) if fresh.spec.state == target => {
                info!(run = %key, state = %target, "run already converged by another writer");
                run.spec.state = target;
                return Ok(SaveOutcome::Converged);
            }
            Ok(Some(fresh)) if fresh.spec.state.is_terminal() => {
                info!(
                    run = %key,
                    state = %fresh.spec.state,
                    wanted = %target,
                    "run reached a terminal state concurrently, not overwriting"
                );
                run.spec.state = fresh.spec.state;
                return Ok(SaveOutcome::Superseded(fresh.spec.state));
            }
            Ok(Some(_)) => {}
            Err(e) => warn!(run = %key, error = %e, "failed to re-read run before retrying"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockRunStore;
    use experiment_common::crd::RunSpec;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn run_with_state(state: RunState) -> Run {
        let mut run = Run::new(
            "mnist-1",
            RunSpec {
                experiment_name: "mnist".to_string(),
                pod_count: 1,
                state,
                ..Default::default()
            },
        );
        run.metadata.namespace = Some("team-a".to_string());
        run
    }

    fn server_error() -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd leader changed".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }))
    }

    #[test]
    fn patch_body_is_a_single_add_operation() {
        let body = serde_json::to_value([StatePatchOp::set(RunState::Complete)]).unwrap();
        assert_eq!(
            body,
            serde_json::json!([{"op": "add", "path": "/spec/state", "value": "COMPLETE"}])
        );

        let patch = state_patch(RunState::Queued).unwrap();
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            serde_json::json!([{"op": "add", "path": "/spec/state", "value": "QUEUED"}])
        );
    }

    #[tokio::test]
    async fn update_state_writes_and_mutates_in_place() {
        let mut store = MockRunStore::new();
        store
            .expect_patch_run_state()
            .withf(|ns, name, state| ns == "team-a" && name == "mnist-1" && *state == RunState::Running)
            .times(1)
            .returning(|_, _, _| Ok(run_with_state(RunState::Running)));

        let mut run = run_with_state(RunState::Queued);
        assert!(update_state(&store, &mut run, RunState::Running).await.unwrap());
        assert_eq!(run.spec.state, RunState::Running);
    }

    #[tokio::test]
    async fn unchanged_state_is_not_written() {
        let mut store = MockRunStore::new();
        store.expect_patch_run_state().never();
        store.expect_get_run().never();

        let mut run = run_with_state(RunState::Complete);
        let outcome = save_with_retries(&store, &mut run, RunState::Complete, 3)
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Unchanged);
        assert_eq!(run.spec.state, RunState::Complete);
    }

    #[tokio::test]
    async fn succeeds_within_the_retry_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let mut store = MockRunStore::new();
        store
            .expect_patch_run_state()
            .times(3)
            .returning(move |_, _, state| {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(server_error())
                } else {
                    Ok(run_with_state(state))
                }
            });
        store
            .expect_get_run()
            .times(2)
            .returning(|_, _| Ok(Some(run_with_state(RunState::Running))));

        let mut run = run_with_state(RunState::Running);
        let outcome = save_with_retries(&store, &mut run, RunState::Complete, 3)
            .await
            .unwrap();

        assert_eq!(outcome, SaveOutcome::Written);
        assert_eq!(run.spec.state, RunState::Complete);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_budget_names_the_run_and_last_error() {
        let mut store = MockRunStore::new();
        store
            .expect_patch_run_state()
            .times(3)
            .returning(|_, _, _| Err(server_error()));
        store
            .expect_get_run()
            .times(2)
            .returning(|_, _| Ok(Some(run_with_state(RunState::Running))));

        let mut run = run_with_state(RunState::Running);
        let err = save_with_retries(&store, &mut run, RunState::Complete, 3)
            .await
            .unwrap_err();

        match &err {
            Error::RetriesExhausted { run, attempts, source } => {
                assert_eq!(run, "team-a/mnist-1");
                assert_eq!(*attempts, 3);
                assert!(source.to_string().contains("etcd leader changed"));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(run.spec.state, RunState::Running);
    }

    #[tokio::test]
    async fn stops_when_another_writer_already_converged() {
        let mut store = MockRunStore::new();
        store
            .expect_patch_run_state()
            .times(1)
            .returning(|_, _, _| Err(server_error()));
        store
            .expect_get_run()
            .times(1)
            .returning(|_, _| Ok(Some(run_with_state(RunState::Complete))));

        let mut run = run_with_state(RunState::Running);
        let outcome = save_with_retries(&store, &mut run, RunState::Complete, 3)
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Converged);
        assert_eq!(run.spec.state, RunState::Complete);
    }

    #[tokio::test]
    async fn never_overwrites_a_concurrent_cancel() {
        let mut store = MockRunStore::new();
        store
            .expect_patch_run_state()
            .times(1)
            .returning(|_, _, _| Err(server_error()));
        store
            .expect_get_run()
            .times(1)
            .returning(|_, _| Ok(Some(run_with_state(RunState::Cancelled))));

        let mut run = run_with_state(RunState::Running);
        let outcome = save_with_retries(&store, &mut run, RunState::Failed, 3)
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Superseded(RunState::Cancelled));
        assert_eq!(run.spec.state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn stops_when_run_was_deleted() {
        let mut store = MockRunStore::new();
        store
            .expect_patch_run_state()
            .times(1)
            .returning(|_, _, _| Err(server_error()));
        store.expect_get_run().times(1).returning(|_, _| Ok(None));

        let mut run = run_with_state(RunState::Queued);
        let outcome = save_with_retries(&store, &mut run, RunState::Running, 3)
            .await
            .unwrap();
        assert_eq!(outcome, SaveOutcome::Deleted);
        assert_eq!(run.spec.state, RunState::Queued);
    }

    #[tokio::test]
    async fn attempt_budget_is_configurable() {
        let mut store = MockRunStore::new();
        store
            .expect_patch_run_state()
            .times(5)
            .returning(|_, _, _| Err(server_error()));
        store
            .expect_get_run()
            .times(4)
            .returning(|_, _| Err(server_error()));

        let mut run = run_with_state(RunState::Queued);
        let err = save_with_retries(&store, &mut run, RunState::Running, 5)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RetriesExhausted { attempts: 5, .. }));
    }

    #[tokio::test]
    async fn run_without_namespace_is_rejected() {
        let store = MockRunStore::new();
        let mut run = run_with_state(RunState::Queued);
        run.metadata.namespace = None;

        let err = save_with_retries(&store, &mut run, RunState::Running, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidKey { .. }));
    }
}
