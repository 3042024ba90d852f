//! Run controller: informers feeding a work queue drained by reconcile workers
//!
//! Pod and Run watches keep reflector caches current and push the key of
//! every affected Run onto a shared [`WorkQueue`]. Workers pop keys, run
//! [`reconcile`] and decide from the result whether the key is forgotten or
//! requeued with backoff.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::reflector;
use kube::runtime::watcher;
use kube::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use experiment_common::crd::Run;
use experiment_common::Error;

use crate::config::ControllerConfig;
use crate::informer::run_informer;
use crate::queue::{default_controller_rate_limiter, WorkQueue};
use crate::reconcile::{reconcile, Context};
use crate::router::{route_run, EventRouter};
use crate::store::KubeRunStore;

/// Queue of `namespace/name` Run keys
pub type RunQueue = WorkQueue<String>;

/// Take one key off the queue and reconcile it.
///
/// Returns `false` once the queue has shut down.
pub async fn process_next_work_item(queue: &RunQueue, ctx: &Context) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    let result = reconcile(&key, ctx)
        .instrument(info_span!("reconcile", run = %key))
        .await;

    match result {
        Ok(outcome) => {
            debug!(run = %key, ?outcome, "Run reconciliation completed");
            queue.forget(&key);
        }
        Err(e) if e.is_retryable() => {
            warn!(
                run = %key,
                error = %e,
                requeues = queue.num_requeues(&key),
                "Run reconciliation failed, requeueing"
            );
            queue.add_rate_limited(key.clone());
        }
        Err(e) => {
            error!(run = %key, error = %e, "Run reconciliation failed, dropping key");
            queue.forget(&key);
        }
    }

    queue.done(&key);
    true
}

/// Process keys until the queue shuts down
pub async fn run_worker(id: usize, queue: RunQueue, ctx: Arc<Context>) {
    debug!(worker = id, "worker started");
    while process_next_work_item(&queue, &ctx).await {}
    debug!(worker = id, "worker stopped");
}

/// Watches Pods and Runs and keeps every Run's state in line with its pods
pub struct RunController {
    client: Client,
    config: ControllerConfig,
}

impl RunController {
    /// Create a controller using `client` for watches and writes
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self { client, config }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Fails if the caches do not finish their initial list within the
    /// configured timeout. A shutdown during that wait stops cleanly. On
    /// shutdown in-flight reconciles are allowed to finish before this
    /// returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let Self { client, config } = self;

        let queue: RunQueue =
            WorkQueue::new("runs", default_controller_rate_limiter(&config.rate_limiter));
        let router = EventRouter::new(config.owner_label.clone(), config.reconcile_on_pod_delete);
        let watch_config = watcher::Config::default().timeout(config.watch_timeout_secs);
        let stop_informers = shutdown.child_token();

        let (pods, pod_writer) = reflector::store::<Pod>();
        let (runs, run_writer) = reflector::store::<Run>();

        let pod_queue = queue.clone();
        let run_queue = queue.clone();
        let informers: Vec<JoinHandle<()>> = vec![
            tokio::spawn(run_informer(
                "Pod",
                Api::<Pod>::all(client.clone()),
                watch_config.clone(),
                pod_writer,
                move |event| {
                    if let Some(key) = router.route_pod(&event) {
                        pod_queue.add_rate_limited(key);
                    }
                },
                stop_informers.clone(),
            )),
            tokio::spawn(run_informer(
                "Run",
                Api::<Run>::all(client.clone()),
                watch_config,
                run_writer,
                move |event| {
                    if let Some(key) = route_run(&event) {
                        run_queue.add_rate_limited(key);
                    }
                },
                stop_informers.clone(),
            )),
        ];

        info!(timeout = ?config.cache_sync_timeout, "Waiting for informer caches to sync");
        let synced = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before caches synced");
                stop_informers.cancel();
                queue.shut_down();
                join_all("informer", informers).await;
                return Ok(());
            }
            synced = tokio::time::timeout(config.cache_sync_timeout, async {
                tokio::try_join!(pods.wait_until_ready(), runs.wait_until_ready())
            }) => synced,
        };

        let sync_error = match synced {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(format!("informer stopped before caches synced: {e}")),
            Err(_) => Some(format!(
                "caches did not sync within {:?}",
                config.cache_sync_timeout
            )),
        };
        if let Some(message) = sync_error {
            stop_informers.cancel();
            queue.shut_down();
            join_all("informer", informers).await;
            return Err(Error::internal_with_context("cache sync", message));
        }
        info!(pods = pods.state().len(), runs = runs.state().len(), "Caches synced");

        let ctx = Arc::new(Context::new(
            Arc::new(KubeRunStore::new(client, pods)),
            config.patch_attempts,
        ));

        let workers: Vec<JoinHandle<()>> = (0..config.workers.max(1))
            .map(|id| tokio::spawn(run_worker(id, queue.clone(), ctx.clone())))
            .collect();
        info!(workers = workers.len(), "Run controller started");

        shutdown.cancelled().await;
        info!("Shutting down Run controller");

        queue.shut_down();
        stop_informers.cancel();
        join_all("worker", workers).await;
        join_all("informer", informers).await;

        info!("Run controller stopped");
        Ok(())
    }
}

async fn join_all(kind: &'static str, handles: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(kind, error = %e, "task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RateLimiterConfig;
    use crate::store::{MockRunStore, RunStore};
    use async_trait::async_trait;
    use experiment_common::crd::{RunSpec, RunState};
    use k8s_openapi::api::core::v1::PodStatus;
    use kube::core::Selector;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    const KEY: &str = "team-a/mnist-1";

    fn queue() -> RunQueue {
        WorkQueue::new(
            "test",
            default_controller_rate_limiter(&RateLimiterConfig::default()),
        )
    }

    fn ctx(store: MockRunStore) -> Context {
        Context::with_store(Arc::new(store))
    }

    fn terminal_run() -> Run {
        let mut run = Run::new(
            "mnist-1",
            RunSpec {
                pod_count: 1,
                state: RunState::Complete,
                ..Default::default()
            },
        );
        run.metadata.namespace = Some("team-a".to_string());
        run
    }

    #[tokio::test]
    async fn success_forgets_the_key() {
        let mut store = MockRunStore::new();
        store
            .expect_get_run()
            .times(1)
            .returning(|_, _| Ok(Some(terminal_run())));
        let ctx = ctx(store);

        let q = queue();
        q.add_rate_limited("team-a/mnist-1".to_string());
        assert_eq!(q.num_requeues(&"team-a/mnist-1".to_string()), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(process_next_work_item(&q, &ctx).await);
        assert_eq!(q.num_requeues(&"team-a/mnist-1".to_string()), 0);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_is_requeued_with_backoff() {
        let mut store = MockRunStore::new();
        store
            .expect_get_run()
            .times(2)
            .returning(|_, _| Err(Error::internal("apiserver unavailable")));
        let ctx = ctx(store);

        let q = queue();
        q.add("team-a/mnist-1".to_string());

        assert!(process_next_work_item(&q, &ctx).await);
        assert_eq!(q.num_requeues(&"team-a/mnist-1".to_string()), 1);

        // Requeued after the first backoff step
        let next = tokio::time::timeout(Duration::from_secs(1), process_next_work_item(&q, &ctx)).await;
        assert_eq!(next.ok(), Some(true));
        assert_eq!(q.num_requeues(&"team-a/mnist-1".to_string()), 2);
    }

    #[tokio::test]
    async fn non_retryable_failure_is_dropped() {
        let store = MockRunStore::new();
        let ctx = ctx(store);

        let q = queue();
        q.add("not-a-key".to_string());

        assert!(process_next_work_item(&q, &ctx).await);
        assert_eq!(q.num_requeues(&"not-a-key".to_string()), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn workers_exit_after_shutdown() {
        let mut store = MockRunStore::new();
        store
            .expect_get_run()
            .times(1)
            .returning(|_, _| Ok(Some(terminal_run())));
        let ctx = Arc::new(ctx(store));

        let q = queue();
        q.add("team-a/mnist-1".to_string());
        let workers: Vec<_> = (0..3)
            .map(|id| tokio::spawn(run_worker(id, q.clone(), ctx.clone())))
            .collect();

        tokio::time::sleep(Duration::from_millis(30)).await;
        q.shut_down();

        for worker in workers {
            tokio::time::timeout(Duration::from_secs(1), worker)
                .await
                .expect("worker did not stop")
                .unwrap();
        }
    }

    /// Store whose `get_run` holds until `gate` is opened
    #[derive(Default)]
    struct GatedStore {
        started: Notify,
        gate: Notify,
        patches: AtomicU32,
    }

    #[async_trait]
    impl RunStore for GatedStore {
        async fn get_run(&self, _: &str, _: &str) -> Result<Option<Run>, Error> {
            self.started.notify_one();
            self.gate.notified().await;
            let mut run = terminal_run();
            run.spec.state = RunState::Running;
            Ok(Some(run))
        }

        async fn list_pods(&self, _: &str, _: &Selector) -> Result<Vec<Arc<Pod>>, Error> {
            Ok(vec![Arc::new(Pod {
                status: Some(PodStatus {
                    phase: Some("Succeeded".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            })])
        }

        async fn patch_run_state(&self, _: &str, _: &str, state: RunState) -> Result<Run, Error> {
            self.patches.fetch_add(1, Ordering::SeqCst);
            let mut run = terminal_run();
            run.spec.state = state;
            Ok(run)
        }
    }

    #[tokio::test]
    async fn in_flight_reconcile_finishes_after_shutdown() {
        let store = Arc::new(GatedStore::default());
        let ctx = Arc::new(Context::with_store(store.clone()));

        let q = queue();
        q.add(KEY.to_string());
        let worker = tokio::spawn(run_worker(0, q.clone(), ctx));

        store.started.notified().await;
        q.shut_down();
        store.gate.notify_one();

        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker did not stop")
            .unwrap();
        assert_eq!(store.patches.load(Ordering::SeqCst), 1);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn retryable_failure_after_shutdown_is_not_requeued() {
        let mut store = MockRunStore::new();
        store
            .expect_get_run()
            .times(1)
            .returning(|_, _| Err(Error::internal("apiserver unavailable")));
        let ctx = ctx(store);

        let q = queue();
        q.add(KEY.to_string());
        q.shut_down();

        assert!(process_next_work_item(&q, &ctx).await);
        assert_eq!(q.num_requeues(&KEY.to_string()), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }
}
