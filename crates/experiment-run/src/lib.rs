//! Reconciliation core for experiment Runs
//!
//! Keeps `spec.state` of every Run in line with the phases of the pods its
//! selector matches:
//! - `informer` / `router`: pod and Run watches mapped to Run keys
//! - `queue`: deduplicating, rate-limited work queue
//! - `reconcile`: the level-triggered handler
//! - `aggregate` / `update`: the pure state rule and the patch protocol
//! - `controller`: wiring of the above into workers

pub mod aggregate;
pub mod config;
pub mod controller;
pub mod informer;
pub mod queue;
pub mod reconcile;
pub mod router;
pub mod store;
pub mod update;

pub use aggregate::{aggregate, PodPhase};
pub use config::ControllerConfig;
pub use controller::{process_next_work_item, run_worker, RunController, RunQueue};
pub use reconcile::{reconcile, Context, ReconcileOutcome, SkipReason};
pub use router::EventRouter;
pub use store::{KubeRunStore, RunStore};
pub use update::{save_with_retries, SaveOutcome};

pub use experiment_common::{Error, Result};
