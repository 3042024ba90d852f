//! Controller tuning knobs

use std::time::Duration;

use experiment_common::RUN_NAME_LABEL;

use crate::queue::RateLimiterConfig;
use crate::update::DEFAULT_PATCH_ATTEMPTS;

/// Default time allowed for the initial pod and Run lists
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Watcher timeout (seconds). Must stay below the client read timeout (30s)
/// so the API server closes idle watches before the client gives up on them.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Configuration for [`RunController`](crate::RunController)
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Patch attempts per state update
    pub patch_attempts: u32,
    /// Pod label naming the owning Run
    pub owner_label: String,
    /// Whether deleting a pod reconciles its Run
    pub reconcile_on_pod_delete: bool,
    /// How long to wait for caches before giving up
    pub cache_sync_timeout: Duration,
    /// Server-side watch timeout
    pub watch_timeout_secs: u32,
    /// Requeue backoff for failed reconciles
    pub rate_limiter: RateLimiterConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            patch_attempts: DEFAULT_PATCH_ATTEMPTS,
            owner_label: RUN_NAME_LABEL.to_string(),
            reconcile_on_pod_delete: true,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
            watch_timeout_secs: WATCH_TIMEOUT_SECS,
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}
