//! Run CRD types
//!
//! A `Run` tracks one batch execution of an experiment. Its pods are found
//! through `pod-selector`; the controller folds their phases into `state`.
//! Field names are kebab-case on the wire to stay compatible with the
//! existing aggregator API schema and its clients.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// API group of the Run resource
pub const RUN_API_GROUP: &str = "aggregator.aipg.intel.com";

/// Full CRD name (`<plural>.<group>`)
pub const RUN_CRD_NAME: &str = "runs.aggregator.aipg.intel.com";

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a Run
///
/// The serialized tokens are an external contract shared with every client
/// of the aggregator API and must not change. Other clients may write tokens
/// this controller does not know; those read as [`RunState::Unrecognized`] so
/// one foreign Run never makes a whole list undecodable.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Not scheduled yet
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Waiting for all pods to start
    #[serde(rename = "QUEUED")]
    Queued,
    /// All pods are running
    #[serde(rename = "RUNNING")]
    Running,
    /// Every pod succeeded
    #[serde(rename = "COMPLETE")]
    Complete,
    /// A pod failed or the pod set has the wrong size
    #[serde(rename = "FAILED")]
    Failed,
    /// Cancelled by a user; never assigned by the controller
    #[serde(rename = "CANCELLED")]
    Cancelled,
    /// Any token not listed above; not terminal, never assigned by the controller
    #[serde(other)]
    Unrecognized,
}

impl RunState {
    /// Wire token for this state
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unset => "",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unrecognized => "Unrecognized",
        }
    }

    /// Terminal states are never overwritten by the controller
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// True for a Run that has not been scheduled yet
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, "<unset>"),
            Self::Unrecognized => write!(f, "<unrecognized>"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

// =============================================================================
// CRD
// =============================================================================

/// A single execution of an experiment, backed by a set of pods
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "aggregator.aipg.intel.com",
    version = "v1",
    kind = "Run",
    plural = "runs",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".spec.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "kebab-case")]
pub struct RunSpec {
    /// Name of the experiment this run belongs to
    #[serde(default)]
    pub experiment_name: String,

    /// Selects the pods that make up this run
    #[serde(default)]
    pub pod_selector: LabelSelector,

    /// Expected number of pods
    ///
    /// Signed so that a bad value on one Run does not break decoding of the
    /// others; a negative count can never be satisfied.
    #[serde(default)]
    pub pod_count: i64,

    /// Parameters the run was started with
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,

    /// Metrics reported by the workload
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, String>,

    /// Current lifecycle state; the only field the controller writes
    #[serde(default, skip_serializing_if = "RunState::is_unset")]
    #[schemars(with = "String")]
    pub state: RunState,

    /// When the workload started, maintained outside the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_timestamp: Option<Time>,

    /// When the workload finished, maintained outside the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<Time>,
}

// =============================================================================
// Tests
// =============================================================================
