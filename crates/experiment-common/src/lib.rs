//! Common types for the experiment run controller: the Run CRD, errors and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod keys;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label key carried by pods that belong to a Run (value is the Run name)
pub const RUN_NAME_LABEL: &str = "runName";

/// Field manager used for every write issued by the controller
pub const FIELD_MANAGER: &str = "experiment-run-controller";
