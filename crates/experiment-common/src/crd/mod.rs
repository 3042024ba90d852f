//! Custom Resource Definitions served by the experiment aggregator API

mod run;

pub use run::{Run, RunSpec, RunState, RUN_API_GROUP, RUN_CRD_NAME};
