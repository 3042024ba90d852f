//! Startup steps run before the controller takes over

mod client;
mod crds;

pub use client::create_client;
pub use crds::ensure_run_crd;
