//! Exporter side of a lease: context, control session, hooks, and the
//! supervisor that drives the status machine.

pub mod hooks;
pub mod lease_context;
pub mod session;
pub mod supervisor;

use thiserror::Error;

pub use hooks::{HookConfig, HookError, HookExecutor, HookInstanceConfig, HookKind, OnFailure};
pub use lease_context::LeaseContext;
pub use session::Session;
pub use supervisor::{DriverTree, LeaseOutcome, LeaseSupervisor};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaseError {
    #[error("lease context requires a non-empty lease_name")]
    EmptyLeaseName,
    #[error("lease context must have a session and socket path before hooks run")]
    NotReady,
}

#[derive(Debug, Error)]
pub enum ExporterConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid hook configuration: {0}")]
    Toml(#[from] toml::de::Error),
}
