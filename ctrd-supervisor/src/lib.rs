//! ctrd - container supervisor daemon.
//!
//! The supervisor keeps a registry of containers, each driven by its own
//! shim, and exposes the execution API over gRPC on a unix socket.
//!
//! ## Architecture
//!
//! - [`supervisor::Supervisor`] owns the registry and orchestrates the
//!   container lifecycle.
//! - [`shim`] abstracts how a shim is reached: a separate `ctrd-shim`
//!   process per container, or an in-process [`ctrd_shim::ShimService`].
//! - [`collector::Collector`] merges the event streams of all shims and
//!   fans them out to API subscribers.
//! - [`exec::ExecPool`] runs process starts on a fixed set of workers.

use std::path::PathBuf;

pub mod bundle;
pub mod collector;
pub mod error;
pub mod exec;
pub mod grpc;
pub mod metrics;
pub mod shim;
pub mod supervisor;

#[cfg(test)]
mod test_util;

pub mod proto {
    tonic::include_proto!("ctrd.execution");
}

pub use error::{Error, Result};
pub use supervisor::{ContainerSummary, Supervisor};

/// Default state directory.
pub const DEFAULT_ROOT: &str = "/run/ctrd";

/// Default exec worker count.
pub const DEFAULT_EXEC_WORKERS: usize = 10;

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one work directory per container.
    pub root: PathBuf,
    pub exec_workers: usize,
    /// Exec tasks queued before submitters wait.
    pub exec_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            exec_workers: DEFAULT_EXEC_WORKERS,
            exec_queue_depth: 512,
        }
    }
}
