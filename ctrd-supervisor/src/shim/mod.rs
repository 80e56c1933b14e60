//! Shim client abstraction.
//!
//! Every cross-process call the supervisor makes goes through [`Shim`].
//! The remote variant talks gRPC to a `ctrd-shim` process over the unix
//! socket in the container's work directory; the local variant calls an
//! in-process [`ctrd_shim::ShimService`]. Callers only ever see
//! `Arc<dyn Shim>`.

mod local;
mod remote;

pub use local::{LocalLauncher, LocalShim, RuntimeFactory};
pub use remote::{RemoteLauncher, RemoteShim, unix_channel};

use async_trait::async_trait;
use ctrd_shim::{CreateOptions, DeleteResult, Event, ExecOptions, State};
use std::pin::Pin;
use std::sync::Arc;
use tokio_stream::Stream;

use crate::bundle::Bundle;
use crate::error::Result;

/// Lifecycle events of a single container.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

#[async_trait]
pub trait Shim: Send + Sync {
    /// Create the container and return its init pid.
    async fn create(&self, opts: CreateOptions) -> Result<u32>;

    async fn start(&self) -> Result<()>;

    /// Start an additional process and return its pid.
    async fn exec(&self, opts: ExecOptions) -> Result<u32>;

    /// Signal a process. Pid 0 targets the init process.
    async fn kill(&self, pid: u32, signal: u32, all: bool) -> Result<()>;

    /// Delete an exec'd process, or the container itself for pid 0.
    async fn delete(&self, pid: u32) -> Result<DeleteResult>;

    async fn pause(&self) -> Result<()>;

    async fn resume(&self) -> Result<()>;

    async fn state(&self) -> Result<State>;

    async fn events(&self) -> Result<EventStream>;

    /// Stop the shim. Called once its container has been deleted.
    async fn shutdown(&self) -> Result<()>;
}

/// Creates shim clients for containers.
#[async_trait]
pub trait ShimLauncher: Send + Sync {
    /// Start a fresh shim for the container working out of
    /// `bundle.work_dir`.
    async fn launch(&self, bundle: &Bundle) -> Result<Arc<dyn Shim>>;

    /// Reattach to a shim left running in `bundle.work_dir` by a previous
    /// daemon.
    async fn connect(&self, bundle: &Bundle) -> Result<Arc<dyn Shim>>;
}
