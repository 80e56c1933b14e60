//! ctrd-shim - per-container process supervisor.
//!
//! A shim owns exactly one container. It drives an OCI runtime binary,
//! waits on every process it starts and reports lifecycle events to the
//! ctrd daemon.
//!
//! ## Modes
//!
//! - **Remote**: the `ctrd-shim` binary serves [`grpc::ShimGrpc`] on a unix
//!   socket in the container's work directory and outlives daemon restarts.
//! - **In-process**: the daemon embeds a [`ShimService`] directly.

pub mod console;
pub mod convert;
pub mod error;
pub mod event;
pub mod grpc;
pub mod process;
pub mod runtime;
pub mod service;
pub mod test_util;

pub mod proto {
    tonic::include_proto!("ctrd.shim");
}

pub use error::{Error, Result};
pub use event::{Event, EventKind};
pub use process::{
    CreateOptions, DeleteResult, ExecOptions, INIT_PROCESS_ID, ProcessSpec, ProcessState, State,
    Status, Stdio, check_id, check_process_id,
};
pub use runtime::{RuncRuntime, Runtime};
pub use service::ShimService;

/// File name of the shim's socket inside a container work directory.
pub const SOCKET_NAME: &str = "shim.sock";

/// File name of the shim's log inside a container work directory.
pub const LOG_NAME: &str = "shim.log";
