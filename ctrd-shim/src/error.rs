//! Error types for the shim.

use thiserror::Error;
use tonic::{Code, Status};

/// Errors returned by shim operations, both in-process and over gRPC.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The container is in the wrong state for the requested operation.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// The OCI runtime command failed.
    #[error("runtime: {0}")]
    Runtime(String),

    /// The shim could not be reached.
    #[error("shim unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(msg) => Status::not_found(msg),
            Error::AlreadyExists(msg) => Status::already_exists(msg),
            Error::InvalidArgument(msg) => Status::invalid_argument(msg),
            Error::FailedPrecondition(msg) => Status::failed_precondition(msg),
            Error::Unimplemented(msg) => Status::unimplemented(msg),
            Error::Unavailable(msg) => Status::unavailable(msg),
            Error::Runtime(msg) => Status::internal(format!("runtime: {msg}")),
            Error::Io(e) => Status::internal(e.to_string()),
            Error::Internal(msg) => Status::internal(msg),
        }
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        let msg = status.message().to_string();
        match status.code() {
            Code::NotFound => Error::NotFound(msg),
            Code::AlreadyExists => Error::AlreadyExists(msg),
            Code::InvalidArgument => Error::InvalidArgument(msg),
            Code::FailedPrecondition => Error::FailedPrecondition(msg),
            Code::Unimplemented => Error::Unimplemented(msg),
            Code::Unavailable | Code::Cancelled | Code::Unknown => Error::Unavailable(msg),
            _ => Error::Internal(msg),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Unavailable(err.to_string())
    }
}
