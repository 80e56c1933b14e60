//! Supervisor error types.

use thiserror::Error;
use tonic::Status;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown container or process.
    #[error("container {0} not found")]
    NotFound(String),

    /// Duplicate create.
    #[error("container {0} already exists")]
    AlreadyExists(String),

    /// A required field is missing or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// The shim failed or refused the request.
    #[error("shim: {0}")]
    Shim(#[from] ctrd_shim::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The event collector or exec pool has stopped.
    #[error("supervisor is shutting down")]
    Shutdown,

    /// An event subscriber fell too far behind and was dropped.
    #[error("event subscriber lagged behind and was dropped")]
    Lagged,

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Map a supervisor error onto the gRPC status returned to clients.
pub fn error_to_status(err: Error) -> Status {
    match err {
        Error::NotFound(id) => Status::not_found(format!("container {id} not found")),
        Error::AlreadyExists(id) => {
            Status::already_exists(format!("container {id} already exists"))
        }
        Error::InvalidArgument(msg) => Status::invalid_argument(msg),
        Error::Unimplemented(msg) => Status::unimplemented(msg),
        Error::Shim(e) => e.into(),
        Error::Io(e) => Status::internal(e.to_string()),
        Error::Shutdown => Status::unavailable("supervisor is shutting down"),
        Error::Lagged => Status::resource_exhausted("event subscriber lagged behind"),
        Error::Internal(msg) => Status::internal(msg),
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        error_to_status(err)
    }
}
