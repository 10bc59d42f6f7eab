//! Error type shared across the snapshotter.

use thiserror::Error;
use tonic::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the snapshotter and its metadata store.
#[derive(Debug, Error)]
pub enum Error {
    /// The snapshot key or name is unknown to the metadata store.
    #[error("snapshot {0} does not exist")]
    NotFound(String),

    /// The snapshot key or committed name is already taken.
    #[error("snapshot {0} already exists")]
    AlreadyExists(String),

    /// Missing or malformed labels, empty ids, illegal kind transitions.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The configured shared base path collides with the snapshotter's own
    /// directory layout.
    #[error("shared path {0} conflicts with snapshotter layout")]
    PathConflict(String),

    /// The backing filesystem cannot host the snapshotter.
    #[error("unsupported filesystem: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(std::io::Error::from_raw_os_error(errno as i32))
    }
}

impl From<walkdir::Error> for Error {
    fn from(err: walkdir::Error) -> Self {
        match err.into_io_error() {
            Some(io) => Error::Io(io),
            None => Error::Internal("filesystem walk hit a loop".to_string()),
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::NotFound(_) => Status::not_found(message),
            Error::AlreadyExists(_) => Status::already_exists(message),
            Error::InvalidArgument(_) => Status::invalid_argument(message),
            Error::PathConflict(_) => Status::failed_precondition(message),
            Error::Unsupported(_) => Status::failed_precondition(message),
            Error::Io(_) => Status::unknown(message),
            Error::Internal(_) => Status::internal(message),
        }
    }
}
