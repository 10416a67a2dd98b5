use thiserror::Error;

use crate::command::Status;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by synchronous driver calls.
///
/// Asynchronous requests never produce this type: their outcome (including
/// transport failures) is delivered as a [`crate::Completion`] to the request
/// callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("DMA allocation of {len} bytes failed")]
    DmaAlloc { len: usize },

    #[error("failed to map BAR{bar}")]
    BarMap { bar: u8 },

    /// An admin command completed with an error status.
    #[error("command failed: {0}")]
    Command(Status),

    #[error("controller is in failed state")]
    ControllerFailed,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("request pool exhausted")]
    NoFreeRequest,

    #[error("no I/O queue pair available")]
    NoQueuePair,

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("stale or unknown handle")]
    InvalidHandle,

    #[error("namespace {0} is not active")]
    NamespaceNotFound(u32),

    #[error("resource busy")]
    Busy,
}

impl Error {
    /// Status of the failed command, if this error came from the device.
    pub fn status(&self) -> Option<Status> {
        match self {
            Error::Command(status) => Some(*status),
            _ => None,
        }
    }
}
