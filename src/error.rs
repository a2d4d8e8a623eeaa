//! Driver errors.
use bson::{self, oid};
use std::{io, sync};

use crate::connstring::Host;

pub type Result<T> = ::std::result::Result<T, Error>;

const NOT_WRITABLE_PRIMARY_CODES: [i32; 2] = [10107, 13435];
const RECOVERING_CODES: [i32; 5] = [11600, 11602, 13436, 189, 91];
const SHUTTING_DOWN_CODES: [i32; 2] = [11600, 91];

/// The error type for all topology, selection and pool operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A malformed connection string or option value.
    #[error("{0}")]
    ArgumentError(String),
    /// A combination of options that can never be satisfied.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    /// Monitoring or pool handshake failure.
    #[error("handshake with {host} failed: {message}")]
    HandshakeError { host: Host, message: String },
    /// No server matched the selection criteria before the deadline.
    #[error("{0}")]
    ServerSelectionTimeout(String),
    /// A server's wire version range does not overlap the driver's.
    #[error("{0}")]
    IncompatibleTopology(String),
    #[error("{0}")]
    IoError(#[from] io::Error),
    /// The server answered a command with `ok: 0`.
    #[error("command failed ({code}): {message}")]
    CommandError { code: i32, message: String },
    /// The server's reply could not be understood.
    #[error("{0}")]
    ResponseError(String),
    #[error("timed out waiting for a connection to {host}")]
    WaitQueueTimeout { host: Host },
    #[error("the connection pool for {host} is closed")]
    PoolClosed { host: Host },
    #[error("the topology has been closed")]
    TopologyClosed,
    #[error("{0}")]
    EncoderError(#[from] bson::EncoderError),
    #[error("{0}")]
    DecoderError(#[from] bson::DecoderError),
    #[error("lock poisoned")]
    LockError,
}

impl From<oid::Error> for Error {
    fn from(err: oid::Error) -> Error {
        Error::ResponseError(format!("invalid ObjectId: {}", err))
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(_: sync::PoisonError<T>) -> Error {
        Error::LockError
    }
}

impl Error {
    /// Whether the error came from the transport rather than from the server.
    pub fn is_network_error(&self) -> bool {
        match *self {
            Error::IoError(_) | Error::HandshakeError { .. } => true,
            _ => false,
        }
    }

    /// Whether the error is a network timeout.
    pub fn is_network_timeout(&self) -> bool {
        match *self {
            Error::IoError(ref err) => {
                err.kind() == io::ErrorKind::TimedOut || err.kind() == io::ErrorKind::WouldBlock
            }
            _ => false,
        }
    }

    /// Whether the server reported that it can no longer accept writes.
    pub fn is_not_writable_primary(&self) -> bool {
        match *self {
            Error::CommandError { code, ref message } => {
                NOT_WRITABLE_PRIMARY_CODES.contains(&code)
                    || (!RECOVERING_CODES.contains(&code) && message.contains("not master"))
            }
            _ => false,
        }
    }

    /// Whether the server reported that it is recovering or shutting down.
    pub fn is_recovering(&self) -> bool {
        match *self {
            Error::CommandError { code, ref message } => {
                RECOVERING_CODES.contains(&code)
                    || message.contains("node is recovering")
                    || message.contains("not master or secondary")
            }
            _ => false,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        match *self {
            Error::CommandError { code, .. } => SHUTTING_DOWN_CODES.contains(&code),
            _ => false,
        }
    }

    /// Whether the error means the server's description is out of date.
    pub fn is_state_change_error(&self) -> bool {
        self.is_not_writable_primary() || self.is_recovering()
    }
}
