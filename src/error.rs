//! Error types for the etherdream crate.

use std::error::Error as StdError;
use std::{fmt, io};

use crate::protocols::ether_dream::dac::stream::CommunicationError;
use crate::protocols::ether_dream::dac::ProtocolError;

/// Errors surfaced by discovery, device handles and the frame pipeline.
#[derive(Debug)]
pub enum Error {
    /// No device announced itself within the allotted time.
    Discovery(String),

    /// A registry index was out of range for the current device count.
    NotFound { index: usize, count: usize },

    /// Connecting to a device failed. The handle is left `Faulted`.
    Connect(ConnectError),

    /// A frame is still in flight; wait for readiness before writing again.
    Busy,

    /// The device sent a malformed or unexpected response.
    Protocol(String),

    /// The handle faulted earlier and must be reconnected.
    Faulted(String),

    /// The handle was closed.
    Closed,

    /// Invalid configuration or API misuse.
    InvalidConfig(String),

    /// Socket-level failure outside of an established connection.
    Io(io::Error),
}

/// Reasons a connection attempt can fail.
#[derive(Debug)]
pub enum ConnectError {
    /// The TCP connect or the device greeting did not complete in time.
    Timeout,
    /// The device actively refused the connection.
    Refused,
    /// The device speaks a newer protocol revision than this crate.
    VersionMismatch { reported: u8, supported: u8 },
    /// Any other I/O failure during connect.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Discovery(msg) => write!(f, "discovery failed: {}", msg),
            Error::NotFound { index, count } => {
                write!(f, "no device at index {} ({} known)", index, count)
            }
            Error::Connect(e) => write!(f, "connect failed: {}", e),
            Error::Busy => write!(f, "busy: a frame is already in flight"),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::Faulted(msg) => write!(f, "device faulted: {}", msg),
            Error::Closed => write!(f, "device handle is closed"),
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::Io(e) => write!(f, "i/o error: {}", e),
        }
    }
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Timeout => write!(f, "timed out"),
            ConnectError::Refused => write!(f, "connection refused"),
            ConnectError::VersionMismatch {
                reported,
                supported,
            } => write!(
                f,
                "device reports protocol version {}, at most {} is supported",
                reported, supported
            ),
            ConnectError::Io(e) => e.fmt(f),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Connect(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl StdError for ConnectError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ConnectError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    /// Create a discovery error with a message.
    pub fn discovery(msg: impl Into<String>) -> Self {
        Error::Discovery(msg.into())
    }

    /// Create a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create an invalid config error with a message.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Error::InvalidConfig(msg.into())
    }

    /// Returns true if this is a Busy error.
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy)
    }

    /// Returns true if this is a Closed error.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed)
    }

    /// Returns true if the handle faulted, either now or earlier.
    pub fn is_faulted(&self) -> bool {
        matches!(self, Error::Faulted(_) | Error::Protocol(_))
    }

    /// Returns true if this is a connect timeout.
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self, Error::Connect(ConnectError::Timeout))
    }
}

impl ConnectError {
    /// Classify an I/O error raised while connecting.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectError::Timeout,
            io::ErrorKind::ConnectionRefused => ConnectError::Refused,
            _ => ConnectError::Io(err),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConnectError> for Error {
    fn from(err: ConnectError) -> Self {
        Error::Connect(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err.to_string())
    }
}

impl From<CommunicationError> for Error {
    fn from(err: CommunicationError) -> Self {
        match err {
            CommunicationError::Io(e) => Error::Io(e),
            other => Error::Protocol(other.to_string()),
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
