//! Error types for the bluetools library
//!
//! A single error enum covers the HCI controller, the event codec and the
//! L2CAP client/server. Socket level failures keep the originating
//! `std::io::Error` so callers can still inspect the OS error code.

use crate::hci::controller::ControllerState;
use thiserror::Error;

/// Errors returned by every fallible operation of the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Controller busy or closed (state: {0})")]
    BusyOrClosed(ControllerState),

    #[error("Malformed HCI packet: {0}")]
    MalformedPacket(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Connection reset by peer")]
    PeerReset,

    #[error("HCI command 0x{opcode:04X} failed: {reason}")]
    HardwareCommandFailed { opcode: u16, reason: String },

    #[error("Already closed")]
    AlreadyClosed,

    #[error("Connection not established")]
    NotConnected,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(crate::gap::BdAddr),

    #[error("Failed to open socket: {0}")]
    SocketError(#[source] std::io::Error),

    #[error("Failed to bind socket: {0}")]
    BindError(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Error {
    /// Builds a `HardwareCommandFailed` error from a controller status code
    pub fn command_status(opcode: u16, status: u8) -> Self {
        Error::HardwareCommandFailed {
            opcode,
            reason: format!("status 0x{:02X}", status),
        }
    }

    /// Builds a `HardwareCommandFailed` error from a transport failure
    pub fn command_io(opcode: u16, err: &std::io::Error) -> Self {
        Error::HardwareCommandFailed {
            opcode,
            reason: err.to_string(),
        }
    }

    /// Maps an I/O error raised on a connected socket.
    ///
    /// `ENOTCONN`, `ECONNRESET` and `EPIPE` mean the peer is gone and become
    /// `PeerReset`; `ETIMEDOUT` becomes `Timeout`.
    pub fn from_connection_io(err: std::io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOTCONN) | Some(libc::ECONNRESET) | Some(libc::EPIPE) => Error::PeerReset,
            Some(libc::ETIMEDOUT) => Error::Timeout,
            _ => Error::Io(err),
        }
    }

    /// True when the error means the remote side dropped the link
    pub fn is_peer_reset(&self) -> bool {
        matches!(self, Error::PeerReset)
    }
}

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;
