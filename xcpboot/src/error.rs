//! Error types for xcpboot.

use std::io;
use thiserror::Error;

/// Result type for xcpboot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for xcpboot operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// USB device lookup or bulk transfer error.
    #[error("USB error: {0}")]
    Usb(String),

    /// No response arrived within the timeout of the command class.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The transport was used before `connect` succeeded.
    #[error("Transport not connected")]
    NotConnected,

    /// The target answered with a negative XCP response.
    #[error("Protocol error: command {command:#04x} rejected with code {code:#04x} ({})", crate::protocol::xcp::error_name(*code))]
    Protocol {
        /// Command code that was rejected.
        command: u8,
        /// XCP error code reported by the target.
        code: u8,
    },

    /// The target sent a response that does not fit the command.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The target requires a seed/key unlock and it could not be performed.
    #[error("Security unlock failed: {0}")]
    SecurityLocked(String),

    /// Invalid argument passed to an API call.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Firmware file missing, unparseable or empty.
    #[error("Firmware load error: {0}")]
    FirmwareLoad(String),

    /// Operation requires `Session::init` first.
    #[error("Session not initialized")]
    NotInitialized,

    /// Connecting to the target failed.
    #[error("Connect failed")]
    Connect(#[source] Box<Error>),

    /// Erasing target memory failed.
    #[error("Memory erase failed")]
    MemoryErase(#[source] Box<Error>),

    /// Programming target memory failed.
    #[error("Memory program failed")]
    MemoryProgram(#[source] Box<Error>),

    /// Reading target memory failed.
    #[error("Memory read failed")]
    MemoryRead(#[source] Box<Error>),

    /// The embedding application requested cancellation.
    #[error("Operation interrupted")]
    Interrupted,

    /// Unsupported transport or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Returns `true` for a transport level timeout, looking through the
    /// session level wrappers.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Connect(inner)
            | Self::MemoryErase(inner)
            | Self::MemoryProgram(inner)
            | Self::MemoryRead(inner) => inner.is_timeout(),
            _ => false,
        }
    }
}
