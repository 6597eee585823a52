//! Error types for the gust receiver.
//!
//! Errors live on two levels. [`TransferError`] is the rich error returned
//! by the public API (configuration, socket setup, control-surface misuse).
//! [`ErrorCode`] is the compact status recorded per worker thread and
//! echoed back to the sender in the DONE reply; it also decodes the status
//! byte the sender transmits.

use std::fmt;
use std::io;
use thiserror::Error;

/// Errors surfaced by the receiver's public API.
#[derive(Debug, Error)]
pub enum TransferError {
    /// An I/O error occurred during file or socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to serialize configuration to TOML format.
    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    /// Failed to deserialize configuration from TOML format.
    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    /// A protocol-level error occurred (bad magic, malformed header).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A network-level error occurred (socket setup, bind, accept).
    #[error("network error: {0}")]
    Network(String),

    /// A memory allocation failed.
    #[error("memory allocation error: {0}")]
    Memory(String),

    /// A transfer is already running on this receiver instance.
    #[error("a transfer is already pending on this receiver")]
    TransferPending,
}

/// Per-worker status code, one byte on the wire.
///
/// Workers overwrite their local code with the most recent failure cause;
/// the sender's own code arrives in DONE frames and is kept separately as
/// the remote code. Byte values outside the known range decode to
/// [`ErrorCode::Error`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error.
    Ok = 0,
    /// Generic failure, also used for control-surface misuse.
    Error = 1,
    /// Listen, bind or accept failed unrecoverably.
    ConnError = 2,
    /// Malformed frame: unknown command, framing violation, decode failure.
    ProtocolError = 3,
    /// Open, seek or write against the destination file failed.
    FileWriteError = 4,
    /// The receive buffer could not be allocated.
    MemoryAllocationError = 5,
}

impl ErrorCode {
    /// Decodes a wire byte, mapping unknown values to [`ErrorCode::Error`].
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ErrorCode::Ok,
            2 => ErrorCode::ConnError,
            3 => ErrorCode::ProtocolError,
            4 => ErrorCode::FileWriteError,
            5 => ErrorCode::MemoryAllocationError,
            _ => ErrorCode::Error,
        }
    }

    /// The wire representation of this code.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Error => "ERROR",
            ErrorCode::ConnError => "CONN_ERROR",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::FileWriteError => "FILE_WRITE_ERROR",
            ErrorCode::MemoryAllocationError => "MEMORY_ALLOCATION_ERROR",
        };
        f.write_str(name)
    }
}
