//! Core error types

use thiserror::Error;

/// Errors that are fatal to the connection that produced them.
///
/// Anything recoverable travels back to the client as a status code in the
/// response record instead (see `protocol::status`).
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("command truncated: got {got} bytes, need {need}")]
    Truncated { got: usize, need: usize },

    #[error("unknown command class {0}")]
    UnknownClass(u32),

    #[error("unknown compositor command type {0}")]
    UnknownType(u32),

    #[error("payload of {0} bytes exceeds the message cap")]
    Oversized(usize),
}

/// Core compositor errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("socket error: {0}")]
    Socket(#[from] nix::Error),

    #[error("gpu error: {0}")]
    Gpu(#[from] crate::gpu::GpuError),

    #[error("peer closed the connection")]
    PeerClosed,
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
