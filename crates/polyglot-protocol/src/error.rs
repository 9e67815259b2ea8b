//! Error types for kernel routing and composition.

use thiserror::Error;

/// Errors that can occur while routing, executing, or relaying commands.
///
/// Every variant is eventually surfaced to callers as the message of a
/// `CommandFailed` event; none of them escape a kernel boundary as a panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),
    #[error("kernel with name {0} already exists")]
    DuplicateKernelName(String),
    #[error("routing cycle detected: stamping {uri} onto [{}]", slip.join(","))]
    RoutingCycleDetected { uri: String, slip: Vec<String> },
    #[error("kernel {kernel} does not support command type {command_type}")]
    CommandNotSupported { command_type: String, kernel: String },
    /// A command reached a terminal failure. The message is passed through unchanged.
    #[error("{0}")]
    CommandFailed(String),
    #[error("Command cancelled.")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("transport disconnected: {0}")]
    Disconnected(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unknown command type: {0}")]
    UnknownCommandType(String),
    #[error("invalid kernel uri: {0}")]
    InvalidKernelUri(String),
    #[error("directive error: {0}")]
    DirectiveParse(String),
    #[error("invocation context for {0} has already completed")]
    ContextCompleted(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for KernelError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Convenience result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
