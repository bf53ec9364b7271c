//! Error taxonomy for the bridge boundary.
//!
//! Platform errors are translated into these types at the adapter facade
//! boundary; raw platform codes never cross into the client protocol.

use thiserror::Error;

/// Errors reported through the client protocol or to embedder callers.
///
/// Only [`BridgeError::ProtocolViolation`] is fatal: it is raised when the
/// client sends something a conforming client could never produce (an
/// identifier the bridge never handed out, an impossible option
/// combination), and it terminates the client connection. Everything else
/// is reported as a typed status on the failing request and leaves other
/// in-flight operations untouched.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A device, service, characteristic or descriptor vanished or never
    /// existed under the given identifier.
    #[error("{0} no longer available")]
    NotFound(&'static str),

    /// Missing read/write permission, blocklisted UUID, or a policy check
    /// (cross-origin, globally disabled feature) failed.
    #[error("permission denied: {0}")]
    PermissionDenied(&'static str),

    /// The client sent input that only a non-conforming client could
    /// produce. Fatal: tears down the client connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transient platform failure; the caller may retry.
    #[error("platform failure: {0}")]
    Platform(#[from] AdapterError),

    /// An operation for the same attribute is already in flight.
    #[error("operation already in progress")]
    Busy,

    /// Write or read offset outside `[0, MAX_ATTRIBUTE_LENGTH)`. Reported
    /// on the failing request; not fatal.
    #[error("offset {0} out of range")]
    InvalidOffset(i32),

    /// Handle space or advertisement slots exhausted.
    #[error("resource exhausted: {0}")]
    Exhausted(&'static str),
}

impl BridgeError {
    /// Whether this error must terminate the client connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BridgeError::ProtocolViolation(_))
    }
}

/// Errors surfaced by the platform adapter.
///
/// This is the only error type [`crate::infrastructure::adapter::AdapterFacade`]
/// implementations are allowed to return.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("adapter not present")]
    NotPresent,
    #[error("adapter powered off")]
    NotPowered,
    #[error("platform object does not exist")]
    DoesNotExist,
    #[error("operation already in progress")]
    InProgress,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("operation not supported")]
    NotSupported,
    #[error("authentication failed")]
    AuthFailed,
    #[error("authentication timed out")]
    AuthTimeout,
    #[error("authentication rejected")]
    AuthRejected,
    #[error("adapter busy")]
    Busy,
    #[error("platform error: {0}")]
    Failed(String),
}
