//! Error types for the event link

use thiserror::Error;

/// Failures of the radio link and its handshake
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Platform busy, GATT error status, or a dropped link mid-setup
    #[error("Transient link error: {0}")]
    Transient(String),

    /// An operation did not complete in time
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// The peripheral lacks the expected service or characteristic
    #[error("Incompatible peripheral: {0}")]
    IncompatiblePeripheral(String),

    /// Radio permission is missing and needs user action
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No adapter, or the adapter is powered off
    #[error("Bluetooth radio unavailable: {0}")]
    RadioUnavailable(String),

    /// Enabling notifications failed after all retries
    #[error("Notification handshake failed: {0}")]
    HandshakeFailed(String),
}

impl LinkError {
    /// Whether the bounded retry policies may try again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }
}

/// A completed buffer that could not be turned into a [`DeviceEvent`]
///
/// [`DeviceEvent`]: crate::domain::models::DeviceEvent
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Malformed message: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Malformed message: not valid UTF-8")]
    InvalidUtf8,

    #[error("Unknown event type: {0}")]
    UnknownKind(i64),
}
