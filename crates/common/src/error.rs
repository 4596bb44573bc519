//! Common error types

use thiserror::Error;

/// Errors surfaced by the device monitor to its callers.
///
/// A refused or unissuable permission prompt is reported through
/// `on_cancel`, never as an `Error`. `PermissionDenied` only appears on
/// direct open calls made without a grant.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation attempted after `destroy()`, or a registry operation while unregistered.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Permission denied for device {0}")]
    PermissionDenied(String),

    /// Operation on a control block that has already been closed.
    #[error("Control block already closed")]
    Closed,

    #[error("USB host error: {0}")]
    Host(#[from] HostError),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by the host platform primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("device not found or already removed")]
    NoDevice,

    #[error("access denied")]
    Access,

    #[error("resource busy")]
    Busy,

    #[error("operation not supported by the host")]
    NotSupported,

    #[error("operation timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}
