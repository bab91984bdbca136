//! Error types for the blocklayer library.
//!
//! All fallible operations return [`Result<T>`], an alias for
//! `Result<T, LayerError>`.
//!
//! # Error Categories
//!
//! - **Configuration**: [`DescriptorNotFound`], [`DescriptorCorrupt`],
//!   [`InvalidUrl`], [`MarkerUnreadable`] — a descriptor or marker file is
//!   missing or malformed. Never retried, surfaced immediately.
//! - **Provisioning timeout**: [`DeviceNotReady`] — a bounded poll against
//!   kernel-published state was exhausted. Carries the stage reached; not
//!   retried by this library.
//! - **External tools**: [`ExternalTool`] — a collaborator executable exited
//!   non-zero. Fatal, carries the captured combined output.
//! - **System**: [`Io`].
//!
//! Teardown failures are deliberately *not* part of [`LayerError`]: unwinding
//! a partially provisioned device is best-effort and must never mask the
//! error that triggered it, so those travel separately as
//! [`TeardownWarning`]s inside [`AcquireError`].
//!
//! [`DescriptorNotFound`]: LayerError::DescriptorNotFound
//! [`DescriptorCorrupt`]: LayerError::DescriptorCorrupt
//! [`InvalidUrl`]: LayerError::InvalidUrl
//! [`MarkerUnreadable`]: LayerError::MarkerUnreadable
//! [`DeviceNotReady`]: LayerError::DeviceNotReady
//! [`ExternalTool`]: LayerError::ExternalTool
//! [`Io`]: LayerError::Io

use std::{path::PathBuf, process::ExitStatus};

/// Result type alias for operations that may return a [`LayerError`].
pub type Result<T> = std::result::Result<T, LayerError>;

/// Error types for layer storage operations.
#[derive(Debug, thiserror::Error)]
pub enum LayerError {
    /// No descriptor file exists for the layer.
    #[error("layer descriptor not found in {0:?}")]
    DescriptorNotFound(PathBuf),

    /// A descriptor file exists but does not match the schema.
    #[error("layer descriptor in {dir:?} is corrupt")]
    DescriptorCorrupt {
        dir: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A content-address URL marker could not be parsed.
    #[error("can't parse content address from url {url}: {reason}")]
    InvalidUrl { url: String, reason: &'static str },

    /// A required marker file is missing or unreadable.
    #[error("marker file {path:?} is missing or unreadable")]
    MarkerUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A bounded poll for kernel-published device state was exhausted.
    #[error("device not ready: no {stage} after {attempts} attempts")]
    DeviceNotReady { stage: &'static str, attempts: u32 },

    /// An external collaborator executable exited non-zero.
    #[error("{tool} failed ({status}): {output}")]
    ExternalTool {
        tool: String,
        status: ExitStatus,
        output: String,
    },

    /// I/O error during file, configfs or mount operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A single best-effort teardown step that failed while unwinding a partially
/// provisioned device. Logged and reported, never propagated as the primary
/// error.
#[derive(Debug, thiserror::Error)]
#[error("teardown of {path:?} failed: {source}")]
pub struct TeardownWarning {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Failure of a device acquisition, together with the outcome of the
/// automatic unwind that ran before the error was returned.
///
/// The triggering error is always `error`; `teardown` records the steps of
/// the unwind that themselves failed (empty when cleanup was complete).
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct AcquireError {
    #[source]
    pub error: LayerError,
    pub teardown: Vec<TeardownWarning>,
}
