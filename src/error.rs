//! Error taxonomy for the bridge.
//!
//! Rust callers see these as ordinary `Result` errors. The `extern "C"` entry
//! points in `runtime::stubs` never surface them directly: they return the
//! native sentinel (null handle or `-1`) and park the error in the bridge's
//! last-error slot.

use std::path::PathBuf;

use thiserror::Error;

use crate::runtime::heap::HeapPtr;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("no object is bound to handle {0:?}")]
    UnknownHandle(HeapPtr),

    #[error("no module named '{0}'")]
    UnknownModule(String),

    #[error("object at {handle:?} is not a {expected}")]
    TypeMismatch {
        handle: HeapPtr,
        expected: &'static str,
    },

    #[error("emulated heap exhausted while allocating {size} bytes")]
    AllocationFailure { size: usize },

    #[error("native call failed: {0}")]
    ForeignCallFailure(String),

    #[error("refcount of {0:?} is already zero")]
    BadRefCount(HeapPtr),

    #[error("handle {0:?} is already bound")]
    AlreadyBound(HeapPtr),

    #[error("attribute '{attr}' of module '{module}' is read-only")]
    ReadOnlyAttribute { module: String, attr: String },

    #[error("{0}")]
    Argument(String),

    #[error("cannot import '{0}'")]
    Import(String),

    #[error("bootstrap snippet line {line}: cannot execute `{text}`")]
    Snippet { line: usize, text: String },

    #[error("bridge has been disposed")]
    Disposed,

    #[error("invalid config {path:?}: {message}")]
    Config {
        path: Option<PathBuf>,
        message: String,
    },
}

impl BridgeError {
    /// Whether this error is one of the lookup failures (unknown handle or name).
    pub fn is_lookup(&self) -> bool {
        matches!(self, Self::UnknownHandle(_) | Self::UnknownModule(_))
    }
}

/// Status code returned to native callers on success.
pub const STATUS_OK: libc::c_int = 0;
/// Status code returned to native callers on failure.
pub const STATUS_FAILED: libc::c_int = -1;
