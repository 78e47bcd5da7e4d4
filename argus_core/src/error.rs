//! Unified error handling for Argus.
//!
//! Every public operation in this crate returns an [`ArgusResult`]; no
//! panics cross the library boundary. The taxonomy mirrors what callers
//! need to react to: bad arguments and bad lifecycle state are caller
//! bugs, invalid buffers are per-call data problems, backend failures
//! carry the vendor's native code and are never retried here.

use thiserror::Error;

use crate::types::BackendClass;

/// Main error type for Argus operations.
#[derive(Debug, Error)]
pub enum ArgusError {
    /// Null or invalid caller-supplied parameter.
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// Operation not legal in the current component or session state.
    #[error("bad state: {0}")]
    BadState(String),

    /// Buffer shape/format/size mismatch detected at execute or register time.
    #[error("invalid buffer: {0}")]
    InvalidBuffer(String),

    /// The vendor library or remote channel reported failure.
    /// `code` is the backend's native error code, passed through unchanged.
    #[error("backend {backend} error {code:#x}: {message}")]
    Backend {
        backend: BackendClass,
        code: i32,
        message: String,
    },

    /// Configuration parsing or validation errors.
    #[error("configuration error: {0}")]
    Config(String),

    /// The requested backend or pipeline is not compiled in / not available.
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl ArgusError {
    /// Create a bad-arguments error.
    pub fn bad_args<S: Into<String>>(msg: S) -> Self {
        ArgusError::BadArguments(msg.into())
    }

    /// Create a bad-state error.
    pub fn bad_state<S: Into<String>>(msg: S) -> Self {
        ArgusError::BadState(msg.into())
    }

    /// Create an invalid-buffer error.
    pub fn invalid_buffer<S: Into<String>>(msg: S) -> Self {
        ArgusError::InvalidBuffer(msg.into())
    }

    /// Create a backend error carrying the vendor's native code.
    pub fn backend<S: Into<String>>(backend: BackendClass, code: i32, message: S) -> Self {
        ArgusError::Backend {
            backend,
            code,
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        ArgusError::Config(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        ArgusError::Unsupported(msg.into())
    }

    /// True for errors detected before any backend call (no side effects).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ArgusError::BadArguments(_)
                | ArgusError::BadState(_)
                | ArgusError::InvalidBuffer(_)
                | ArgusError::Config(_)
        )
    }
}

/// Convenience type alias for Results using ArgusError.
pub type ArgusResult<T> = std::result::Result<T, ArgusError>;

/// Short alias — `Result<T>` is equivalent to `ArgusResult<T>`.
pub type Result<T> = ArgusResult<T>;
