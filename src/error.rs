//! Error taxonomy and flat status-code mapping.
//!
//! Every fallible operation in the crate returns [`EngineError`] through the
//! crate-level [`Result`] alias. Each variant corresponds to exactly one
//! integer status code so embedders that re-export the engine through a flat
//! ABI can translate errors without inspecting messages.

use std::path::PathBuf;
use thiserror::Error;

/// Crate-level result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Status code returned for a successful call.
pub const STATUS_SUCCESS: i32 = 0;

/// Top-level error type for all engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A caller-supplied argument was rejected. State is never mutated.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The model file could not be read. The model remains unloaded.
    #[error("file access failed for {path}: {source}")]
    FileAccess {
        /// Path as given by the caller.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The container declares a format version this build does not support.
    #[error("unsupported container version {found} (supported: {supported})")]
    InvalidVersion {
        /// Version field from the container header.
        found: u32,
        /// Versions this build accepts.
        supported: &'static str,
    },

    /// The container is structurally invalid or truncated.
    #[error("broken model container: {0}")]
    Broken(String),

    /// An allocation request could not be satisfied.
    #[error("memory insufficient: {0}")]
    MemoryInsufficient(String),

    /// A worker thread could not be created.
    #[error("thread creation failed: {0}")]
    Thread(String),

    /// An API call arrived in a state that does not permit it. No mutation
    /// occurs.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The rendered token sequence exceeds the context capacity. The session
    /// remains in its pre-call state.
    #[error("context full: {needed} tokens exceed capacity {capacity}")]
    ContextFull {
        /// Tokens the operation would require.
        needed: usize,
        /// Session context capacity.
        capacity: usize,
    },

    /// The requested feature is not available in this build.
    #[error("unimplemented: {0}")]
    Unimplemented(String),

    /// Fallback for errors outside the fixed taxonomy.
    #[error("error: {0}")]
    Other(String),
}

impl EngineError {
    /// The flat ABI status code for this error kind.
    ///
    /// Zero is reserved for success ([`STATUS_SUCCESS`]); every error maps to
    /// a distinct negative value.
    pub fn status_code(&self) -> i32 {
        match self {
            EngineError::InvalidArgument(_) => -1,
            EngineError::FileAccess { .. } => -2,
            EngineError::InvalidVersion { .. } => -3,
            EngineError::Broken(_) => -4,
            EngineError::MemoryInsufficient(_) => -5,
            EngineError::Thread(_) => -6,
            EngineError::InvalidState(_) => -7,
            EngineError::ContextFull { .. } => -8,
            EngineError::Unimplemented(_) => -15,
            EngineError::Other(_) => -128,
        }
    }

    /// Whether the caller can retry after fixing its input, without having to
    /// rebuild the session.
    pub fn is_caller_fixable(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidArgument(_)
                | EngineError::InvalidState(_)
                | EngineError::ContextFull { .. }
        )
    }
}
