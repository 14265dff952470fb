//! Incremental text generation over GGUF models.
//!
//! The crate exposes a single-session, pull-based generation API: load a
//! model, set a chat prompt, then call [`LlmSession::generate`] once per
//! token, reading each step's text delta between calls. All state lives in
//! the session handle, so the caller decides the pace and generation can be
//! suspended indefinitely between steps.
//!
//! ```no_run
//! use llm_session::{ChatMessage, LlmSession};
//!
//! # fn main() -> llm_session::Result<()> {
//! let mut session = LlmSession::create(0);
//! session.open_model_file("model.gguf")?;
//! session.set_prompt(&[ChatMessage::user("Tell me about rabbits.")])?;
//!
//! loop {
//!     let done = session.generate()?;
//!     print!("{}", session.delta_text()?);
//!     if done {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod sampling;
pub mod session;
pub mod tokenizer;

mod utils;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use backend::{backend_count, backend_name, Backend, BackendKind};
pub use config::{SamplingParams, SessionConfig};
pub use error::{EngineError, Result, STATUS_SUCCESS};
pub use metrics::MetricsSnapshot;
pub use model::Model;
pub use session::{LlmSession, SessionState};
pub use tokenizer::{ChatMessage, Tokenizer};
pub use utils::logging::{setup_logging, LogConfig};
