//! Error types.
//!
//! Two layers:
//!
//! - [`ChatError`] is the failure taxonomy of a single streamed turn. It never
//!   crosses the streaming boundary as a `Result`; it travels inside
//!   [`StreamEvent::Error`](crate::session::StreamEvent::Error) so the caller can
//!   still render whatever partial text arrived first.
//! - [`StudioError`] covers everything outside a stream: configuration, history
//!   import/export and the backend status endpoints.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Why a streamed turn ended without completing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// HTTP 503: the backend is busy or still loading a model. Retryable.
    #[error("model busy or loading: {message}")]
    Busy { message: String },

    /// Any other non-2xx response.
    #[error("backend returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Connection failure, broken body or similar transport-level problem.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ChatError {
    /// True for the "busy/loading" condition a caller may retry after polling health.
    pub fn is_busy(&self) -> bool {
        matches!(self, ChatError::Busy { .. })
    }
}

/// Crate-level error for configuration, transcripts and backend calls.
#[derive(Debug, Error)]
pub enum StudioError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("unknown persona '{0}' (expected one of: default, coder, creative, english)")]
    UnknownPersona(String),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("history is empty, nothing to export")]
    EmptyHistory,

    #[error("backend not ready after {0:?}")]
    NotReady(Duration),
}

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, StudioError>;
