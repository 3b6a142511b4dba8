//! Proxy error types.
//!
//! One enum covers the whole error taxonomy: validation, lookup misses,
//! upstream failures, handshake failures, configuration and persistence
//! problems. Each variant maps to a stable wire-visible kind string.

use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// An argument failed its declared schema. Surfaced to the caller, never retried.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced server, tool, session, or preset does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A connected upstream returned an error or timed out.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Transport handshake or session restoration failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Malformed configuration. The previous generation is retained.
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Session or preset state could not be written.
    #[error("Persistence failed: {0}")]
    PersistenceFailed(String),

    /// Unexpected internal failure. Converted to `upstream` on the wire.
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Sdk(#[from] Box<rmcp::RmcpError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl ProxyError {
    /// Stable kind string for logs and structured error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ProxyError::Validation(_) => "validation",
            ProxyError::NotFound(_) => "not_found",
            ProxyError::Upstream(_) => "upstream",
            ProxyError::ConnectionFailed(_) => "connection_failed",
            ProxyError::ConfigInvalid(_) => "config_invalid",
            ProxyError::PersistenceFailed(_) => "persistence_failed",
            ProxyError::Internal(_) | ProxyError::Sdk(_) | ProxyError::Io(_)
            | ProxyError::Http(_) => "internal",
        }
    }

    /// Kind string as seen by downstream callers. `internal` never crosses
    /// the wire; it degrades to `upstream`.
    pub fn wire_kind(&self) -> &'static str {
        match self.kind() {
            "internal" => "upstream",
            kind => kind,
        }
    }

    /// Rebuild an owned error with the same kind and message.
    ///
    /// Coalesced cache loads hand one failure to many waiters; the transparent
    /// variants are not `Clone`, so those collapse to their message under the
    /// same kind.
    pub fn duplicate(&self) -> ProxyError {
        match self {
            ProxyError::Validation(m) => ProxyError::Validation(m.clone()),
            ProxyError::NotFound(m) => ProxyError::NotFound(m.clone()),
            ProxyError::Upstream(m) => ProxyError::Upstream(m.clone()),
            ProxyError::ConnectionFailed(m) => ProxyError::ConnectionFailed(m.clone()),
            ProxyError::ConfigInvalid(m) => ProxyError::ConfigInvalid(m.clone()),
            ProxyError::PersistenceFailed(m) => ProxyError::PersistenceFailed(m.clone()),
            ProxyError::Internal(m) => ProxyError::Internal(m.clone()),
            other => ProxyError::Internal(other.to_string()),
        }
    }

    pub fn server_not_found(name: &str) -> ProxyError {
        ProxyError::NotFound(format!("server '{name}'"))
    }

    pub fn tool_not_found(server: &str, tool: &str) -> ProxyError {
        ProxyError::NotFound(format!("tool '{server}:{tool}'"))
    }

    pub fn session_not_found(id: &str) -> ProxyError {
        ProxyError::NotFound(format!("session '{id}'"))
    }

    pub fn preset_not_found(name: &str) -> ProxyError {
        ProxyError::NotFound(format!("preset '{name}'"))
    }
}
