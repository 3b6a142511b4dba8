//! Inbound session lifecycle with persisted, resumable state.

pub mod manager;
pub mod persistence;
pub mod transport;

pub use manager::{
    CreatedSession, InboundSession, SessionConfig, SessionManager, PRESET_ENV_VAR,
};
pub use persistence::{PersistedSession, SessionStore};
pub use transport::InboundTransport;
