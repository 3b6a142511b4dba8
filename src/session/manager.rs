//! Inbound session lifecycle.
//!
//! Creates, looks up, restores, and deletes downstream sessions. The live map
//! is always consulted first; only a miss falls through to the persistence
//! layer, which drives restoration by replaying the persisted initialize
//! response onto a fresh transport.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use std::collections::BTreeSet;

use super::persistence::{PersistedSession, SessionStore};
use super::transport::InboundTransport;
use crate::context::ContextData;
use crate::error::{ProxyError, ProxyResult};
use crate::presets::PresetStore;
use crate::tags::TagIndex;

pub const PRESET_ENV_VAR: &str = "ONE_MCP_PRESET";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Raw tag filter for this session.
    pub tags: Vec<String>,
    /// Preset admission filter; falls back to `ONE_MCP_PRESET` when unset.
    pub preset_name: Option<String>,
    pub enable_pagination: bool,
}

#[derive(Debug)]
pub struct InboundSession {
    pub id: String,
    pub config: SessionConfig,
    pub context: Option<ContextData>,
    pub transport: Arc<InboundTransport>,
    last_access: Mutex<DateTime<Utc>>,
}

impl InboundSession {
    fn new(
        id: String,
        config: SessionConfig,
        context: Option<ContextData>,
        transport: Arc<InboundTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            config,
            context,
            transport,
            last_access: Mutex::new(Utc::now()),
        })
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Utc::now();
    }

    pub fn last_access(&self) -> DateTime<Utc> {
        *self.last_access.lock()
    }
}

#[derive(Debug)]
pub struct CreatedSession {
    pub session: Arc<InboundSession>,
    pub persisted: bool,
    /// Set when the session is live but its metadata could not be written.
    pub persistence_error: Option<String>,
}

pub struct SessionManager {
    sessions: Arc<DashMap<String, Arc<InboundSession>>>,
    store: Arc<SessionStore>,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            store: Arc::new(store),
        }
    }

    pub fn generate_id() -> String {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        format!("stream-{}", &hex[..16])
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<InboundSession>> {
        let session = self.sessions.get(id).map(|s| Arc::clone(s.value()))?;
        session.touch();
        Some(session)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Create a session with a fresh transport. Persistence failure does not
    /// fail the creation; the caller gets a hint instead.
    pub async fn create_session(
        &self,
        mut config: SessionConfig,
        context: Option<ContextData>,
        id: Option<String>,
        initialize_response: Value,
    ) -> ProxyResult<CreatedSession> {
        let id = match id {
            Some(id) => {
                if id.trim().is_empty() {
                    return Err(ProxyError::Validation(
                        "session id must not be empty or whitespace".to_string(),
                    ));
                }
                id
            }
            None => Self::generate_id(),
        };
        if self.sessions.contains_key(&id) {
            return Err(ProxyError::Validation(format!(
                "session '{id}' already exists"
            )));
        }

        if config.preset_name.is_none() {
            if let Ok(preset) = std::env::var(PRESET_ENV_VAR) {
                if !preset.trim().is_empty() {
                    debug!("session '{id}' picks preset '{preset}' from {PRESET_ENV_VAR}");
                    config.preset_name = Some(preset);
                }
            }
        }

        let transport = InboundTransport::new(id.clone());
        transport.initialize(initialize_response.clone())?;
        self.wire_close_hook(&transport);

        let session = InboundSession::new(id.clone(), config.clone(), context.clone(), transport);
        self.sessions.insert(id.clone(), Arc::clone(&session));

        let persisted = PersistedSession {
            session_id: id.clone(),
            tags: config.tags,
            enable_pagination: config.enable_pagination,
            context,
            initialize_response,
            preset_name: config.preset_name,
        };
        let (persisted, persistence_error) = match self.store.save(&persisted).await {
            Ok(()) => (true, None),
            Err(e) => {
                warn!("session '{id}' created but not persisted: {e}");
                (false, Some(e.to_string()))
            }
        };

        info!("created session '{id}'");
        Ok(CreatedSession {
            session,
            persisted,
            persistence_error,
        })
    }

    /// Look up a live session or restore one from disk. The restored
    /// transport reaches initialized state through a virtual initialize.
    pub async fn restore_session(&self, id: &str) -> ProxyResult<Arc<InboundSession>> {
        if id.trim().is_empty() {
            return Err(ProxyError::session_not_found(id));
        }
        if let Some(session) = self.get_session(id) {
            return Ok(session);
        }

        let persisted = self
            .store
            .load(id)
            .await?
            .ok_or_else(|| ProxyError::session_not_found(id))?;

        let transport = InboundTransport::new(id);
        transport.replay_initialize(&persisted.initialize_response)?;
        self.wire_close_hook(&transport);

        let session = InboundSession::new(
            id.to_string(),
            SessionConfig {
                tags: persisted.tags,
                preset_name: persisted.preset_name,
                enable_pagination: persisted.enable_pagination,
            },
            persisted.context,
            transport,
        );
        self.sessions.insert(id.to_string(), Arc::clone(&session));
        info!("restored session '{id}'");
        Ok(session)
    }

    /// Drop a session everywhere: live map, transport, and disk.
    pub async fn delete_session(&self, id: &str) -> ProxyResult<()> {
        let live = self.sessions.remove(id).map(|(_, session)| session);
        if let Some(session) = &live {
            session.transport.close();
        }
        let stored = self.store.delete(id).await?;
        if live.is_none() && !stored {
            return Err(ProxyError::session_not_found(id));
        }
        info!("deleted session '{id}'");
        Ok(())
    }

    /// Session ids recoverable from disk (live or not).
    pub async fn persisted_sessions(&self) -> ProxyResult<Vec<String>> {
        self.store.list().await
    }

    /// The upstreams this session may see: preset filter first, then the raw
    /// tag filter (any-tag match), otherwise everything.
    pub fn admissible_servers(
        config: &SessionConfig,
        presets: &PresetStore,
        index: &TagIndex,
    ) -> ProxyResult<BTreeSet<String>> {
        if let Some(preset) = &config.preset_name {
            let query = presets.resolve_to_expression(preset)?;
            return Ok(index.evaluate(&query));
        }
        if !config.tags.is_empty() {
            return Ok(index.by_any_tag(&config.tags));
        }
        Ok(index.server_names().clone())
    }

    /// Transport close drops the live entry; the file stays for one
    /// reconnection cycle.
    fn wire_close_hook(&self, transport: &Arc<InboundTransport>) {
        let sessions = Arc::clone(&self.sessions);
        transport.set_on_close(move |id| {
            if sessions.remove(id).is_some() {
                debug!("session '{id}' removed after transport close");
            }
        });
    }
}
