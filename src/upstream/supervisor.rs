//! Outbound connection supervisor.
//!
//! Owns the authoritative map of upstream connections, drives the per-server
//! state machine (AwaitingConnection → Connecting → Connected, with
//! backoff-retried Error states), runs the periodic liveness probe, and
//! publishes typed events to subscribers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::backoff::RestartBackoff;
use super::client::UpstreamClient;
use super::connection::{ConnectionStatus, OutboundConnection, ServerHandle};
use super::transport::Connector;
use crate::config::ServerDescriptor;
use crate::error::{ProxyError, ProxyResult};

const GRACEFUL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
const HEALTH_STRIKE_LIMIT: u8 = 2;
const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StatusChanged {
        server: String,
        old: ConnectionStatus,
        new: ConnectionStatus,
    },
    ServerCapabilitiesUpdated {
        server: String,
    },
    ServerRemoved {
        server: String,
    },
    ReloadCompleted {
        succeeded: Vec<String>,
        failed: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub total: usize,
    pub connected: usize,
    pub connecting: usize,
    pub errored: usize,
    pub total_retries: u64,
}

pub struct UpstreamSupervisor {
    servers: DashMap<String, Arc<ServerHandle>>,
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<SupervisorEvent>,
    capability_version: AtomicU64,
}

impl UpstreamSupervisor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            servers: DashMap::new(),
            connector,
            events,
            capability_version: AtomicU64::new(0),
        }
    }

    /// Events are dropped for subscribers that lag behind the channel bound.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn has(&self, name: &str) -> bool {
        self.servers.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<OutboundConnection> {
        self.servers.get(name).map(|handle| handle.snapshot())
    }

    /// Snapshots ordered by internal key.
    pub fn entries(&self) -> Vec<OutboundConnection> {
        let mut entries: Vec<OutboundConnection> = self
            .servers
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Live client handle for a Connected server.
    pub fn client(&self, name: &str) -> Option<Arc<UpstreamClient>> {
        let handle = self.servers.get(name)?;
        let state = handle.state.lock();
        if state.status == ConnectionStatus::Connected {
            state.client.clone()
        } else {
            None
        }
    }

    /// Clients of every Connected server, ordered by internal key.
    pub fn connected_clients(&self) -> Vec<(String, Arc<UpstreamClient>)> {
        let mut clients: Vec<(String, Arc<UpstreamClient>)> = self
            .servers
            .iter()
            .filter_map(|entry| {
                let state = entry.value().state.lock();
                if state.status == ConnectionStatus::Connected {
                    state
                        .client
                        .clone()
                        .map(|client| (entry.key().clone(), client))
                } else {
                    None
                }
            })
            .collect();
        clients.sort_by(|a, b| a.0.cmp(&b.0));
        clients
    }

    /// Resolve a clean configured name to the internal map key. Template
    /// instances are keyed `name:<hash>`; a direct hit wins.
    pub fn resolve_name(&self, clean: &str) -> Option<String> {
        if self.servers.contains_key(clean) {
            return Some(clean.to_string());
        }
        let prefix = format!("{clean}:");
        self.servers
            .iter()
            .map(|entry| entry.key().clone())
            .find(|key| key.starts_with(&prefix))
    }

    /// Register a server and schedule its first connection attempt.
    pub fn add(self: &Arc<Self>, descriptor: ServerDescriptor) -> ProxyResult<()> {
        let key = descriptor.name.clone();
        self.add_keyed(key, descriptor)
    }

    /// Instantiate a template under a session-scoped `name:<hash>` key.
    pub fn add_from_template(
        self: &Arc<Self>,
        descriptor: ServerDescriptor,
        session_seed: &str,
    ) -> ProxyResult<String> {
        let mut hasher = DefaultHasher::new();
        descriptor.name.hash(&mut hasher);
        session_seed.hash(&mut hasher);
        let key = format!("{}:{:08x}", descriptor.name, hasher.finish() as u32);
        self.add_keyed(key.clone(), descriptor)?;
        Ok(key)
    }

    fn add_keyed(self: &Arc<Self>, key: String, descriptor: ServerDescriptor) -> ProxyResult<()> {
        if self.servers.contains_key(&key) {
            return Err(ProxyError::Validation(format!(
                "server '{key}' is already registered"
            )));
        }
        let handle = ServerHandle::new(key.clone(), descriptor);
        self.servers.insert(key, Arc::clone(&handle));
        self.spawn_connect(handle);
        Ok(())
    }

    /// Close and drop a server. In-flight attempts are cancelled first; a
    /// graceful remove waits up to five seconds for the transport to close.
    pub async fn remove(&self, name: &str, graceful: bool) -> ProxyResult<()> {
        let (_, handle) = self
            .servers
            .remove(name)
            .ok_or_else(|| ProxyError::server_not_found(name))?;
        handle.cancel.cancel();
        // Wait out any transition currently holding the lock.
        let _transition = handle.transition.lock().await;

        let client = handle.state.lock().client.take();
        if let Some(client) = client {
            if graceful {
                let close = UpstreamClient::close_shared(client, name);
                if tokio::time::timeout(GRACEFUL_CLOSE_TIMEOUT, close).await.is_err() {
                    warn!("graceful close of '{name}' timed out, forcing shutdown");
                }
            }
        }

        self.set_status(&handle, ConnectionStatus::Disconnected);
        self.emit(SupervisorEvent::ServerRemoved {
            server: name.to_string(),
        });
        info!("removed server '{name}'");
        Ok(())
    }

    /// Atomically swap a server's descriptor: graceful remove, then re-add.
    /// Also the recovery path for servers stuck in Error with exhausted retries.
    pub async fn replace(self: &Arc<Self>, name: &str, descriptor: ServerDescriptor) -> ProxyResult<()> {
        match self.remove(name, true).await {
            Ok(()) => {}
            Err(ProxyError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.add_keyed(name.to_string(), descriptor)
    }

    /// In-place tag update; the connection is untouched.
    pub fn update_tags(&self, name: &str, tags: Vec<String>) -> ProxyResult<()> {
        let handle = self
            .servers
            .get(name)
            .ok_or_else(|| ProxyError::server_not_found(name))?;
        handle.state.lock().descriptor.tags = tags;
        drop(handle);
        self.emit(SupervisorEvent::ServerCapabilitiesUpdated {
            server: name.to_string(),
        });
        Ok(())
    }

    pub fn stats(&self) -> SupervisorStats {
        let mut stats = SupervisorStats::default();
        for entry in self.servers.iter() {
            let state = entry.value().state.lock();
            stats.total += 1;
            stats.total_retries += u64::from(state.retries);
            match state.status {
                ConnectionStatus::Connected => stats.connected += 1,
                ConnectionStatus::Connecting | ConnectionStatus::AwaitingConnection => {
                    stats.connecting += 1
                }
                ConnectionStatus::Error => stats.errored += 1,
                ConnectionStatus::Disconnected => {}
            }
        }
        stats
    }

    /// Gracefully close every connection.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Err(e) = self.remove(&name, true).await {
                warn!("shutdown of '{name}': {e}");
            }
        }
    }

    /// Emit the reload-completed event on behalf of the reload controller.
    pub fn publish_reload_completed(&self, succeeded: Vec<String>, failed: Vec<(String, String)>) {
        self.emit(SupervisorEvent::ReloadCompleted { succeeded, failed });
    }

    /// Periodic liveness probe over idle Connected servers. Two consecutive
    /// failures push the server to Error and schedule a reconnect.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                supervisor.run_health_pass().await;
            }
        })
    }

    /// One probe sweep. Public so reload/health behavior is testable without
    /// waiting on the timer.
    pub async fn run_health_pass(self: &Arc<Self>) {
        let handles: Vec<Arc<ServerHandle>> = self
            .servers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        for handle in handles {
            let (client, timeout) = {
                let state = handle.state.lock();
                if state.status != ConnectionStatus::Connected {
                    continue;
                }
                (state.client.clone(), state.descriptor.timeout())
            };
            let Some(client) = client else { continue };

            let healthy = matches!(
                tokio::time::timeout(timeout, client.probe()).await,
                Ok(Ok(()))
            );
            if healthy {
                handle.state.lock().health_strikes = 0;
                continue;
            }

            let strikes = {
                let mut state = handle.state.lock();
                state.health_strikes += 1;
                state.health_strikes
            };
            warn!(
                "health probe failed for '{}' ({strikes}/{HEALTH_STRIKE_LIMIT})",
                handle.name
            );
            if strikes >= HEALTH_STRIKE_LIMIT {
                {
                    let mut state = handle.state.lock();
                    state.client = None;
                    state.last_error = Some("health probe failed twice".to_string());
                    state.health_strikes = 0;
                    state.retries = 0;
                }
                self.set_status(&handle, ConnectionStatus::Error);
                self.spawn_connect(Arc::clone(&handle));
            }
        }
    }

    fn spawn_connect(self: &Arc<Self>, handle: Arc<ServerHandle>) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            supervisor.run_connect_loop(handle).await;
        });
    }

    /// Connection attempt chain for one server. The transition lock guarantees
    /// a single in-flight Connecting per server.
    async fn run_connect_loop(&self, handle: Arc<ServerHandle>) {
        let _transition = handle.transition.lock().await;
        loop {
            if handle.cancel.is_cancelled() {
                return;
            }
            let descriptor = handle.state.lock().descriptor.clone();
            self.set_status(&handle, ConnectionStatus::Connecting);

            let attempt = self.connector.connect(&descriptor);
            let result = tokio::select! {
                _ = handle.cancel.cancelled() => return,
                result = attempt => result,
            };

            match result {
                Ok(client) => {
                    let version = self.capability_version.fetch_add(1, Ordering::SeqCst) + 1;
                    {
                        let mut state = handle.state.lock();
                        state.client = Some(Arc::new(client));
                        state.last_error = None;
                        state.health_strikes = 0;
                        state.capability_versions.push(version);
                    }
                    self.set_status(&handle, ConnectionStatus::Connected);
                    self.emit(SupervisorEvent::ServerCapabilitiesUpdated {
                        server: handle.name.clone(),
                    });
                    return;
                }
                Err(e) => {
                    debug!("connect attempt for '{}' failed: {e}", handle.name);
                    {
                        let mut state = handle.state.lock();
                        state.last_error = Some(e.to_string());
                    }
                    self.set_status(&handle, ConnectionStatus::Error);

                    let (restart, retries, max_restarts, base_delay) = {
                        let state = handle.state.lock();
                        (
                            state.descriptor.restart_on_exit,
                            state.retries,
                            state.descriptor.max_restarts,
                            state.descriptor.restart_delay_ms,
                        )
                    };
                    if !restart || retries >= max_restarts {
                        warn!(
                            "server '{}' stays in error after {retries} retries: {e}",
                            handle.name
                        );
                        return;
                    }
                    let delay =
                        RestartBackoff::new(Duration::from_millis(base_delay)).delay(retries);
                    handle.state.lock().retries = retries + 1;
                    tokio::select! {
                        _ = handle.cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn set_status(&self, handle: &ServerHandle, new: ConnectionStatus) {
        let old = {
            let mut state = handle.state.lock();
            let old = state.status;
            if old == new {
                return;
            }
            state.status = new;
            old
        };
        debug!("server '{}' {old} -> {new}", handle.name);
        self.emit(SupervisorEvent::StatusChanged {
            server: handle.name.clone(),
            old,
            new,
        });
    }

    fn emit(&self, event: SupervisorEvent) {
        // No receivers is fine; lagging receivers observe RecvError::Lagged.
        let _ = self.events.send(event);
    }
}
