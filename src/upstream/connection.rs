//! Outbound connection state.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::client::UpstreamClient;
use crate::config::ServerDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    AwaitingConnection,
    Connecting,
    Connected,
    Error,
    Disconnected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::AwaitingConnection => "awaiting-connection",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Disconnected => "disconnected",
        };
        f.write_str(label)
    }
}

/// Public snapshot of one supervised connection.
#[derive(Debug, Clone)]
pub struct OutboundConnection {
    /// Internal map key (`clean-name` or `template:hash`).
    pub name: String,
    pub descriptor: ServerDescriptor,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub retries: u32,
    /// Monotonic versions observed across capability refreshes.
    pub capability_versions: Vec<u64>,
}

pub(crate) struct ServerState {
    pub descriptor: ServerDescriptor,
    pub status: ConnectionStatus,
    pub last_error: Option<String>,
    pub retries: u32,
    pub client: Option<Arc<UpstreamClient>>,
    pub capability_versions: Vec<u64>,
    pub health_strikes: u8,
}

/// Per-server handle. Async transitions serialize on `transition`; the state
/// mutex only guards short field accesses.
pub(crate) struct ServerHandle {
    pub name: String,
    pub state: Mutex<ServerState>,
    pub transition: tokio::sync::Mutex<()>,
    pub cancel: CancellationToken,
}

impl ServerHandle {
    pub fn new(name: String, descriptor: ServerDescriptor) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(ServerState {
                descriptor,
                status: ConnectionStatus::AwaitingConnection,
                last_error: None,
                retries: 0,
                client: None,
                capability_versions: Vec::new(),
                health_strikes: 0,
            }),
            transition: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn snapshot(&self) -> OutboundConnection {
        let state = self.state.lock();
        OutboundConnection {
            name: self.name.clone(),
            descriptor: state.descriptor.clone(),
            status: state.status,
            last_error: state.last_error.clone(),
            retries: state.retries,
            capability_versions: state.capability_versions.clone(),
        }
    }
}
