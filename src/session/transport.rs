//! Inbound session transport.
//!
//! Channel-backed duplex handle between the proxy and one downstream client.
//! The HTTP/stdio framing lives outside this crate; this type guarantees
//! in-order single-consumer delivery, tracks initialize state, and lets a
//! restored session replay a persisted initialize response to reach the
//! initialized state without a live handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};

const OUTGOING_BUFFER: usize = 64;

type CloseHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct InboundTransport {
    session_id: String,
    outgoing_tx: mpsc::Sender<Value>,
    outgoing_rx: Mutex<Option<mpsc::Receiver<Value>>>,
    initialize_response: Mutex<Option<Value>>,
    restored: AtomicBool,
    closed: AtomicBool,
    on_close: Mutex<Option<CloseHook>>,
}

impl std::fmt::Debug for InboundTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundTransport")
            .field("session_id", &self.session_id)
            .field("initialize_response", &self.initialize_response)
            .field("restored", &self.restored)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl InboundTransport {
    pub fn new(session_id: impl Into<String>) -> Arc<Self> {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_BUFFER);
        Arc::new(Self {
            session_id: session_id.into(),
            outgoing_tx,
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            initialize_response: Mutex::new(None),
            restored: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            on_close: Mutex::new(None),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Receiver half for the single downstream consumer. The first caller
    /// takes it; messages arrive in send order.
    pub fn take_outgoing(&self) -> Option<mpsc::Receiver<Value>> {
        self.outgoing_rx.lock().take()
    }

    /// Record the initialize response produced for this session.
    pub fn initialize(&self, response: Value) -> ProxyResult<()> {
        let mut slot = self.initialize_response.lock();
        if slot.is_some() {
            return Err(ProxyError::Validation(format!(
                "session '{}' is already initialized",
                self.session_id
            )));
        }
        *slot = Some(response);
        Ok(())
    }

    /// Bring a fresh transport to initialized state from a persisted
    /// initialize response (the virtual initialize of session restoration).
    pub fn replay_initialize(&self, persisted: &Value) -> ProxyResult<()> {
        let valid = persisted
            .as_object()
            .map(|o| o.contains_key("protocolVersion") && o.contains_key("capabilities"))
            .unwrap_or(false);
        if !valid {
            return Err(ProxyError::ConnectionFailed(format!(
                "session '{}': persisted initialize response is unusable",
                self.session_id
            )));
        }
        self.initialize(persisted.clone())?;
        self.restored.store(true, Ordering::SeqCst);
        debug!("session '{}' restored via virtual initialize", self.session_id);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialize_response.lock().is_some()
    }

    pub fn is_restored(&self) -> bool {
        self.restored.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn initialize_response(&self) -> Option<Value> {
        self.initialize_response.lock().clone()
    }

    /// Queue a message for the downstream consumer, in order.
    pub async fn send(&self, message: Value) -> ProxyResult<()> {
        if self.is_closed() {
            return Err(ProxyError::ConnectionFailed(format!(
                "session '{}' transport is closed",
                self.session_id
            )));
        }
        self.outgoing_tx.send(message).await.map_err(|_| {
            ProxyError::ConnectionFailed(format!(
                "session '{}' consumer went away",
                self.session_id
            ))
        })
    }

    pub fn set_on_close(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_close.lock() = Some(Box::new(hook));
    }

    /// Close the transport. Idempotent; fires the close hook once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = self.on_close.lock().take() {
            hook(&self.session_id);
        }
    }

    /// Transport-level errors are logged and keep the session alive for a
    /// potential resume.
    pub fn on_error(&self, error: &ProxyError) {
        warn!(
            "session '{}' transport error (session kept for resume): {error}",
            self.session_id
        );
    }
}
