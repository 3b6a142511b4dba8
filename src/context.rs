//! Caller context propagation.
//!
//! Builds a per-request `ContextData` snapshot and attaches it to outbound
//! JSON-RPC requests as `params._meta.context`. The downstream client identity
//! (captured from its `initialize` message) feeds the outbound HTTP
//! `User-Agent`, read from a hot-swappable snapshot so connections built
//! before the identity is known still pick it up on the next build.

use std::collections::HashMap;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const PROXY_PRODUCT: &str = "1MCP-Proxy";
pub const PROXY_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentContext {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
}

/// Identity of the downstream client, from its MCP `initialize` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIdentity {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportContext {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientIdentity>,
}

/// Structured caller context attached to every outbound request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentContext>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportContext>,
}

impl ContextData {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            project: None,
            user: None,
            environment: None,
            timestamp: Utc::now(),
            transport: None,
        }
    }
}

/// Shared propagator: one per proxy instance.
#[derive(Default)]
pub struct ContextPropagator {
    client_info: ArcSwapOption<ClientIdentity>,
}

impl ContextPropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the downstream identity once `initialize` has been seen.
    pub fn record_client_info(&self, identity: ClientIdentity) {
        self.client_info.store(Some(std::sync::Arc::new(identity)));
    }

    pub fn client_info(&self) -> Option<ClientIdentity> {
        self.client_info.load_full().map(|arc| (*arc).clone())
    }

    /// Extract and record identity from raw `initialize` params.
    pub fn capture_from_initialize(&self, params: &Value) -> Option<ClientIdentity> {
        let info = params.get("clientInfo")?;
        let identity = ClientIdentity {
            name: info.get("name")?.as_str()?.to_string(),
            version: info
                .get("version")
                .and_then(Value::as_str)
                .unwrap_or("0.0.0")
                .to_string(),
            title: info
                .get("title")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        self.record_client_info(identity.clone());
        Some(identity)
    }

    /// `1MCP-Proxy/<ver>[ <client>/<cliver>[ (<title>)]]`
    pub fn user_agent(&self) -> String {
        let mut ua = format!("{PROXY_PRODUCT}/{PROXY_VERSION}");
        if let Some(identity) = self.client_info() {
            ua.push_str(&format!(" {}/{}", identity.name, identity.version));
            if let Some(title) = identity.title {
                ua.push_str(&format!(" ({title})"));
            }
        }
        ua
    }

    /// Set `params._meta.context` on an outbound request's params object.
    pub fn attach_context(params: &mut Map<String, Value>, context: &ContextData) {
        let meta = params
            .entry("_meta".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !meta.is_object() {
            *meta = Value::Object(Map::new());
        }
        if let Value::Object(meta) = meta {
            meta.insert(
                "context".to_string(),
                serde_json::to_value(context).unwrap_or(Value::Null),
            );
        }
    }

    /// Attach context to a full JSON-RPC request, creating `params` if needed.
    pub fn annotate_request(&self, request: &mut Value, context: &ContextData) {
        let Some(request) = request.as_object_mut() else {
            return;
        };
        let params = request
            .entry("params".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !params.is_object() {
            *params = Value::Object(Map::new());
        }
        if let Value::Object(params) = params {
            Self::attach_context(params, context);
        }
    }
}
