//! Configuration types.
//!
//! Defines upstream server descriptors, restart policy, and the lazy-loading
//! options block. All documents are JSON with camelCase field names.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

/// Transport-specific launch parameters for an upstream server.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    HttpStreamable {
        url: String,
        /// Additional headers (e.g. Authorization, X-API-Key).
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::HttpStreamable { .. } => "http-streamable",
            TransportConfig::Sse { .. } => "sse",
        }
    }

    /// True when the two transports denote a different connection identity
    /// (kind, command, args, or url). Header/env differences do not count.
    pub fn identity_differs(&self, other: &TransportConfig) -> bool {
        match (self, other) {
            (
                TransportConfig::Stdio { command: c1, args: a1, .. },
                TransportConfig::Stdio { command: c2, args: a2, .. },
            ) => c1 != c2 || a1 != a2,
            (
                TransportConfig::HttpStreamable { url: u1, .. },
                TransportConfig::HttpStreamable { url: u2, .. },
            )
            | (TransportConfig::Sse { url: u1, .. }, TransportConfig::Sse { url: u2, .. }) => {
                u1 != u2
            }
            _ => true,
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportConfig::Stdio { command, args, env, cwd } => f
                .debug_struct("Stdio")
                .field("command", command)
                .field("args", args)
                .field("env", &format!("{} vars", env.len()))
                .field("cwd", cwd)
                .finish(),
            TransportConfig::HttpStreamable { url, headers } => f
                .debug_struct("HttpStreamable")
                .field("url", url)
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
            TransportConfig::Sse { url, headers } => f
                .debug_struct("Sse")
                .field("url", url)
                .field("headers", &format!("{} headers", headers.len()))
                .finish(),
        }
    }
}

/// One upstream MCP server. Immutable within a generation; a reload replaces
/// the whole descriptor atomically.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDescriptor {
    /// Clean configured name. Injected from the `mcpServers` map key on load.
    #[serde(default, skip_serializing)]
    pub name: String,

    #[serde(flatten)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Per-call timeout for requests against this server.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Reconnect after an exited process or failed handshake.
    #[serde(default = "default_true")]
    pub restart_on_exit: bool,

    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Base delay for the exponential restart backoff.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl ServerDescriptor {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// True when only `tags` differ between the two descriptors.
    pub fn tags_only_change(&self, other: &ServerDescriptor) -> bool {
        self.tags != other.tags && {
            let mut a = self.clone();
            let mut b = other.clone();
            a.tags = Vec::new();
            b.tags = Vec::new();
            a == b
        }
    }
}

/// Schema cache sizing.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            ttl_ms: default_ttl_ms(),
        }
    }
}

/// Schema preload selection, applied at orchestrator initialization.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadConfig {
    /// Glob patterns (only `*`) matched against server names.
    #[serde(default)]
    pub patterns: Vec<String>,
    /// Case-insensitive substrings matched against tool names.
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LazyLoadingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub preload: PreloadConfig,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, ServerDescriptor>,

    /// Per-session template descriptors, instantiated under `name:<hash>` keys.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_templates: BTreeMap<String, ServerDescriptor>,

    #[serde(default)]
    pub lazy_loading: LazyLoadingConfig,

    #[serde(default = "default_health_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl AppConfig {
    /// Validate the document, injecting map keys as descriptor names.
    pub fn validate(&mut self) -> ProxyResult<()> {
        for section in [&mut self.mcp_servers, &mut self.mcp_templates] {
            for (name, descriptor) in section.iter_mut() {
                descriptor.name = name.clone();
                validate_descriptor(name, descriptor)?;
            }
        }
        if self.lazy_loading.cache.max_entries == 0 {
            return Err(ProxyError::ConfigInvalid(
                "lazyLoading.cache.maxEntries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_descriptor(name: &str, descriptor: &ServerDescriptor) -> ProxyResult<()> {
    if name.is_empty() || name.len() > 100 {
        return Err(ProxyError::ConfigInvalid(format!(
            "server name '{name}' must be 1-100 characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ProxyError::ConfigInvalid(format!(
            "server '{name}': name must match [A-Za-z0-9_-]"
        )));
    }
    match &descriptor.transport {
        TransportConfig::Stdio { command, .. } => {
            if command.trim().is_empty() {
                return Err(ProxyError::ConfigInvalid(format!(
                    "server '{name}': command must not be empty"
                )));
            }
        }
        TransportConfig::HttpStreamable { url, .. } | TransportConfig::Sse { url, .. } => {
            url::Url::parse(url).map_err(|e| {
                ProxyError::ConfigInvalid(format!("server '{name}': invalid url: {e}"))
            })?;
        }
    }
    if descriptor.timeout_ms == 0 {
        return Err(ProxyError::ConfigInvalid(format!(
            "server '{name}': timeoutMs must be at least 1"
        )));
    }
    Ok(())
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay_ms() -> u64 {
    500
}

fn default_max_entries() -> usize {
    256
}

fn default_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_health_interval_secs() -> u64 {
    30
}
