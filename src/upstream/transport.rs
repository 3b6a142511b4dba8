//! Transport handshakes for upstream servers.
//!
//! Spawns stdio subprocesses or opens HTTP/SSE sessions and drives the MCP
//! initialize exchange through rmcp. Handshake failures classify as
//! `connection_failed`; transport construction problems as `upstream`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::transport::{
    sse_client::SseClientConfig, streamable_http_client::StreamableHttpClientTransportConfig,
    ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess,
};
use rmcp::ServiceExt;
use tracing::{info, warn};

use super::client::UpstreamClient;
use crate::config::{ServerDescriptor, TransportConfig};
use crate::context::ContextPropagator;
use crate::error::{ProxyError, ProxyResult};

/// Opens a session to one upstream server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, descriptor: &ServerDescriptor) -> ProxyResult<UpstreamClient>;
}

/// Production connector backed by rmcp transports.
pub struct RmcpConnector {
    /// Supplies the outbound User-Agent from the downstream identity snapshot.
    context: Option<Arc<ContextPropagator>>,
    connect_timeout: Duration,
}

impl RmcpConnector {
    pub fn new(context: Option<Arc<ContextPropagator>>) -> Self {
        Self {
            context,
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn user_agent(&self) -> Option<String> {
        self.context.as_ref().map(|c| c.user_agent())
    }

    fn build_http_client(
        &self,
        headers: &std::collections::HashMap<String, String>,
    ) -> ProxyResult<reqwest::Client> {
        let mut header_map = reqwest::header::HeaderMap::new();
        for (key, value) in headers {
            let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| ProxyError::Upstream(format!("header name '{key}': {e}")))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| ProxyError::Upstream(format!("header value for '{key}': {e}")))?;
            header_map.insert(name, value);
        }
        if let Some(ua) = self.user_agent() {
            header_map.insert(
                reqwest::header::USER_AGENT,
                reqwest::header::HeaderValue::from_str(&ua)
                    .map_err(|e| ProxyError::Upstream(format!("user agent: {e}")))?,
            );
        }
        reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .default_headers(header_map)
            .build()
            .map_err(|e| ProxyError::Upstream(format!("build HTTP client: {e}")))
    }
}

#[async_trait]
impl Connector for RmcpConnector {
    async fn connect(&self, descriptor: &ServerDescriptor) -> ProxyResult<UpstreamClient> {
        info!(
            "connecting to '{}' via {:?}",
            descriptor.name, descriptor.transport
        );

        match &descriptor.transport {
            TransportConfig::Stdio { command, args, env, cwd } => {
                let transport = TokioChildProcess::new(
                    tokio::process::Command::new(command).configure(|cmd| {
                        cmd.args(args)
                            .envs(env.iter())
                            .stderr(std::process::Stdio::inherit());
                        if let Some(cwd) = cwd {
                            cmd.current_dir(cwd);
                        }
                    }),
                )
                .map_err(|e| ProxyError::Upstream(format!("spawn '{command}': {e}")))?;

                let client = ().serve(transport).await.map_err(|e| {
                    ProxyError::ConnectionFailed(format!("initialize stdio client: {e}"))
                })?;

                info!("connected to stdio server '{}'", descriptor.name);
                Ok(UpstreamClient::from_running(client))
            }

            TransportConfig::Sse { url, headers } => {
                let http = self.build_http_client(headers)?;
                let config = SseClientConfig {
                    sse_endpoint: url.clone().into(),
                    ..Default::default()
                };
                let transport = SseClientTransport::start_with_client(http, config)
                    .await
                    .map_err(|e| ProxyError::Upstream(format!("create SSE transport: {e}")))?;

                let client = ().serve(transport).await.map_err(|e| {
                    ProxyError::ConnectionFailed(format!("initialize SSE client: {e}"))
                })?;

                info!("connected to SSE server '{}' at {url}", descriptor.name);
                Ok(UpstreamClient::from_running(client))
            }

            TransportConfig::HttpStreamable { url, headers } => {
                let auth_header = headers
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case("authorization"))
                    .map(|(_, value)| value.clone());
                if headers.len() > usize::from(auth_header.is_some()) {
                    warn!(
                        "server '{}': streamable transport only honors the Authorization header",
                        descriptor.name
                    );
                }

                let transport = if let Some(auth) = auth_header {
                    let mut config = StreamableHttpClientTransportConfig::with_uri(url.as_str());
                    config.auth_header = Some(auth);
                    StreamableHttpClientTransport::from_config(config)
                } else {
                    StreamableHttpClientTransport::from_uri(url.as_str())
                };

                let client = ().serve(transport).await.map_err(|e| {
                    ProxyError::ConnectionFailed(format!("initialize streamable client: {e}"))
                })?;

                info!(
                    "connected to streamable HTTP server '{}' at {url}",
                    descriptor.name
                );
                Ok(UpstreamClient::from_running(client))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(json: serde_json::Value) -> ServerDescriptor {
        serde_json::from_value(json).unwrap()
    }

    #[tokio::test]
    async fn test_stdio_spawn_failure_is_upstream() {
        let connector = RmcpConnector::new(None);
        let descriptor = descriptor(serde_json::json!({
            "type": "stdio",
            "command": "/nonexistent/definitely-not-a-binary"
        }));
        let err = connector.connect(&descriptor).await.unwrap_err();
        assert!(matches!(err.kind(), "upstream" | "connection_failed"));
    }

    #[test]
    fn test_http_client_rejects_bad_header_values() {
        let connector = RmcpConnector::new(None);
        let mut headers = std::collections::HashMap::new();
        headers.insert("X-Api-Key".to_string(), "bad\nvalue".to_string());
        assert!(connector.build_http_client(&headers).is_err());
    }

    #[test]
    fn test_http_client_carries_user_agent() {
        let propagator = Arc::new(ContextPropagator::new());
        let connector = RmcpConnector::new(Some(propagator));
        assert!(connector.user_agent().unwrap().starts_with("1MCP-Proxy/"));
    }
}
