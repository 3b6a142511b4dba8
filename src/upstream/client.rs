//! Upstream client handle.
//!
//! Thin wrapper around the rmcp client service. Every catalog listing and
//! invocation the proxy makes goes through this seam, which also gives tests
//! a scriptable stand-in without a live transport.

use rmcp::{
    model::{CallToolRequestParam, CallToolResult, Prompt, RawResource, Tool},
    service::RunningService,
    RoleClient,
};
use serde_json::Map;
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};

pub type RunningClient = RunningService<RoleClient, ()>;

pub struct UpstreamClient {
    inner: Inner,
}

impl std::fmt::Debug for UpstreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamClient").finish_non_exhaustive()
    }
}

enum Inner {
    Rmcp(RunningClient),
    #[cfg(test)]
    Mock(mock::MockUpstream),
}

impl UpstreamClient {
    pub fn from_running(service: RunningClient) -> Self {
        Self {
            inner: Inner::Rmcp(service),
        }
    }

    pub async fn list_tools(&self) -> ProxyResult<Vec<Tool>> {
        match &self.inner {
            Inner::Rmcp(client) => client
                .peer()
                .list_all_tools()
                .await
                .map_err(|e| ProxyError::Upstream(format!("list tools: {e}"))),
            #[cfg(test)]
            Inner::Mock(mock) => mock.list_tools(),
        }
    }

    pub async fn list_prompts(&self) -> ProxyResult<Vec<Prompt>> {
        match &self.inner {
            Inner::Rmcp(client) => client
                .peer()
                .list_all_prompts()
                .await
                .map_err(|e| ProxyError::Upstream(format!("list prompts: {e}"))),
            #[cfg(test)]
            Inner::Mock(mock) => mock.list_prompts(),
        }
    }

    pub async fn list_resources(&self) -> ProxyResult<Vec<RawResource>> {
        match &self.inner {
            Inner::Rmcp(client) => client
                .peer()
                .list_all_resources()
                .await
                .map(|resources| resources.into_iter().map(|r| r.raw).collect())
                .map_err(|e| ProxyError::Upstream(format!("list resources: {e}"))),
            #[cfg(test)]
            Inner::Mock(mock) => mock.list_resources(),
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, serde_json::Value>>,
    ) -> ProxyResult<CallToolResult> {
        match &self.inner {
            Inner::Rmcp(client) => {
                let request = CallToolRequestParam {
                    name: std::borrow::Cow::Owned(name.to_string()),
                    arguments,
                };
                client
                    .call_tool(request)
                    .await
                    .map_err(|e| ProxyError::Upstream(format!("call tool '{name}': {e}")))
            }
            #[cfg(test)]
            Inner::Mock(mock) => mock.call_tool(name, arguments).await,
        }
    }

    /// Lightweight liveness probe: a catalog round-trip over the live handle.
    pub async fn probe(&self) -> ProxyResult<()> {
        match &self.inner {
            Inner::Rmcp(client) => client
                .peer()
                .list_all_tools()
                .await
                .map(|_| ())
                .map_err(|e| ProxyError::Upstream(format!("health probe: {e}"))),
            #[cfg(test)]
            Inner::Mock(mock) => mock.probe(),
        }
    }

    /// Close the session, surfacing transport shutdown errors.
    pub async fn close(self) -> ProxyResult<()> {
        match self.inner {
            Inner::Rmcp(client) => client
                .cancel()
                .await
                .map(|_| ())
                .map_err(|e| ProxyError::Upstream(format!("close: {e}"))),
            #[cfg(test)]
            Inner::Mock(mock) => {
                mock.note_closed();
                Ok(())
            }
        }
    }

    /// Best-effort close through a shared handle.
    pub async fn close_shared(this: std::sync::Arc<Self>, name: &str) {
        match std::sync::Arc::try_unwrap(this) {
            Ok(client) => {
                if let Err(e) = client.close().await {
                    warn!("error closing connection to '{name}': {e}");
                }
            }
            Err(_) => warn!("connection to '{name}' still in use, dropping handle"),
        }
    }

    #[cfg(test)]
    pub fn mock(mock: mock::MockUpstream) -> Self {
        Self {
            inner: Inner::Mock(mock),
        }
    }
}
