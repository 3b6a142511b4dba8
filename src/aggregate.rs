//! Capability aggregation.
//!
//! Snapshots tools, resources, and prompts from every Connected upstream into
//! one ordered view. A server whose tool listing fails is logged and left out
//! of `ready_servers`; the snapshot is still produced from the rest.

use chrono::{DateTime, Utc};
use rmcp::model::{Prompt, RawResource, Tool};
use tracing::{debug, info, warn};

use crate::upstream::{UpstreamClient, UpstreamSupervisor};

#[derive(Debug, Clone)]
pub struct AggregatedTool {
    pub server: String,
    pub tool: Tool,
}

#[derive(Debug, Clone)]
pub struct AggregatedResource {
    pub server: String,
    pub resource: RawResource,
}

#[derive(Debug, Clone)]
pub struct AggregatedPrompt {
    pub server: String,
    pub prompt: Prompt,
}

/// Catalog of a single upstream, as listed during one aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct ServerCatalog {
    pub server: String,
    pub tools: Vec<Tool>,
    pub resources: Vec<RawResource>,
    pub prompts: Vec<Prompt>,
}

#[derive(Debug, Clone)]
pub struct AggregatedCapabilities {
    pub tools: Vec<AggregatedTool>,
    pub resources: Vec<AggregatedResource>,
    pub prompts: Vec<AggregatedPrompt>,
    pub ready_servers: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AggregatedCapabilities {
    pub fn empty() -> Self {
        merge(Vec::new())
    }
}

/// Merge per-server catalogs into one snapshot, ordered by (server, name).
pub fn merge(mut catalogs: Vec<ServerCatalog>) -> AggregatedCapabilities {
    catalogs.sort_by(|a, b| a.server.cmp(&b.server));

    let mut tools = Vec::new();
    let mut resources = Vec::new();
    let mut prompts = Vec::new();
    let mut ready_servers = Vec::new();

    for catalog in catalogs {
        ready_servers.push(catalog.server.clone());

        let mut server_tools = catalog.tools;
        server_tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools.extend(server_tools.into_iter().map(|tool| AggregatedTool {
            server: catalog.server.clone(),
            tool,
        }));

        let mut server_resources = catalog.resources;
        server_resources.sort_by(|a, b| a.name.cmp(&b.name));
        resources.extend(
            server_resources
                .into_iter()
                .map(|resource| AggregatedResource {
                    server: catalog.server.clone(),
                    resource,
                }),
        );

        let mut server_prompts = catalog.prompts;
        server_prompts.sort_by(|a, b| a.name.cmp(&b.name));
        prompts.extend(server_prompts.into_iter().map(|prompt| AggregatedPrompt {
            server: catalog.server.clone(),
            prompt,
        }));
    }

    AggregatedCapabilities {
        tools,
        resources,
        prompts,
        ready_servers,
        timestamp: Utc::now(),
    }
}

/// List one upstream's catalog. Failing to list tools disqualifies the server;
/// missing prompt or resource support is common and only logged.
pub async fn list_catalog(server: &str, client: &UpstreamClient) -> Option<ServerCatalog> {
    let tools = match client.list_tools().await {
        Ok(tools) => {
            info!("discovered {} tool(s) from '{server}'", tools.len());
            tools
        }
        Err(e) => {
            warn!("failed to list tools from '{server}': {e}");
            return None;
        }
    };

    let resources = match client.list_resources().await {
        Ok(resources) => resources,
        Err(e) => {
            debug!("no resources from '{server}': {e}");
            Vec::new()
        }
    };

    let prompts = match client.list_prompts().await {
        Ok(prompts) => prompts,
        Err(e) => {
            debug!("no prompts from '{server}': {e}");
            Vec::new()
        }
    };

    Some(ServerCatalog {
        server: server.to_string(),
        tools,
        resources,
        prompts,
    })
}

/// Aggregate every Connected upstream in the supervisor's map.
pub async fn aggregate(supervisor: &UpstreamSupervisor) -> AggregatedCapabilities {
    let mut catalogs = Vec::new();
    for (server, client) in supervisor.connected_clients() {
        if let Some(catalog) = list_catalog(&server, client.as_ref()).await {
            catalogs.push(catalog);
        }
    }
    merge(catalogs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::client::mock::{test_tool, MockUpstream};

    fn catalog(server: &str, tools: &[&str]) -> ServerCatalog {
        ServerCatalog {
            server: server.to_string(),
            tools: tools.iter().map(|name| test_tool(name)).collect(),
            resources: Vec::new(),
            prompts: Vec::new(),
        }
    }

    #[test]
    fn test_merge_orders_by_server_then_name() {
        let merged = merge(vec![
            catalog("fs", &["write", "read"]),
            catalog("db", &["query"]),
        ]);
        let order: Vec<String> = merged
            .tools
            .iter()
            .map(|t| format!("{}/{}", t.server, t.tool.name))
            .collect();
        assert_eq!(order, vec!["db/query", "fs/read", "fs/write"]);
        assert_eq!(merged.ready_servers, vec!["db", "fs"]);
    }

    #[test]
    fn test_merge_empty() {
        let merged = AggregatedCapabilities::empty();
        assert!(merged.tools.is_empty());
        assert!(merged.ready_servers.is_empty());
    }

    #[tokio::test]
    async fn test_list_catalog_collects_all_sections() {
        let mock = MockUpstream::with_tools(&["read"]);
        mock.set_prompts(&["greeting"]);
        mock.set_resources(&["file:///etc/hosts"]);
        let client = UpstreamClient::mock(mock);

        let catalog = list_catalog("fs", &client).await.unwrap();
        assert_eq!(catalog.tools.len(), 1);
        assert_eq!(catalog.prompts.len(), 1);
        assert_eq!(catalog.resources.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_tool_listing_disqualifies_server() {
        let mock = MockUpstream::with_tools(&["read"]);
        mock.set_fail_lists(true);
        let client = UpstreamClient::mock(mock);
        assert!(list_catalog("fs", &client).await.is_none());
    }

    #[tokio::test]
    async fn test_aggregate_skips_failing_upstream() {
        use crate::upstream::supervisor::test_support::{descriptor, wait_for_status, ScriptedConnector};
        use crate::upstream::ConnectionStatus;

        let connector = ScriptedConnector::new()
            .with_server("fs", &["read"])
            .with_server("db", &["query"]);
        let supervisor = std::sync::Arc::new(UpstreamSupervisor::new(connector.clone()));
        supervisor.add(descriptor("fs", &[])).unwrap();
        supervisor.add(descriptor("db", &[])).unwrap();
        wait_for_status(&supervisor, "fs", ConnectionStatus::Connected).await;
        wait_for_status(&supervisor, "db", ConnectionStatus::Connected).await;

        connector.latest_mock("db").unwrap().set_fail_lists(true);

        let merged = aggregate(&supervisor).await;
        assert_eq!(merged.ready_servers, vec!["fs"]);
        assert_eq!(merged.tools.len(), 1);
        assert_eq!(merged.tools[0].tool.name, "read");
    }
}
