//! Meta-tool provider.
//!
//! Exposes exactly three discovery tools to downstream clients in lazy mode:
//! `tool_list` (paged registry view), `tool_schema` (cache-backed schema
//! fetch), and `tool_invoke` (routed invocation). Every response is fully
//! shaped: the data field is present even on failure, with the failure
//! nested as `error: {type, message}`.

use std::borrow::Cow;
use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use rmcp::model::Tool;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::cache::SchemaCache;
use crate::error::{ProxyError, ProxyResult};
use crate::registry::{QualifiedTool, ToolListFilter, ToolMetadata, ToolRegistry};
use crate::upstream::UpstreamSupervisor;

pub const TOOL_LIST: &str = "tool_list";
pub const TOOL_SCHEMA: &str = "tool_schema";
pub const TOOL_INVOKE: &str = "tool_invoke";

pub fn is_meta_tool(name: &str) -> bool {
    matches!(name, TOOL_LIST | TOOL_SCHEMA | TOOL_INVOKE)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaToolError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

impl MetaToolError {
    fn from_proxy(error: &ProxyError) -> Self {
        Self {
            kind: error.wire_kind().to_string(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolListResult {
    pub tools: Vec<ToolMetadata>,
    pub total_count: usize,
    pub servers: Vec<String>,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MetaToolError>,
}

impl ToolListResult {
    fn failure(error: &ProxyError) -> Self {
        Self {
            tools: Vec::new(),
            total_count: 0,
            servers: Vec::new(),
            has_more: false,
            next_cursor: None,
            error: Some(MetaToolError::from_proxy(error)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSchemaResult {
    pub server: String,
    pub tool_name: String,
    /// Full tool schema; an empty object when the lookup failed.
    pub schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MetaToolError>,
}

impl ToolSchemaResult {
    fn failure(server: &str, tool: &str, error: &ProxyError) -> Self {
        Self {
            server: server.to_string(),
            tool_name: tool.to_string(),
            schema: Value::Object(Map::new()),
            error: Some(MetaToolError::from_proxy(error)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvokeResult {
    pub server: String,
    pub tool_name: String,
    /// Upstream result content; an empty array when the call failed.
    pub result: Value,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<MetaToolError>,
}

impl ToolInvokeResult {
    fn failure(server: &str, tool: &str, error: &ProxyError) -> Self {
        Self {
            server: server.to_string(),
            tool_name: tool.to_string(),
            result: Value::Array(Vec::new()),
            is_error: true,
            error: Some(MetaToolError::from_proxy(error)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetaToolResponse {
    List(ToolListResult),
    Schema(ToolSchemaResult),
    Invoke(ToolInvokeResult),
}

impl MetaToolResponse {
    pub fn to_value(&self) -> Value {
        match self {
            MetaToolResponse::List(r) => serde_json::to_value(r),
            MetaToolResponse::Schema(r) => serde_json::to_value(r),
            MetaToolResponse::Invoke(r) => serde_json::to_value(r),
        }
        .unwrap_or(Value::Null)
    }

    pub fn error(&self) -> Option<&MetaToolError> {
        match self {
            MetaToolResponse::List(r) => r.error.as_ref(),
            MetaToolResponse::Schema(r) => r.error.as_ref(),
            MetaToolResponse::Invoke(r) => r.error.as_ref(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ToolListParams {
    server: Option<String>,
    name_pattern: Option<String>,
    tag: Option<String>,
    limit: Option<usize>,
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ToolSchemaParams {
    server: String,
    tool_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ToolInvokeParams {
    server: String,
    tool_name: String,
    #[serde(default)]
    args: Option<Value>,
}

pub struct MetaToolProvider {
    registry: Arc<ArcSwap<ToolRegistry>>,
    cache: Arc<SchemaCache>,
    supervisor: Arc<UpstreamSupervisor>,
    allowed_servers: RwLock<Option<BTreeSet<String>>>,
}

impl MetaToolProvider {
    pub fn new(
        registry: Arc<ArcSwap<ToolRegistry>>,
        cache: Arc<SchemaCache>,
        supervisor: Arc<UpstreamSupervisor>,
    ) -> Self {
        Self {
            registry,
            cache,
            supervisor,
            allowed_servers: RwLock::new(None),
        }
    }

    /// Restrict discovery and invocation to the given clean server names.
    /// `None` lifts the restriction.
    pub fn set_allowed_servers(&self, allowed: Option<BTreeSet<String>>) {
        *self.allowed_servers.write() = allowed;
    }

    /// The three meta-tool definitions advertised to downstream clients.
    pub fn definitions() -> Vec<Tool> {
        vec![
            meta_tool(
                TOOL_LIST,
                "List available tools across connected MCP servers, with optional \
                 server/pattern/tag filters and cursor pagination.",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string", "description": "Only list tools from this server"},
                        "namePattern": {"type": "string", "description": "Substring or *-glob on tool names"},
                        "tag": {"type": "string", "description": "Only servers carrying this tag"},
                        "limit": {"type": "integer", "minimum": 1},
                        "cursor": {"type": "string", "description": "Opaque cursor from a previous page"}
                    },
                    "additionalProperties": false
                }),
            ),
            meta_tool(
                TOOL_SCHEMA,
                "Fetch the full input schema for one tool.",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string"},
                        "toolName": {"type": "string"}
                    },
                    "required": ["server", "toolName"],
                    "additionalProperties": false
                }),
            ),
            meta_tool(
                TOOL_INVOKE,
                "Invoke a tool on a connected MCP server.",
                json!({
                    "type": "object",
                    "properties": {
                        "server": {"type": "string"},
                        "toolName": {"type": "string"},
                        "args": {"type": "object", "description": "Tool arguments"}
                    },
                    "required": ["server", "toolName"],
                    "additionalProperties": false
                }),
            ),
        ]
    }

    /// Dispatch a meta-tool call. Only an unknown meta-tool name raises;
    /// every other failure is embedded in the shaped response.
    pub async fn call(&self, name: &str, args: Value) -> ProxyResult<MetaToolResponse> {
        match name {
            TOOL_LIST => Ok(MetaToolResponse::List(self.tool_list(args))),
            TOOL_SCHEMA => Ok(MetaToolResponse::Schema(self.tool_schema(args).await)),
            TOOL_INVOKE => Ok(MetaToolResponse::Invoke(self.tool_invoke(args).await)),
            other => Err(ProxyError::NotFound(format!("meta tool '{other}'"))),
        }
    }

    fn visible_registry(&self) -> Arc<ToolRegistry> {
        let registry = self.registry.load_full();
        match self.allowed_servers.read().as_ref() {
            Some(allowed) => {
                // Allowed names are clean; registry keys may carry suffixes.
                let internal: BTreeSet<String> = allowed
                    .iter()
                    .filter_map(|clean| self.supervisor.resolve_name(clean))
                    .collect();
                Arc::new(registry.filter_by_servers(&internal))
            }
            None => registry,
        }
    }

    fn is_allowed(&self, clean: &str) -> bool {
        self.allowed_servers
            .read()
            .as_ref()
            .map(|allowed| allowed.contains(clean))
            .unwrap_or(true)
    }

    fn tool_list(&self, args: Value) -> ToolListResult {
        let params: ToolListParams = match parse_params(args) {
            Ok(params) => params,
            Err(e) => return ToolListResult::failure(&e),
        };

        let registry = self.visible_registry();
        let filter = ToolListFilter {
            server: params
                .server
                .as_deref()
                .map(|clean| self.supervisor.resolve_name(clean).unwrap_or_else(|| clean.to_string())),
            name_pattern: params.name_pattern,
            tag: params.tag,
            limit: params.limit,
            cursor: params.cursor,
        };
        let page = registry.list_tools(&filter);
        ToolListResult {
            tools: page.items,
            total_count: page.total_count,
            servers: registry.servers(),
            has_more: page.has_more,
            next_cursor: page.next_cursor,
            error: None,
        }
    }

    async fn tool_schema(&self, args: Value) -> ToolSchemaResult {
        let params: ToolSchemaParams = match parse_params(args) {
            Ok(params) => params,
            Err(e) => return ToolSchemaResult::failure("", "", &e),
        };

        let resolved = match self.resolve_allowed(&params.server) {
            Ok(internal) => internal,
            Err(e) => return ToolSchemaResult::failure(&params.server, &params.tool_name, &e),
        };

        let key = QualifiedTool::new(resolved.clone(), params.tool_name.clone());
        let client = match self.supervisor.client(&resolved) {
            Some(client) => client,
            None => {
                return ToolSchemaResult::failure(
                    &params.server,
                    &params.tool_name,
                    &ProxyError::Upstream(format!("server '{}' is not connected", params.server)),
                )
            }
        };

        let tool_name = params.tool_name.clone();
        let loaded = self
            .cache
            .get_or_load(key, move || async move {
                let tools = client.list_tools().await?;
                let tool = tools
                    .into_iter()
                    .find(|t| t.name == tool_name)
                    .ok_or_else(|| ProxyError::NotFound(format!("tool '{tool_name}'")))?;
                serde_json::to_value(&tool)
                    .map_err(|e| ProxyError::Internal(format!("serialize schema: {e}")))
            })
            .await;

        match loaded {
            Ok(schema) => ToolSchemaResult {
                server: params.server,
                tool_name: params.tool_name,
                schema: (*schema).clone(),
                error: None,
            },
            Err(e) => ToolSchemaResult::failure(&params.server, &params.tool_name, &e),
        }
    }

    async fn tool_invoke(&self, args: Value) -> ToolInvokeResult {
        let params: ToolInvokeParams = match parse_params(args) {
            Ok(params) => params,
            Err(e) => return ToolInvokeResult::failure("", "", &e),
        };

        let resolved = match self.resolve_allowed(&params.server) {
            Ok(internal) => internal,
            Err(e) => return ToolInvokeResult::failure(&params.server, &params.tool_name, &e),
        };

        let arguments = match params.args {
            None | Some(Value::Null) => None,
            Some(Value::Object(map)) => Some(map),
            Some(_) => {
                return ToolInvokeResult::failure(
                    &params.server,
                    &params.tool_name,
                    &ProxyError::Validation("args must be an object".to_string()),
                )
            }
        };

        let Some(client) = self.supervisor.client(&resolved) else {
            return ToolInvokeResult::failure(
                &params.server,
                &params.tool_name,
                &ProxyError::Upstream(format!("server '{}' is not connected", params.server)),
            );
        };
        let timeout = self
            .supervisor
            .get(&resolved)
            .map(|c| c.descriptor.timeout())
            .unwrap_or(std::time::Duration::from_secs(30));

        debug!("invoking {resolved}:{} downstream of tool_invoke", params.tool_name);
        let call = client.call_tool(&params.tool_name, arguments);
        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => ToolInvokeResult {
                server: params.server,
                tool_name: params.tool_name,
                result: serde_json::to_value(&result.content).unwrap_or(Value::Array(Vec::new())),
                is_error: result.is_error.unwrap_or(false),
                error: None,
            },
            Ok(Err(e)) => ToolInvokeResult::failure(&params.server, &params.tool_name, &e),
            Err(_) => ToolInvokeResult::failure(
                &params.server,
                &params.tool_name,
                &ProxyError::Upstream(format!(
                    "call to '{}:{}' timed out",
                    params.server, params.tool_name
                )),
            ),
        }
    }

    /// Resolve a clean downstream name, enforcing the session filter.
    fn resolve_allowed(&self, clean: &str) -> ProxyResult<String> {
        if clean.trim().is_empty() {
            return Err(ProxyError::Validation("server must not be empty".to_string()));
        }
        if !self.is_allowed(clean) {
            return Err(ProxyError::server_not_found(clean));
        }
        self.supervisor
            .resolve_name(clean)
            .ok_or_else(|| ProxyError::server_not_found(clean))
    }
}

fn meta_tool(name: &'static str, description: &'static str, schema: Value) -> Tool {
    let schema_map = match schema {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    Tool {
        name: Cow::Borrowed(name),
        title: None,
        description: Some(Cow::Borrowed(description)),
        input_schema: Arc::new(schema_map),
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(args: Value) -> ProxyResult<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ProxyError::Validation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::upstream::supervisor::test_support::{descriptor, wait_for_status, ScriptedConnector};
    use crate::upstream::ConnectionStatus;

    struct Fixture {
        provider: MetaToolProvider,
        supervisor: Arc<UpstreamSupervisor>,
        connector: Arc<ScriptedConnector>,
        cache: Arc<SchemaCache>,
    }

    async fn fixture() -> Fixture {
        let connector = ScriptedConnector::new()
            .with_server("fs", &["read", "write"])
            .with_server("db", &["query"]);
        let supervisor = Arc::new(UpstreamSupervisor::new(connector.clone()));
        supervisor.add(descriptor("fs", &["files"])).unwrap();
        supervisor.add(descriptor("db", &["data"])).unwrap();
        wait_for_status(&supervisor, "fs", ConnectionStatus::Connected).await;
        wait_for_status(&supervisor, "db", ConnectionStatus::Connected).await;

        let registry = Arc::new(ArcSwap::from_pointee(ToolRegistry::new(vec![
            tool_meta("fs", "read", &["files"]),
            tool_meta("fs", "write", &["files"]),
            tool_meta("db", "query", &["data"]),
        ])));
        let cache = Arc::new(SchemaCache::new(&CacheConfig::default()));
        let provider = MetaToolProvider::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&supervisor),
        );
        Fixture {
            provider,
            supervisor,
            connector,
            cache,
        }
    }

    fn tool_meta(server: &str, name: &str, tags: &[&str]) -> ToolMetadata {
        ToolMetadata {
            server: server.to_string(),
            name: name.to_string(),
            description: None,
            tags: tags.iter().map(|s| s.to_string()).collect(),
        }
    }

    async fn list(provider: &MetaToolProvider, args: Value) -> ToolListResult {
        match provider.call(TOOL_LIST, args).await.unwrap() {
            MetaToolResponse::List(result) => result,
            other => panic!("expected list result, got {other:?}"),
        }
    }

    async fn schema(provider: &MetaToolProvider, args: Value) -> ToolSchemaResult {
        match provider.call(TOOL_SCHEMA, args).await.unwrap() {
            MetaToolResponse::Schema(result) => result,
            other => panic!("expected schema result, got {other:?}"),
        }
    }

    async fn invoke(provider: &MetaToolProvider, args: Value) -> ToolInvokeResult {
        match provider.call(TOOL_INVOKE, args).await.unwrap() {
            MetaToolResponse::Invoke(result) => result,
            other => panic!("expected invoke result, got {other:?}"),
        }
    }

    #[test]
    fn test_definitions() {
        let defs = MetaToolProvider::definitions();
        let names: Vec<&str> = defs.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec![TOOL_LIST, TOOL_SCHEMA, TOOL_INVOKE]);
        assert!(defs.iter().all(|t| t.description.is_some()));
        assert!(is_meta_tool(TOOL_INVOKE));
        assert!(!is_meta_tool("read"));
    }

    #[tokio::test]
    async fn test_tool_list_full_catalog() {
        let fixture = fixture().await;
        let result = list(&fixture.provider, json!({})).await;

        assert!(result.error.is_none());
        assert_eq!(result.total_count, 3);
        assert_eq!(result.servers, vec!["db", "fs"]);
        assert!(!result.has_more);
        let names: Vec<String> = result
            .tools
            .iter()
            .map(|t| format!("{}/{}", t.server, t.name))
            .collect();
        assert_eq!(names, vec!["db/query", "fs/read", "fs/write"]);

        // Wire shape is camelCase with the data field always present.
        let wire = MetaToolResponse::List(result).to_value();
        assert_eq!(wire["totalCount"], json!(3));
        assert_eq!(wire["hasMore"], json!(false));
        assert!(wire.get("error").is_none());
    }

    #[tokio::test]
    async fn test_tool_list_filters_and_pages() {
        let fixture = fixture().await;

        let result = list(&fixture.provider, json!({"server": "fs"})).await;
        assert_eq!(result.total_count, 2);

        let result = list(&fixture.provider, json!({"tag": "data"})).await;
        assert_eq!(result.tools[0].name, "query");

        let page1 = list(&fixture.provider, json!({"limit": 2})).await;
        assert!(page1.has_more);
        let page2 = list(
            &fixture.provider,
            json!({"limit": 2, "cursor": page1.next_cursor.clone().unwrap()}),
        )
        .await;
        assert_eq!(page2.tools.len(), 1);
        assert!(!page2.has_more);
    }

    #[tokio::test]
    async fn test_tool_list_validation_error_keeps_shape() {
        let fixture = fixture().await;
        let result = list(&fixture.provider, json!({"limit": "many"})).await;
        let error = result.error.as_ref().unwrap();
        assert_eq!(error.kind, "validation");
        assert!(result.tools.is_empty());
        assert_eq!(result.total_count, 0);

        let result = list(&fixture.provider, json!({"bogus": true})).await;
        assert_eq!(result.error.unwrap().kind, "validation");
    }

    #[tokio::test]
    async fn test_tool_schema_loads_and_caches() {
        let fixture = fixture().await;
        let result = schema(
            &fixture.provider,
            json!({"server": "fs", "toolName": "read"}),
        )
        .await;
        assert!(result.error.is_none());
        assert_eq!(result.schema["name"], json!("read"));
        assert!(result.schema["inputSchema"].is_object());

        // Second fetch is served from the cache.
        schema(&fixture.provider, json!({"server": "fs", "toolName": "read"})).await;
        let mock = fixture.connector.latest_mock("fs").unwrap();
        assert_eq!(mock.list_tool_call_count(), 1);
        assert_eq!(fixture.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_tool_schema_not_found() {
        let fixture = fixture().await;

        let result = schema(
            &fixture.provider,
            json!({"server": "ghost", "toolName": "read"}),
        )
        .await;
        assert_eq!(result.error.as_ref().unwrap().kind, "not_found");
        assert_eq!(result.schema, json!({}));

        let result = schema(
            &fixture.provider,
            json!({"server": "fs", "toolName": "ghost"}),
        )
        .await;
        assert_eq!(result.error.unwrap().kind, "not_found");
    }

    #[tokio::test]
    async fn test_tool_schema_missing_required_field() {
        let fixture = fixture().await;
        let result = schema(&fixture.provider, json!({"server": "fs"})).await;
        assert_eq!(result.error.unwrap().kind, "validation");
    }

    #[tokio::test]
    async fn test_tool_invoke_round_trip() {
        let fixture = fixture().await;
        let result = invoke(
            &fixture.provider,
            json!({"server": "db", "toolName": "query", "args": {"sql": "select 1"}}),
        )
        .await;
        assert!(result.error.is_none());
        assert!(!result.is_error);
        assert_eq!(result.server, "db");

        let calls = fixture.connector.latest_mock("db").unwrap().recorded_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "query");
        assert_eq!(calls[0].1.as_ref().unwrap()["sql"], json!("select 1"));
    }

    #[tokio::test]
    async fn test_tool_invoke_upstream_failure() {
        let fixture = fixture().await;
        fixture
            .connector
            .latest_mock("db")
            .unwrap()
            .set_call_error("table missing");
        let result = invoke(
            &fixture.provider,
            json!({"server": "db", "toolName": "query"}),
        )
        .await;
        let error = result.error.unwrap();
        assert_eq!(error.kind, "upstream");
        assert!(error.message.contains("table missing"));
        assert_eq!(result.result, json!([]));
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_tool_invoke_rejects_non_object_args() {
        let fixture = fixture().await;
        let result = invoke(
            &fixture.provider,
            json!({"server": "db", "toolName": "query", "args": [1, 2]}),
        )
        .await;
        assert_eq!(result.error.unwrap().kind, "validation");
    }

    #[tokio::test]
    async fn test_unknown_meta_tool_raises() {
        let fixture = fixture().await;
        let err = fixture.provider.call("tool_bogus", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_allowed_servers_filter() {
        let fixture = fixture().await;
        fixture
            .provider
            .set_allowed_servers(Some(["fs".to_string()].into()));

        let result = list(&fixture.provider, json!({})).await;
        assert_eq!(result.servers, vec!["fs"]);
        assert_eq!(result.total_count, 2);

        let result = invoke(
            &fixture.provider,
            json!({"server": "db", "toolName": "query"}),
        )
        .await;
        assert_eq!(result.error.unwrap().kind, "not_found");

        // Lifting the filter restores visibility.
        fixture.provider.set_allowed_servers(None);
        let result = list(&fixture.provider, json!({})).await;
        assert_eq!(result.total_count, 3);
    }

    #[tokio::test]
    async fn test_invoke_after_remove_is_not_found() {
        let fixture = fixture().await;
        fixture.supervisor.remove("db", true).await.unwrap();
        let result = invoke(
            &fixture.provider,
            json!({"server": "db", "toolName": "query"}),
        )
        .await;
        assert_eq!(result.error.unwrap().kind, "not_found");
    }
}
