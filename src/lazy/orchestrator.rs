//! Lazy-loading orchestrator.
//!
//! Composition root for downstream discovery: owns the tool registry
//! generations, the schema cache, and the meta-tool provider, and keeps them
//! in step with the supervisor's connection map. With lazy loading enabled a
//! downstream client sees only the three meta-tools plus full resources and
//! prompts; disabled, it sees the whole aggregated catalog.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use rmcp::model::Tool;
use serde_json::Value;
use tracing::{debug, info};

use crate::aggregate::{self, AggregatedCapabilities, AggregatedPrompt, AggregatedResource};
use crate::cache::SchemaCache;
use crate::config::{LazyLoadingConfig, PreloadConfig};
use crate::error::{ProxyError, ProxyResult};
use crate::meta::{MetaToolProvider, MetaToolResponse};
use crate::registry::{name_pattern_matches, QualifiedTool, ToolMetadata, ToolRegistry};
use crate::upstream::{SupervisorEvent, UpstreamSupervisor};

/// What a downstream client is offered at initialize time.
#[derive(Debug, Clone)]
pub struct DownstreamCapabilities {
    pub tools: Vec<Tool>,
    pub resources: Vec<AggregatedResource>,
    pub prompts: Vec<AggregatedPrompt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenSavings {
    pub full_tokens: u64,
    pub current_tokens: u64,
    pub percent_saved: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LazyStatistics {
    pub enabled: bool,
    pub registered_tool_count: usize,
    pub loaded_tool_count: usize,
    pub cache_hit_rate: f64,
    pub token_savings: TokenSavings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthStatus {
    pub healthy: bool,
    pub warnings: Vec<String>,
}

pub struct LazyLoadingOrchestrator {
    supervisor: Arc<UpstreamSupervisor>,
    registry: Arc<ArcSwap<ToolRegistry>>,
    cache: Arc<SchemaCache>,
    provider: MetaToolProvider,
    config: LazyLoadingConfig,
    capabilities: RwLock<AggregatedCapabilities>,
}

impl LazyLoadingOrchestrator {
    pub fn new(supervisor: Arc<UpstreamSupervisor>, config: LazyLoadingConfig) -> Self {
        let registry = Arc::new(ArcSwap::from_pointee(ToolRegistry::empty()));
        let cache = Arc::new(SchemaCache::new(&config.cache));
        let provider = MetaToolProvider::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&supervisor),
        );
        Self {
            supervisor,
            registry,
            cache,
            provider,
            config,
            capabilities: RwLock::new(AggregatedCapabilities::empty()),
        }
    }

    /// First capability snapshot plus configured schema preloading.
    pub async fn initialize(&self) -> ProxyResult<()> {
        self.refresh_capabilities().await;
        let selected = select_preload(&self.registry.load(), &self.config.preload);
        if !selected.is_empty() {
            info!("preloading {} schema(s)", selected.len());
            self.preload_tools_list(selected).await;
        }
        Ok(())
    }

    /// Rebuild the registry and capability snapshot from Connected upstreams.
    pub async fn refresh_capabilities(&self) -> usize {
        let aggregated = aggregate::aggregate(&self.supervisor).await;

        let tags_by_server: HashMap<String, Vec<String>> = self
            .supervisor
            .entries()
            .into_iter()
            .map(|connection| (connection.name, connection.descriptor.tags))
            .collect();

        let metadata: Vec<ToolMetadata> = aggregated
            .tools
            .iter()
            .map(|entry| ToolMetadata {
                server: entry.server.clone(),
                name: entry.tool.name.to_string(),
                description: entry.tool.description.as_ref().map(|d| d.to_string()),
                tags: tags_by_server
                    .get(&entry.server)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect();

        let count = metadata.len();
        self.registry.store(Arc::new(ToolRegistry::new(metadata)));
        *self.capabilities.write() = aggregated;
        debug!("registry rebuilt with {count} tool(s)");
        count
    }

    /// Downstream view, gated on the lazy-loading switch.
    pub fn get_capabilities(&self) -> DownstreamCapabilities {
        let capabilities = self.capabilities.read();
        let tools = if self.config.enabled {
            MetaToolProvider::definitions()
        } else {
            capabilities.tools.iter().map(|t| t.tool.clone()).collect()
        };
        DownstreamCapabilities {
            tools,
            resources: capabilities.resources.clone(),
            prompts: capabilities.prompts.clone(),
        }
    }

    /// With the static meta-tool surface there is nothing to notify about;
    /// the full catalog changes whenever upstreams do.
    pub fn should_notify_list_changed(&self) -> bool {
        !self.config.enabled
    }

    pub fn is_meta_tool(&self, name: &str) -> bool {
        crate::meta::is_meta_tool(name)
    }

    pub async fn call_meta_tool(&self, name: &str, args: Value) -> ProxyResult<MetaToolResponse> {
        self.provider.call(name, args).await
    }

    pub fn provider(&self) -> &MetaToolProvider {
        &self.provider
    }

    pub fn cache(&self) -> &Arc<SchemaCache> {
        &self.cache
    }

    pub fn registry(&self) -> Arc<ToolRegistry> {
        self.registry.load_full()
    }

    /// Load the given schemas through the cache with bounded concurrency.
    pub async fn preload_tools_list(&self, list: Vec<QualifiedTool>) -> usize {
        let supervisor = Arc::clone(&self.supervisor);
        self.cache
            .preload(list, move |key| {
                let supervisor = Arc::clone(&supervisor);
                async move { load_schema(&supervisor, &key).await }
            })
            .await
    }

    /// React to a supervisor event: removed servers lose their cached schemas,
    /// and any capability change rebuilds the registry generation.
    pub async fn handle_event(&self, event: &SupervisorEvent) {
        match event {
            SupervisorEvent::ServerRemoved { server } => {
                self.cache.invalidate_by_server(server);
                self.refresh_capabilities().await;
            }
            SupervisorEvent::ServerCapabilitiesUpdated { .. } => {
                self.refresh_capabilities().await;
            }
            SupervisorEvent::StatusChanged { .. } | SupervisorEvent::ReloadCompleted { .. } => {}
        }
    }

    /// Pump supervisor events into [`Self::handle_event`] until the supervisor
    /// goes away.
    pub fn spawn_event_pump(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut events = orchestrator.supervisor.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => orchestrator.handle_event(&event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("event pump lagged, missed {missed} event(s); refreshing");
                        orchestrator.refresh_capabilities().await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    pub fn get_statistics(&self) -> LazyStatistics {
        let capabilities = self.capabilities.read();
        let stats = self.cache.stats();
        let tools = capabilities.tools.len() as u64;
        let extras = (capabilities.resources.len() + capabilities.prompts.len()) as u64;

        let full_tokens = 300 * tools + 50 * extras;
        let current_tokens = if self.config.enabled {
            300 + 10 * tools + 50 * extras
        } else {
            full_tokens
        };
        let percent_saved = if full_tokens == 0 {
            0.0
        } else {
            (1.0 - current_tokens as f64 / full_tokens as f64).max(0.0) * 100.0
        };

        LazyStatistics {
            enabled: self.config.enabled,
            registered_tool_count: self.registry.load().size(),
            loaded_tool_count: stats.size,
            cache_hit_rate: stats.hit_rate(),
            token_savings: TokenSavings {
                full_tokens,
                current_tokens,
                percent_saved,
            },
        }
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let stats = self.cache.stats();
        let mut warnings = Vec::new();
        if stats.utilization() > 0.9 {
            warnings.push(format!(
                "schema cache over 90% full ({}/{})",
                stats.size, stats.capacity
            ));
        }
        if stats.request_count() >= 100 && stats.hit_rate() < 0.5 {
            warnings.push(format!(
                "schema cache hit rate below 50% ({:.0}%)",
                stats.hit_rate() * 100.0
            ));
        }
        if stats.evictions > 100 {
            warnings.push(format!("high eviction count ({})", stats.evictions));
        }
        HealthStatus {
            healthy: warnings.is_empty(),
            warnings,
        }
    }
}

/// Fetch one tool's full schema from its live upstream.
async fn load_schema(
    supervisor: &UpstreamSupervisor,
    key: &QualifiedTool,
) -> ProxyResult<Value> {
    let client = supervisor
        .client(&key.server)
        .ok_or_else(|| ProxyError::Upstream(format!("server '{}' is not connected", key.server)))?;
    let tools = client.list_tools().await?;
    let tool = tools
        .into_iter()
        .find(|t| t.name == key.name)
        .ok_or_else(|| ProxyError::tool_not_found(&key.server, &key.name))?;
    serde_json::to_value(&tool).map_err(|e| ProxyError::Internal(format!("serialize schema: {e}")))
}

/// Choose the schemas to warm at startup: servers matching any `*`-glob
/// pattern, plus tools whose name contains any keyword.
pub fn select_preload(registry: &ToolRegistry, preload: &PreloadConfig) -> Vec<QualifiedTool> {
    registry
        .all()
        .iter()
        .filter(|tool| {
            preload
                .patterns
                .iter()
                .any(|pattern| name_pattern_matches(pattern, &tool.server))
                || preload
                    .keywords
                    .iter()
                    .any(|keyword| tool.name.to_lowercase().contains(&keyword.to_lowercase()))
        })
        .map(|tool| QualifiedTool::new(&tool.server, &tool.name))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::meta::TOOL_LIST;
    use crate::upstream::supervisor::test_support::{descriptor, wait_for_status, ScriptedConnector};
    use crate::upstream::ConnectionStatus;

    async fn fixture(enabled: bool) -> (Arc<LazyLoadingOrchestrator>, Arc<ScriptedConnector>) {
        let connector = ScriptedConnector::new()
            .with_server("fs", &["read", "write"])
            .with_server("db", &["query"]);
        let supervisor = Arc::new(UpstreamSupervisor::new(connector.clone()));
        supervisor.add(descriptor("fs", &["files"])).unwrap();
        supervisor.add(descriptor("db", &["data"])).unwrap();
        wait_for_status(&supervisor, "fs", ConnectionStatus::Connected).await;
        wait_for_status(&supervisor, "db", ConnectionStatus::Connected).await;

        let config = LazyLoadingConfig {
            enabled,
            ..LazyLoadingConfig::default()
        };
        let orchestrator = Arc::new(LazyLoadingOrchestrator::new(supervisor, config));
        orchestrator.initialize().await.unwrap();
        (orchestrator, connector)
    }

    #[tokio::test]
    async fn test_lazy_discovery_scenario() {
        // Two upstreams, lazy loading on: downstream sees the meta-tools and
        // tool_list{} answers with the whole ordered catalog.
        let (orchestrator, _) = fixture(true).await;

        let capabilities = orchestrator.get_capabilities();
        let names: Vec<&str> = capabilities.tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, vec!["tool_list", "tool_schema", "tool_invoke"]);
        assert!(!orchestrator.should_notify_list_changed());

        let response = orchestrator
            .call_meta_tool(TOOL_LIST, json!({}))
            .await
            .unwrap();
        let wire = response.to_value();
        assert_eq!(wire["totalCount"], json!(3));
        assert_eq!(wire["servers"], json!(["db", "fs"]));
        assert_eq!(wire["hasMore"], json!(false));
        let listed: Vec<String> = wire["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| format!("{}/{}", t["server"].as_str().unwrap(), t["name"].as_str().unwrap()))
            .collect();
        assert_eq!(listed, vec!["db/query", "fs/read", "fs/write"]);
    }

    #[tokio::test]
    async fn test_disabled_exposes_full_catalog() {
        let (orchestrator, _) = fixture(false).await;
        let capabilities = orchestrator.get_capabilities();
        assert_eq!(capabilities.tools.len(), 3);
        assert!(orchestrator.should_notify_list_changed());
    }

    #[tokio::test]
    async fn test_refresh_tracks_supervisor_events() {
        let (orchestrator, connector) = fixture(true).await;
        assert_eq!(orchestrator.registry().size(), 3);

        // A removed server disappears from the registry and the cache.
        orchestrator
            .call_meta_tool(
                crate::meta::TOOL_SCHEMA,
                json!({"server": "fs", "toolName": "read"}),
            )
            .await
            .unwrap();
        assert_eq!(orchestrator.cache().size(), 1);

        let supervisor = Arc::clone(&orchestrator.supervisor);
        supervisor.remove("fs", true).await.unwrap();
        orchestrator
            .handle_event(&SupervisorEvent::ServerRemoved {
                server: "fs".to_string(),
            })
            .await;

        assert_eq!(orchestrator.registry().size(), 1);
        assert!(orchestrator
            .cache()
            .get_if_cached(&QualifiedTool::new("fs", "read"))
            .is_none());
        drop(connector);
    }

    #[tokio::test]
    async fn test_registry_rebuilds_once_per_event() {
        let (orchestrator, _) = fixture(true).await;
        let before = orchestrator.registry();
        orchestrator
            .handle_event(&SupervisorEvent::ServerCapabilitiesUpdated {
                server: "fs".to_string(),
            })
            .await;
        let after_first = orchestrator.registry();
        orchestrator
            .handle_event(&SupervisorEvent::ServerCapabilitiesUpdated {
                server: "db".to_string(),
            })
            .await;
        let after_second = orchestrator.registry();

        // One fresh generation per event; status changes alone do not rebuild.
        assert!(!Arc::ptr_eq(&before, &after_first));
        assert!(!Arc::ptr_eq(&after_first, &after_second));
        orchestrator
            .handle_event(&SupervisorEvent::StatusChanged {
                server: "db".to_string(),
                old: ConnectionStatus::Connected,
                new: ConnectionStatus::Connected,
            })
            .await;
        assert!(Arc::ptr_eq(&after_second, &orchestrator.registry()));
    }

    #[tokio::test]
    async fn test_preload_selection_and_loading() {
        let connector = ScriptedConnector::new()
            .with_server("fs", &["read_file", "write_file"])
            .with_server("db", &["query"]);
        let supervisor = Arc::new(UpstreamSupervisor::new(connector.clone()));
        supervisor.add(descriptor("fs", &[])).unwrap();
        supervisor.add(descriptor("db", &[])).unwrap();
        wait_for_status(&supervisor, "fs", ConnectionStatus::Connected).await;
        wait_for_status(&supervisor, "db", ConnectionStatus::Connected).await;

        let config = LazyLoadingConfig {
            enabled: true,
            preload: PreloadConfig {
                patterns: vec!["f*".to_string()],
                keywords: vec!["QUERY".to_string()],
            },
            ..LazyLoadingConfig::default()
        };
        let orchestrator = LazyLoadingOrchestrator::new(supervisor, config);
        orchestrator.initialize().await.unwrap();

        // fs matches by pattern (both tools), db/query by keyword.
        assert_eq!(orchestrator.cache().size(), 3);
        assert!(orchestrator
            .cache()
            .get_if_cached(&QualifiedTool::new("db", "query"))
            .is_some());
    }

    #[test]
    fn test_select_preload_pure() {
        let registry = ToolRegistry::new(vec![
            ToolMetadata {
                server: "fs".into(),
                name: "read_file".into(),
                description: None,
                tags: vec![],
            },
            ToolMetadata {
                server: "db".into(),
                name: "query".into(),
                description: None,
                tags: vec![],
            },
        ]);

        let none = select_preload(&registry, &PreloadConfig::default());
        assert!(none.is_empty());

        let by_pattern = select_preload(
            &registry,
            &PreloadConfig {
                patterns: vec!["*".to_string()],
                keywords: vec![],
            },
        );
        assert_eq!(by_pattern.len(), 2);

        let by_keyword = select_preload(
            &registry,
            &PreloadConfig {
                patterns: vec![],
                keywords: vec!["file".to_string()],
            },
        );
        assert_eq!(by_keyword, vec![QualifiedTool::new("fs", "read_file")]);
    }

    #[tokio::test]
    async fn test_statistics_token_savings() {
        let (orchestrator, _) = fixture(true).await;
        let stats = orchestrator.get_statistics();
        assert!(stats.enabled);
        assert_eq!(stats.registered_tool_count, 3);
        // full = 300 * 3, current = 300 + 10 * 3
        assert_eq!(stats.token_savings.full_tokens, 900);
        assert_eq!(stats.token_savings.current_tokens, 330);
        assert!((stats.token_savings.percent_saved - 63.33).abs() < 0.1);

        let (disabled, _) = fixture(false).await;
        let stats = disabled.get_statistics();
        assert_eq!(stats.token_savings.current_tokens, stats.token_savings.full_tokens);
        assert_eq!(stats.token_savings.percent_saved, 0.0);
    }

    #[tokio::test]
    async fn test_health_warnings() {
        let (orchestrator, _) = fixture(true).await;
        assert!(orchestrator.get_health_status().healthy);

        // Drive the hit rate down with 100+ misses.
        for i in 0..120 {
            orchestrator
                .cache()
                .get_if_cached(&QualifiedTool::new("ghost", format!("t{i}")));
        }
        let health = orchestrator.get_health_status();
        assert!(!health.healthy);
        assert!(health.warnings.iter().any(|w| w.contains("hit rate")));
    }

    #[tokio::test]
    async fn test_event_pump_follows_reload() {
        let (orchestrator, _) = fixture(true).await;
        let _pump = orchestrator.spawn_event_pump();

        let supervisor = Arc::clone(&orchestrator.supervisor);
        supervisor.remove("db", true).await.unwrap();

        // The pump refreshes asynchronously.
        for _ in 0..100 {
            if orchestrator.registry().size() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(orchestrator.registry().size(), 2);
    }
}
