//! Durable preset store.
//!
//! All presets live in one JSON document written atomically (temp sibling,
//! fsync, rename). Saves are serialized; subscribers are notified through
//! bounded channels and can never block or fail a save.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::types::{
    Preset, PresetConfig, PresetEvent, PresetFile, PresetStrategy, PresetTestResult,
    PRESET_FILE_VERSION,
};
use crate::error::{ProxyError, ProxyResult};
use crate::tags::{TagIndex, TagQuery};

static PRESET_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("preset name pattern"));

const SUBSCRIBER_BUFFER: usize = 16;

pub struct PresetStore {
    path: PathBuf,
    presets: RwLock<BTreeMap<String, Preset>>,
    subscribers: Mutex<Vec<mpsc::Sender<PresetEvent>>>,
    /// Serializes mutation + persistence so concurrent saves linearize.
    save_lock: tokio::sync::Mutex<()>,
}

impl PresetStore {
    /// Open the store, reading the document when it exists.
    pub async fn open(path: impl Into<PathBuf>) -> ProxyResult<Self> {
        let path = path.into();
        let presets = match tokio::fs::read_to_string(&path).await {
            Ok(content) => parse_document(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(ProxyError::PersistenceFailed(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            presets: RwLock::new(presets),
            subscribers: Mutex::new(Vec::new()),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, name: &str) -> Option<Preset> {
        self.presets.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<Preset> {
        self.presets.read().values().cloned().collect()
    }

    /// Create or update a preset. Returns non-fatal warnings (e.g. servers the
    /// author referenced that are not currently live).
    pub async fn save(
        &self,
        name: &str,
        config: PresetConfig,
        live_servers: &BTreeSet<String>,
    ) -> ProxyResult<Vec<String>> {
        let _serialized = self.save_lock.lock().await;

        if !PRESET_NAME.is_match(name) {
            return Err(ProxyError::Validation(format!(
                "preset name '{name}' must match [A-Za-z0-9_-]{{1,64}}"
            )));
        }
        let strategy = config.strategy();
        let tag_query = build_query(strategy, &config)?;

        let warnings: Vec<String> = config
            .servers
            .iter()
            .filter(|server| !live_servers.contains(*server))
            .map(|server| format!("server '{server}' is not in the live configuration"))
            .collect();
        for warning in &warnings {
            warn!("preset '{name}': {warning}");
        }

        let now = Utc::now();
        {
            let mut presets = self.presets.write();
            let (created, last_used) = presets
                .get(name)
                .map(|p| (p.created, p.last_used))
                .unwrap_or((now, None));
            presets.insert(
                name.to_string(),
                Preset {
                    name: name.to_string(),
                    strategy,
                    tag_query: tag_query.to_json(),
                    display_name: config.display_name,
                    created,
                    last_modified: now,
                    last_used,
                },
            );
        }

        self.persist().await?;
        self.notify(PresetEvent::Saved(name.to_string()));
        Ok(warnings)
    }

    pub async fn delete(&self, name: &str) -> ProxyResult<()> {
        let _serialized = self.save_lock.lock().await;
        if self.presets.write().remove(name).is_none() {
            return Err(ProxyError::preset_not_found(name));
        }
        self.persist().await?;
        self.notify(PresetEvent::Deleted(name.to_string()));
        Ok(())
    }

    /// Touch `lastUsed`. Persisted, but not announced to subscribers.
    pub async fn mark_used(&self, name: &str) -> ProxyResult<()> {
        let _serialized = self.save_lock.lock().await;
        {
            let mut presets = self.presets.write();
            let preset = presets
                .get_mut(name)
                .ok_or_else(|| ProxyError::preset_not_found(name))?;
            preset.last_used = Some(Utc::now());
        }
        self.persist().await
    }

    /// Resolve a preset into its parsed tag query.
    pub fn resolve_to_expression(&self, name: &str) -> ProxyResult<TagQuery> {
        let preset = self
            .get(name)
            .ok_or_else(|| ProxyError::preset_not_found(name))?;
        TagQuery::from_json(&preset.tag_query)
    }

    /// Dry-run a preset against the live index.
    pub fn test(&self, name: &str, index: &TagIndex) -> ProxyResult<PresetTestResult> {
        let query = self.resolve_to_expression(name)?;
        let mut tags = Vec::new();
        collect_leaf_tags(&query, &mut tags);
        tags.sort();
        tags.dedup();
        Ok(PresetTestResult {
            servers: index.evaluate(&query),
            tags,
        })
    }

    /// Register a change listener. A slow listener loses events (with a log
    /// line); a dropped listener is pruned on the next notification.
    pub fn subscribe(&self) -> mpsc::Receiver<PresetEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Re-read the document after an external edit. Fires [`PresetEvent::Reloaded`]
    /// only when the content actually changed (our own atomic writes also wake
    /// the file watcher).
    pub async fn reload_from_disk(&self) -> ProxyResult<bool> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::from("{}"),
            Err(e) => {
                return Err(ProxyError::PersistenceFailed(format!(
                    "read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let incoming = parse_document(&content)?;
        let changed = {
            let mut presets = self.presets.write();
            if *presets == incoming {
                false
            } else {
                *presets = incoming;
                true
            }
        };
        if changed {
            info!("presets reloaded from {}", self.path.display());
            self.notify(PresetEvent::Reloaded);
        }
        Ok(changed)
    }

    /// Watch the document for external edits. The returned watcher must be
    /// kept alive by the caller.
    pub fn watch(self: &Arc<Self>) -> ProxyResult<RecommendedWatcher> {
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ProxyError::PersistenceFailed("preset path has no parent".into()))?;
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let watched = self.path.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                if event.paths.iter().any(|p| p == &watched) {
                    let _ = tx.send(());
                }
            }
        })
        .map_err(|e| ProxyError::PersistenceFailed(format!("start preset watcher: {e}")))?;
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(|e| ProxyError::PersistenceFailed(format!("watch {}: {e}", parent.display())))?;

        let store = Arc::clone(self);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                while rx.try_recv().is_ok() {}
                if let Err(e) = store.reload_from_disk().await {
                    warn!("preset reload after external edit failed: {e}");
                }
            }
        });
        Ok(watcher)
    }

    async fn persist(&self) -> ProxyResult<()> {
        let document = PresetFile {
            version: PRESET_FILE_VERSION.to_string(),
            presets: self.presets.read().clone(),
        };
        let content = serde_json::to_vec_pretty(&document)
            .map_err(|e| ProxyError::PersistenceFailed(format!("serialize presets: {e}")))?;

        let tmp = self.path.with_extension("json.tmp");
        let file_result: std::io::Result<()> = async {
            if let Some(parent) = self.path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&tmp, &content).await?;
            let file = tokio::fs::File::open(&tmp).await?;
            file.sync_all().await?;
            tokio::fs::rename(&tmp, &self.path).await
        }
        .await;
        file_result.map_err(|e| {
            ProxyError::PersistenceFailed(format!("write {}: {e}", self.path.display()))
        })?;
        debug!("persisted {} preset(s)", document.presets.len());
        Ok(())
    }

    fn notify(&self, event: PresetEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("preset subscriber lagging, dropping {event:?}");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

fn parse_document(content: &str) -> ProxyResult<BTreeMap<String, Preset>> {
    let file: PresetFile = serde_json::from_str(content)
        .map_err(|e| ProxyError::PersistenceFailed(format!("parse presets: {e}")))?;
    Ok(file.presets)
}

fn build_query(strategy: PresetStrategy, config: &PresetConfig) -> ProxyResult<TagQuery> {
    match strategy {
        PresetStrategy::SimpleOr | PresetStrategy::SimpleAnd => {
            let leaves: Vec<TagQuery> = config
                .tags
                .iter()
                .filter(|t| !t.trim().is_empty())
                .map(|t| TagQuery::Tag(t.clone()))
                .collect();
            Ok(match strategy {
                PresetStrategy::SimpleOr => TagQuery::Or(leaves),
                _ => TagQuery::And(leaves),
            })
        }
        PresetStrategy::Advanced => {
            let expression = config.tag_expression.as_deref().ok_or_else(|| {
                ProxyError::Validation("advanced strategy requires tagExpression".to_string())
            })?;
            TagQuery::parse(expression)
        }
    }
}

fn collect_leaf_tags(query: &TagQuery, out: &mut Vec<String>) {
    match query {
        TagQuery::Tag(tag) => out.push(crate::tags::normalize_tag(tag)),
        TagQuery::And(children) | TagQuery::Or(children) => {
            for child in children {
                collect_leaf_tags(child, out);
            }
        }
        TagQuery::Not(child) | TagQuery::Group(child) => collect_leaf_tags(child, out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, PresetStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PresetStore::open(dir.path().join("presets.json"))
            .await
            .unwrap();
        (dir, store)
    }

    fn live(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn simple_or(tags: &[&str]) -> PresetConfig {
        PresetConfig {
            strategy: Some(PresetStrategy::SimpleOr),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            ..PresetConfig::default()
        }
    }

    #[tokio::test]
    async fn test_save_and_get() {
        let (_dir, store) = store().await;
        let warnings = store.save("p1", simple_or(&["files"]), &live(&[])).await.unwrap();
        assert!(warnings.is_empty());

        let preset = store.get("p1").unwrap();
        assert_eq!(preset.strategy, PresetStrategy::SimpleOr);
        assert_eq!(preset.tag_query, serde_json::json!({"$or": [{"tag": "files"}]}));
        assert!(preset.last_used.is_none());
    }

    #[tokio::test]
    async fn test_save_rejects_bad_names() {
        let (_dir, store) = store().await;
        let too_long = "x".repeat(65);
        for name in ["", "has space", "a/b", too_long.as_str()] {
            let err = store
                .save(name, simple_or(&["t"]), &live(&[]))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "validation", "name {name:?}");
        }
    }

    #[tokio::test]
    async fn test_save_warns_for_unknown_servers() {
        let (_dir, store) = store().await;
        let mut config = simple_or(&["files"]);
        config.servers = vec!["fs".to_string(), "ghost".to_string()];
        let warnings = store.save("p1", config, &live(&["fs"])).await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("ghost"));
    }

    #[tokio::test]
    async fn test_advanced_requires_parseable_expression() {
        let (_dir, store) = store().await;
        let config = PresetConfig {
            strategy: Some(PresetStrategy::Advanced),
            tag_expression: Some("files AND".to_string()),
            ..PresetConfig::default()
        };
        assert_eq!(
            store.save("p1", config, &live(&[])).await.unwrap_err().kind(),
            "validation"
        );
        assert!(store.get("p1").is_none());
    }

    #[tokio::test]
    async fn test_persisted_document_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        {
            let store = PresetStore::open(&path).await.unwrap();
            store.save("p1", simple_or(&["files"]), &live(&[])).await.unwrap();
            store
                .save(
                    "p2",
                    PresetConfig {
                        strategy: Some(PresetStrategy::Advanced),
                        tag_expression: Some("a AND NOT b".to_string()),
                        display_name: Some("Advanced".to_string()),
                        ..PresetConfig::default()
                    },
                    &live(&[]),
                )
                .await
                .unwrap();
        }

        let reopened = PresetStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().len(), 2);
        let query = reopened.resolve_to_expression("p2").unwrap();
        assert!(query.matches(&["a".to_string()]));
        assert!(!query.matches(&["a".to_string(), "b".to_string()]));

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["version"], "1.0.0");
        assert!(raw["presets"]["p1"]["tagQuery"].is_object());
    }

    #[tokio::test]
    async fn test_update_preserves_created() {
        let (_dir, store) = store().await;
        store.save("p1", simple_or(&["a"]), &live(&[])).await.unwrap();
        let created = store.get("p1").unwrap().created;
        store.save("p1", simple_or(&["b"]), &live(&[])).await.unwrap();
        let updated = store.get("p1").unwrap();
        assert_eq!(updated.created, created);
        assert!(updated.last_modified >= created);
    }

    #[tokio::test]
    async fn test_delete() {
        let (_dir, store) = store().await;
        store.save("p1", simple_or(&["a"]), &live(&[])).await.unwrap();
        store.delete("p1").await.unwrap();
        assert!(store.get("p1").is_none());
        assert_eq!(store.delete("p1").await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_mark_used() {
        let (_dir, store) = store().await;
        store.save("p1", simple_or(&["a"]), &live(&[])).await.unwrap();
        store.mark_used("p1").await.unwrap();
        assert!(store.get("p1").unwrap().last_used.is_some());
        assert_eq!(store.mark_used("nope").await.unwrap_err().kind(), "not_found");
    }

    #[tokio::test]
    async fn test_subscribers_see_saves_in_order() {
        let (_dir, store) = store().await;
        let mut rx = store.subscribe();
        store.save("p1", simple_or(&["a"]), &live(&[])).await.unwrap();
        store.save("p2", simple_or(&["b"]), &live(&[])).await.unwrap();
        store.delete("p1").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), PresetEvent::Saved("p1".into()));
        assert_eq!(rx.recv().await.unwrap(), PresetEvent::Saved("p2".into()));
        assert_eq!(rx.recv().await.unwrap(), PresetEvent::Deleted("p1".into()));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_save() {
        let (_dir, store) = store().await;
        let rx = store.subscribe();
        drop(rx);
        store.save("p1", simple_or(&["a"]), &live(&[])).await.unwrap();
        assert!(store.get("p1").is_some());
    }

    #[tokio::test]
    async fn test_external_edit_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("presets.json");
        let store = PresetStore::open(&path).await.unwrap();
        let mut rx = store.subscribe();

        tokio::fs::write(
            &path,
            r#"{"version":"1.0.0","presets":{"ext":{
                "name":"ext","strategy":"simple-and",
                "tagQuery":{"$and":[{"tag":"x"}]},
                "created":"2026-01-01T00:00:00Z",
                "lastModified":"2026-01-01T00:00:00Z"}}}"#,
        )
        .await
        .unwrap();

        assert!(store.reload_from_disk().await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), PresetEvent::Reloaded);
        assert!(store.get("ext").is_some());
        // Unchanged content does not re-notify.
        assert!(!store.reload_from_disk().await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_and_test() {
        use crate::config::ServerDescriptor;

        let (_dir, store) = store().await;
        store
            .save("files-only", simple_or(&["files"]), &live(&[]))
            .await
            .unwrap();

        let mut fs: ServerDescriptor = serde_json::from_value(serde_json::json!({
            "type": "stdio", "command": "mcp-fs", "tags": ["files"]
        }))
        .unwrap();
        fs.name = "fs".to_string();
        let mut db = fs.clone();
        db.name = "db".to_string();
        db.tags = vec!["data".to_string()];
        let servers: std::collections::BTreeMap<_, _> =
            [("fs".to_string(), fs), ("db".to_string(), db)].into();
        let index = TagIndex::build(&servers);

        let result = store.test("files-only", &index).unwrap();
        assert_eq!(result.servers, live(&["fs"]));
        assert_eq!(result.tags, vec!["files".to_string()]);
        assert_eq!(
            store.test("missing", &index).unwrap_err().kind(),
            "not_found"
        );
    }

    #[tokio::test]
    async fn test_concurrent_saves_linearize() {
        let (_dir, store) = store().await;
        let store = std::sync::Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .save(&format!("p{i}"), simple_or(&["t"]), &BTreeSet::new())
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(store.list().len(), 8);
    }
}
