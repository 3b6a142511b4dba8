//! Lightweight tool metadata registry.
//!
//! An immutable snapshot of every tool name/description/tag triple across the
//! connected upstreams, ordered by (server, tool). Rebuilt wholesale on each
//! capability refresh; discovery requests page through it with opaque
//! `server:offset` cursors.

use std::collections::{BTreeSet, HashSet};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// `(server, tool)` pair used as the cache and registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedTool {
    pub server: String,
    pub name: String,
}

impl QualifiedTool {
    pub fn new(server: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for QualifiedTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.server, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolMetadata {
    pub server: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ToolListFilter {
    pub server: Option<String>,
    pub name_pattern: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolListPage {
    pub items: Vec<ToolMetadata>,
    pub total_count: usize,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Match `value` against a discovery pattern: `*`-glob when the pattern
/// contains a wildcard, case-insensitive substring otherwise.
pub fn name_pattern_matches(pattern: &str, value: &str) -> bool {
    let pattern = pattern.to_lowercase();
    let value = value.to_lowercase();
    if !pattern.contains('*') {
        return value.contains(&pattern);
    }
    let mut remainder = value.as_str();
    let segments: Vec<&str> = pattern.split('*').collect();
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            match remainder.strip_prefix(segment) {
                Some(rest) => remainder = rest,
                None => return false,
            }
        } else if i == segments.len() - 1 {
            return remainder.ends_with(segment);
        } else {
            match remainder.find(segment) {
                Some(pos) => remainder = &remainder[pos + segment.len()..],
                None => return false,
            }
        }
    }
    // Pattern ended with `*` (or was all wildcards).
    segments.last().map(|s| s.is_empty()).unwrap_or(true) || remainder.is_empty()
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    /// Sorted by (server, name).
    tools: Vec<ToolMetadata>,
    keys: HashSet<QualifiedTool>,
    servers: BTreeSet<String>,
}

impl ToolRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(mut tools: Vec<ToolMetadata>) -> Self {
        tools.sort_by(|a, b| (&a.server, &a.name).cmp(&(&b.server, &b.name)));
        tools.dedup_by(|a, b| a.server == b.server && a.name == b.name);
        let keys = tools
            .iter()
            .map(|t| QualifiedTool::new(&t.server, &t.name))
            .collect();
        let servers = tools.iter().map(|t| t.server.clone()).collect();
        Self { tools, keys, servers }
    }

    pub fn has_tool(&self, server: &str, name: &str) -> bool {
        self.keys
            .contains(&QualifiedTool::new(server, name))
    }

    pub fn get(&self, server: &str, name: &str) -> Option<&ToolMetadata> {
        self.tools
            .binary_search_by(|t| (t.server.as_str(), t.name.as_str()).cmp(&(server, name)))
            .ok()
            .map(|i| &self.tools[i])
    }

    pub fn servers(&self) -> Vec<String> {
        self.servers.iter().cloned().collect()
    }

    pub fn size(&self) -> usize {
        self.tools.len()
    }

    pub fn all(&self) -> &[ToolMetadata] {
        &self.tools
    }

    /// New snapshot holding only tools from the allowed servers.
    pub fn filter_by_servers(&self, allowed: &BTreeSet<String>) -> ToolRegistry {
        ToolRegistry::new(
            self.tools
                .iter()
                .filter(|t| allowed.contains(&t.server))
                .cloned()
                .collect(),
        )
    }

    /// Paged listing. An unreadable cursor is logged and treated as "start".
    pub fn list_tools(&self, filter: &ToolListFilter) -> ToolListPage {
        let filtered: Vec<&ToolMetadata> = self
            .tools
            .iter()
            .filter(|t| {
                filter
                    .server
                    .as_deref()
                    .map(|server| t.server == server)
                    .unwrap_or(true)
                    && filter
                        .name_pattern
                        .as_deref()
                        .map(|pattern| name_pattern_matches(pattern, &t.name))
                        .unwrap_or(true)
                    && filter
                        .tag
                        .as_deref()
                        .map(|tag| {
                            let tag = crate::tags::normalize_tag(tag);
                            t.tags.iter().any(|t| crate::tags::normalize_tag(t) == tag)
                        })
                        .unwrap_or(true)
            })
            .collect();
        let total_count = filtered.len();

        let start = match filter.cursor.as_deref() {
            None => 0,
            Some(raw) => match decode_cursor(raw) {
                Some((server, offset)) => position_of(&filtered, &server, offset),
                None => {
                    warn!("unreadable tool cursor {raw:?}, restarting from the beginning");
                    0
                }
            },
        };

        let limit = filter.limit.unwrap_or(total_count.max(1));
        let end = start.saturating_add(limit).min(total_count);
        let items: Vec<ToolMetadata> = filtered[start.min(total_count)..end]
            .iter()
            .map(|t| (*t).clone())
            .collect();

        let has_more = end < total_count;
        let next_cursor = if has_more {
            let next = filtered[end];
            let offset = filtered[..end]
                .iter()
                .filter(|t| t.server == next.server)
                .count();
            Some(encode_cursor(&next.server, offset))
        } else {
            None
        };

        ToolListPage {
            items,
            total_count,
            has_more,
            next_cursor,
        }
    }
}

fn encode_cursor(server: &str, offset: usize) -> String {
    BASE64.encode(format!("{server}:{offset}"))
}

fn decode_cursor(raw: &str) -> Option<(String, usize)> {
    let decoded = BASE64.decode(raw).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (server, offset) = text.rsplit_once(':')?;
    if server.is_empty() {
        return None;
    }
    Some((server.to_string(), offset.parse().ok()?))
}

/// Global position of `offset` within `server`'s block, skipping past the
/// whole block of any server that no longer exists.
fn position_of(filtered: &[&ToolMetadata], server: &str, offset: usize) -> usize {
    let before = filtered
        .iter()
        .take_while(|t| t.server.as_str() < server)
        .count();
    let block = filtered[before..]
        .iter()
        .take_while(|t| t.server == server)
        .count();
    before + offset.min(block)
}
