//! Preset data model.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PRESET_FILE_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PresetStrategy {
    SimpleOr,
    SimpleAnd,
    Advanced,
}

/// A named, persisted tag query.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub name: String,
    pub strategy: PresetStrategy,
    /// Structured tag query (`{$and|$or|$not|tag}` form).
    pub tag_query: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Input for [`super::PresetStore::save`].
#[derive(Debug, Clone, Default)]
pub struct PresetConfig {
    pub strategy: Option<PresetStrategy>,
    /// Tags combined by the simple strategies.
    pub tags: Vec<String>,
    /// Infix expression, required by the advanced strategy.
    pub tag_expression: Option<String>,
    pub display_name: Option<String>,
    /// Server names the preset author expects to match; unknown names warn.
    pub servers: Vec<String>,
}

impl PresetConfig {
    pub fn strategy(&self) -> PresetStrategy {
        self.strategy.unwrap_or(PresetStrategy::SimpleOr)
    }
}

/// On-disk document: one JSON file holding every preset.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PresetFile {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub presets: BTreeMap<String, Preset>,
}

fn default_version() -> String {
    PRESET_FILE_VERSION.to_string()
}

/// Result of a dry-run evaluation against the live server index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetTestResult {
    pub servers: BTreeSet<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresetEvent {
    Saved(String),
    Deleted(String),
    /// External edit detected and re-read from disk.
    Reloaded,
}
