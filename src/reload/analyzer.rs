//! Configuration change analysis.
//!
//! Pure diff of two server maps into per-server impact records, a summary,
//! and apply recommendations. A change to the transport identity (kind,
//! command, args, url) is rewritten as a REMOVE+ADD pair; tag-only edits are
//! non-disruptive; any other parameter change forces a reconnect.

use std::collections::BTreeMap;

use crate::config::ServerDescriptor;

const ADD_MS: u64 = 100;
const REMOVE_MS: u64 = 500;
const MODIFY_TAGS_MS: u64 = 100;
const MODIFY_RECONNECT_MS: u64 = 2_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Remove,
    /// Tag-only edit, applied in place.
    ModifyTags,
    /// Executable-parameter edit (env, cwd, headers, timeout, restart policy).
    ModifyReconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerChange {
    pub name: String,
    pub kind: ChangeKind,
    pub restart_required: bool,
    pub disrupts_connections: bool,
    pub estimated_ms: u64,
}

impl ServerChange {
    fn new(name: &str, kind: ChangeKind) -> Self {
        let (restart_required, disrupts_connections, estimated_ms) = match kind {
            ChangeKind::Add => (false, false, ADD_MS),
            ChangeKind::Remove => (false, true, REMOVE_MS),
            ChangeKind::ModifyTags => (false, false, MODIFY_TAGS_MS),
            ChangeKind::ModifyReconnect => (true, true, MODIFY_RECONNECT_MS),
        };
        Self {
            name: name.to_string(),
            kind,
            restart_required,
            disrupts_connections,
            estimated_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub modified: usize,
    pub requires_full_restart: bool,
    pub can_partial_reload: bool,
    pub requires_connection_migration: bool,
    pub estimated_total_downtime_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendationKind {
    Full,
    Partial,
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub reason: String,
    pub user_action_required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadImpactAnalysis {
    pub changes: Vec<ServerChange>,
    pub summary: ReloadSummary,
    pub recommendations: Vec<Recommendation>,
}

impl ReloadImpactAnalysis {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes_of(&self, kind: ChangeKind) -> impl Iterator<Item = &ServerChange> {
        self.changes.iter().filter(move |c| c.kind == kind)
    }
}

/// Diff two configuration generations.
pub fn analyze(
    old: &BTreeMap<String, ServerDescriptor>,
    new: &BTreeMap<String, ServerDescriptor>,
) -> ReloadImpactAnalysis {
    let mut changes = Vec::new();
    let mut migrations = 0usize;

    for (name, old_descriptor) in old {
        match new.get(name) {
            None => changes.push(ServerChange::new(name, ChangeKind::Remove)),
            Some(new_descriptor) if old_descriptor == new_descriptor => {}
            Some(new_descriptor) => {
                if old_descriptor
                    .transport
                    .identity_differs(&new_descriptor.transport)
                {
                    // A different transport identity is a different server.
                    changes.push(ServerChange::new(name, ChangeKind::Remove));
                    changes.push(ServerChange::new(name, ChangeKind::Add));
                    migrations += 1;
                } else if old_descriptor.tags_only_change(new_descriptor) {
                    changes.push(ServerChange::new(name, ChangeKind::ModifyTags));
                } else {
                    changes.push(ServerChange::new(name, ChangeKind::ModifyReconnect));
                }
            }
        }
    }
    for name in new.keys() {
        if !old.contains_key(name) {
            changes.push(ServerChange::new(name, ChangeKind::Add));
        }
    }

    let added = changes.iter().filter(|c| c.kind == ChangeKind::Add).count();
    let removed = changes
        .iter()
        .filter(|c| c.kind == ChangeKind::Remove)
        .count();
    let modified = changes
        .iter()
        .filter(|c| matches!(c.kind, ChangeKind::ModifyTags | ChangeKind::ModifyReconnect))
        .count();

    let summary = ReloadSummary {
        added,
        removed,
        modified,
        // Reserved; no change class forces a full restart since transport
        // edits became REMOVE+ADD pairs.
        requires_full_restart: false,
        can_partial_reload: true,
        requires_connection_migration: migrations > 0,
        estimated_total_downtime_ms: changes.iter().map(|c| c.estimated_ms).sum(),
    };

    let mut recommendations = Vec::new();
    if !changes.is_empty() {
        if summary.requires_full_restart {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Full,
                reason: "a change class in this diff requires a full restart".to_string(),
                user_action_required: false,
            });
        }
        recommendations.push(Recommendation {
            kind: RecommendationKind::Partial,
            reason: format!(
                "{} change(s) can be applied with at most {} ms of per-server downtime",
                changes.len(),
                summary.estimated_total_downtime_ms
            ),
            user_action_required: false,
        });
        if removed > 0 || summary.requires_connection_migration {
            recommendations.push(Recommendation {
                kind: RecommendationKind::Deferred,
                reason: "removals or transport changes will disrupt active connections; \
                         review before applying"
                    .to_string(),
                user_action_required: true,
            });
        }
    }

    ReloadImpactAnalysis {
        changes,
        summary,
        recommendations,
    }
}
