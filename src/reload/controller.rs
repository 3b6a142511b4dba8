//! Reload controller.
//!
//! Applies a [`ReloadImpactAnalysis`] against the supervisor with minimal
//! downtime: tag-only edits first (in place), then additions concurrently,
//! then reconnect-modifies, removals last. A same-name REMOVE+ADD pair from a
//! transport change is executed as an atomic replace in the reconnect phase.
//! Failures are collected, never fatal to the remaining operations.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use super::analyzer::{ChangeKind, ReloadImpactAnalysis};
use crate::config::ServerDescriptor;
use crate::error::ProxyError;
use crate::upstream::UpstreamSupervisor;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ReloadOutcome {
    fn ok(&mut self, name: &str) {
        self.succeeded.push(name.to_string());
    }

    fn err(&mut self, name: &str, error: &ProxyError) {
        warn!("reload operation for '{name}' failed: {error}");
        self.failed.push((name.to_string(), error.to_string()));
    }
}

pub struct ReloadController {
    supervisor: Arc<UpstreamSupervisor>,
}

impl ReloadController {
    pub fn new(supervisor: Arc<UpstreamSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Apply the analysis, resolving descriptors from the new generation.
    pub async fn apply(
        &self,
        analysis: &ReloadImpactAnalysis,
        new_config: &BTreeMap<String, ServerDescriptor>,
    ) -> ReloadOutcome {
        if analysis.is_noop() {
            return ReloadOutcome::default();
        }
        if !analysis.summary.can_partial_reload {
            return self.full_reload(new_config).await;
        }

        let mut outcome = ReloadOutcome::default();

        let removals: BTreeSet<&str> = analysis
            .changes_of(ChangeKind::Remove)
            .map(|c| c.name.as_str())
            .collect();
        let additions: BTreeSet<&str> = analysis
            .changes_of(ChangeKind::Add)
            .map(|c| c.name.as_str())
            .collect();
        // Same-name pairs are transport migrations: replace, not add-then-remove.
        let replacements: BTreeSet<&str> = removals.intersection(&additions).copied().collect();

        // Phase 1: tag-only updates, in place.
        for change in analysis.changes_of(ChangeKind::ModifyTags) {
            let Some(descriptor) = new_config.get(&change.name) else {
                outcome.err(&change.name, &ProxyError::server_not_found(&change.name));
                continue;
            };
            match self
                .supervisor
                .update_tags(&change.name, descriptor.tags.clone())
            {
                Ok(()) => outcome.ok(&change.name),
                Err(e) => outcome.err(&change.name, &e),
            }
        }

        // Phase 2: additions, concurrently.
        let adds: Vec<&str> = additions
            .iter()
            .filter(|name| !replacements.contains(*name))
            .copied()
            .collect();
        let results = join_all(adds.iter().map(|name| self.add_one(name, new_config))).await;
        for (name, result) in adds.iter().zip(results) {
            match result {
                Ok(()) => outcome.ok(name),
                Err(e) => outcome.err(name, &e),
            }
        }

        // Phase 3: modifications that need a reconnect, including migrations.
        let reconnects: Vec<&str> = analysis
            .changes_of(ChangeKind::ModifyReconnect)
            .map(|c| c.name.as_str())
            .chain(replacements.iter().copied())
            .collect();
        let results = join_all(
            reconnects
                .iter()
                .map(|name| self.replace_one(name, new_config)),
        )
        .await;
        for (name, result) in reconnects.iter().zip(results) {
            match result {
                Ok(()) => outcome.ok(name),
                Err(e) => outcome.err(name, &e),
            }
        }

        // Phase 4: removals last, so discovery degrades rather than breaks.
        let removes: Vec<&str> = removals
            .iter()
            .filter(|name| !replacements.contains(*name))
            .copied()
            .collect();
        let results = join_all(removes.iter().map(|name| self.remove_one(name))).await;
        for (name, result) in removes.iter().zip(results) {
            match result {
                Ok(()) => outcome.ok(name),
                Err(e) => outcome.err(name, &e),
            }
        }

        info!(
            "reload applied: {} succeeded, {} failed",
            outcome.succeeded.len(),
            outcome.failed.len()
        );
        self.supervisor
            .publish_reload_completed(outcome.succeeded.clone(), outcome.failed.clone());
        outcome
    }

    /// Idempotent add: a server that is already present counts as applied.
    async fn add_one(
        &self,
        name: &str,
        new_config: &BTreeMap<String, ServerDescriptor>,
    ) -> Result<(), ProxyError> {
        if self.supervisor.has(name) {
            return Ok(());
        }
        let descriptor = new_config
            .get(name)
            .ok_or_else(|| ProxyError::server_not_found(name))?;
        self.supervisor.add(descriptor.clone())
    }

    async fn replace_one(
        &self,
        name: &str,
        new_config: &BTreeMap<String, ServerDescriptor>,
    ) -> Result<(), ProxyError> {
        let descriptor = new_config
            .get(name)
            .ok_or_else(|| ProxyError::server_not_found(name))?;
        self.supervisor.replace(name, descriptor.clone()).await
    }

    /// Idempotent remove: an absent server counts as applied.
    async fn remove_one(&self, name: &str) -> Result<(), ProxyError> {
        match self.supervisor.remove(name, true).await {
            Ok(()) | Err(ProxyError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stop-then-start for diffs that cannot be applied piecewise.
    async fn full_reload(&self, new_config: &BTreeMap<String, ServerDescriptor>) -> ReloadOutcome {
        info!("performing full reload: stopping all upstream connections");
        self.supervisor.shutdown().await;

        let mut outcome = ReloadOutcome::default();
        for (name, descriptor) in new_config {
            match self.supervisor.add(descriptor.clone()) {
                Ok(()) => outcome.ok(name),
                Err(e) => outcome.err(name, &e),
            }
        }
        self.supervisor
            .publish_reload_completed(outcome.succeeded.clone(), outcome.failed.clone());
        outcome
    }
}
