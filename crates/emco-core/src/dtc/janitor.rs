// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker reconciling parent and child contexts.
//!
//! Parents refer to children only by id, so either side can disappear on
//! its own. Each sweep:
//! - drops child ids whose context no longer exists from parent metas;
//! - deletes service-discovery children no parent refers to.
//!
//! A child is only deleted once it has been unreferenced for two sweeps in a
//! row, so a child that is still being linked into its parent survives.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::SERVICE_DISCOVERY_APP;
use crate::appcontext::AppContext;
use crate::contextdb::ContextTree;
use crate::error::Result;

/// What one sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Dead child ids removed from parent metas.
    pub unlinked: usize,
    /// Orphan child contexts deleted.
    pub deleted: usize,
}

/// Periodic parent/child reconciliation.
pub struct ContextJanitor {
    tree: ContextTree,
    interval: Duration,
    shutdown: Arc<Notify>,
    // orphans seen by the previous sweep
    suspects: Mutex<HashSet<String>>,
}

impl ContextJanitor {
    /// Janitor over `tree`, sweeping every `interval`.
    pub fn new(tree: ContextTree, interval: Duration) -> Self {
        Self {
            tree,
            interval,
            shutdown: Arc::new(Notify::new()),
            suspects: Mutex::new(HashSet::new()),
        }
    }

    /// Handle that stops [`ContextJanitor::run`] when notified.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Sweep until shutdown.
    pub async fn run(&self) {
        info!(interval_secs = self.interval.as_secs(), "Context janitor started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Context janitor received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.interval) => {
                    match self.sweep().await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(unlinked = report.unlinked, deleted = report.deleted, "Context sweep done");
                        }
                        Ok(_) => debug!("Context sweep found nothing"),
                        Err(e) => error!(error = %e, "Context sweep failed"),
                    }
                }
            }
        }
        info!("Context janitor stopped");
    }

    /// One reconciliation pass.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let ids: HashSet<String> = self.tree.context_ids().await?.into_iter().collect();
        let mut report = SweepReport::default();
        let mut referenced = HashSet::new();
        let mut children = Vec::new();

        for id in &ids {
            // gone since the listing, or not yet given a meta
            let Ok(ac) = AppContext::load(&self.tree, id).await else {
                continue;
            };
            let Ok(meta) = ac.get_composite_app_meta().await else {
                continue;
            };
            if meta.composite_app == SERVICE_DISCOVERY_APP {
                children.push(id.clone());
            }
            for child in &meta.child_context_ids {
                if ids.contains(child) {
                    referenced.insert(child.clone());
                    continue;
                }
                match ac.remove_child_context_id(child).await {
                    Ok(_) => {
                        debug!(app_context = %id, child = %child, "Unlinked dead child context");
                        report.unlinked += 1;
                    }
                    Err(e) => warn!(app_context = %id, child = %child, error = %e, "Error unlinking child context"),
                }
            }
        }

        let mut suspects = self.suspects.lock().await;
        let orphans: HashSet<String> = children
            .into_iter()
            .filter(|c| !referenced.contains(c))
            .collect();
        for orphan in orphans.intersection(&suspects) {
            let Ok(ac) = AppContext::load(&self.tree, orphan).await else {
                continue;
            };
            match ac.delete_composite_app().await {
                Ok(()) => {
                    debug!(app_context = %orphan, "Deleted orphan child context");
                    report.deleted += 1;
                }
                Err(e) => warn!(app_context = %orphan, error = %e, "Error deleting orphan child context"),
            }
        }
        *suspects = orphans.difference(&suspects).cloned().collect();
        Ok(report)
    }
}
