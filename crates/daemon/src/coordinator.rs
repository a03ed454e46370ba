//! Accounting cycle coordination
//!
//! One accounting cycle fetches the raw tunnel counters, reconciles them into
//! per-peer usage, evaluates the lifecycle rules, persists everything in a
//! single transaction and finally takes peers that left the tunnel set off
//! the live interfaces. Failures never escape a cycle; they are logged and
//! reported through [`CycleOutcome`].

use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use wgquota_common::db::RemovalTarget;
use wgquota_common::{lifecycle, now_millis, Database, TrafficReconciler, TunnelControl};

/// Result of one accounting cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed(CycleReport),
    /// Another cycle was still running
    Skipped,
    /// Counters could not be read in time; nothing was changed
    CounterFetchFailed,
    /// Reading or writing the database failed; the tick was rolled back
    PersistFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub peers: usize,
    pub counters: usize,
    pub updated: usize,
    pub transitions: usize,
    pub mismatched: usize,
    pub removals: RemovalReport,
}

/// Outcome of a batch of tunnel removals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub attempted: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Drives accounting cycles and inactive-peer reconciliation
pub struct AccountingCoordinator {
    db: Database,
    tunnel: Arc<dyn TunnelControl>,
    reconciler: TrafficReconciler,
    tick_timeout: Duration,
    cycle_guard: Mutex<()>,
    reconcile_guard: Mutex<()>,
}

impl AccountingCoordinator {
    pub fn new(db: Database, tunnel: Arc<dyn TunnelControl>, tick_timeout: Duration) -> Self {
        Self {
            db,
            tunnel,
            reconciler: TrafficReconciler::new(),
            tick_timeout,
            cycle_guard: Mutex::new(()),
            reconcile_guard: Mutex::new(()),
        }
    }

    /// Run one accounting cycle at the current wall clock
    pub async fn run_accounting_cycle(&self) -> CycleOutcome {
        self.run_accounting_cycle_at(now_millis()).await
    }

    /// Run one accounting cycle evaluating lifecycle rules at `now` (epoch millis)
    pub async fn run_accounting_cycle_at(&self, now: i64) -> CycleOutcome {
        let _guard = match self.cycle_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Previous accounting cycle still running, skipping tick");
                return CycleOutcome::Skipped;
            }
        };

        let counters =
            match tokio::time::timeout(self.tick_timeout, self.tunnel.get_counters()).await {
                Ok(Ok(counters)) => counters,
                Ok(Err(e)) => {
                    error!("Accounting cycle aborted: {}", e);
                    return CycleOutcome::CounterFetchFailed;
                }
                Err(_) => {
                    error!(
                        "Accounting cycle aborted: counter fetch timed out after {:?}",
                        self.tick_timeout
                    );
                    return CycleOutcome::CounterFetchFailed;
                }
            };

        let rows = match self.db.list_accounting_rows() {
            Ok(rows) => rows,
            Err(e) => {
                error!("Accounting cycle aborted: failed to load peers: {}", e);
                return CycleOutcome::PersistFailed;
            }
        };
        let peers = rows.len();

        let reconciled = self.reconciler.apply(rows, &counters);
        let transitions = lifecycle::evaluate(&reconciled.peers, now);

        if let Err(e) = self
            .db
            .apply_accounting_batch(&reconciled.updates, &transitions)
        {
            error!("Accounting cycle rolled back: {}", e);
            return CycleOutcome::PersistFailed;
        }

        let removals = match self.db.peers_pending_removal() {
            Ok(targets) => self.remove_from_tunnel(targets).await,
            Err(e) => {
                error!("Failed to load peers pending removal: {}", e);
                RemovalReport::default()
            }
        };

        let report = CycleReport {
            peers,
            counters: counters.len(),
            updated: reconciled.updates.len(),
            transitions: transitions.len(),
            mismatched: reconciled.mismatched,
            removals,
        };
        info!(
            "Accounting cycle: {} peers, {} updated, {} transitions, {}/{} removals",
            report.peers,
            report.updated,
            report.transitions,
            report.removals.removed,
            report.removals.attempted
        );
        CycleOutcome::Completed(report)
    }

    /// Remove every limited, expired or disabled peer from the live tunnel.
    ///
    /// Removal is repeated even for peers already gone, so a redelivered
    /// request is harmless.
    pub async fn reconcile_inactive_peers(&self) -> RemovalReport {
        let _guard = match self.reconcile_guard.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!("Inactive-peer reconciliation already running, skipping");
                return RemovalReport::default();
            }
        };

        match self.db.inactive_peers() {
            Ok(targets) => {
                let report = self.remove_from_tunnel(targets).await;
                info!(
                    "Reconciled inactive peers: {} removed, {} failed",
                    report.removed, report.failed
                );
                report
            }
            Err(e) => {
                error!("Failed to load inactive peers: {}", e);
                RemovalReport::default()
            }
        }
    }

    async fn remove_from_tunnel(&self, targets: Vec<RemovalTarget>) -> RemovalReport {
        let mut report = RemovalReport::default();
        let mut touched = BTreeSet::new();

        for target in targets {
            report.attempted += 1;
            let result = tokio::time::timeout(
                self.tick_timeout,
                self.tunnel.remove_peer(&target.interface, &target.public_key),
            )
            .await;

            match result {
                Ok(Ok(())) => {
                    debug!(
                        "Removed {} peer {} from {}",
                        target.status, target.peer_name, target.interface
                    );
                    if let Err(e) = self.db.set_removal_pending(target.peer_id, false) {
                        warn!("Failed to clear removal flag of {}: {}", target.peer_name, e);
                    }
                    report.removed += 1;
                    touched.insert(target.interface);
                }
                Ok(Err(e)) => {
                    warn!(
                        "Failed to remove peer {} from {}: {}",
                        target.peer_name, target.interface, e
                    );
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(
                        "Removing peer {} from {} timed out",
                        target.peer_name, target.interface
                    );
                    report.failed += 1;
                }
            }
        }

        for interface in touched {
            match tokio::time::timeout(self.tick_timeout, self.tunnel.save_config(&interface)).await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to save config of {}: {}", interface, e),
                Err(_) => warn!("Saving config of {} timed out", interface),
            }
        }

        report
    }
}
