//! Periodic job driver
//!
//! Runs the accounting cycle and the inactive-peer reconciliation on their own
//! intervals from a single loop. Each job is awaited inline, so a slow run
//! delays its next tick instead of overlapping with it.

use crate::coordinator::{AccountingCoordinator, CycleOutcome};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Scheduler {
    coordinator: Arc<AccountingCoordinator>,
    accounting_interval: Duration,
    reconcile_interval: Duration,
}

impl Scheduler {
    pub fn new(
        coordinator: Arc<AccountingCoordinator>,
        accounting_interval: Duration,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            accounting_interval,
            reconcile_interval,
        }
    }

    /// Run both jobs until `shutdown` resolves
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut accounting = tokio::time::interval(self.accounting_interval);
        accounting.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut reconcile = tokio::time::interval(self.reconcile_interval);
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!(
            "Scheduler started: accounting every {:?}, reconciliation every {:?}",
            self.accounting_interval, self.reconcile_interval
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    break;
                }
                _ = accounting.tick() => {
                    match self.coordinator.run_accounting_cycle().await {
                        CycleOutcome::Completed(report) => debug!("Accounting tick done: {:?}", report),
                        other => warn!("Accounting tick ended with {:?}", other),
                    }
                }
                _ = reconcile.tick() => {
                    let report = self.coordinator.reconcile_inactive_peers().await;
                    if report.failed > 0 {
                        warn!("{} inactive peer removal(s) failed", report.failed);
                    }
                }
            }
        }
    }
}
