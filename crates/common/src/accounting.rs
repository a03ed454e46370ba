//! Traffic reconciliation
//!
//! Turns raw cumulative tunnel counters into accumulated per-peer usage. The
//! kernel counters restart from zero whenever an interface is recreated, so a
//! raw value below the last observed one is treated as a reset and the raw
//! value itself becomes the delta.

use crate::db::AccountingRow;
use crate::types::{Peer, PeerUsage, TransferCounter};
use std::collections::HashMap;
use tracing::{debug, warn};

/// New counter state for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageUpdate {
    pub peer_id: i64,
    pub usage: PeerUsage,
}

/// Result of reconciling one counter snapshot
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Only peers whose counters actually moved
    pub updates: Vec<UsageUpdate>,
    /// Every input peer, with reconciled usage applied
    pub peers: Vec<Peer>,
    /// Counters found for a peer but reported under another interface
    pub mismatched: usize,
}

#[derive(Debug, Default)]
pub struct TrafficReconciler;

impl TrafficReconciler {
    pub fn new() -> Self {
        Self
    }

    /// Apply a counter snapshot to the given peers. Peers without a counter
    /// in the snapshot are carried through unchanged.
    pub fn apply(&self, rows: Vec<AccountingRow>, counters: &[TransferCounter]) -> Reconciliation {
        let mut by_key: HashMap<&str, Vec<&TransferCounter>> = HashMap::new();
        for counter in counters {
            by_key.entry(counter.public_key.as_str()).or_default().push(counter);
        }

        let mut result = Reconciliation::default();
        for row in rows {
            let AccountingRow {
                mut peer,
                interface_name,
                upload_percent,
                download_percent,
            } = row;

            let candidates = match by_key.get(peer.public_key.as_str()) {
                Some(c) => c,
                None => {
                    result.peers.push(peer);
                    continue;
                }
            };

            let counter = match candidates.iter().find(|c| c.interface == interface_name) {
                Some(c) => c,
                None => {
                    warn!(
                        "Counter for peer {} reported on {} but peer belongs to {}, skipping",
                        peer.name, candidates[0].interface, interface_name
                    );
                    result.mismatched += 1;
                    result.peers.push(peer);
                    continue;
                }
            };

            let before = peer.usage();
            let after = reconcile_usage(
                before,
                counter.received_bytes,
                counter.sent_bytes,
                download_percent,
                upload_percent,
            );

            if after != before {
                debug!(
                    "Peer {}: download {} -> {}, upload {} -> {}",
                    peer.name,
                    before.download_volume,
                    after.download_volume,
                    before.upload_volume,
                    after.upload_volume
                );
                apply_usage(&mut peer, after);
                result.updates.push(UsageUpdate {
                    peer_id: peer.id,
                    usage: after,
                });
            }
            result.peers.push(peer);
        }

        result
    }
}

/// Fold one raw `(rx, tx)` observation into accumulated usage
pub fn reconcile_usage(
    usage: PeerUsage,
    rx: u64,
    tx: u64,
    download_percent: f64,
    upload_percent: f64,
) -> PeerUsage {
    let delta_rx = counter_delta(rx, usage.last_download_volume);
    let delta_tx = counter_delta(tx, usage.last_upload_volume);
    let download_percent = clamp_multiplier(download_percent);
    let upload_percent = clamp_multiplier(upload_percent);

    PeerUsage {
        download_volume: usage
            .download_volume
            .saturating_add(weighted(delta_rx, download_percent)),
        upload_volume: usage
            .upload_volume
            .saturating_add(weighted(delta_tx, upload_percent)),
        total_received_volume: usage.total_received_volume.saturating_add(weighted(
            delta_rx.saturating_add(delta_tx),
            download_percent * upload_percent,
        )),
        last_download_volume: rx,
        last_upload_volume: tx,
        last_total_received_volume: rx.saturating_add(tx),
    }
}

fn apply_usage(peer: &mut Peer, usage: PeerUsage) {
    peer.download_volume = usage.download_volume;
    peer.upload_volume = usage.upload_volume;
    peer.total_received_volume = usage.total_received_volume;
    peer.last_download_volume = usage.last_download_volume;
    peer.last_upload_volume = usage.last_upload_volume;
    peer.last_total_received_volume = usage.last_total_received_volume;
}

/// A raw value below the previous one means the counter was reset
fn counter_delta(current: u64, last: u64) -> u64 {
    if current >= last {
        current - last
    } else {
        current
    }
}

fn clamp_multiplier(factor: f64) -> f64 {
    if factor.is_finite() && factor > 0.0 {
        factor
    } else {
        0.0
    }
}

// `as` saturates float to int conversion at u64::MAX
fn weighted(delta: u64, factor: f64) -> u64 {
    (delta as f64 * factor).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::sample_peer;

    fn row(public_key: &str, usage: PeerUsage, percent: f64) -> AccountingRow {
        let mut peer = sample_peer(1, public_key);
        peer.id = 7;
        peer.public_key = public_key.to_string();
        peer.download_volume = usage.download_volume;
        peer.upload_volume = usage.upload_volume;
        peer.total_received_volume = usage.total_received_volume;
        peer.last_download_volume = usage.last_download_volume;
        peer.last_upload_volume = usage.last_upload_volume;
        peer.last_total_received_volume = usage.last_total_received_volume;
        AccountingRow {
            peer,
            interface_name: "wg0".to_string(),
            upload_percent: percent,
            download_percent: percent,
        }
    }

    fn counter(iface: &str, public_key: &str, rx: u64, tx: u64) -> TransferCounter {
        TransferCounter {
            interface: iface.to_string(),
            public_key: public_key.to_string(),
            received_bytes: rx,
            sent_bytes: tx,
        }
    }

    #[test]
    fn test_plain_delta() {
        let usage = PeerUsage {
            last_download_volume: 100,
            last_upload_volume: 50,
            ..Default::default()
        };
        let next = reconcile_usage(usage, 300, 80, 1.0, 1.0);
        assert_eq!(next.download_volume, 200);
        assert_eq!(next.upload_volume, 30);
        assert_eq!(next.total_received_volume, 230);
        assert_eq!(next.last_download_volume, 300);
        assert_eq!(next.last_upload_volume, 80);
        assert_eq!(next.last_total_received_volume, 380);
    }

    #[test]
    fn test_counter_reset() {
        let usage = PeerUsage {
            download_volume: 1_000,
            upload_volume: 500,
            total_received_volume: 1_500,
            last_download_volume: 1_000,
            last_upload_volume: 500,
            last_total_received_volume: 1_500,
        };
        let next = reconcile_usage(usage, 200, 100, 1.0, 1.0);
        assert_eq!(next.download_volume, 1_200);
        assert_eq!(next.upload_volume, 600);
        assert_eq!(next.total_received_volume, 1_800);
        assert_eq!(next.last_download_volume, 200);
        assert_eq!(next.last_upload_volume, 100);
    }

    #[test]
    fn test_multipliers_and_rounding() {
        let next = reconcile_usage(PeerUsage::default(), 3, 5, 0.5, 1.5);
        // 3 * 0.5 = 1.5 rounds away from zero
        assert_eq!(next.download_volume, 2);
        // 5 * 1.5 = 7.5
        assert_eq!(next.upload_volume, 8);
        // 8 * 0.75 = 6
        assert_eq!(next.total_received_volume, 6);
    }

    #[test]
    fn test_negative_multiplier_counts_nothing() {
        let next = reconcile_usage(PeerUsage::default(), 1_000, 1_000, -1.0, 1.0);
        assert_eq!(next.download_volume, 0);
        assert_eq!(next.upload_volume, 1_000);
        assert_eq!(next.total_received_volume, 0);
        assert_eq!(next.last_download_volume, 1_000);
    }

    #[test]
    fn test_saturates_at_max() {
        let usage = PeerUsage {
            download_volume: u64::MAX - 1,
            ..Default::default()
        };
        let next = reconcile_usage(usage, u64::MAX, u64::MAX, 2.0, 2.0);
        assert_eq!(next.download_volume, u64::MAX);
        assert_eq!(next.total_received_volume, u64::MAX);
        assert_eq!(next.last_total_received_volume, u64::MAX);
    }

    #[test]
    fn test_apply_skips_absent_and_mismatched() {
        let reconciler = TrafficReconciler::new();
        let mut rows = vec![
            row("present", PeerUsage::default(), 1.0),
            row("absent", PeerUsage::default(), 1.0),
            row("elsewhere", PeerUsage::default(), 1.0),
        ];
        rows[1].peer.id = 8;
        rows[2].peer.id = 9;

        let counters = vec![
            counter("wg0", "present", 10, 20),
            counter("wg9", "elsewhere", 10, 20),
        ];
        let result = reconciler.apply(rows, &counters);

        assert_eq!(result.peers.len(), 3);
        assert_eq!(result.updates.len(), 1);
        assert_eq!(result.updates[0].peer_id, 7);
        assert_eq!(result.updates[0].usage.total_received_volume, 30);
        assert_eq!(result.mismatched, 1);
        assert_eq!(result.peers[2].total_received_volume, 0);
    }

    #[test]
    fn test_unchanged_counters_produce_no_update() {
        let reconciler = TrafficReconciler::new();
        let usage = PeerUsage {
            last_download_volume: 10,
            last_upload_volume: 20,
            last_total_received_volume: 30,
            download_volume: 10,
            upload_volume: 20,
            total_received_volume: 30,
        };
        let result = reconciler.apply(vec![row("pk", usage, 1.0)], &[counter("wg0", "pk", 10, 20)]);
        assert!(result.updates.is_empty());
        assert_eq!(result.peers[0].total_received_volume, 30);
    }
}
