//! Peer quota and expiry lifecycle

use crate::types::{Peer, PeerStatus};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A status change decided for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub peer_id: i64,
    pub previous: PeerStatus,
    pub next: PeerStatus,
    /// Expiry after the transition, epoch millis
    pub expire_time: i64,
    /// The peer left the tunnel set and must be removed from the live interface
    pub requires_removal: bool,
}

/// Evaluate the lifecycle rules for every peer at `now` (epoch millis).
///
/// Rules apply in order to a working copy, so a peer activated by its first
/// traffic can be limited or expired in the same pass. Disabled peers are
/// never touched. Returns one transition per peer whose status or expiry
/// changed.
pub fn evaluate(peers: &[Peer], now: i64) -> Vec<Transition> {
    peers
        .iter()
        .filter_map(|peer| evaluate_peer(peer, now))
        .collect()
}

fn evaluate_peer(peer: &Peer, now: i64) -> Option<Transition> {
    if peer.status == PeerStatus::Disabled {
        return None;
    }

    let mut status = peer.status;
    let mut expire_time = peer.expire_time;

    if status == PeerStatus::OnHold && peer.total_received_volume != 0 {
        status = PeerStatus::Active;
        expire_time = now.saturating_add(peer.on_hold_expire_duration);
    }

    if status == PeerStatus::Active
        && peer.total_volume != 0
        && peer.total_received_volume > peer.total_volume
    {
        status = PeerStatus::Limited;
    }

    if status != PeerStatus::OnHold && expire_time < now {
        status = PeerStatus::Expired;
    }

    if status == peer.status && expire_time == peer.expire_time {
        return None;
    }

    let requires_removal = peer.status.in_tunnel() && status.is_inactive();
    info!(
        "Peer {} ({}): {} -> {}",
        peer.name, peer.id, peer.status, status
    );

    Some(Transition {
        peer_id: peer.id,
        previous: peer.status,
        next: status,
        expire_time,
        requires_removal,
    })
}
