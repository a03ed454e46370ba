//! Operator provisioning of interfaces and peers
//!
//! Every operation that changes which peers belong on a live interface keeps
//! the database and the tunnel in step: database first inside a transaction,
//! then the tunnel. The only operation that undoes its database work on a
//! tunnel failure is [`Provisioner::create_peer`]; the others log and leave
//! the state for the accounting cycle or a repeated command to converge.

use crate::config_render::{render_interface_config, render_peer_config};
use crate::db::{self, Database};
use crate::ippool::{self, compute_range};
use crate::keys::{public_key_for, KeyGenerator};
use crate::tunnel::TunnelControl;
use crate::types::*;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Defaults applied to peers when the operator leaves a field unset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerDefaults {
    /// Grace period granted on first traffic, millis
    pub on_hold_expire_duration_ms: i64,
    /// Quota in bytes, 0 = unlimited
    pub total_volume: u64,
    pub mtu: u32,
    pub persistent_keepalive: u32,
    pub endpoint_allowed_ips: String,
    pub dns: Option<String>,
}

impl Default for PeerDefaults {
    fn default() -> Self {
        Self {
            on_hold_expire_duration_ms: 30 * 24 * 60 * 60 * 1000,
            total_volume: 0,
            mtu: 1420,
            persistent_keepalive: 21,
            endpoint_allowed_ips: "0.0.0.0/0".to_string(),
            dns: None,
        }
    }
}

/// Parameters for a new interface
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInterface {
    pub name: String,
    /// Subnet in CIDR notation
    pub address: String,
    pub endpoint: String,
    pub listen_port: u16,
    /// Generated when absent
    pub private_key: Option<String>,
    pub upload_percent: f64,
    pub download_percent: f64,
    pub save_config: bool,
    pub pre_up: Option<String>,
    pub post_up: Option<String>,
    pub pre_down: Option<String>,
    pub post_down: Option<String>,
    pub dns: Option<String>,
}

/// Per-peer limits and client settings; unset fields fall back to [`PeerDefaults`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerOptions {
    pub total_volume: Option<u64>,
    pub on_hold_expire_duration_ms: Option<i64>,
    pub endpoint: Option<String>,
    pub endpoint_allowed_ips: Option<String>,
    pub dns: Option<String>,
    pub mtu: Option<u32>,
    pub persistent_keepalive: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPeer {
    /// Random when absent
    pub name: Option<String>,
    /// Client-held key; a key pair is generated when absent
    pub public_key: Option<String>,
    #[serde(default)]
    pub options: PeerOptions,
}

/// Shared settings for bulk-created peers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerTemplate {
    pub name_prefix: Option<String>,
    #[serde(default)]
    pub options: PeerOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub total_volume: Option<u64>,
    /// Epoch millis
    pub expire_time: Option<i64>,
    pub endpoint: Option<String>,
    pub endpoint_allowed_ips: Option<String>,
    pub dns: Option<String>,
    pub mtu: Option<u32>,
    pub persistent_keepalive: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerReset {
    pub total_volume: Option<u64>,
    pub expire_time: Option<i64>,
}

/// Operator-facing provisioning service
pub struct Provisioner {
    db: Database,
    tunnel: Arc<dyn TunnelControl>,
    keys: Arc<dyn KeyGenerator>,
    defaults: PeerDefaults,
    config_dir: Option<PathBuf>,
}

impl Provisioner {
    pub fn new(db: Database, tunnel: Arc<dyn TunnelControl>, keys: Arc<dyn KeyGenerator>) -> Self {
        Self {
            db,
            tunnel,
            keys,
            defaults: PeerDefaults::default(),
            config_dir: None,
        }
    }

    pub fn with_defaults(mut self, defaults: PeerDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Write `<dir>/<name>.conf` for every created interface
    pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    // ========================================================================
    // Interfaces
    // ========================================================================

    pub async fn create_interface(&self, new_iface: NewInterface) -> Result<Interface> {
        validate_interface_name(&new_iface.name)?;
        if self.db.get_interface_by_name(&new_iface.name)?.is_some() {
            return Err(Error::already_exists("interface", &new_iface.name));
        }
        let address = new_iface.address.trim().to_string();
        compute_range(&address)?;
        for (label, value) in [
            ("upload_percent", new_iface.upload_percent),
            ("download_percent", new_iface.download_percent),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::InvalidConfig(format!(
                    "{} must be a non-negative number, got {}",
                    label, value
                )));
            }
        }

        let conf_path = self.conf_path(&new_iface.name);
        if let Some(path) = conf_path.as_ref().filter(|p| p.exists()) {
            return Err(Error::already_exists("config file", path.display()));
        }

        let (private_key, public_key) = match new_iface.private_key {
            Some(key) => {
                let public = public_key_for(&key)?;
                (key, public)
            }
            None => {
                let pair = self.keys.generate_keypair();
                (pair.private_key, pair.public_key)
            }
        };

        let iface = Interface {
            id: 0,
            name: new_iface.name,
            address,
            endpoint: new_iface.endpoint,
            listen_port: new_iface.listen_port,
            private_key,
            public_key,
            status: InterfaceStatus::Active,
            upload_percent: new_iface.upload_percent,
            download_percent: new_iface.download_percent,
            save_config: new_iface.save_config,
            pre_up: new_iface.pre_up,
            post_up: new_iface.post_up,
            pre_down: new_iface.pre_down,
            post_down: new_iface.post_down,
            dns: new_iface.dns,
            created_at: 0,
            updated_at: 0,
        };

        let (id, addresses) = self.db.with_transaction(|tx| {
            let id = db::insert_interface(tx, &iface)?;
            let mut addresses = ippool::materialize_pool(tx, id, &iface.address)?;
            if ippool::exclude_host_address(tx, id, &iface.address)? {
                addresses -= 1;
            }
            Ok((id, addresses))
        })?;

        if let Some(path) = conf_path {
            if let Err(e) = write_config_file(&path, &render_interface_config(&iface)).await {
                self.db.delete_interface(id)?;
                return Err(e);
            }
        }

        info!(
            "Created interface {} ({}) with {} addresses",
            iface.name, iface.address, addresses
        );
        self.db
            .get_interface(id)?
            .ok_or_else(|| Error::not_found("interface", id))
    }

    pub fn list_interfaces(&self) -> Result<Vec<InterfaceSummary>> {
        self.db.interface_summaries()
    }

    pub fn get_interface(&self, name: &str) -> Result<Interface> {
        self.db
            .get_interface_by_name(name)?
            .ok_or_else(|| Error::not_found("interface", name))
    }

    /// Bring an interface up or down and record the new status
    pub async fn set_interface_status(&self, name: &str, status: InterfaceStatus) -> Result<Interface> {
        let iface = self.get_interface(name)?;
        let state = match status {
            InterfaceStatus::Active => LinkState::Up,
            InterfaceStatus::Disabled => LinkState::Down,
        };

        self.tunnel.set_interface_state(&iface.name, state).await?;
        self.db.update_interface_status(iface.id, status)?;

        info!("Interface {} is now {}", iface.name, status);
        self.get_interface(name)
    }

    pub async fn delete_interface(&self, name: &str) -> Result<()> {
        let iface = self.get_interface(name)?;
        let peers = self.db.count_peers(iface.id)?;
        if peers > 0 {
            return Err(Error::InterfaceInUse {
                name: iface.name,
                peers,
            });
        }

        if iface.status == InterfaceStatus::Active {
            if let Err(e) = self.tunnel.set_interface_state(&iface.name, LinkState::Down).await {
                warn!("Failed to bring down {} before deletion: {}", iface.name, e);
            }
        }

        self.db.delete_interface(iface.id)?;

        if let Some(path) = self.conf_path(&iface.name) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }

        info!("Deleted interface {}", iface.name);
        Ok(())
    }

    // ========================================================================
    // Peers
    // ========================================================================

    /// Create one peer. A tunnel failure undoes the insert and the address claim.
    pub async fn create_peer(&self, interface: &str, new_peer: NewPeer) -> Result<Peer> {
        let iface = self.usable_interface(interface)?;

        let name = match new_peer.name {
            Some(name) => {
                validate_peer_name(&name)?;
                name
            }
            None => generated_name(None),
        };
        if self.db.get_peer_by_name(&name)?.is_some() {
            return Err(Error::already_exists("peer", &name));
        }

        let (private_key, public_key) = match new_peer.public_key {
            Some(public_key) => (None, public_key),
            None => {
                let pair = self.keys.generate_keypair();
                (Some(pair.private_key), pair.public_key)
            }
        };
        if self.db.get_peer_by_public_key(&public_key)?.is_some() {
            return Err(Error::already_exists("peer public key", &public_key));
        }
        let preshared_key = self.keys.generate_preshared_key();

        let peer = self.db.with_transaction(|tx| {
            let addr = ippool::claim_one(tx, iface.id)?;
            let mut peer = build_peer(
                &self.defaults,
                &iface,
                name,
                public_key,
                private_key,
                preshared_key,
                &addr,
                &new_peer.options,
            );
            peer.id = db::insert_peer(tx, &peer)?;
            Ok(peer)
        })?;

        if let Err(e) = self
            .tunnel
            .apply_peer(
                &iface.name,
                &peer.public_key,
                &peer.allowed_ips,
                Some(&peer.preshared_key),
            )
            .await
        {
            warn!("Failed to apply peer {} on {}, rolling back: {}", peer.name, iface.name, e);
            self.db.with_transaction(|tx| {
                db::delete_peer(tx, peer.id)?;
                if let Some(ip) = peer.ip_address_id {
                    ippool::release(tx, &[ip])?;
                }
                Ok(())
            })?;
            return Err(e);
        }
        self.save(&iface.name).await;

        info!("Created peer {} on {} at {}", peer.name, iface.name, peer.allowed_ips);
        self.peer_by_id(peer.id)
    }

    /// Create `count` peers with generated keys and names, all or nothing.
    ///
    /// Tunnel failures after the commit are logged; `activate_peer` re-applies
    /// such peers.
    pub async fn create_peers_bulk(
        &self,
        interface: &str,
        count: usize,
        template: PeerTemplate,
    ) -> Result<Vec<Peer>> {
        let iface = self.usable_interface(interface)?;
        if let Some(prefix) = template.name_prefix.as_deref() {
            validate_peer_name(prefix)?;
        }
        if count == 0 {
            return Ok(Vec::new());
        }

        let peers = self.db.with_transaction(|tx| {
            let addresses = ippool::claim_n(tx, iface.id, count)?;
            let mut peers = Vec::with_capacity(count);
            for addr in &addresses {
                let pair = self.keys.generate_keypair();
                let mut peer = build_peer(
                    &self.defaults,
                    &iface,
                    generated_name(template.name_prefix.as_deref()),
                    pair.public_key,
                    Some(pair.private_key),
                    self.keys.generate_preshared_key(),
                    addr,
                    &template.options,
                );
                peer.id = db::insert_peer(tx, &peer)?;
                peers.push(peer);
            }
            Ok(peers)
        })?;

        let mut failed = 0usize;
        for peer in &peers {
            if let Err(e) = self
                .tunnel
                .apply_peer(
                    &iface.name,
                    &peer.public_key,
                    &peer.allowed_ips,
                    Some(&peer.preshared_key),
                )
                .await
            {
                warn!("Failed to apply peer {} on {}: {}", peer.name, iface.name, e);
                failed += 1;
            }
        }
        self.save(&iface.name).await;

        info!(
            "Created {} peers on {} ({} not applied to the tunnel)",
            peers.len(),
            iface.name,
            failed
        );
        peers.iter().map(|p| self.peer_by_id(p.id)).collect()
    }

    /// Change limits and client settings. A limited or expired peer whose new
    /// limits no longer trip goes back to active.
    pub async fn update_peer(&self, name: &str, update: PeerUpdate) -> Result<Peer> {
        let mut peer = self.get_peer(name)?;
        let iface = self.interface_of(&peer)?;

        if let Some(total_volume) = update.total_volume {
            peer.total_volume = total_volume;
        }
        if let Some(expire_time) = update.expire_time {
            peer.expire_time = expire_time;
        }
        if update.endpoint.is_some() {
            peer.endpoint = update.endpoint;
        }
        if let Some(allowed) = update.endpoint_allowed_ips {
            peer.endpoint_allowed_ips = allowed;
        }
        if update.dns.is_some() {
            peer.dns = update.dns;
        }
        if update.mtu.is_some() {
            peer.mtu = update.mtu;
        }
        if update.persistent_keepalive.is_some() {
            peer.persistent_keepalive = update.persistent_keepalive;
        }

        let reactivate = matches!(peer.status, PeerStatus::Limited | PeerStatus::Expired)
            && within_limits(&peer, now_millis());
        if reactivate {
            peer.status = PeerStatus::Active;
            peer.removal_pending = false;
        }

        self.db.update_peer(&peer)?;
        if reactivate {
            info!("Peer {} is within its limits again, reactivating", peer.name);
            self.push_to_tunnel(&iface, &peer).await;
        }

        self.peer_by_id(peer.id)
    }

    /// Zero accumulated usage and make the peer active.
    ///
    /// Raw `last_*` counters are kept so the next delta stays correct. An
    /// already elapsed expiry restarts the grace period unless a new expiry is
    /// given.
    pub async fn reset_peer(&self, name: &str, reset: PeerReset) -> Result<Peer> {
        let mut peer = self.get_peer(name)?;
        let iface = self.usable_interface_by_id(peer.interface_id)?;
        let was_in_tunnel = peer.status.in_tunnel();
        let now = now_millis();

        peer.download_volume = 0;
        peer.upload_volume = 0;
        peer.total_received_volume = 0;
        if let Some(total_volume) = reset.total_volume {
            peer.total_volume = total_volume;
        }
        peer.expire_time = match reset.expire_time {
            Some(expire_time) => expire_time,
            None if peer.expire_time < now => now.saturating_add(peer.on_hold_expire_duration),
            None => peer.expire_time,
        };
        peer.status = PeerStatus::Active;
        peer.removal_pending = false;

        self.db.with_transaction(|tx| {
            ensure_address(tx, &iface, &mut peer)?;
            db::update_peer(tx, &peer)
        })?;

        if !was_in_tunnel {
            self.push_to_tunnel(&iface, &peer).await;
        }

        info!("Reset peer {}", peer.name);
        self.peer_by_id(peer.id)
    }

    /// Disable a peer, release its address and take it off the tunnel
    pub async fn disable_peer(&self, name: &str) -> Result<Peer> {
        let mut peer = self.get_peer(name)?;
        if peer.status == PeerStatus::Disabled {
            return Ok(peer);
        }
        let iface = self.interface_of(&peer)?;

        let needs_removal = peer.status.in_tunnel() || peer.removal_pending;
        let released = peer.ip_address_id.take();
        peer.status = PeerStatus::Disabled;
        peer.removal_pending = needs_removal;

        self.db.with_transaction(|tx| {
            db::update_peer(tx, &peer)?;
            if let Some(ip) = released {
                ippool::release(tx, &[ip])?;
            }
            Ok(())
        })?;

        if needs_removal {
            self.remove_from_tunnel(&iface, &peer).await;
        }

        info!("Disabled peer {}", peer.name);
        self.peer_by_id(peer.id)
    }

    /// Bring an inactive peer back, or re-apply an active one to the tunnel
    pub async fn activate_peer(&self, name: &str) -> Result<Peer> {
        let mut peer = self.get_peer(name)?;
        let iface = self.usable_interface_by_id(peer.interface_id)?;

        if peer.status.in_tunnel() {
            self.push_to_tunnel(&iface, &peer).await;
            return Ok(peer);
        }

        let now = now_millis();
        peer.status = if peer.total_received_volume == 0 {
            PeerStatus::OnHold
        } else {
            PeerStatus::Active
        };
        if peer.status == PeerStatus::Active && peer.expire_time < now {
            peer.expire_time = now.saturating_add(peer.on_hold_expire_duration);
        }
        peer.removal_pending = false;

        self.db.with_transaction(|tx| {
            ensure_address(tx, &iface, &mut peer)?;
            db::update_peer(tx, &peer)
        })?;
        self.push_to_tunnel(&iface, &peer).await;

        info!("Activated peer {} as {}", peer.name, peer.status);
        self.peer_by_id(peer.id)
    }

    /// Delete a peer. It is taken off the tunnel first; if that fails nothing is deleted.
    pub async fn delete_peer(&self, name: &str) -> Result<()> {
        let peer = self.get_peer(name)?;
        let iface = self.interface_of(&peer)?;

        let on_tunnel = peer.status.in_tunnel() || peer.removal_pending;
        if on_tunnel {
            self.tunnel.remove_peer(&iface.name, &peer.public_key).await?;
        }

        self.db.with_transaction(|tx| {
            db::delete_peer(tx, peer.id)?;
            if let Some(ip) = peer.ip_address_id {
                ippool::release(tx, &[ip])?;
            }
            Ok(())
        })?;

        if on_tunnel {
            self.save(&iface.name).await;
        }

        info!("Deleted peer {}", peer.name);
        Ok(())
    }

    pub fn get_peer(&self, name: &str) -> Result<Peer> {
        self.db
            .get_peer_by_name(name)?
            .ok_or_else(|| Error::not_found("peer", name))
    }

    pub fn filter_peers(&self, filter: &PeerFilter) -> Result<PeerPage> {
        self.db.filter_peers(filter)
    }

    /// Client wg-quick config for a peer with a stored private key
    pub fn render_peer_config(&self, name: &str) -> Result<String> {
        let peer = self.get_peer(name)?;
        let iface = self.interface_of(&peer)?;
        render_peer_config(&peer, &iface)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn peer_by_id(&self, id: i64) -> Result<Peer> {
        self.db.get_peer(id)?.ok_or_else(|| Error::not_found("peer", id))
    }

    fn interface_of(&self, peer: &Peer) -> Result<Interface> {
        self.db
            .get_interface(peer.interface_id)?
            .ok_or_else(|| Error::not_found("interface", peer.interface_id))
    }

    fn usable_interface(&self, name: &str) -> Result<Interface> {
        let iface = self.get_interface(name)?;
        ensure_active(&iface)?;
        Ok(iface)
    }

    fn usable_interface_by_id(&self, id: i64) -> Result<Interface> {
        let iface = self
            .db
            .get_interface(id)?
            .ok_or_else(|| Error::not_found("interface", id))?;
        ensure_active(&iface)?;
        Ok(iface)
    }

    fn conf_path(&self, name: &str) -> Option<PathBuf> {
        self.config_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.conf", name)))
    }

    async fn push_to_tunnel(&self, iface: &Interface, peer: &Peer) -> bool {
        match self
            .tunnel
            .apply_peer(
                &iface.name,
                &peer.public_key,
                &peer.allowed_ips,
                Some(&peer.preshared_key),
            )
            .await
        {
            Ok(()) => {
                self.save(&iface.name).await;
                true
            }
            Err(e) => {
                warn!("Failed to apply peer {} on {}: {}", peer.name, iface.name, e);
                false
            }
        }
    }

    async fn remove_from_tunnel(&self, iface: &Interface, peer: &Peer) -> bool {
        match self.tunnel.remove_peer(&iface.name, &peer.public_key).await {
            Ok(()) => {
                if let Err(e) = self.db.set_removal_pending(peer.id, false) {
                    warn!("Failed to clear removal flag of {}: {}", peer.name, e);
                }
                self.save(&iface.name).await;
                true
            }
            Err(e) => {
                warn!(
                    "Failed to remove peer {} from {}, retrying on the next cycle: {}",
                    peer.name, iface.name, e
                );
                false
            }
        }
    }

    async fn save(&self, interface: &str) {
        if let Err(e) = self.tunnel.save_config(interface).await {
            warn!("Failed to save config of {}: {}", interface, e);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn build_peer(
    defaults: &PeerDefaults,
    iface: &Interface,
    name: String,
    public_key: String,
    private_key: Option<String>,
    preshared_key: String,
    addr: &IpAddress,
    options: &PeerOptions,
) -> Peer {
    Peer {
        id: 0,
        interface_id: iface.id,
        name,
        public_key,
        private_key,
        preshared_key,
        allowed_ips: host_route(addr),
        ip_address_id: Some(addr.id),
        total_volume: options.total_volume.unwrap_or(defaults.total_volume),
        expire_time: 0,
        on_hold_expire_duration: options
            .on_hold_expire_duration_ms
            .unwrap_or(defaults.on_hold_expire_duration_ms),
        download_volume: 0,
        upload_volume: 0,
        total_received_volume: 0,
        last_download_volume: 0,
        last_upload_volume: 0,
        last_total_received_volume: 0,
        status: PeerStatus::OnHold,
        removal_pending: false,
        endpoint: options.endpoint.clone(),
        endpoint_allowed_ips: options
            .endpoint_allowed_ips
            .clone()
            .unwrap_or_else(|| defaults.endpoint_allowed_ips.clone()),
        dns: options.dns.clone().or_else(|| defaults.dns.clone()),
        mtu: Some(options.mtu.unwrap_or(defaults.mtu)),
        persistent_keepalive: Some(
            options
                .persistent_keepalive
                .unwrap_or(defaults.persistent_keepalive),
        ),
        created_at: 0,
        updated_at: 0,
    }
}

/// Give a peer an address if it lost its own on disable
fn ensure_address(conn: &rusqlite::Connection, iface: &Interface, peer: &mut Peer) -> Result<()> {
    if peer.ip_address_id.is_none() {
        let addr = ippool::claim_one(conn, iface.id)?;
        peer.allowed_ips = host_route(&addr);
        peer.ip_address_id = Some(addr.id);
    }
    Ok(())
}

fn host_route(addr: &IpAddress) -> String {
    format!("{}/32", addr.address)
}

fn within_limits(peer: &Peer, now: i64) -> bool {
    let quota_ok = peer.total_volume == 0 || peer.total_received_volume <= peer.total_volume;
    quota_ok && peer.expire_time >= now
}

fn ensure_active(iface: &Interface) -> Result<()> {
    if iface.status != InterfaceStatus::Active {
        return Err(Error::InvalidState(format!(
            "interface {} is {}",
            iface.name, iface.status
        )));
    }
    Ok(())
}

fn generated_name(prefix: Option<&str>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    match prefix {
        Some(prefix) => format!("{}-{}", prefix, id),
        None => id,
    }
}

// Linux caps interface names at 15 bytes
fn validate_interface_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 15
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '='));
    if !valid {
        return Err(Error::InvalidConfig(format!("invalid interface name {:?}", name)));
    }
    Ok(())
}

fn validate_peer_name(name: &str) -> Result<()> {
    if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(Error::InvalidConfig(format!("invalid peer name {:?}", name)));
    }
    Ok(())
}

async fn write_config_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::X25519KeyGenerator;
    use crate::tunnel::{DryRunTunnel, TunnelCall};

    struct Fixture {
        prov: Provisioner,
        tunnel: Arc<DryRunTunnel>,
        dir: tempfile::TempDir,
    }

    fn new_interface(name: &str, cidr: &str) -> NewInterface {
        NewInterface {
            name: name.to_string(),
            address: cidr.to_string(),
            endpoint: "vpn.example.com:51820".to_string(),
            listen_port: 51820,
            private_key: None,
            upload_percent: 1.0,
            download_percent: 1.0,
            save_config: true,
            pre_up: None,
            post_up: None,
            pre_down: None,
            post_down: None,
            dns: None,
        }
    }

    async fn setup(cidr: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tunnel = Arc::new(DryRunTunnel::new());
        let prov = Provisioner::new(
            Database::open_memory().unwrap(),
            tunnel.clone(),
            Arc::new(X25519KeyGenerator),
        )
        .with_config_dir(dir.path());
        prov.create_interface(new_interface("wg0", cidr)).await.unwrap();
        Fixture { prov, tunnel, dir }
    }

    fn named(name: &str) -> NewPeer {
        NewPeer {
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn available(f: &Fixture) -> usize {
        f.prov.list_interfaces().unwrap()[0].available_addresses
    }

    #[tokio::test]
    async fn test_create_interface() {
        let f = setup("10.8.0.1/24").await;

        let iface = f.prov.get_interface("wg0").unwrap();
        assert_eq!(iface.public_key.len(), 44);
        assert_eq!(available(&f), 253);

        let conf = std::fs::read_to_string(f.dir.path().join("wg0.conf")).unwrap();
        assert!(conf.contains("Address = 10.8.0.1/24"));
        assert!(conf.contains(&iface.private_key));
    }

    #[tokio::test]
    async fn test_interface_host_address_is_never_allocated() {
        let f = setup("10.8.0.12/29").await;
        assert_eq!(available(&f), 4);

        let mut got = Vec::new();
        for name in ["a", "b", "c", "d"] {
            got.push(f.prov.create_peer("wg0", named(name)).await.unwrap().allowed_ips);
        }
        assert!(!got.contains(&"10.8.0.12/32".to_string()), "got {:?}", got);

        let result = f.prov.create_peer("wg0", named("e")).await;
        assert!(matches!(result, Err(Error::PoolExhausted { .. })));
    }

    #[tokio::test]
    async fn test_interface_address_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let prov = Provisioner::new(
            Database::open_memory().unwrap(),
            Arc::new(DryRunTunnel::new()),
            Arc::new(X25519KeyGenerator),
        )
        .with_config_dir(dir.path());

        let iface = prov
            .create_interface(new_interface("wg0", "  10.8.0.1/24\n"))
            .await
            .unwrap();
        assert_eq!(iface.address, "10.8.0.1/24");

        let conf = std::fs::read_to_string(dir.path().join("wg0.conf")).unwrap();
        assert!(conf.contains("Address = 10.8.0.1/24\n"));
    }

    #[tokio::test]
    async fn test_create_interface_rejections() {
        let f = setup("10.8.0.1/24").await;

        let dup = f.prov.create_interface(new_interface("wg0", "10.9.0.1/24")).await;
        assert!(matches!(dup, Err(Error::AlreadyExists { .. })));

        let bad = f.prov.create_interface(new_interface("wg1", "10.9.0.1/40")).await;
        assert!(matches!(bad, Err(Error::InvalidRange { .. })));

        let huge = f.prov.create_interface(new_interface("wg2", "10.0.0.0/8")).await;
        assert!(matches!(huge, Err(Error::PoolTooLarge { .. })));

        assert!(f.prov.get_interface("wg1").is_err());
        assert!(f.prov.get_interface("wg2").is_err());
        assert_eq!(f.prov.list_interfaces().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_peer() {
        let f = setup("10.8.0.1/24").await;
        let peer = f.prov.create_peer("wg0", named("alice")).await.unwrap();

        assert_eq!(peer.status, PeerStatus::OnHold);
        assert_eq!(peer.allowed_ips, "10.8.0.2/32");
        assert!(peer.private_key.is_some());
        assert_eq!(peer.mtu, Some(1420));
        assert_eq!(peer.persistent_keepalive, Some(21));
        assert_eq!(available(&f), 252);
        assert!(f.tunnel.calls().contains(&TunnelCall::ApplyPeer {
            interface: "wg0".to_string(),
            public_key: peer.public_key.clone(),
            allowed_ips: "10.8.0.2/32".to_string(),
        }));
        assert_eq!(f.tunnel.saved_interfaces(), vec!["wg0".to_string()]);

        let dup = f.prov.create_peer("wg0", named("alice")).await;
        assert!(matches!(dup, Err(Error::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_create_peer_with_client_key() {
        let f = setup("10.8.0.1/24").await;
        let pair = X25519KeyGenerator.generate_keypair();
        let peer = f
            .prov
            .create_peer(
                "wg0",
                NewPeer {
                    name: None,
                    public_key: Some(pair.public_key.clone()),
                    options: PeerOptions {
                        total_volume: Some(1 << 30),
                        ..Default::default()
                    },
                },
            )
            .await
            .unwrap();

        assert_eq!(peer.public_key, pair.public_key);
        assert!(peer.private_key.is_none());
        assert_eq!(peer.name.len(), 32);
        assert_eq!(peer.total_volume, 1 << 30);
        assert!(f.prov.render_peer_config(&peer.name).is_err());
    }

    #[tokio::test]
    async fn test_create_peer_rolls_back_on_tunnel_failure() {
        let f = setup("10.8.0.1/24").await;
        f.tunnel.fail_apply(true);

        let result = f.prov.create_peer("wg0", named("alice")).await;
        assert!(matches!(result, Err(Error::TunnelControl(_))));
        assert!(f.prov.get_peer("alice").is_err());
        assert_eq!(available(&f), 253);
    }

    #[tokio::test]
    async fn test_bulk_is_all_or_nothing() {
        let f = setup("10.8.0.0/29").await;

        let peers = f
            .prov
            .create_peers_bulk(
                "wg0",
                3,
                PeerTemplate {
                    name_prefix: Some("batch".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(peers.len(), 3);
        assert!(peers.iter().all(|p| p.name.starts_with("batch-")));
        assert_eq!(available(&f), 2);

        let err = f
            .prov
            .create_peers_bulk("wg0", 5, PeerTemplate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { requested: 5, available: 2 }));
        assert_eq!(available(&f), 2);
        assert_eq!(f.prov.filter_peers(&PeerFilter::default()).unwrap().total, 3);
    }

    #[tokio::test]
    async fn test_disable_and_activate() {
        let f = setup("10.8.0.0/29").await;
        let peer = f.prov.create_peer("wg0", named("alice")).await.unwrap();

        let disabled = f.prov.disable_peer("alice").await.unwrap();
        assert_eq!(disabled.status, PeerStatus::Disabled);
        assert!(disabled.ip_address_id.is_none());
        assert!(!disabled.removal_pending);
        assert_eq!(f.tunnel.removed_keys(), vec![peer.public_key.clone()]);
        assert_eq!(available(&f), 5);

        let active = f.prov.activate_peer("alice").await.unwrap();
        assert_eq!(active.status, PeerStatus::OnHold);
        assert!(active.ip_address_id.is_some());
        assert_eq!(available(&f), 4);
    }

    #[tokio::test]
    async fn test_disable_keeps_pending_on_tunnel_failure() {
        let f = setup("10.8.0.1/24").await;
        let peer = f.prov.create_peer("wg0", named("alice")).await.unwrap();
        f.tunnel.fail_removal_of(&peer.public_key);

        let disabled = f.prov.disable_peer("alice").await.unwrap();
        assert_eq!(disabled.status, PeerStatus::Disabled);
        assert!(disabled.removal_pending);
    }

    #[tokio::test]
    async fn test_update_reactivates_limited_peer() {
        let f = setup("10.8.0.1/24").await;
        f.prov.create_peer("wg0", named("alice")).await.unwrap();

        let mut peer = f.prov.get_peer("alice").unwrap();
        peer.status = PeerStatus::Limited;
        peer.total_volume = 100;
        peer.total_received_volume = 150;
        peer.expire_time = now_millis() + 60_000;
        f.prov.db.update_peer(&peer).unwrap();
        f.tunnel.clear_calls();

        let still_limited = f
            .prov
            .update_peer(
                "alice",
                PeerUpdate {
                    total_volume: Some(120),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(still_limited.status, PeerStatus::Limited);
        assert!(f.tunnel.calls().is_empty());

        let updated = f
            .prov
            .update_peer(
                "alice",
                PeerUpdate {
                    total_volume: Some(1_000),
                    dns: Some("9.9.9.9".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, PeerStatus::Active);
        assert_eq!(updated.dns.as_deref(), Some("9.9.9.9"));
        assert_eq!(f.tunnel.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_keeps_raw_counters() {
        let f = setup("10.8.0.1/24").await;
        f.prov.create_peer("wg0", named("alice")).await.unwrap();

        let mut peer = f.prov.get_peer("alice").unwrap();
        peer.status = PeerStatus::Expired;
        peer.expire_time = now_millis() - 1;
        peer.download_volume = 500;
        peer.upload_volume = 300;
        peer.total_received_volume = 800;
        peer.last_download_volume = 500;
        peer.last_upload_volume = 300;
        peer.last_total_received_volume = 800;
        f.prov.db.update_peer(&peer).unwrap();

        let reset = f.prov.reset_peer("alice", PeerReset::default()).await.unwrap();
        assert_eq!(reset.status, PeerStatus::Active);
        assert_eq!(reset.total_received_volume, 0);
        assert_eq!(reset.download_volume, 0);
        assert_eq!(reset.last_download_volume, 500);
        assert_eq!(reset.last_total_received_volume, 800);
        assert!(reset.expire_time > now_millis());
    }

    #[tokio::test]
    async fn test_delete_peer_and_interface() {
        let f = setup("10.8.0.1/24").await;
        let peer = f.prov.create_peer("wg0", named("alice")).await.unwrap();

        let in_use = f.prov.delete_interface("wg0").await;
        assert!(matches!(in_use, Err(Error::InterfaceInUse { peers: 1, .. })));

        f.prov.delete_peer("alice").await.unwrap();
        assert!(f.tunnel.removed_keys().contains(&peer.public_key));
        assert_eq!(available(&f), 253);

        f.prov.delete_interface("wg0").await.unwrap();
        assert!(f.prov.list_interfaces().unwrap().is_empty());
        assert!(!f.dir.path().join("wg0.conf").exists());
        assert!(f.tunnel.calls().contains(&TunnelCall::SetState {
            interface: "wg0".to_string(),
            state: LinkState::Down,
        }));
    }

    #[tokio::test]
    async fn test_disabled_interface_refuses_peers() {
        let f = setup("10.8.0.1/24").await;
        f.prov
            .set_interface_status("wg0", InterfaceStatus::Disabled)
            .await
            .unwrap();

        let result = f.prov.create_peer("wg0", named("alice")).await;
        assert!(matches!(result, Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_render_and_filter() {
        let f = setup("10.8.0.1/24").await;
        f.prov.create_peer("wg0", named("alice")).await.unwrap();
        f.prov.create_peer("wg0", named("bob")).await.unwrap();

        let conf = f.prov.render_peer_config("alice").unwrap();
        assert!(conf.contains("Endpoint = vpn.example.com:51820"));

        let page = f
            .prov
            .filter_peers(&PeerFilter {
                status: Some(PeerStatus::OnHold),
                take: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.peers.len(), 1);
        assert_eq!(page.peers[0].name, "alice");
    }
}
