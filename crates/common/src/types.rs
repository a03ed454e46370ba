//! Core types for wgquota

use serde::{Deserialize, Serialize};

/// Current wall clock in epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Administrative status of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceStatus {
    Active,
    Disabled,
}

impl Default for InterfaceStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl std::fmt::Display for InterfaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

impl std::str::FromStr for InterfaceStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("unknown interface status: {}", s)),
        }
    }
}

/// Lifecycle status of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Provisioned, billing clock not started
    OnHold,
    Active,
    /// Quota exceeded
    Limited,
    Expired,
    /// Administratively disabled
    Disabled,
}

impl Default for PeerStatus {
    fn default() -> Self {
        Self::OnHold
    }
}

impl PeerStatus {
    /// Peers in these states are configured on the live tunnel
    pub fn in_tunnel(&self) -> bool {
        matches!(self, Self::OnHold | Self::Active)
    }

    /// Peers in these states must not be present on the live tunnel
    pub fn is_inactive(&self) -> bool {
        matches!(self, Self::Limited | Self::Expired | Self::Disabled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnHold => "onhold",
            Self::Active => "active",
            Self::Limited => "limited",
            Self::Expired => "expired",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PeerStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onhold" => Ok(Self::OnHold),
            "active" => Ok(Self::Active),
            "limited" => Ok(Self::Limited),
            "expired" => Ok(Self::Expired),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("unknown peer status: {}", s)),
        }
    }
}

/// Desired link state for an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Up,
    Down,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

/// A WireGuard tunnel endpoint hosting many peers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub id: i64,
    pub name: String,
    /// Subnet in CIDR notation, e.g. `10.8.0.1/24`
    pub address: String,
    /// Public `host:port` clients connect to
    pub endpoint: String,
    pub listen_port: u16,
    pub private_key: String,
    pub public_key: String,
    pub status: InterfaceStatus,
    pub upload_percent: f64,
    pub download_percent: f64,
    #[serde(default)]
    pub save_config: bool,
    pub pre_up: Option<String>,
    pub post_up: Option<String>,
    pub pre_down: Option<String>,
    pub post_down: Option<String>,
    pub dns: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One allocatable host address of an interface pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    pub id: i64,
    pub interface_id: i64,
    pub address: String,
    pub available: bool,
}

/// One VPN client identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub id: i64,
    pub interface_id: i64,
    pub name: String,
    pub public_key: String,
    /// Only present when the key pair was generated here
    pub private_key: Option<String>,
    pub preshared_key: String,
    pub allowed_ips: String,
    pub ip_address_id: Option<i64>,
    /// Quota in bytes, 0 = unlimited
    pub total_volume: u64,
    /// Epoch millis
    pub expire_time: i64,
    /// Grace period length in millis, applied on first traffic
    pub on_hold_expire_duration: i64,
    pub download_volume: u64,
    pub upload_volume: u64,
    pub total_received_volume: u64,
    pub last_download_volume: u64,
    pub last_upload_volume: u64,
    pub last_total_received_volume: u64,
    pub status: PeerStatus,
    /// Set when the peer left the tunnel set and the removal has not been confirmed
    pub removal_pending: bool,
    pub endpoint: Option<String>,
    pub endpoint_allowed_ips: String,
    pub dns: Option<String>,
    pub mtu: Option<u32>,
    pub persistent_keepalive: Option<u32>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Peer {
    /// Accounting-relevant view of this peer
    pub fn usage(&self) -> PeerUsage {
        PeerUsage {
            download_volume: self.download_volume,
            upload_volume: self.upload_volume,
            total_received_volume: self.total_received_volume,
            last_download_volume: self.last_download_volume,
            last_upload_volume: self.last_upload_volume,
            last_total_received_volume: self.last_total_received_volume,
        }
    }
}

/// Accumulated and last-observed raw counters of a peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUsage {
    pub download_volume: u64,
    pub upload_volume: u64,
    pub total_received_volume: u64,
    pub last_download_volume: u64,
    pub last_upload_volume: u64,
    pub last_total_received_volume: u64,
}

/// Raw cumulative transfer counter for one peer, as reported by the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferCounter {
    pub interface: String,
    pub public_key: String,
    pub received_bytes: u64,
    pub sent_bytes: u64,
}

/// Interface listing entry with aggregate peer figures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSummary {
    pub name: String,
    pub address: String,
    pub listen_port: u16,
    pub public_key: String,
    pub status: InterfaceStatus,
    pub peer_count: usize,
    pub available_addresses: usize,
    /// Sum of peer quotas in bytes
    pub total_quota: u64,
    /// Sum of accounted peer volume in bytes
    pub total_used: u64,
}

/// Peer query with optional equality filters and paging
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerFilter {
    pub name: Option<String>,
    pub interface: Option<String>,
    pub public_key: Option<String>,
    pub status: Option<PeerStatus>,
    #[serde(default)]
    pub skip: usize,
    pub take: Option<usize>,
}

/// A page of peers plus the unpaged match count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerPage {
    pub total: usize,
    pub peers: Vec<Peer>,
}
