//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use wgquota_common::PeerDefaults;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// State directory
    pub store_path: PathBuf,

    /// Database file, defaults to `<store_path>/state.db`
    pub database_path: Option<PathBuf>,

    /// Job intervals and timeouts
    pub schedule: ScheduleConfig,

    /// Database open behaviour
    pub database: DatabaseConfig,

    /// WireGuard tooling
    pub wireguard: WireGuardConfig,

    /// Defaults for newly provisioned peers
    pub peer_defaults: PeerDefaults,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            store_path: wgquota_common::default_store_path(),
            database_path: None,
            schedule: ScheduleConfig::default(),
            database: DatabaseConfig::default(),
            wireguard: WireGuardConfig::default(),
            peer_defaults: PeerDefaults::default(),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Seconds between accounting cycles
    pub accounting_interval_secs: u64,

    /// Seconds between inactive-peer reconciliations
    pub reconcile_interval_secs: u64,

    /// Upper bound for a counter fetch or a single tunnel mutation
    pub tick_timeout_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            accounting_interval_secs: 60,
            reconcile_interval_secs: 300,
            tick_timeout_secs: 30,
        }
    }
}

impl ScheduleConfig {
    pub fn accounting_interval(&self) -> Duration {
        Duration::from_secs(self.accounting_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn tick_timeout(&self) -> Duration {
        Duration::from_secs(self.tick_timeout_secs)
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Attempts to open the database before giving up
    pub open_attempts: u32,

    /// Delay before the second attempt, doubled after each failure
    pub open_backoff_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            open_attempts: 5,
            open_backoff_ms: 500,
        }
    }
}

/// WireGuard tooling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardConfig {
    /// Path to `wg`
    pub wg_binary: PathBuf,

    /// Path to `wg-quick`
    pub wg_quick_binary: PathBuf,

    /// Where interface `.conf` files are written
    pub config_dir: Option<PathBuf>,

    /// Record tunnel operations instead of running them
    pub dry_run: bool,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            wg_binary: PathBuf::from("wg"),
            wg_quick_binary: PathBuf::from("wg-quick"),
            config_dir: Some(PathBuf::from("/etc/wireguard")),
            dry_run: false,
        }
    }
}

impl DaemonConfig {
    /// Load configuration from file
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the scheduler cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.schedule.accounting_interval_secs == 0 || self.schedule.reconcile_interval_secs == 0 {
            anyhow::bail!("schedule intervals must be at least one second");
        }
        if self.schedule.tick_timeout_secs == 0 {
            anyhow::bail!("tick_timeout_secs must be at least one second");
        }
        if self.database.open_attempts == 0 {
            anyhow::bail!("database.open_attempts must be at least 1");
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.store_path.join("state.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.schedule.accounting_interval(), Duration::from_secs(60));
        assert_eq!(config.schedule.reconcile_interval(), Duration::from_secs(300));
        assert_eq!(config.database.open_attempts, 5);
        assert_eq!(config.peer_defaults.mtu, 1420);
        assert_eq!(config.peer_defaults.persistent_keepalive, 21);
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/wgquota/state.db"));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.schedule.tick_timeout_secs, 30);
    }

    #[test]
    fn test_partial_file_and_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "store_path = \"/tmp/wgq\"\n\
             [schedule]\n\
             accounting_interval_secs = 15\n\
             [wireguard]\n\
             dry_run = true\n\
             [peer_defaults]\n\
             total_volume = 1073741824\n",
        )
        .unwrap();

        let config = DaemonConfig::load(&path).unwrap();
        assert_eq!(config.schedule.accounting_interval_secs, 15);
        assert_eq!(config.schedule.reconcile_interval_secs, 300);
        assert!(config.wireguard.dry_run);
        assert_eq!(config.peer_defaults.total_volume, 1 << 30);
        assert_eq!(config.peer_defaults.endpoint_allowed_ips, "0.0.0.0/0");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/wgq/state.db"));

        let saved = dir.path().join("saved.toml");
        config.save(&saved).unwrap();
        let reloaded = DaemonConfig::load(&saved).unwrap();
        assert_eq!(reloaded.schedule.accounting_interval_secs, 15);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[schedule]\naccounting_interval_secs = 0\n").unwrap();
        assert!(DaemonConfig::load(&path).is_err());
    }
}
