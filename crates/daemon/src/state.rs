//! Shared daemon state: database, tunnel backend and the services built on them

use crate::config::DaemonConfig;
use crate::coordinator::AccountingCoordinator;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use wgquota_common::{
    Database, DryRunTunnel, Provisioner, Result, TunnelControl, WgCli, X25519KeyGenerator,
};

/// State manager for all daemon resources
#[derive(Clone)]
pub struct StateManager {
    config: DaemonConfig,
    db: Database,
    tunnel: Arc<dyn TunnelControl>,
}

impl StateManager {
    /// Open the database and select the tunnel backend
    pub async fn new(config: &DaemonConfig) -> Result<Self> {
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let db = open_with_retry(
            &db_path,
            config.database.open_attempts,
            Duration::from_millis(config.database.open_backoff_ms),
        )
        .await?;

        let tunnel: Arc<dyn TunnelControl> = if config.wireguard.dry_run {
            info!("Dry run: tunnel operations are recorded, not executed");
            Arc::new(DryRunTunnel::new())
        } else {
            Arc::new(WgCli::new(
                &config.wireguard.wg_binary,
                &config.wireguard.wg_quick_binary,
                config.schedule.tick_timeout(),
            ))
        };

        Ok(Self {
            config: config.clone(),
            db,
            tunnel,
        })
    }

    /// Get configuration
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn provisioner(&self) -> Provisioner {
        let provisioner = Provisioner::new(
            self.db.clone(),
            self.tunnel.clone(),
            Arc::new(X25519KeyGenerator),
        )
        .with_defaults(self.config.peer_defaults.clone());

        match &self.config.wireguard.config_dir {
            Some(dir) => provisioner.with_config_dir(dir),
            None => provisioner,
        }
    }

    pub fn coordinator(&self) -> AccountingCoordinator {
        AccountingCoordinator::new(
            self.db.clone(),
            self.tunnel.clone(),
            self.config.schedule.tick_timeout(),
        )
    }
}

/// Open the database, retrying with doubling backoff while it is unavailable
pub async fn open_with_retry(path: &Path, attempts: u32, backoff: Duration) -> Result<Database> {
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut attempt = 1;

    loop {
        match Database::open(path) {
            Ok(db) => return Ok(db),
            Err(e) if attempt < attempts => {
                warn!(
                    "Failed to open database {} (attempt {}/{}): {}; retrying in {:?}",
                    path.display(),
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
