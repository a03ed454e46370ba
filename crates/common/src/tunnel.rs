//! Live tunnel control
//!
//! The engine never talks to the kernel directly. Everything that touches a
//! running WireGuard interface goes through [`TunnelControl`], implemented by
//! [`WgCli`] (the `wg` / `wg-quick` tools) and [`DryRunTunnel`] (in memory).

use crate::types::{LinkState, TransferCounter};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Operations on the live WireGuard interfaces
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Raw cumulative counters for every peer on every interface
    async fn get_counters(&self) -> Result<Vec<TransferCounter>>;

    /// Add or update a peer on a running interface
    async fn apply_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ips: &str,
        preshared_key: Option<&str>,
    ) -> Result<()>;

    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()>;

    async fn set_interface_state(&self, interface: &str, state: LinkState) -> Result<()>;

    /// Persist the running configuration of an interface
    async fn save_config(&self, interface: &str) -> Result<()>;
}

/// Counters parsed from a `wg show all transfer` dump
#[derive(Debug, Default)]
pub struct TransferDump {
    pub counters: Vec<TransferCounter>,
    pub malformed: usize,
}

/// Parse `wg show all transfer` output: `<iface>\t<public key>\t<rx>\t<tx>`.
///
/// Malformed lines are logged and counted, never fatal.
pub fn parse_transfer_dump(text: &str) -> TransferDump {
    let mut dump = TransferDump::default();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_transfer_line(line) {
            Ok(counter) => dump.counters.push(counter),
            Err(e) => {
                warn!("{}", e);
                dump.malformed += 1;
            }
        }
    }
    dump
}

fn parse_transfer_line(line: &str) -> Result<TransferCounter> {
    let malformed = |reason: &str| Error::CounterParse {
        line: line.to_string(),
        reason: reason.to_string(),
    };

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(malformed("expected 4 fields"));
    }

    let received_bytes = fields[2]
        .parse::<u64>()
        .map_err(|_| malformed("received bytes is not a non-negative integer"))?;
    let sent_bytes = fields[3]
        .parse::<u64>()
        .map_err(|_| malformed("sent bytes is not a non-negative integer"))?;

    Ok(TransferCounter {
        interface: fields[0].to_string(),
        public_key: fields[1].to_string(),
        received_bytes,
        sent_bytes,
    })
}

// ============================================================================
// wg / wg-quick backend
// ============================================================================

/// Tunnel control through the `wg` and `wg-quick` command line tools
#[derive(Debug, Clone)]
pub struct WgCli {
    wg_binary: PathBuf,
    wg_quick_binary: PathBuf,
    timeout: Duration,
}

impl WgCli {
    pub fn new(wg_binary: impl Into<PathBuf>, wg_quick_binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            wg_binary: wg_binary.into(),
            wg_quick_binary: wg_quick_binary.into(),
            timeout,
        }
    }

    async fn run(&self, program: &Path, args: &[&str]) -> Result<String> {
        debug!("Running {} {}", program.display(), args.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                seconds: self.timeout.as_secs(),
            })?
            .map_err(|e| {
                Error::TunnelControl(format!("failed to spawn {}: {}", program.display(), e))
            })?;

        if !output.status.success() {
            return Err(Error::TunnelControl(format!(
                "{} {} exited with {}: {}",
                program.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TunnelControl for WgCli {
    async fn get_counters(&self) -> Result<Vec<TransferCounter>> {
        let stdout = self
            .run(&self.wg_binary, &["show", "all", "transfer"])
            .await
            .map_err(|e| Error::CounterFetch(e.to_string()))?;

        let dump = parse_transfer_dump(&stdout);
        if dump.malformed > 0 {
            warn!("Dropped {} malformed transfer line(s)", dump.malformed);
        }
        Ok(dump.counters)
    }

    async fn apply_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ips: &str,
        preshared_key: Option<&str>,
    ) -> Result<()> {
        // `wg set` only reads preshared keys from a file
        let psk_file = match preshared_key {
            Some(psk) if !psk.is_empty() => {
                let mut file = tempfile::NamedTempFile::new()?;
                writeln!(file, "{}", psk)?;
                file.flush()?;
                Some(file)
            }
            _ => None,
        };
        let psk_path = psk_file
            .as_ref()
            .map(|f| f.path().to_string_lossy().into_owned());

        let mut args = vec!["set", interface, "peer", public_key];
        if let Some(path) = psk_path.as_deref() {
            args.extend(["preshared-key", path]);
        }
        args.extend(["allowed-ips", allowed_ips]);

        self.run(&self.wg_binary, &args).await?;
        info!("Applied peer {} on {}", public_key, interface);
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()> {
        self.run(&self.wg_binary, &["set", interface, "peer", public_key, "remove"])
            .await?;
        info!("Removed peer {} from {}", public_key, interface);
        Ok(())
    }

    async fn set_interface_state(&self, interface: &str, state: LinkState) -> Result<()> {
        let verb = state.to_string();
        self.run(&self.wg_quick_binary, &[verb.as_str(), interface]).await?;
        info!("Interface {} is {}", interface, state);
        Ok(())
    }

    async fn save_config(&self, interface: &str) -> Result<()> {
        self.run(&self.wg_quick_binary, &["save", interface]).await?;
        debug!("Saved running config of {}", interface);
        Ok(())
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// A recorded tunnel mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelCall {
    ApplyPeer {
        interface: String,
        public_key: String,
        allowed_ips: String,
    },
    RemovePeer {
        interface: String,
        public_key: String,
    },
    SetState {
        interface: String,
        state: LinkState,
    },
    SaveConfig {
        interface: String,
    },
}

#[derive(Debug, Default)]
struct DryRunState {
    counters: Vec<TransferCounter>,
    calls: Vec<TunnelCall>,
    fail_counters: bool,
    fail_apply: bool,
    failing_removals: HashSet<String>,
    counter_delay: Option<Duration>,
}

/// Tunnel that only records what it was asked to do.
///
/// Counters and failures are scripted by the caller.
#[derive(Debug, Default)]
pub struct DryRunTunnel {
    state: Mutex<DryRunState>,
}

impl DryRunTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_counters(&self, counters: Vec<TransferCounter>) {
        self.state.lock().counters = counters;
    }

    pub fn fail_counters(&self, fail: bool) {
        self.state.lock().fail_counters = fail;
    }

    pub fn fail_apply(&self, fail: bool) {
        self.state.lock().fail_apply = fail;
    }

    /// Make `remove_peer` fail for this public key until cleared
    pub fn fail_removal_of(&self, public_key: &str) {
        self.state.lock().failing_removals.insert(public_key.to_string());
    }

    pub fn clear_removal_failures(&self) {
        self.state.lock().failing_removals.clear();
    }

    /// Delay every counter fetch, to exercise timeouts and overlap
    pub fn delay_counters(&self, delay: Duration) {
        self.state.lock().counter_delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<TunnelCall> {
        self.state.lock().calls.clone()
    }

    /// Public keys passed to successful `remove_peer` calls, in order
    pub fn removed_keys(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TunnelCall::RemovePeer { public_key, .. } => Some(public_key.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn saved_interfaces(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                TunnelCall::SaveConfig { interface } => Some(interface.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

#[async_trait]
impl TunnelControl for DryRunTunnel {
    async fn get_counters(&self) -> Result<Vec<TransferCounter>> {
        let delay = self.state.lock().counter_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.state.lock();
        if state.fail_counters {
            return Err(Error::CounterFetch("scripted failure".to_string()));
        }
        Ok(state.counters.clone())
    }

    async fn apply_peer(
        &self,
        interface: &str,
        public_key: &str,
        allowed_ips: &str,
        _preshared_key: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_apply {
            return Err(Error::TunnelControl(format!(
                "scripted apply failure for {}",
                public_key
            )));
        }
        state.calls.push(TunnelCall::ApplyPeer {
            interface: interface.to_string(),
            public_key: public_key.to_string(),
            allowed_ips: allowed_ips.to_string(),
        });
        Ok(())
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_removals.contains(public_key) {
            return Err(Error::TunnelControl(format!(
                "scripted removal failure for {}",
                public_key
            )));
        }
        state.calls.push(TunnelCall::RemovePeer {
            interface: interface.to_string(),
            public_key: public_key.to_string(),
        });
        Ok(())
    }

    async fn set_interface_state(&self, interface: &str, state: LinkState) -> Result<()> {
        self.state.lock().calls.push(TunnelCall::SetState {
            interface: interface.to_string(),
            state,
        });
        Ok(())
    }

    async fn save_config(&self, interface: &str) -> Result<()> {
        self.state.lock().calls.push(TunnelCall::SaveConfig {
            interface: interface.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_transfer_dump() {
        let text = "wg0\tAAAA=\t1024\t2048\n\
                    wg0\tBBBB=\t0\t0\n\
                    \n\
                    wg1\tCCCC=\t5\n\
                    wg1\tDDDD=\t-5\t10\n\
                    wg1\tEEEE=\t7\t8\n";
        let dump = parse_transfer_dump(text);

        assert_eq!(dump.counters.len(), 3);
        assert_eq!(dump.malformed, 2);
        assert_eq!(
            dump.counters[0],
            TransferCounter {
                interface: "wg0".to_string(),
                public_key: "AAAA=".to_string(),
                received_bytes: 1024,
                sent_bytes: 2048,
            }
        );
        assert_eq!(dump.counters[2].interface, "wg1");
    }

    #[test]
    fn test_parse_line_reports_reason() {
        let err = parse_transfer_line("wg0 key abc 1").unwrap_err();
        assert!(matches!(err, Error::CounterParse { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_records_calls() {
        let tunnel = DryRunTunnel::new();
        tunnel.apply_peer("wg0", "pk1", "10.8.0.2/32", Some("psk")).await.unwrap();
        tunnel.remove_peer("wg0", "pk1").await.unwrap();
        tunnel.save_config("wg0").await.unwrap();
        tunnel.set_interface_state("wg0", LinkState::Down).await.unwrap();

        assert_eq!(tunnel.calls().len(), 4);
        assert_eq!(tunnel.removed_keys(), vec!["pk1".to_string()]);
        assert_eq!(tunnel.saved_interfaces(), vec!["wg0".to_string()]);
    }

    #[tokio::test]
    async fn test_dry_run_scripted_failures() {
        let tunnel = DryRunTunnel::new();
        tunnel.fail_counters(true);
        assert!(matches!(tunnel.get_counters().await, Err(Error::CounterFetch(_))));

        tunnel.fail_removal_of("pk1");
        assert!(tunnel.remove_peer("wg0", "pk1").await.is_err());
        assert!(tunnel.removed_keys().is_empty());

        tunnel.clear_removal_failures();
        tunnel.remove_peer("wg0", "pk1").await.unwrap();
        assert_eq!(tunnel.removed_keys().len(), 1);
    }

    #[tokio::test]
    async fn test_wg_cli_missing_binary() {
        let cli = WgCli::new(
            "/nonexistent/wg",
            "/nonexistent/wg-quick",
            Duration::from_secs(1),
        );
        let err = cli.get_counters().await.unwrap_err();
        assert!(matches!(err, Error::CounterFetch(_)));
        assert!(cli.remove_peer("wg0", "pk").await.is_err());
    }
}
