//! wgquota Daemon
//!
//! Meters WireGuard peers against their quotas on a schedule and provides the
//! operator commands for provisioning interfaces and peers.

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use wgquota_common::provisioning::{
    NewInterface, NewPeer, PeerOptions, PeerReset, PeerTemplate, PeerUpdate,
};
use wgquota_common::{InterfaceStatus, PeerFilter, PeerStatus};

mod config;
mod coordinator;
mod scheduler;
mod state;

use config::DaemonConfig;
use coordinator::CycleOutcome;
use scheduler::Scheduler;
use state::StateManager;

#[derive(Parser)]
#[command(name = "wgquotad")]
#[command(about = "wgquota daemon - WireGuard peer accounting and quota lifecycle")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WGQUOTA_CONFIG", default_value = "/etc/wgquota/config.toml")]
    config: PathBuf,

    /// State directory
    #[arg(short, long, env = "WGQUOTA_STORE")]
    store: Option<PathBuf>,

    /// Database file
    #[arg(long, env = "WGQUOTA_DATABASE")]
    database: Option<PathBuf>,

    /// Record tunnel operations instead of running wg / wg-quick
    #[arg(long)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler until interrupted (default)
    Run,
    /// Run a single accounting cycle
    Cycle,
    /// Remove every inactive peer from the live tunnels once
    Reconcile,
    /// Manage interfaces
    #[command(subcommand)]
    Interface(InterfaceCommand),
    /// Manage peers
    #[command(subcommand)]
    Peer(PeerCommand),
}

#[derive(Subcommand)]
enum InterfaceCommand {
    /// Create an interface and its address pool
    Add {
        name: String,
        /// Subnet in CIDR notation, e.g. 10.8.0.1/24
        #[arg(long)]
        address: String,
        /// Public host:port clients connect to
        #[arg(long)]
        endpoint: String,
        #[arg(long, default_value_t = 51820)]
        listen_port: u16,
        /// Existing private key; generated when omitted
        #[arg(long)]
        private_key: Option<String>,
        #[arg(long, default_value_t = 1.0)]
        upload_percent: f64,
        #[arg(long, default_value_t = 1.0)]
        download_percent: f64,
        #[arg(long)]
        save_config: bool,
        #[arg(long)]
        pre_up: Option<String>,
        #[arg(long)]
        post_up: Option<String>,
        #[arg(long)]
        pre_down: Option<String>,
        #[arg(long)]
        post_down: Option<String>,
        #[arg(long)]
        dns: Option<String>,
    },
    /// List interfaces with usage totals
    List,
    /// Bring an interface up
    Up { name: String },
    /// Bring an interface down
    Down { name: String },
    /// Delete an interface without peers
    Rm { name: String },
}

#[derive(Subcommand)]
enum PeerCommand {
    /// Create a peer
    Add {
        interface: String,
        #[arg(long)]
        name: Option<String>,
        /// Client-held public key; a key pair is generated when omitted
        #[arg(long)]
        public_key: Option<String>,
        #[command(flatten)]
        options: PeerOptionArgs,
    },
    /// Create many peers at once
    Bulk {
        interface: String,
        count: usize,
        #[arg(long)]
        prefix: Option<String>,
        #[command(flatten)]
        options: PeerOptionArgs,
    },
    /// List peers
    List {
        #[arg(long)]
        interface: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        public_key: Option<String>,
        #[arg(long)]
        status: Option<PeerStatus>,
        #[arg(long, default_value_t = 0)]
        skip: usize,
        #[arg(long)]
        take: Option<usize>,
    },
    /// Show one peer
    Show { name: String },
    /// Print the client configuration of a peer
    Config { name: String },
    /// Change limits or client settings
    Update {
        name: String,
        #[arg(long)]
        total_volume: Option<u64>,
        /// Epoch millis
        #[arg(long)]
        expire_time: Option<i64>,
        #[arg(long)]
        endpoint: Option<String>,
        #[arg(long)]
        endpoint_allowed_ips: Option<String>,
        #[arg(long)]
        dns: Option<String>,
        #[arg(long)]
        mtu: Option<u32>,
        #[arg(long)]
        persistent_keepalive: Option<u32>,
    },
    /// Zero accumulated usage and reactivate
    Reset {
        name: String,
        #[arg(long)]
        total_volume: Option<u64>,
        #[arg(long)]
        expire_time: Option<i64>,
    },
    /// Disable a peer and release its address
    Disable { name: String },
    /// Reactivate a peer
    Activate { name: String },
    /// Delete a peer
    Rm { name: String },
}

#[derive(Args)]
struct PeerOptionArgs {
    /// Quota in bytes, 0 = unlimited
    #[arg(long)]
    total_volume: Option<u64>,
    /// Grace period after first traffic, millis
    #[arg(long)]
    on_hold_expire_duration_ms: Option<i64>,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long)]
    endpoint_allowed_ips: Option<String>,
    #[arg(long)]
    dns: Option<String>,
    #[arg(long)]
    mtu: Option<u32>,
    #[arg(long)]
    persistent_keepalive: Option<u32>,
}

impl From<PeerOptionArgs> for PeerOptions {
    fn from(args: PeerOptionArgs) -> Self {
        Self {
            total_volume: args.total_volume,
            on_hold_expire_duration_ms: args.on_hold_expire_duration_ms,
            endpoint: args.endpoint,
            endpoint_allowed_ips: args.endpoint_allowed_ips,
            dns: args.dns,
            mtu: args.mtu,
            persistent_keepalive: args.persistent_keepalive,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(cli.json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!cli.json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(filter)
        .init();

    let mut config = DaemonConfig::load(&cli.config)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(database) = cli.database {
        config.database_path = Some(database);
    }
    if cli.dry_run {
        config.wireguard.dry_run = true;
    }
    config.validate()?;

    let state = StateManager::new(&config).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_daemon(&state).await,
        Command::Cycle => {
            let outcome = state.coordinator().run_accounting_cycle().await;
            print_json(&outcome)?;
            if !matches!(outcome, CycleOutcome::Completed(_)) {
                anyhow::bail!("accounting cycle did not complete");
            }
            Ok(())
        }
        Command::Reconcile => {
            let report = state.coordinator().reconcile_inactive_peers().await;
            print_json(&report)
        }
        Command::Interface(cmd) => interface_command(&state, cmd).await,
        Command::Peer(cmd) => peer_command(&state, cmd).await,
    }
}

async fn run_daemon(state: &StateManager) -> anyhow::Result<()> {
    info!("wgquota daemon v{}", wgquota_common::VERSION);

    let schedule = &state.config().schedule;
    let scheduler = Scheduler::new(
        Arc::new(state.coordinator()),
        schedule.accounting_interval(),
        schedule.reconcile_interval(),
    );

    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received shutdown signal");
        })
        .await;

    info!("Daemon shutdown complete");
    Ok(())
}

async fn interface_command(state: &StateManager, cmd: InterfaceCommand) -> anyhow::Result<()> {
    let provisioner = state.provisioner();
    match cmd {
        InterfaceCommand::Add {
            name,
            address,
            endpoint,
            listen_port,
            private_key,
            upload_percent,
            download_percent,
            save_config,
            pre_up,
            post_up,
            pre_down,
            post_down,
            dns,
        } => {
            let iface = provisioner
                .create_interface(NewInterface {
                    name,
                    address,
                    endpoint,
                    listen_port,
                    private_key,
                    upload_percent,
                    download_percent,
                    save_config,
                    pre_up,
                    post_up,
                    pre_down,
                    post_down,
                    dns,
                })
                .await?;
            println!(
                "Created interface {} ({}), public key {}",
                iface.name, iface.address, iface.public_key
            );
        }
        InterfaceCommand::List => print_json(&provisioner.list_interfaces()?)?,
        InterfaceCommand::Up { name } => {
            provisioner
                .set_interface_status(&name, InterfaceStatus::Active)
                .await?;
            println!("Interface {} is up", name);
        }
        InterfaceCommand::Down { name } => {
            provisioner
                .set_interface_status(&name, InterfaceStatus::Disabled)
                .await?;
            println!("Interface {} is down", name);
        }
        InterfaceCommand::Rm { name } => {
            provisioner.delete_interface(&name).await?;
            println!("Deleted interface {}", name);
        }
    }
    Ok(())
}

async fn peer_command(state: &StateManager, cmd: PeerCommand) -> anyhow::Result<()> {
    let provisioner = state.provisioner();
    match cmd {
        PeerCommand::Add {
            interface,
            name,
            public_key,
            options,
        } => {
            let peer = provisioner
                .create_peer(
                    &interface,
                    NewPeer {
                        name,
                        public_key,
                        options: options.into(),
                    },
                )
                .await?;
            print_json(&peer)?;
        }
        PeerCommand::Bulk {
            interface,
            count,
            prefix,
            options,
        } => {
            let peers = provisioner
                .create_peers_bulk(
                    &interface,
                    count,
                    PeerTemplate {
                        name_prefix: prefix,
                        options: options.into(),
                    },
                )
                .await?;
            for peer in &peers {
                println!("{}\t{}\t{}", peer.name, peer.allowed_ips, peer.public_key);
            }
        }
        PeerCommand::List {
            interface,
            name,
            public_key,
            status,
            skip,
            take,
        } => {
            let page = provisioner.filter_peers(&PeerFilter {
                name,
                interface,
                public_key,
                status,
                skip,
                take,
            })?;
            print_json(&page)?;
        }
        PeerCommand::Show { name } => print_json(&provisioner.get_peer(&name)?)?,
        PeerCommand::Config { name } => print!("{}", provisioner.render_peer_config(&name)?),
        PeerCommand::Update {
            name,
            total_volume,
            expire_time,
            endpoint,
            endpoint_allowed_ips,
            dns,
            mtu,
            persistent_keepalive,
        } => {
            let peer = provisioner
                .update_peer(
                    &name,
                    PeerUpdate {
                        total_volume,
                        expire_time,
                        endpoint,
                        endpoint_allowed_ips,
                        dns,
                        mtu,
                        persistent_keepalive,
                    },
                )
                .await?;
            print_json(&peer)?;
        }
        PeerCommand::Reset {
            name,
            total_volume,
            expire_time,
        } => {
            let peer = provisioner
                .reset_peer(
                    &name,
                    PeerReset {
                        total_volume,
                        expire_time,
                    },
                )
                .await?;
            print_json(&peer)?;
        }
        PeerCommand::Disable { name } => {
            let peer = provisioner.disable_peer(&name).await?;
            println!("Peer {} is {}", peer.name, peer.status);
        }
        PeerCommand::Activate { name } => {
            let peer = provisioner.activate_peer(&name).await?;
            println!("Peer {} is {}", peer.name, peer.status);
        }
        PeerCommand::Rm { name } => {
            provisioner.delete_peer(&name).await?;
            println!("Deleted peer {}", name);
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
