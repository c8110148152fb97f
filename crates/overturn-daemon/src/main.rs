//! Overturn daemon
//!
//! IP over ICMP overlay network

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use overturn_core::NetworkCluster;
use overturn_daemon::capture::{CaptureRules, IptablesCapture, NoCapture};
use overturn_daemon::config::Config;
use overturn_daemon::identity::{FixedIdentity, MachineIdentity, SystemIdentity};
use overturn_daemon::manager::{ClusterManager, FileStore, ManagerOptions};

/// Overturn - overlay network over ICMP echo
#[derive(Parser)]
#[command(name = "ovtd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// PID file path
    #[arg(long, default_value = "/var/run/ovtd.pid")]
    pidfile: PathBuf,

    /// Heartbeat period (ms) for networks that leave it unset
    #[arg(long, default_value_t = 200)]
    default_heartbeat_period: u32,

    /// Heartbeat timeout (ms) for networks that leave it unset
    #[arg(long, default_value_t = 1000)]
    default_heartbeat_timeout: u32,

    /// Take over as master at start-up
    #[arg(long)]
    master: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,

    /// Validate the configuration and print the derived membership
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("Cannot load {}", cli.config.display()))?;

    // Initialize logging
    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Validate configuration
    config.validate(cli.default_heartbeat_period, cli.default_heartbeat_timeout)?;

    match cli.command {
        Some(Commands::Check) => check(&cli, &config),
        Some(Commands::Run) | None => run(&cli, config).await,
    }
}

/// Build the active network from the configuration
fn load_cluster(cli: &Cli, config: &Config) -> anyhow::Result<NetworkCluster> {
    let (name, network) = config.active_network()?;
    let network = network
        .clone()
        .with_heartbeat_defaults(cli.default_heartbeat_period, cli.default_heartbeat_timeout);

    let machine_id = match config.machine_id()? {
        Some(id) => FixedIdentity(id).machine_id()?,
        None => SystemIdentity::new().machine_id()?,
    };

    Ok(NetworkCluster::from_config(name, &network, machine_id)?)
}

/// Run until interrupted
async fn run(cli: &Cli, config: Config) -> anyhow::Result<()> {
    let cluster = load_cluster(cli, &config)?;
    let options = ManagerOptions {
        bind_address: config.bind_address()?,
        icmp_type: config.icmp_type()?,
        size_limit: config.transport.size_limit,
        queue_count: config.transport.queues,
    };
    let capture_config = config.capture.clone();
    let store = FileStore::new(&cli.config, config);

    let manager = ClusterManager::new(cluster, &options, Box::new(store), |link| {
        let capture: Box<dyn CaptureRules> = if capture_config.enabled {
            Box::new(IptablesCapture::new(&capture_config, link))
        } else {
            Box::new(NoCapture)
        };
        Ok(capture)
    })?;

    if cli.master {
        manager.promote_self()?;
    }
    manager.start()?;

    write_pidfile(&cli.pidfile)?;
    info!(link = %manager.link_name(), "Serving. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let stopped = manager.stop();
    if let Err(e) = fs::remove_file(&cli.pidfile) {
        warn!(path = %cli.pidfile.display(), error = %e, "Cannot remove pidfile");
    }
    manager.persist()?;

    let stats = manager.stats();
    info!(
        icmp_sent = stats.icmp.bytes_sent,
        icmp_received = stats.icmp.bytes_received,
        link_sent = stats.link.bytes_sent,
        link_received = stats.link.bytes_received,
        "Traffic totals"
    );
    stopped?;
    Ok(())
}

/// Print the derived membership without touching the network
fn check(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let cluster = load_cluster(cli, config)?;

    println!("Network:   {}", cluster.name());
    println!("Term:      {}", cluster.term());
    println!("Index:     {}", cluster.index());
    println!(
        "Heartbeat: {} ms period, {} ms timeout",
        cluster.heartbeat_period().as_millis(),
        cluster.heartbeat_timeout().as_millis()
    );
    println!("Self:      {} ({})", cluster.self_node().name(), cluster.self_node().id());
    println!();
    println!("Nodes:");
    for (_, node) in cluster.nodes() {
        let publish: Vec<String> = node.publish().iter().map(ToString::to_string).collect();
        println!(
            "  {} {:<16} {:<8} {}",
            node.id(),
            node.name(),
            if node.is_active() { "active" } else { "inactive" },
            publish.join(", ")
        );
    }

    if !cluster.conflicts().is_empty() {
        let conflicts: Vec<String> = cluster.conflicts().iter().map(ToString::to_string).collect();
        println!();
        println!("Conflicting IPs: {}", conflicts.join(", "));
    }

    let members: Vec<String> = cluster.member_ips().iter().map(ToString::to_string).collect();
    println!();
    println!("Capture set: {}", members.join(", "));
    Ok(())
}

fn write_pidfile(path: &Path) -> anyhow::Result<()> {
    fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("Cannot write pidfile {}", path.display()))
}
