//! xengate CLI - Multi-tunnel SSH forwarding proxy
//!
//! Keeps pools of SSH tunnels open to the configured servers and serves
//! local SOCKS5, HTTP or TUN front-ends that forward through them.

mod config;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use xengate_access::{AccessControl, IpBlocklist, NewRule};
use xengate_proto::{AppConfig, ConfigStore, ServerProfile};
use xengate_proxy::Proxy;
use xengate_transport::SshConnector;
use xengate_tunnel::Manager;

use crate::config::{default_config_path, FileConfigStore};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// xengate - Forward local traffic through pools of SSH tunnels
#[derive(Parser, Debug)]
#[command(name = "xengate")]
#[command(about = "xengate - Forward local traffic through pools of SSH tunnels")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Configuration file (defaults to ~/.xengate/config.json)
    #[arg(long, global = true, env = "XENGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter, overridden by RUST_LOG
    #[arg(long, global = true, env = "XENGATE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open tunnel pools and serve the configured front-ends
    #[command(long_about = r#"
Open a pool of SSH tunnels for each configured server and start the
front-end (socks5, http or tuntap) described by its proxy settings.
Runs until Ctrl+C.

EXAMPLES:
  # Start every configured server
  xengate run

  # Start only two of them
  xengate run --server eu --server us

ENVIRONMENT VARIABLES:
  XENGATE_CONFIG     Configuration file path
  XENGATE_LOG_LEVEL  Log level filter (e.g. debug, xengate_tunnel=trace)
    "#)]
    Run {
        /// Server profile to start (repeatable, default: all)
        #[arg(long = "server")]
        servers: Vec<String>,
    },

    /// Inspect server profiles
    Servers {
        #[command(subcommand)]
        command: ServersCommand,
    },

    /// Manage per-IP daily access rules
    Rules {
        #[command(subcommand)]
        command: RulesCommand,
    },

    /// Manage the IP blocklist
    Block {
        #[command(subcommand)]
        command: BlockCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ServersCommand {
    /// List configured server profiles
    List,
}

#[derive(Subcommand, Debug)]
enum RulesCommand {
    /// List rules with today's usage
    List,

    /// Add a rule for one source IP
    Add {
        /// Display name
        #[arg(long)]
        title: String,

        /// Source IP the rule applies to
        #[arg(long)]
        ip: IpAddr,

        /// Daily allowance in minutes (0 = default of one hour)
        #[arg(long, default_value = "60")]
        limit_minutes: u64,

        /// Exempt this IP from quotas and the blocklist
        #[arg(long)]
        master: bool,

        #[arg(long, default_value = "")]
        description: String,
    },

    /// Delete a rule
    Remove {
        /// Rule id
        id: String,
    },

    /// Clear today's usage for a rule
    Reset {
        /// Rule id
        id: String,
    },
}

#[derive(Subcommand, Debug)]
enum BlockCommand {
    /// List blocked IPs
    List,

    /// Block an IP
    Add { ip: IpAddr },

    /// Unblock an IP
    Remove { ip: IpAddr },
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str, verbose: bool) {
    let log_level = if verbose { "debug" } else { log_level };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn open_store(path: Option<PathBuf>) -> Result<Arc<FileConfigStore>> {
    let path = match path {
        Some(path) => path,
        None => default_config_path().context("Could not determine home directory")?,
    };
    Ok(Arc::new(FileConfigStore::new(path)))
}

fn build_manager(store: &Arc<FileConfigStore>, config: &AppConfig) -> Result<Arc<Manager>> {
    let store: Arc<dyn ConfigStore> = store.clone();
    let access = AccessControl::with_store(Arc::clone(&store))
        .context("Failed to load access rules")?;

    let manager = Manager::new(Arc::new(SshConnector::new()), Arc::new(access))
        .with_blocklist(IpBlocklist::from_entries(config.blocked_list.clone()))
        .with_store(store);
    Ok(Arc::new(manager))
}

fn select_profiles(config: &AppConfig, names: &[String]) -> Result<Vec<ServerProfile>> {
    if names.is_empty() {
        return Ok(config.connections.clone());
    }

    names
        .iter()
        .map(|name| {
            config
                .find_profile(name)
                .cloned()
                .with_context(|| format!("No server profile named '{}'", name))
        })
        .collect()
}

async fn run(store: Arc<FileConfigStore>, servers: Vec<String>) -> Result<()> {
    let config = store
        .load()
        .with_context(|| format!("Failed to load {}", store.path().display()))?;
    let profiles = select_profiles(&config, &servers)?;
    if profiles.is_empty() {
        bail!(
            "No server profiles configured in {}",
            store.path().display()
        );
    }

    let manager = build_manager(&store, &config)?;
    let shutdown = CancellationToken::new();
    let daily_reset = manager.access().spawn_daily_reset(shutdown.child_token());

    let mut front_ends = JoinSet::new();
    for profile in profiles {
        let name = profile.name.clone();
        let settings = profile.proxy.clone();

        if let Err(e) = manager.start(profile, shutdown.child_token()).await {
            error!(server = %name, "Failed to start tunnel pool: {}", e);
            continue;
        }

        let proxy = match Proxy::new(&settings, Arc::clone(&manager)) {
            Ok(proxy) => proxy,
            Err(e) => {
                error!(server = %name, "Failed to create {} front-end: {}", settings.mode, e);
                continue;
            }
        };
        info!(
            server = %name,
            mode = %proxy.mode(),
            address = %settings.listen_addr,
            port = settings.listen_port,
            "Starting front-end"
        );

        let cancel = shutdown.child_token();
        front_ends.spawn(async move { (name, proxy.run(cancel).await) });
    }

    if front_ends.is_empty() {
        shutdown.cancel();
        manager.stop_all().await;
        bail!("No front-end could be started");
    }

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            finished = front_ends.join_next() => match finished {
                None => {
                    warn!("No front-end left running, shutting down...");
                    break;
                }
                Some(Ok((name, Ok(())))) => info!(server = %name, "Front-end stopped"),
                Some(Ok((name, Err(e)))) => error!(server = %name, "Front-end failed: {}", e),
                Some(Err(e)) => error!("Front-end task panicked: {}", e),
            },
        }
    }

    shutdown.cancel();
    while front_ends.join_next().await.is_some() {}

    for stats in manager.stats().await {
        info!(
            server = %stats.server_name,
            requests = stats.total_requests,
            bytes = stats.total_bytes,
            "Pool totals"
        );
    }
    manager.stop_all().await;
    if let Err(e) = daily_reset.await {
        warn!("Daily reset task failed: {}", e);
    }

    info!("xengate stopped");
    Ok(())
}

fn list_servers(store: &FileConfigStore) -> Result<()> {
    let config = store.load().context("Failed to load configuration")?;
    if config.connections.is_empty() {
        println!("No server profiles configured in {}", store.path().display());
        return Ok(());
    }

    for profile in &config.connections {
        println!(
            "{}  {}@{}:{}  tunnels={} retries={}  {} on {}:{}",
            profile.name,
            profile.user,
            profile.host,
            profile.port,
            profile.connections,
            profile.max_retries,
            profile.proxy.mode,
            profile.proxy.listen_addr,
            profile.proxy.listen_port,
        );
    }
    Ok(())
}

async fn rules(store: Arc<FileConfigStore>, command: RulesCommand) -> Result<()> {
    let access = AccessControl::with_store(store).context("Failed to load access rules")?;

    match command {
        RulesCommand::List => {
            let rules = access.list_rules().await;
            if rules.is_empty() {
                println!("No access rules");
            }
            for (rule, status) in rules {
                let state = if rule.is_master {
                    "master"
                } else if status.blocked {
                    "blocked"
                } else {
                    "allowed"
                };
                println!(
                    "{}  {}  {}  {}/{} min  {}",
                    rule.id,
                    rule.title,
                    rule.ip,
                    status.used_time.as_secs() / 60,
                    rule.daily_limit.as_secs() / 60,
                    state,
                );
            }
        }
        RulesCommand::Add {
            title,
            ip,
            limit_minutes,
            master,
            description,
        } => {
            let rule = access
                .add_rule(NewRule {
                    title,
                    ip,
                    is_master: master,
                    daily_limit: Duration::from_secs(limit_minutes * 60),
                    description,
                })
                .await?;
            println!("Added rule {} for {}", rule.id, rule.ip);
        }
        RulesCommand::Remove { id } => {
            access.delete_rule(&id).await?;
            println!("Removed rule {}", id);
        }
        RulesCommand::Reset { id } => {
            access.reset_rule(&id).await?;
            println!("Reset usage of rule {}", id);
        }
    }
    Ok(())
}

async fn block(store: Arc<FileConfigStore>, command: BlockCommand) -> Result<()> {
    let config = store.load().context("Failed to load configuration")?;
    let manager = build_manager(&store, &config)?;

    match command {
        BlockCommand::List => {
            let blocked = manager.blocked_ips().await;
            if blocked.is_empty() {
                println!("No blocked IPs");
            }
            for entry in blocked {
                println!("{}  since {}", entry.ip, entry.timestamp.to_rfc3339());
            }
        }
        BlockCommand::Add { ip } => {
            if manager.block_ip(ip).await? {
                println!("Blocked {}", ip);
            } else {
                println!("{} is already blocked", ip);
            }
        }
        BlockCommand::Remove { ip } => {
            if manager.unblock_ip(ip).await? {
                println!("Unblocked {}", ip);
            } else {
                println!("{} was not blocked", ip);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.log_level, cli.verbose);

    let store = open_store(cli.config)?;

    match cli.command {
        Commands::Run { servers } => {
            info!(config = %store.path().display(), "xengate starting...");
            run(store, servers).await
        }
        Commands::Servers {
            command: ServersCommand::List,
        } => list_servers(&store),
        Commands::Rules { command } => rules(store, command).await,
        Commands::Block { command } => block(store, command).await,
    }
}
