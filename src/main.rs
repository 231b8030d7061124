//! burrow - expose a NAT-bound HTTP origin through a public relay.
//!
//! ```text
//! burrow relay --listen 0.0.0.0:10000 --base-domain tunnel.example.com
//! burrow agent --server https://tunnel.example.com --identity media --origin http://127.0.0.1:8000
//! ```

use anyhow::{Context, Result};
use mimalloc::MiMalloc;

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use burrow::{Agent, AgentConfig, RelayConfig};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "burrow")]
#[command(version = VERSION)]
#[command(about = "Multiplexed reverse HTTP tunnel")]
struct Cli {
    /// JSON config file (defaults to <config dir>/burrow/{relay,agent}.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public relay
    Relay {
        /// Public listen address
        #[arg(long)]
        listen: Option<String>,
        /// Strip this domain to find the routing identity
        #[arg(long)]
        base_domain: Option<String>,
        /// Also accept agents over raw TCP on this address
        #[arg(long)]
        tcp_control: Option<String>,
        /// Send every request to the newest agent instead of routing by Host
        #[arg(long)]
        no_identity_routing: bool,
    },
    /// Run the agent next to the origin
    Agent {
        /// Relay URL (http(s):// or ws(s)://)
        #[arg(long)]
        server: Option<String>,
        /// Requested routing identity
        #[arg(long)]
        identity: Option<String>,
        /// Local origin URL
        #[arg(long)]
        origin: Option<String>,
    },
    /// Print the effective configuration
    Config {
        /// Show the agent configuration instead of the relay's
        #[arg(long)]
        agent: bool,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format_timestamp_secs();

    if let Ok(path) = std::env::var("BURROW_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            return;
        }
        log::info!("Shutdown requested");
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Relay {
            listen,
            base_domain,
            tcp_control,
            no_identity_routing,
        } => {
            let mut config = RelayConfig::load(config_path)?;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if base_domain.is_some() {
                config.base_domain = base_domain;
            }
            if tcp_control.is_some() {
                config.tcp_control_addr = tcp_control;
            }
            if no_identity_routing {
                config.routing_by_identity = false;
            }
            config.validate()?;

            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            burrow::server::run_relay(config, shutdown).await?;
        }
        Commands::Agent {
            server,
            identity,
            origin,
        } => {
            let mut config = AgentConfig::load(config_path)?;
            if let Some(server) = server {
                config.server_url = server;
            }
            if identity.is_some() {
                config.identity = identity;
            }
            if let Some(origin) = origin {
                config.origin_url = origin;
            }
            config.validate()?;

            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            Agent::new(config)?.run(shutdown).await?;
        }
        Commands::Config { agent } => {
            let rendered = if agent {
                serde_json::to_string_pretty(&AgentConfig::load(config_path)?)?
            } else {
                serde_json::to_string_pretty(&RelayConfig::load(config_path)?)?
            };
            println!("{rendered}");
        }
    }

    Ok(())
}
