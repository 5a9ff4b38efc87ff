#![forbid(unsafe_code)]

//! Tessel node binary.
//!
//! - `tessel-node device`: run a commissionable device on UDP
//! - `tessel-node pair`: commission a device over PASE and report the session

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use tessel_common::config::{validate_passcode, DEFAULT_PASSCODE};
use tessel_common::NodeConfig;
use tessel_node::{Controller, Device};

#[derive(Parser, Debug)]
#[command(name = "tessel-node")]
#[command(about = "Tessel node - secure sessions and reliable exchanges over UDP")]
struct Args {
    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a device that accepts PASE and CASE
    Device {
        /// JSON config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// UDP listen address
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Setup passcode
        #[arg(long)]
        passcode: Option<u32>,

        /// 12-bit discriminator
        #[arg(long)]
        discriminator: Option<u16>,
    },

    /// Establish a PASE session with a device
    Pair {
        /// Device address
        #[arg(long)]
        peer: SocketAddr,

        /// Setup passcode
        #[arg(long, env = "TESSEL_PASSCODE", default_value_t = DEFAULT_PASSCODE)]
        passcode: u32,

        /// Local bind address
        #[arg(long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tessel_common::init_tracing_with_default(&args.log_level);
    info!("Starting tessel-node v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Device {
            config,
            listen,
            passcode,
            discriminator,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::load(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => NodeConfig::default(),
            };
            node_config
                .apply_env(|name| std::env::var(name).ok())
                .context("reading environment")?;
            if let Some(listen) = listen {
                node_config.listen = listen;
            }
            if let Some(passcode) = passcode {
                node_config.passcode = passcode;
            }
            if let Some(discriminator) = discriminator {
                node_config.discriminator = discriminator;
            }
            run_device(node_config).await
        }
        Command::Pair {
            peer,
            passcode,
            bind,
        } => pair(peer, passcode, bind).await,
    }
}

async fn run_device(config: NodeConfig) -> Result<()> {
    let device = Device::builder(config)
        .build()
        .context("invalid device configuration")?;

    tokio::select! {
        result = device.run() => {
            result.context("device stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl-C");
        }
    }
    device.shutdown();
    Ok(())
}

async fn pair(peer: SocketAddr, passcode: u32, bind: SocketAddr) -> Result<()> {
    validate_passcode(passcode)?;
    let controller = Controller::new();
    let channel = controller
        .connect_udp(bind, peer)
        .await
        .with_context(|| format!("binding {bind}"))?;

    let result = controller.pair_pase(channel, passcode).await;
    controller.close();
    match result {
        Ok(session) => {
            println!(
                "paired with {peer}: session {} (peer session {})",
                session.id(),
                session.peer_session_id()
            );
            Ok(())
        }
        Err(e) => {
            warn!("pairing with {} failed: {}", peer, e);
            Err(e).context("PASE failed")
        }
    }
}
