//! soraproxy: a local HTTP port for the SORACOM Unified Endpoint.

use anyhow::{Context, Result};
use arc_netstack::Config;
use clap::{Parser, Subcommand};
use soratun::commands::{self, up, ProxyOptions};
use soratun::logging;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "soraproxy")]
#[command(version, about = "Forward local HTTP requests to the Unified Endpoint over SORACOM Arc")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Arc client configuration (arc.json or a WireGuard .conf)
    #[arg(long, global = true, default_value = "arc.json")]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the proxy and run until SIGINT or SIGTERM
    Up {
        /// Port to listen on
        #[arg(short, long, default_value_t = up::DEFAULT_PORT)]
        port: u16,

        /// Address to listen on
        #[arg(short, long, default_value_t = up::DEFAULT_ADDRESS)]
        address: IpAddr,

        /// Extra header as "Name: Value", repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    logging::init(config.log_level);

    match cli.command {
        Commands::Up {
            port,
            address,
            headers,
        } => {
            let options = ProxyOptions {
                address,
                port,
                headers,
            };
            up::run(&config, &options, commands::verbose_from_env()).await
        }
    }
}
