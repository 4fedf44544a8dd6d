//! soratun: nc and curl over SORACOM Arc.

use anyhow::{Context, Result};
use arc_netstack::Config;
use clap::{Parser, Subcommand};
use soratun::commands::{self, BodySource, CurlOptions, NcOptions};
use soratun::logging;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "soratun")]
#[command(version, about = "Send traffic through a SORACOM Arc tunnel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Arc client configuration (arc.json or a WireGuard .conf)
    #[arg(long, global = true, default_value = "arc.json")]
    config: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Send stdin to host:port and print the reply
    Nc {
        host: String,
        port: u16,

        /// Use UDP instead of TCP
        #[arg(short, long)]
        udp: bool,

        /// Timeout in seconds, 0 to wait forever
        #[arg(short, long, default_value_t = 0)]
        wait: u64,
    },

    /// Send an HTTP request and print the response body
    Curl {
        url: String,

        /// GET or POST
        #[arg(short = 'X', long, default_value = "GET")]
        request: String,

        /// Request body, or @file to read it from a file
        #[arg(short, long)]
        data: Option<String>,

        /// Extra header as "Name: Value", repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Print the configuration as a WireGuard config file
    WgConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    logging::init(config.log_level);

    let verbose = commands::verbose_from_env();
    let mut stdout = tokio::io::stdout();

    match cli.command {
        Commands::Nc {
            host,
            port,
            udp,
            wait,
        } => {
            let options = NcOptions {
                host,
                port,
                udp,
                wait,
            };
            let body = BodySource::select(commands::stdin_is_piped(), None)
                .read()
                .await?;
            commands::nc::run(&config, &options, body, verbose, &mut stdout).await
        }
        Commands::Curl {
            url,
            request,
            data,
            headers,
        } => {
            let options = CurlOptions {
                url,
                method: commands::curl::parse_method(&request)?,
                data,
                headers,
            };
            let body = if options.sends_body() {
                BodySource::select(commands::stdin_is_piped(), options.data.as_deref())
                    .read()
                    .await?
            } else {
                Default::default()
            };
            commands::curl::run(&config, &options, body, verbose, &mut stdout).await
        }
        Commands::WgConfig => {
            commands::wg_config::run(&config, &mut std::io::stdout().lock())?;
            Ok(())
        }
    }
}
