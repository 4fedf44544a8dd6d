//! `soraproxy up`: serve the Unified Endpoint on a local port until a signal.

use crate::proxy::{shutdown_signal, ProxyServer};
use anyhow::{Context, Result};
use arc_client::FixedEndpointHttpClient;
use arc_netstack::Config;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

pub const DEFAULT_ADDRESS: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const DEFAULT_PORT: u16 = 8888;

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub address: IpAddr,
    pub port: u16,
    /// Extra `Name: Value` headers added to every forwarded request.
    pub headers: Vec<String>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            port: DEFAULT_PORT,
            headers: Vec::new(),
        }
    }
}

impl ProxyOptions {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

pub async fn run(config: &Config, options: &ProxyOptions, verbose: bool) -> Result<()> {
    super::ensure_session(config)?;

    let mut client = FixedEndpointHttpClient::new(config, options.headers.clone())
        .await
        .context("Failed to create a new client")?;
    client.set_verbose(verbose);
    let client = Arc::new(client);

    let server = ProxyServer::bind(options.bind_addr(), client.clone()).await?;
    let local = server.local_addr()?;
    log::info!(
        "proxy server for Unified Endpoint started at {}:{}",
        local.ip(),
        local.port()
    );

    let result = server
        .run_until(async {
            match shutdown_signal().await {
                Ok(name) => log::info!("received signal {}", name),
                Err(e) => {
                    log::error!("failed to listen for signals: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

    // Connection tasks may still hold the client; the tunnel then closes on drop.
    match Arc::try_unwrap(client) {
        Ok(client) => client.close(),
        Err(_) => log::debug!("proxy client still shared, closing on drop"),
    }

    result?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bind_address() {
        let options = ProxyOptions::default();
        assert_eq!(options.bind_addr(), "127.0.0.1:8888".parse().unwrap());
    }
}
