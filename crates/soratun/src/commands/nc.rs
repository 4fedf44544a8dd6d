//! `soratun nc`: send stdin over one TCP or UDP connection and print the reply.

use anyhow::{Context, Result};
use arc_client::RawClient;
use arc_netstack::{Config, Network};
use bytes::Bytes;
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct NcOptions {
    pub host: String,
    pub port: u16,
    pub udp: bool,
    /// Seconds before the dial (and, for UDP, every read and write) gives up.
    /// Zero waits forever.
    pub wait: u64,
}

impl NcOptions {
    pub fn network(&self) -> Network {
        if self.udp {
            Network::Udp
        } else {
            Network::Tcp
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        (self.wait > 0).then(|| Instant::now() + Duration::from_secs(self.wait))
    }
}

pub async fn run<W>(
    config: &Config,
    options: &NcOptions,
    body: Bytes,
    verbose: bool,
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    super::ensure_session(config)?;

    let address = options.address();
    let mut client = RawClient::connect(config, options.network(), &address, options.deadline())
        .await
        .context("Failed to create a new client")?;
    client.set_verbose(verbose);

    let exchanged = exchange(&mut client, body, usize::from(config.mtu), out)
        .await
        .with_context(|| format!("Failed to get response from {}", address));
    let closed = client.close().await;

    exchanged?;
    if let Err(e) = closed {
        log::debug!("Closing connection to {} failed: {}", address, e);
    }
    Ok(())
}

/// Write `body`, then read at most `mtu` bytes of reply into `out`.
pub async fn exchange<W>(client: &mut RawClient, body: Bytes, mtu: usize, out: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    client.write(body.as_ref()).await?;

    let mut buf = vec![0u8; mtu];
    let n = client.read(&mut buf).await?;
    out.write_all(&buf[..n]).await?;
    out.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn options(host: &str) -> NcOptions {
        NcOptions {
            host: host.into(),
            port: 5683,
            udp: false,
            wait: 0,
        }
    }

    #[test]
    fn test_address_formatting() {
        assert_eq!(options("100.127.10.16").address(), "100.127.10.16:5683");
        assert_eq!(options("harvest.soracom.io").address(), "harvest.soracom.io:5683");
        assert_eq!(options("fd00::1").address(), "[fd00::1]:5683");
    }

    #[test]
    fn test_network_and_deadline() {
        let mut opts = options("100.127.10.16");
        assert_eq!(opts.network(), Network::Tcp);
        assert!(opts.deadline().is_none());

        opts.udp = true;
        opts.wait = 3;
        assert_eq!(opts.network(), Network::Udp);
        assert!(opts.deadline().unwrap() > Instant::now());
    }

    #[tokio::test]
    async fn test_exchange_prints_one_mtu_of_reply() {
        let (client, mut server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(async move {
            let mut request = [0u8; 4];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request, b"ping");
            server.write_all(b"pong and then some").await.unwrap();
        });

        let mut raw = RawClient::with_connection(Box::new(client));
        let mut out = Vec::new();
        exchange(&mut raw, Bytes::from_static(b"ping"), 4, &mut out)
            .await
            .unwrap();
        peer.await.unwrap();

        assert_eq!(out, b"pong");
    }
}
