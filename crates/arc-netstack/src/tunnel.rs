//! The Arc tunnel: one WireGuard device plus the network stack behind it.
//!
//! [`Tunnel::new`] allocates the stack, applies the peer session to the
//! device and brings it up. The tunnel is then dialable until
//! [`Tunnel::close`], after which every operation fails with
//! [`Error::TunnelClosed`].

use crate::config::{split_host_port, Config};
use crate::dns::Resolver;
use crate::error::{Error, Result, Stage};
use crate::netstack::{NetStack, TcpConnection, UdpConnection};
use crate::wireguard::{AllowedIp, PeerConfig, WireGuardDevice};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// DNS servers reachable inside the tunnel. Lookups go to the first one.
pub const DNS_SERVERS: [Ipv4Addr; 2] = [
    Ipv4Addr::new(100, 127, 0, 53),
    Ipv4Addr::new(100, 127, 1, 53),
];

/// Transport protocol for [`Tunnel::dial`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" => Ok(Network::Tcp),
            "udp" | "udp4" => Ok(Network::Udp),
            _ => Err(Error::UnsupportedNetwork(s.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// A connection dialed through a [`Tunnel`].
pub enum Connection {
    Tcp(TcpConnection),
    Udp(UdpConnection),
}

impl Connection {
    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            Connection::Tcp(c) => c.remote_addr(),
            Connection::Udp(c) => c.remote_addr(),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(c) => Pin::new(c).poll_read(cx, buf),
            Connection::Udp(c) => Pin::new(c).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(c) => Pin::new(c).poll_write(cx, buf),
            Connection::Udp(c) => Pin::new(c).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(c) => Pin::new(c).poll_flush(cx),
            Connection::Udp(c) => Pin::new(c).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(c) => Pin::new(c).poll_shutdown(cx),
            Connection::Udp(c) => Pin::new(c).poll_shutdown(cx),
        }
    }
}

struct TunnelInner {
    device: Arc<WireGuardDevice>,
    netstack: Arc<NetStack>,
    resolver: Resolver,
    tasks: JoinSet<()>,
}

/// A WireGuard tunnel to the Arc server with a dialable network stack.
pub struct Tunnel {
    inner: Mutex<Option<TunnelInner>>,
}

impl Tunnel {
    /// Build and bring up a tunnel for the peer session in `config`.
    ///
    /// A missing session fails with [`Error::MissingPeerSession`] before any
    /// I/O. Every later failure is a [`Error::TunnelConstruction`] naming the
    /// stage that failed.
    pub async fn new(config: &Config) -> Result<Self> {
        let session = config.session()?;

        let (tun, netstack) = NetStack::create(
            session.arc_client_peer_ip_address,
            DNS_SERVERS.to_vec(),
            config.mtu,
        )
        .map_err(|e| Error::construction(Stage::Allocate, e))?;

        let device = Arc::new(WireGuardDevice::new(tun));

        let endpoint = resolve_endpoint(&session.arc_server_endpoint)
            .await
            .map_err(|e| Error::construction(Stage::Configure, e))?;
        let peer = PeerConfig {
            private_key: config.private_key,
            peer_public_key: session.arc_server_peer_public_key,
            endpoint,
            allowed_ips: vec![AllowedIp {
                addr: Ipv4Addr::UNSPECIFIED,
                prefix: 0,
            }],
            preshared_key: None,
            keepalive_seconds: config.persistent_keepalive,
        };
        device
            .ipc_set(&peer.to_ipc())
            .map_err(|e| Error::construction(Stage::Configure, e))?;

        device
            .up()
            .await
            .map_err(|e| Error::construction(Stage::Up, e))?;

        let mut tasks = JoinSet::new();

        let ns = netstack.clone();
        tasks.spawn(async move {
            if let Err(e) = ns.run_poll_loop().await {
                log::error!("Network stack poll loop error: {}", e);
            }
        });

        let ns = netstack.clone();
        tasks.spawn(async move {
            if let Err(e) = ns.run_rx_loop().await {
                log::error!("Network stack RX loop error: {}", e);
            }
        });

        log::info!(
            "Tunnel up: {} via {}",
            session.arc_client_peer_ip_address,
            endpoint
        );

        let resolver = Resolver::new(netstack.clone(), DNS_SERVERS[0]);

        Ok(Self {
            inner: Mutex::new(Some(TunnelInner {
                device,
                netstack,
                resolver,
                tasks,
            })),
        })
    }

    fn parts(&self) -> Result<(Arc<NetStack>, Resolver)> {
        let inner = self.inner.lock();
        let inner = inner.as_ref().ok_or(Error::TunnelClosed)?;
        Ok((inner.netstack.clone(), inner.resolver.clone()))
    }

    fn device(&self) -> Result<Arc<WireGuardDevice>> {
        let inner = self.inner.lock();
        let inner = inner.as_ref().ok_or(Error::TunnelClosed)?;
        Ok(inner.device.clone())
    }

    /// Dial `address` (`host:port`) through the tunnel.
    ///
    /// Hostnames are resolved with the tunnel resolver. A TCP dial that has
    /// not completed by `deadline` fails with [`Error::DialTimeout`]. A UDP
    /// connection carries `deadline` onto its reads and writes.
    pub async fn dial(
        &self,
        network: Network,
        address: &str,
        deadline: Option<Instant>,
    ) -> Result<Connection> {
        let (netstack, resolver) = self.parts()?;

        let dial = connect(netstack, resolver, network, address, deadline);

        let result = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, dial)
                .await
                .unwrap_or(Err(Error::DialTimeout)),
            None => dial.await,
        };

        result.map_err(|e| Error::dial(address, e))
    }

    /// A resolver that looks names up through this tunnel.
    pub fn resolver(&self) -> Result<Resolver> {
        self.parts().map(|(_, resolver)| resolver)
    }

    pub fn netstack(&self) -> Result<Arc<NetStack>> {
        self.parts().map(|(netstack, _)| netstack)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().is_none()
    }

    /// Time since the last completed handshake, `None` before the first one
    /// or once closed.
    pub fn time_since_last_handshake(&self) -> Option<Duration> {
        self.device().ok()?.time_since_last_handshake()
    }

    pub async fn wait_for_handshake(&self, timeout: Duration) -> Result<()> {
        self.device()?.wait_for_handshake(timeout).await
    }

    /// Release the device and stack. Later calls are no-ops.
    pub fn close(&self) {
        let Some(mut inner) = self.inner.lock().take() else {
            return;
        };
        inner.tasks.abort_all();
        inner.device.close();
        log::debug!("Tunnel closed");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn connect(
    netstack: Arc<NetStack>,
    resolver: Resolver,
    network: Network,
    address: &str,
    deadline: Option<Instant>,
) -> Result<Connection> {
    let (host, port) = split_host_port(address)?;
    let addr = resolver.resolve_addr(&host, port).await?;
    log::debug!("Dialing {} {} ({})", network, address, addr);

    match network {
        Network::Tcp => Ok(Connection::Tcp(TcpConnection::connect(netstack, addr).await?)),
        Network::Udp => {
            let mut conn = UdpConnection::connect(netstack, addr)?;
            if let Some(deadline) = deadline {
                conn.set_deadline(deadline);
            }
            Ok(Connection::Udp(conn))
        }
    }
}

/// Resolve the server endpoint with the host resolver.
async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let (host, port) = split_host_port(endpoint)?;

    if let Ok(ip) = host.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(_) => Ok(SocketAddr::new(ip, port)),
            IpAddr::V6(_) => Err(Error::Ipv6NotSupported),
        };
    }

    log::debug!("Resolving endpoint {} with the system resolver", host);
    let found = tokio::net::lookup_host((host.as_str(), port))
        .await?
        .find(SocketAddr::is_ipv4);
    found.ok_or(Error::DnsNoRecords(host))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArcSession, Key};

    fn config(endpoint: &str, mtu: u16) -> Config {
        Config {
            private_key: Key::new([1u8; 32]),
            public_key: None,
            sim_id: None,
            mtu,
            log_level: 0,
            persistent_keepalive: None,
            arc_session: Some(ArcSession {
                arc_server_peer_public_key: Key::new([2u8; 32]).public_key(),
                arc_server_endpoint: endpoint.to_string(),
                arc_allowed_ips: vec![],
                arc_client_peer_ip_address: Ipv4Addr::new(10, 128, 0, 2),
            }),
        }
    }

    #[test]
    fn test_network_from_str() {
        assert_eq!("tcp".parse::<Network>().unwrap(), Network::Tcp);
        assert_eq!("UDP".parse::<Network>().unwrap(), Network::Udp);
        assert!(matches!(
            "sctp".parse::<Network>(),
            Err(Error::UnsupportedNetwork(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_session_is_precondition() {
        let mut cfg = config("127.0.0.1:9", 1420);
        cfg.arc_session = None;
        assert!(matches!(
            Tunnel::new(&cfg).await,
            Err(Error::MissingPeerSession)
        ));
    }

    #[tokio::test]
    async fn test_construction_names_failed_stage() {
        let err = Tunnel::new(&config("127.0.0.1:9", 100)).await.err().unwrap();
        assert_eq!(err.stage(), Some(Stage::Allocate));

        let err = Tunnel::new(&config("127.0.0.1", 1420)).await.err().unwrap();
        assert_eq!(err.stage(), Some(Stage::Configure));
        assert!(err.to_string().starts_with("Failed to configure device"));
    }

    #[tokio::test]
    async fn test_resolve_endpoint() {
        assert_eq!(
            resolve_endpoint("198.51.100.7:11010").await.unwrap(),
            "198.51.100.7:11010".parse().unwrap()
        );
        assert_eq!(
            resolve_endpoint("localhost:11010").await.unwrap(),
            "127.0.0.1:11010".parse().unwrap()
        );
        assert!(matches!(
            resolve_endpoint("[fd00::1]:11010").await,
            Err(Error::Ipv6NotSupported)
        ));
    }

    #[tokio::test]
    async fn test_hostname_endpoint_is_configured() {
        let tunnel = Tunnel::new(&config("localhost:9", 1420)).await.unwrap();
        assert!(!tunnel.is_closed());
        tunnel.close();
    }

    #[tokio::test]
    async fn test_close_twice_then_use_fails() {
        let tunnel = Tunnel::new(&config("127.0.0.1:9", 1420)).await.unwrap();
        assert!(!tunnel.is_closed());
        assert!(tunnel.resolver().is_ok());

        tunnel.close();
        tunnel.close();

        assert!(tunnel.is_closed());
        assert!(matches!(tunnel.resolver(), Err(Error::TunnelClosed)));
        assert!(tunnel.time_since_last_handshake().is_none());
        assert!(matches!(
            tunnel.dial(Network::Tcp, "100.127.69.42:80", None).await,
            Err(Error::TunnelClosed)
        ));
    }

    #[tokio::test]
    async fn test_tcp_dial_honors_deadline() {
        let tunnel = Tunnel::new(&config("127.0.0.1:9", 1420)).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(200);

        let err = tunnel
            .dial(Network::Tcp, "100.127.69.42:80", Some(deadline))
            .await
            .err()
            .unwrap();
        match err {
            Error::Dial { address, source } => {
                assert_eq!(address, "100.127.69.42:80");
                assert!(matches!(*source, Error::DialTimeout));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_udp_dial_carries_deadline() {
        let tunnel = Tunnel::new(&config("127.0.0.1:9", 1420)).await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);

        let conn = tunnel
            .dial(Network::Udp, "100.127.10.16:5683", Some(deadline))
            .await
            .unwrap();
        match conn {
            Connection::Udp(udp) => assert_eq!(udp.deadline(), Some(deadline)),
            Connection::Tcp(_) => panic!("expected a UDP connection"),
        }
    }
}
