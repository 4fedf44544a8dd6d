//! WireGuard device built on gotatun.
//!
//! A [`WireGuardDevice`] wraps a [`TunDevice`] and follows the usual device
//! lifecycle: it is configured with an IPC text block ([`PeerConfig`]),
//! brought up (UDP socket bound, background loops started, handshake
//! initiated) and finally closed.

use bytes::BytesMut;
use gotatun::noise::rate_limiter::RateLimiter;
use gotatun::noise::{Tunn, TunnResult};
use gotatun::packet::Packet;
use gotatun::x25519::{PublicKey, StaticSecret};
use parking_lot::Mutex;
use smoltcp::wire::Ipv4Packet;
use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use zerocopy::IntoBytes;

use crate::config::Key;
use crate::error::{Error, Result};
use crate::netstack::TunDevice;

/// UDP socket buffer size for the encrypted transport.
const SOCKET_BUFFER_SIZE: usize = 1024 * 1024;

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedIp {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl AllowedIp {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, prefix),
            None => (s, "32"),
        };
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| Error::InvalidAddress(s.to_string()))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
        Ok(Self { addr, prefix })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        if self.prefix == 0 {
            return true;
        }
        let mask = u32::MAX << (32 - self.prefix as u32);
        (u32::from(ip) & mask) == (u32::from(self.addr) & mask)
    }
}

impl std::fmt::Display for AllowedIp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Peer configuration applied to a device.
///
/// The text form is a block of `key=value` lines: `private_key`,
/// `public_key` and `preshared_key` in hex, `endpoint` as `ip:port`,
/// repeatable `allowed_ip` in CIDR notation, and
/// `persistent_keepalive_interval` in seconds.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub private_key: Key,
    pub peer_public_key: Key,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<AllowedIp>,
    pub preshared_key: Option<Key>,
    pub keepalive_seconds: Option<u16>,
}

impl PeerConfig {
    /// Parse the IPC text block.
    pub fn parse_ipc(text: &str) -> Result<Self> {
        let mut private_key = None;
        let mut peer_public_key = None;
        let mut endpoint = None;
        let mut allowed_ips = Vec::new();
        let mut preshared_key = None;
        let mut keepalive_seconds = None;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::InvalidIpc(format!("malformed line: {}", line)))?;

            match key {
                "private_key" => private_key = Some(Key::from_hex(value)?),
                "public_key" => peer_public_key = Some(Key::from_hex(value)?),
                "preshared_key" => preshared_key = Some(Key::from_hex(value)?),
                "endpoint" => {
                    endpoint = Some(
                        value
                            .parse::<SocketAddr>()
                            .map_err(|_| Error::InvalidEndpoint(value.to_string()))?,
                    )
                }
                "allowed_ip" => allowed_ips.push(AllowedIp::parse(value)?),
                "persistent_keepalive_interval" => {
                    let seconds: u16 = value
                        .parse()
                        .map_err(|_| Error::InvalidIpc(format!("invalid keepalive: {}", value)))?;
                    keepalive_seconds = (seconds > 0).then_some(seconds);
                }
                other => return Err(Error::InvalidIpc(format!("unknown key: {}", other))),
            }
        }

        Ok(Self {
            private_key: private_key
                .ok_or_else(|| Error::InvalidIpc("missing private_key".into()))?,
            peer_public_key: peer_public_key
                .ok_or_else(|| Error::InvalidIpc("missing public_key".into()))?,
            endpoint: endpoint.ok_or_else(|| Error::InvalidIpc("missing endpoint".into()))?,
            allowed_ips,
            preshared_key,
            keepalive_seconds,
        })
    }

    /// Render the IPC text block.
    pub fn to_ipc(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "private_key={}", self.private_key.to_hex());
        let _ = writeln!(out, "public_key={}", self.peer_public_key.to_hex());
        if let Some(psk) = &self.preshared_key {
            let _ = writeln!(out, "preshared_key={}", psk.to_hex());
        }
        let _ = writeln!(out, "endpoint={}", self.endpoint);
        for ip in &self.allowed_ips {
            let _ = writeln!(out, "allowed_ip={}", ip);
        }
        if let Some(keepalive) = self.keepalive_seconds {
            let _ = writeln!(out, "persistent_keepalive_interval={}", keepalive);
        }
        out
    }

    fn allows(&self, src: Ipv4Addr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(src))
    }
}

/// An active WireGuard session: encrypts outgoing packets and decrypts
/// incoming ones over a UDP socket.
struct WireGuardTunnel {
    tunn: Mutex<Tunn>,
    udp_socket: Arc<UdpSocket>,
    peer: PeerConfig,
    /// Decrypted packets, towards the network stack.
    incoming_tx: mpsc::Sender<BytesMut>,
}

impl WireGuardTunnel {
    async fn new(peer: PeerConfig, incoming_tx: mpsc::Sender<BytesMut>) -> Result<Arc<Self>> {
        let private_key = StaticSecret::from(*peer.private_key.as_bytes());
        let peer_public_key = PublicKey::from(*peer.peer_public_key.as_bytes());

        let tunn = Tunn::new(
            private_key,
            peer_public_key,
            peer.preshared_key.map(|k| *k.as_bytes()),
            peer.keepalive_seconds,
            rand::random::<u32>() >> 8,
            Arc::new(RateLimiter::new(&peer_public_key, 0)),
        );

        let udp_socket = UdpSocket::bind("0.0.0.0:0").await?;

        let sock_ref = socket2::SockRef::from(&udp_socket);
        if let Err(e) = sock_ref.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
            log::warn!("Failed to set UDP recv buffer size: {}", e);
        }
        if let Err(e) = sock_ref.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
            log::warn!("Failed to set UDP send buffer size: {}", e);
        }

        log::info!(
            "WireGuard UDP socket bound to {}, peer {}",
            udp_socket.local_addr()?,
            peer.endpoint
        );

        Ok(Arc::new(Self {
            tunn: Mutex::new(tunn),
            udp_socket: Arc::new(udp_socket),
            peer,
            incoming_tx,
        }))
    }

    fn time_since_last_handshake(&self) -> Option<Duration> {
        self.tunn.lock().stats().0
    }

    async fn initiate_handshake(&self) -> Result<()> {
        let handshake_init = {
            let mut tunn = self.tunn.lock();
            tunn.format_handshake_initiation(false)
        };

        if let Some(packet) = handshake_init {
            let data = packet.as_bytes();
            self.udp_socket.send_to(data, self.peer.endpoint).await?;
            log::debug!("Sent handshake initiation ({} bytes)", data.len());
        }

        Ok(())
    }

    /// Encrypt an IP packet and send it to the peer.
    async fn send_ip_packet(&self, packet: BytesMut) -> Result<()> {
        let encrypted = {
            let mut tunn = self.tunn.lock();
            tunn.handle_outgoing_packet(Packet::from_bytes(packet))
        };

        if let Some(wg_packet) = encrypted {
            let pkt: Packet = wg_packet.into();
            let data = pkt.as_bytes();
            self.udp_socket.send_to(data, self.peer.endpoint).await?;
            log::trace!("Sent encrypted packet ({} bytes)", data.len());
        }

        Ok(())
    }

    fn spawn_send(&self, data: BytesMut, what: &'static str) {
        let socket = self.udp_socket.clone();
        let endpoint = self.peer.endpoint;
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&data, endpoint).await {
                log::error!("Failed to send {}: {}", what, e);
            }
        });
    }

    /// Decrypt a received datagram, returning an IP packet if it carried one
    /// from an allowed source.
    fn process_incoming_udp(&self, data: &[u8]) -> Option<BytesMut> {
        let packet = Packet::from_bytes(BytesMut::from(data));
        let wg_packet = match packet.try_into_wg() {
            Ok(wg) => wg,
            Err(_) => {
                log::warn!("Received non-WireGuard packet");
                return None;
            }
        };

        let mut tunn = self.tunn.lock();
        match tunn.handle_incoming_packet(wg_packet) {
            TunnResult::Done => None,
            TunnResult::Err(e) => {
                log::warn!("WG error: {:?}", e);
                None
            }
            TunnResult::WriteToNetwork(response) => {
                // Handshake response, cookie reply or keepalive
                let pkt: Packet = response.into();
                self.spawn_send(BytesMut::from(pkt.as_bytes()), "response");

                while let Some(queued) = tunn.next_queued_packet() {
                    let pkt: Packet = queued.into();
                    self.spawn_send(BytesMut::from(pkt.as_bytes()), "queued packet");
                }

                None
            }
            TunnResult::WriteToTunnel(decrypted) => {
                if decrypted.is_empty() {
                    log::trace!("WG: Received keepalive");
                    return None;
                }
                let bytes = BytesMut::from(decrypted.as_bytes());

                let src = Ipv4Packet::new_checked(&bytes[..])
                    .ok()
                    .map(|ip| Ipv4Addr::from(ip.src_addr().0));
                match src {
                    Some(src) if self.peer.allows(src) => Some(bytes),
                    Some(src) => {
                        log::debug!("Dropping packet from {} outside allowed IPs", src);
                        None
                    }
                    None => {
                        log::debug!("Dropping non-IPv4 packet");
                        None
                    }
                }
            }
        }
    }

    async fn run_receive_loop(self: Arc<Self>) -> Result<()> {
        let mut buf = vec![0u8; 65535];

        loop {
            let (len, from) = self.udp_socket.recv_from(&mut buf).await?;
            if from != self.peer.endpoint {
                log::warn!("Received packet from unknown peer: {}", from);
                continue;
            }

            if let Some(ip_packet) = self.process_incoming_udp(&buf[..len]) {
                if self.incoming_tx.send(ip_packet).await.is_err() {
                    log::debug!("Network stack gone, stopping receive loop");
                    return Ok(());
                }
            }
        }
    }

    async fn run_send_loop(self: Arc<Self>, mut outgoing: mpsc::Receiver<BytesMut>) -> Result<()> {
        while let Some(packet) = outgoing.recv().await {
            if let Err(e) = self.send_ip_packet(packet).await {
                log::error!("Failed to send packet: {}", e);
            }
        }
        Ok(())
    }

    /// Keepalives and handshake retries.
    async fn run_timer_loop(self: Arc<Self>) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(250));

        loop {
            interval.tick().await;

            let packet = {
                let mut tunn = self.tunn.lock();
                match tunn.update_timers() {
                    Ok(Some(packet)) => {
                        let pkt: Packet = packet.into();
                        Some(pkt.as_bytes().to_vec())
                    }
                    Ok(None) => None,
                    Err(e) => {
                        log::trace!("Timer error (may be normal): {:?}", e);
                        None
                    }
                }
            };

            if let Some(packet) = packet {
                if let Err(e) = self.udp_socket.send_to(&packet, self.peer.endpoint).await {
                    log::error!("Failed to send timer packet: {}", e);
                }
            }
        }
    }
}

/// A WireGuard device attached to a packet-level [`TunDevice`].
pub struct WireGuardDevice {
    tun: Mutex<Option<TunDevice>>,
    peer: Mutex<Option<PeerConfig>>,
    active: Mutex<Option<Arc<WireGuardTunnel>>>,
    tasks: Mutex<JoinSet<()>>,
}

impl WireGuardDevice {
    pub fn new(tun: TunDevice) -> Self {
        Self {
            tun: Mutex::new(Some(tun)),
            peer: Mutex::new(None),
            active: Mutex::new(None),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Apply an IPC configuration block.
    pub fn ipc_set(&self, text: &str) -> Result<()> {
        let peer = PeerConfig::parse_ipc(text)?;
        if self.active.lock().is_some() {
            return Err(Error::InvalidIpc(
                "device is up; close it before reconfiguring".into(),
            ));
        }
        log::debug!(
            "Device configured: endpoint {}, {} allowed IP(s)",
            peer.endpoint,
            peer.allowed_ips.len()
        );
        *self.peer.lock() = Some(peer);
        Ok(())
    }

    /// Bring the device up: bind the transport socket, start the packet
    /// loops and send the first handshake initiation.
    pub async fn up(&self) -> Result<()> {
        let peer = self.peer.lock().clone().ok_or(Error::NotConfigured)?;
        let tun = self.tun.lock().take().ok_or(Error::TunnelClosed)?;
        let (incoming_tx, outgoing_rx) = tun.into_parts();

        let wg = WireGuardTunnel::new(peer, incoming_tx).await?;

        {
            let mut tasks = self.tasks.lock();

            let w = wg.clone();
            tasks.spawn(async move {
                if let Err(e) = w.run_receive_loop().await {
                    log::error!("WireGuard receive loop error: {}", e);
                }
            });

            let w = wg.clone();
            tasks.spawn(async move {
                if let Err(e) = w.run_send_loop(outgoing_rx).await {
                    log::error!("WireGuard send loop error: {}", e);
                }
            });

            let w = wg.clone();
            tasks.spawn(async move {
                if let Err(e) = w.run_timer_loop().await {
                    log::error!("WireGuard timer loop error: {}", e);
                }
            });
        }

        *self.active.lock() = Some(wg.clone());

        wg.initiate_handshake().await
    }

    pub fn is_up(&self) -> bool {
        self.active.lock().is_some()
    }

    pub fn time_since_last_handshake(&self) -> Option<Duration> {
        self.active
            .lock()
            .as_ref()
            .and_then(|wg| wg.time_since_last_handshake())
    }

    /// Wait for the handshake to complete.
    pub async fn wait_for_handshake(&self, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();

        loop {
            if !self.is_up() {
                return Err(Error::TunnelClosed);
            }
            if self.time_since_last_handshake().is_some() {
                log::info!("WireGuard handshake completed");
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(Error::HandshakeTimeout(timeout));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Stop all packet loops and release the session. Safe to call twice.
    pub fn close(&self) {
        self.tasks.lock().abort_all();
        self.active.lock().take();
        self.tun.lock().take();
    }
}

impl Drop for WireGuardDevice {
    fn drop(&mut self) {
        self.tasks.get_mut().abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netstack::NetStack;

    fn peer() -> PeerConfig {
        PeerConfig {
            private_key: Key::new([1u8; 32]),
            peer_public_key: Key::new([2u8; 32]),
            endpoint: "127.0.0.1:51820".parse().unwrap(),
            allowed_ips: vec![AllowedIp::parse("0.0.0.0/0").unwrap()],
            preshared_key: None,
            keepalive_seconds: Some(25),
        }
    }

    #[test]
    fn test_ipc_text_round_trip() {
        let text = peer().to_ipc();
        assert!(text.starts_with(&format!("private_key={}\n", "01".repeat(32))));
        assert!(text.contains(&format!("public_key={}\n", "02".repeat(32))));
        assert!(text.contains("endpoint=127.0.0.1:51820\n"));
        assert!(text.contains("allowed_ip=0.0.0.0/0\n"));
        assert!(text.contains("persistent_keepalive_interval=25\n"));

        let parsed = PeerConfig::parse_ipc(&text).unwrap();
        assert_eq!(parsed.private_key, Key::new([1u8; 32]));
        assert_eq!(parsed.endpoint, peer().endpoint);
        assert_eq!(parsed.allowed_ips, peer().allowed_ips);
        assert_eq!(parsed.keepalive_seconds, Some(25));
    }

    #[test]
    fn test_ipc_rejects_bad_input() {
        let base = peer().to_ipc();

        let unknown = format!("{}listen_port=1\n", base);
        assert!(matches!(
            PeerConfig::parse_ipc(&unknown),
            Err(Error::InvalidIpc(_))
        ));

        let hostname = base.replace("127.0.0.1:51820", "arc.example.com:51820");
        assert!(matches!(
            PeerConfig::parse_ipc(&hostname),
            Err(Error::InvalidEndpoint(_))
        ));

        let no_endpoint: String = base
            .lines()
            .filter(|l| !l.starts_with("endpoint="))
            .map(|l| format!("{}\n", l))
            .collect();
        assert!(PeerConfig::parse_ipc(&no_endpoint).is_err());
    }

    #[test]
    fn test_allowed_ip_contains() {
        let all = AllowedIp::parse("0.0.0.0/0").unwrap();
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));

        let arc = AllowedIp::parse("100.127.0.0/16").unwrap();
        assert!(arc.contains(Ipv4Addr::new(100, 127, 69, 42)));
        assert!(!arc.contains(Ipv4Addr::new(100, 128, 0, 1)));

        let host = AllowedIp::parse("10.0.0.1").unwrap();
        assert_eq!(host.prefix, 32);
        assert!(host.contains(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(!host.contains(Ipv4Addr::new(10, 0, 0, 2)));

        assert!(AllowedIp::parse("10.0.0.0/33").is_err());
    }

    #[tokio::test]
    async fn test_up_requires_configuration() {
        let (tun, _netstack) =
            NetStack::create(Ipv4Addr::new(10, 0, 0, 2), vec![], 1420).unwrap();
        let device = WireGuardDevice::new(tun);
        assert!(matches!(device.up().await, Err(Error::NotConfigured)));
    }

    #[tokio::test]
    async fn test_up_then_close_twice() {
        let (tun, _netstack) =
            NetStack::create(Ipv4Addr::new(10, 0, 0, 2), vec![], 1420).unwrap();
        let device = WireGuardDevice::new(tun);
        device.ipc_set(&peer().to_ipc()).unwrap();
        device.up().await.unwrap();
        assert!(device.is_up());
        assert!(device.time_since_last_handshake().is_none());

        device.close();
        device.close();
        assert!(!device.is_up());
        assert!(matches!(device.up().await, Err(Error::TunnelClosed)));
    }
}
