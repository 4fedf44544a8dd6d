//! Userspace TCP/IP network stack using smoltcp.
//!
//! [`NetStack::create`] allocates the stack together with a [`TunDevice`],
//! the packet-level side that the WireGuard device reads plaintext IP packets
//! from and writes decrypted packets into.

use crate::error::{Error, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::Socket;
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer, State as TcpState};
use smoltcp::socket::udp::{
    PacketBuffer as UdpPacketBuffer, PacketMetadata as UdpPacketMetadata, Socket as UdpSocket,
};
use smoltcp::time::Instant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpProtocol, Ipv4Address, Ipv4Packet,
    TcpPacket, UdpPacket,
};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Smallest MTU an IPv4 interface must support.
pub const MIN_MTU: u16 = 576;

/// Size of TCP socket buffers.
const TCP_BUFFER_SIZE: usize = 65535;

/// Size of UDP socket payload buffers.
const UDP_BUFFER_SIZE: usize = 65535;

/// Number of datagrams a UDP socket can queue in each direction.
const UDP_PACKET_SLOTS: usize = 64;

/// Capacity of the channels between the stack and the WireGuard device.
const PACKET_CHANNEL_CAPACITY: usize = 256;

/// How long TCP connect waits when the caller gives no deadline.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pick a port from the dynamic range that no socket in `sockets` holds.
fn ephemeral_port(sockets: &SocketSet<'_>) -> u16 {
    let in_use: HashSet<u16> = sockets
        .iter()
        .filter_map(|(_, socket)| match socket {
            Socket::Tcp(tcp) => tcp.local_endpoint().map(|ep| ep.port),
            Socket::Udp(udp) => Some(udp.endpoint().port),
            #[allow(unreachable_patterns)]
            _ => None,
        })
        .collect();

    loop {
        let port = 49152 + (rand::random::<u16>() % 16384);
        if !in_use.contains(&port) {
            return port;
        }
    }
}

/// TCP states after which a socket no longer sends anything.
fn is_finished(state: TcpState) -> bool {
    matches!(state, TcpState::Closed | TcpState::TimeWait)
}

fn ipv4(addr: Ipv4Addr) -> IpAddress {
    let o = addr.octets();
    IpAddress::v4(o[0], o[1], o[2], o[3])
}

fn endpoint(addr: SocketAddrV4) -> IpEndpoint {
    IpEndpoint::new(ipv4(*addr.ip()), addr.port())
}

/// Packet-level side of the virtual interface.
///
/// `incoming` feeds decrypted IP packets into the stack, `outgoing` yields
/// IP packets the stack wants sent through the tunnel.
pub struct TunDevice {
    incoming: mpsc::Sender<BytesMut>,
    outgoing: mpsc::Receiver<BytesMut>,
    mtu: u16,
}

impl TunDevice {
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub(crate) fn into_parts(self) -> (mpsc::Sender<BytesMut>, mpsc::Receiver<BytesMut>) {
        (self.incoming, self.outgoing)
    }
}

/// smoltcp device backed by two in-memory packet queues.
struct QueueDevice {
    inbound: VecDeque<BytesMut>,
    outbound: VecDeque<BytesMut>,
    mtu: usize,
}

impl QueueDevice {
    fn new(mtu: usize) -> Self {
        Self {
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            mtu,
        }
    }

    fn push_rx(&mut self, packet: BytesMut) {
        self.inbound.push_back(packet);
    }

    fn drain_tx(&mut self) -> Vec<BytesMut> {
        self.outbound.drain(..).collect()
    }
}

struct QueueRxToken {
    buffer: BytesMut,
}

impl RxToken for QueueRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buffer)
    }
}

struct QueueTxToken<'a> {
    outbound: &'a mut VecDeque<BytesMut>,
}

impl<'a> TxToken for QueueTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = BytesMut::zeroed(len);
        let result = f(&mut buffer);
        self.outbound.push_back(buffer);
        result
    }
}

impl Device for QueueDevice {
    type RxToken<'a> = QueueRxToken;
    type TxToken<'a> = QueueTxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let buffer = self.inbound.pop_front()?;
        Some((
            QueueRxToken { buffer },
            QueueTxToken {
                outbound: &mut self.outbound,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(QueueTxToken {
            outbound: &mut self.outbound,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

struct NetStackInner {
    interface: Interface,
    device: QueueDevice,
    sockets: SocketSet<'static>,
    /// Closed TCP sockets still flushing their FIN, removed once finished.
    closing: Vec<SocketHandle>,
}

/// A userspace TCP/IP network stack.
pub struct NetStack {
    inner: Mutex<NetStackInner>,
    local_ip: Ipv4Addr,
    dns_servers: Vec<Ipv4Addr>,
    mtu: u16,
    to_tunnel: mpsc::Sender<BytesMut>,
    /// Decrypted packets, consumed by [`NetStack::run_rx_loop`].
    incoming_rx: Mutex<Option<mpsc::Receiver<BytesMut>>>,
}

impl NetStack {
    /// Allocate a network stack bound to `local_ip`.
    ///
    /// Returns the packet-level device for the WireGuard side and the
    /// dialable stack. The DNS servers are recorded for the tunnel resolver;
    /// smoltcp itself does not resolve names.
    pub fn create(
        local_ip: Ipv4Addr,
        dns_servers: Vec<Ipv4Addr>,
        mtu: u16,
    ) -> Result<(TunDevice, Arc<Self>)> {
        if mtu < MIN_MTU {
            return Err(Error::InvalidMtu(mtu));
        }
        if local_ip.is_unspecified() || local_ip.is_broadcast() {
            return Err(Error::InvalidAddress(local_ip.to_string()));
        }

        let mut device = QueueDevice::new(mtu as usize);

        let mut config = Config::new(HardwareAddress::Ip);
        config.random_seed = rand::random();

        let mut interface = Interface::new(config, &mut device, Instant::now());

        let mut pushed = Ok(());
        interface.update_ip_addrs(|addrs| {
            pushed = addrs.push(IpCidr::new(ipv4(local_ip), 32)).map(|_| ());
        });
        pushed.map_err(|_| Error::InvalidAddress(local_ip.to_string()))?;

        // Route everything through this interface
        interface
            .routes_mut()
            .add_default_ipv4_route(Ipv4Address::new(0, 0, 0, 0))
            .map_err(|e| Error::InvalidAddress(format!("default route: {:?}", e)))?;

        let (incoming_tx, incoming_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(PACKET_CHANNEL_CAPACITY);

        let netstack = Arc::new(Self {
            inner: Mutex::new(NetStackInner {
                interface,
                device,
                sockets: SocketSet::new(vec![]),
                closing: Vec::new(),
            }),
            local_ip,
            dns_servers,
            mtu,
            to_tunnel: outgoing_tx,
            incoming_rx: Mutex::new(Some(incoming_rx)),
        });

        let tun = TunDevice {
            incoming: incoming_tx,
            outgoing: outgoing_rx,
            mtu,
        };

        log::debug!("Network stack allocated for {} (MTU {})", local_ip, mtu);
        Ok((tun, netstack))
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.local_ip
    }

    pub fn dns_servers(&self) -> &[Ipv4Addr] {
        &self.dns_servers
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Create a new TCP socket and return its handle.
    pub fn create_tcp_socket(&self) -> SocketHandle {
        let mut inner = self.inner.lock();

        let rx_buffer = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let tx_buffer = SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
        let socket = TcpSocket::new(rx_buffer, tx_buffer);

        inner.sockets.add(socket)
    }

    /// Start connecting a TCP socket to the given address.
    pub fn connect(&self, handle: SocketHandle, addr: SocketAddr) -> Result<()> {
        let remote = match addr {
            SocketAddr::V4(v4) => endpoint(v4),
            SocketAddr::V6(_) => return Err(Error::Ipv6NotSupported),
        };
        let mut inner = self.inner.lock();
        let NetStackInner {
            ref mut interface,
            ref mut sockets,
            ..
        } = *inner;
        let local_addr = SocketAddrV4::new(self.local_ip, ephemeral_port(sockets));
        let cx = interface.context();
        let socket = sockets.get_mut::<TcpSocket>(handle);
        socket
            .connect(cx, remote, endpoint(local_addr))
            .map_err(|e| Error::TcpConnectGeneric(format!("TCP connect failed: {}", e)))?;

        log::debug!("TCP socket connecting to {} from {}", addr, local_addr);

        Ok(())
    }

    pub fn can_send(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).can_send()
    }

    pub fn can_recv(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).can_recv()
    }

    /// Whether the socket may still send (connection in progress or established).
    pub fn may_send(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).may_send()
    }

    pub fn may_recv(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).may_recv()
    }

    pub fn socket_state(&self, handle: SocketHandle) -> TcpState {
        let inner = self.inner.lock();
        inner.sockets.get::<TcpSocket>(handle).state()
    }

    /// Enqueue as much of `data` as fits in the send buffer.
    pub fn send(&self, handle: SocketHandle, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner
            .sockets
            .get_mut::<TcpSocket>(handle)
            .send_slice(data)
            .map_err(|e| Error::TcpSend(e.to_string()))
    }

    /// Dequeue received bytes into `buffer`.
    pub fn recv(&self, handle: SocketHandle, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner
            .sockets
            .get_mut::<TcpSocket>(handle)
            .recv_slice(buffer)
            .map_err(|e| Error::TcpRecv(e.to_string()))
    }

    /// Begin closing a TCP socket.
    pub fn close(&self, handle: SocketHandle) {
        let mut inner = self.inner.lock();
        inner.sockets.get_mut::<TcpSocket>(handle).close();
    }

    /// Create a UDP socket bound to an ephemeral port.
    pub fn create_udp_socket(&self) -> Result<(SocketHandle, u16)> {
        let rx_buffer = UdpPacketBuffer::new(
            vec![UdpPacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let tx_buffer = UdpPacketBuffer::new(
            vec![UdpPacketMetadata::EMPTY; UDP_PACKET_SLOTS],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let mut socket = UdpSocket::new(rx_buffer, tx_buffer);

        let mut inner = self.inner.lock();
        let port = ephemeral_port(&inner.sockets);
        socket
            .bind(port)
            .map_err(|e| Error::UdpBind(e.to_string()))?;

        Ok((inner.sockets.add(socket), port))
    }

    pub fn udp_can_send(&self, handle: SocketHandle) -> bool {
        let inner = self.inner.lock();
        inner.sockets.get::<UdpSocket>(handle).can_send()
    }

    /// Queue one datagram to `remote`.
    pub fn udp_send(&self, handle: SocketHandle, data: &[u8], remote: SocketAddrV4) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .sockets
            .get_mut::<UdpSocket>(handle)
            .send_slice(data, endpoint(remote))
            .map_err(|e| Error::UdpSend(e.to_string()))
    }

    /// Take the next datagram from `remote`, discarding datagrams from other
    /// peers. Returns `None` if nothing is queued.
    pub fn udp_recv(
        &self,
        handle: SocketHandle,
        buffer: &mut [u8],
        remote: SocketAddrV4,
    ) -> Result<Option<usize>> {
        let expected = endpoint(remote);
        let mut inner = self.inner.lock();
        let socket = inner.sockets.get_mut::<UdpSocket>(handle);

        while socket.can_recv() {
            let (n, meta) = socket
                .recv_slice(buffer)
                .map_err(|e| Error::UdpRecv(e.to_string()))?;
            if meta.endpoint == expected {
                return Ok(Some(n));
            }
            log::debug!("Dropping datagram from unexpected peer {}", meta.endpoint);
        }

        Ok(None)
    }

    /// Remove a socket from the socket set.
    pub fn remove_socket(&self, handle: SocketHandle) {
        let mut inner = self.inner.lock();
        inner.sockets.remove(handle);
    }

    /// Close a TCP socket the caller is done with. It is removed right away
    /// if nothing is left to send, otherwise by [`NetStack::poll`] once the
    /// close has finished.
    pub fn release_tcp(&self, handle: SocketHandle) {
        let mut inner = self.inner.lock();
        let socket = inner.sockets.get_mut::<TcpSocket>(handle);
        socket.close();

        if is_finished(socket.state()) {
            inner.sockets.remove(handle);
        } else {
            inner.closing.push(handle);
        }
    }

    /// Number of sockets currently allocated.
    pub fn socket_count(&self) -> usize {
        self.inner.lock().sockets.iter().count()
    }

    /// Run one smoltcp poll and hand any produced packets to the tunnel.
    /// Returns whether anything changed.
    pub fn poll(&self) -> bool {
        let mut inner = self.inner.lock();

        let NetStackInner {
            ref mut interface,
            ref mut device,
            ref mut sockets,
            ref mut closing,
        } = *inner;

        let processed = interface.poll(Instant::now(), device, sockets);

        closing.retain(|&handle| {
            if is_finished(sockets.get::<TcpSocket>(handle).state()) {
                sockets.remove(handle);
                false
            } else {
                true
            }
        });

        let tx_packets = device.drain_tx();
        drop(inner);

        for packet in tx_packets {
            log_packet("out", &packet);
            // TCP retransmits anything dropped here
            if let Err(e) = self.to_tunnel.try_send(packet) {
                log::warn!("Tunnel queue full, dropping packet: {}", e);
            }
        }

        processed
    }

    /// Queue a decrypted packet for the next poll.
    pub fn push_rx_packet(&self, packet: BytesMut) {
        log_packet("in", &packet);
        let mut inner = self.inner.lock();
        inner.device.push_rx(packet);
    }

    /// Poll every millisecond for timers and retransmits.
    pub async fn run_poll_loop(self: &Arc<Self>) -> Result<()> {
        let mut interval = tokio::time::interval(Duration::from_millis(1));

        loop {
            interval.tick().await;
            self.poll();
        }
    }

    /// Feed packets decrypted by the WireGuard device into the stack.
    pub async fn run_rx_loop(self: &Arc<Self>) -> Result<()> {
        let mut rx = self
            .incoming_rx
            .lock()
            .take()
            .ok_or_else(|| Error::UdpRecv("receive loop already running".into()))?;

        while let Some(packet) = rx.recv().await {
            self.push_rx_packet(packet);
            self.poll();
        }

        Ok(())
    }
}

fn tcp_flags(tcp: &TcpPacket<&[u8]>) -> String {
    [
        (tcp.syn(), 'S'),
        (tcp.ack(), 'A'),
        (tcp.fin(), 'F'),
        (tcp.rst(), 'R'),
        (tcp.psh(), 'P'),
    ]
    .iter()
    .filter_map(|&(set, flag)| set.then_some(flag))
    .collect()
}

/// One-line trace of a TCP or UDP packet crossing the tunnel.
fn log_packet(direction: &str, packet: &[u8]) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    let Ok(ip) = Ipv4Packet::new_checked(packet) else {
        return;
    };
    let (src, dst) = (ip.src_addr(), ip.dst_addr());

    match ip.next_header() {
        IpProtocol::Tcp => {
            if let Ok(tcp) = TcpPacket::new_checked(ip.payload()) {
                log::trace!(
                    "{} tcp {}:{} > {}:{} [{}] len {}",
                    direction,
                    src,
                    tcp.src_port(),
                    dst,
                    tcp.dst_port(),
                    tcp_flags(&tcp),
                    tcp.payload().len()
                );
            }
        }
        IpProtocol::Udp => {
            if let Ok(udp) = UdpPacket::new_checked(ip.payload()) {
                log::trace!(
                    "{} udp {}:{} > {}:{} len {}",
                    direction,
                    src,
                    udp.src_port(),
                    dst,
                    udp.dst_port(),
                    udp.payload().len()
                );
            }
        }
        _ => {}
    }
}

/// Wake the task again shortly; the stack has no readiness notifications.
fn schedule_wake(cx: &Context<'_>) {
    let waker = cx.waker().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1)).await;
        waker.wake();
    });
}

fn io_error(e: Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// A TCP stream over the tunnel.
pub struct TcpConnection {
    netstack: Arc<NetStack>,
    handle: SocketHandle,
    remote: SocketAddr,
}

impl TcpConnection {
    /// Connect, giving up after the default connect timeout.
    ///
    /// The socket is released on every failure path, including when the
    /// returned future is dropped before it completes.
    pub async fn connect(netstack: Arc<NetStack>, addr: SocketAddr) -> Result<Self> {
        let conn = Self {
            handle: netstack.create_tcp_socket(),
            netstack,
            remote: addr,
        };
        conn.netstack.connect(conn.handle, addr)?;

        let start = std::time::Instant::now();

        loop {
            conn.netstack.poll();

            let state = conn.netstack.socket_state(conn.handle);
            log::trace!("TCP state: {:?}", state);

            if state == TcpState::Established {
                log::info!("TCP connection established to {}", addr);
                return Ok(conn);
            }

            if is_finished(state) {
                return Err(Error::TcpConnect {
                    addr,
                    message: format!("Connection failed (state: {:?})", state),
                });
            }

            if start.elapsed() > CONNECT_TIMEOUT {
                return Err(Error::TcpTimeout);
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// Shutdown the connection.
    pub fn shutdown(&self) {
        self.netstack.close(self.handle);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.netstack.release_tcp(self.handle);
        // Give the FIN a chance to go out
        self.netstack.poll();
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();

        self.netstack.poll();

        if self.netstack.can_recv(self.handle) {
            match self.netstack.recv(self.handle, unfilled) {
                Ok(n) if n > 0 => {
                    log::trace!("TCP read {} bytes", n);
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(_) => {}
                Err(e) => return Poll::Ready(Err(io_error(e))),
            }
        }

        if !self.netstack.may_recv(self.handle) {
            // Connection closed
            return Poll::Ready(Ok(()));
        }

        schedule_wake(cx);
        Poll::Pending
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.netstack.poll();

        if self.netstack.can_send(self.handle) {
            return match self.netstack.send(self.handle, buf) {
                Ok(n) => {
                    self.netstack.poll();
                    Poll::Ready(Ok(n))
                }
                Err(e) => Poll::Ready(Err(io_error(e))),
            };
        }

        if !self.netstack.may_send(self.handle) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "Connection closed",
            )));
        }

        schedule_wake(cx);
        Poll::Pending
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.netstack.poll();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdown();
        self.netstack.poll();
        Poll::Ready(Ok(()))
    }
}

/// A UDP socket bound to one peer over the tunnel.
///
/// Each write sends one datagram; each read returns one datagram from the
/// connected peer. Reads and writes fail with `TimedOut` once the deadline,
/// if any, has passed.
pub struct UdpConnection {
    netstack: Arc<NetStack>,
    handle: SocketHandle,
    remote: SocketAddrV4,
    deadline: Option<tokio::time::Instant>,
}

impl UdpConnection {
    /// Bind an ephemeral port and associate it with `addr`.
    pub fn connect(netstack: Arc<NetStack>, addr: SocketAddr) -> Result<Self> {
        let remote = match addr {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => return Err(Error::Ipv6NotSupported),
        };
        let (handle, port) = netstack.create_udp_socket()?;
        log::debug!("UDP socket {} associated with {}", port, remote);

        Ok(Self {
            netstack,
            handle,
            remote,
            deadline: None,
        })
    }

    /// Apply an I/O deadline to all subsequent reads and writes.
    pub fn set_deadline(&mut self, deadline: tokio::time::Instant) {
        self.deadline = Some(deadline);
    }

    pub fn deadline(&self) -> Option<tokio::time::Instant> {
        self.deadline
    }

    pub fn remote_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.remote)
    }

    fn check_deadline(&self) -> io::Result<()> {
        match self.deadline {
            Some(deadline) if tokio::time::Instant::now() >= deadline => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "i/o deadline exceeded",
            )),
            _ => Ok(()),
        }
    }
}

impl Drop for UdpConnection {
    fn drop(&mut self) {
        self.netstack.remove_socket(self.handle);
    }
}

impl AsyncRead for UdpConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Err(e) = self.check_deadline() {
            return Poll::Ready(Err(e));
        }

        self.netstack.poll();

        let unfilled = buf.initialize_unfilled();
        match self.netstack.udp_recv(self.handle, unfilled, self.remote) {
            Ok(Some(n)) => {
                log::trace!("UDP read {} bytes", n);
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Ok(None) => {
                schedule_wake(cx);
                Poll::Pending
            }
            Err(e) => Poll::Ready(Err(io_error(e))),
        }
    }
}

impl AsyncWrite for UdpConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Err(e) = self.check_deadline() {
            return Poll::Ready(Err(e));
        }

        if !self.netstack.udp_can_send(self.handle) {
            self.netstack.poll();
            schedule_wake(cx);
            return Poll::Pending;
        }

        match self.netstack.udp_send(self.handle, buf, self.remote) {
            Ok(()) => {
                self.netstack.poll();
                Poll::Ready(Ok(buf.len()))
            }
            Err(e) => Poll::Ready(Err(io_error(e))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.netstack.poll();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
