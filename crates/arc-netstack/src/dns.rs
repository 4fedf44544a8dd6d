//! DNS resolver that queries over the tunnel.
//!
//! The tunnel's address space is invisible to the host resolver, so names
//! are looked up with plain DNS over UDP sent to the internal DNS server
//! through the userspace network stack.

use crate::error::{Error, Result};
use crate::netstack::{NetStack, UdpConnection};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Port DNS servers listen on.
pub const DNS_PORT: u16 = 53;

/// How long to wait for a single DNS answer.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of times a query is sent before giving up.
const QUERY_ATTEMPTS: usize = 2;

/// Cap on how long an answer stays cached regardless of its TTL.
const MAX_CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct CacheEntry {
    addresses: Vec<Ipv4Addr>,
    expires_at: Instant,
}

/// A resolver bound to one tunnel and one DNS server inside it.
#[derive(Clone)]
pub struct Resolver {
    netstack: Arc<NetStack>,
    server: SocketAddr,
    cache: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl Resolver {
    pub fn new(netstack: Arc<NetStack>, server: Ipv4Addr) -> Self {
        Self {
            netstack,
            server: SocketAddr::V4(SocketAddrV4::new(server, DNS_PORT)),
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The DNS server queries are sent to.
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Resolve a hostname to IPv4 addresses.
    pub async fn resolve(&self, hostname: &str) -> Result<Vec<Ipv4Addr>> {
        if let Ok(ip) = hostname.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }

        {
            let cache = self.cache.lock();
            if let Some(entry) = cache.get(hostname) {
                if entry.expires_at > Instant::now() {
                    log::debug!("DNS cache hit for {}", hostname);
                    return Ok(entry.addresses.clone());
                }
            }
        }

        log::debug!("Resolving {} via {}", hostname, self.server);

        let mut last_error = Error::DnsTimeout;
        for attempt in 1..=QUERY_ATTEMPTS {
            match self.query(hostname).await {
                Ok((addresses, ttl)) => {
                    self.cache.lock().insert(
                        hostname.to_string(),
                        CacheEntry {
                            addresses: addresses.clone(),
                            expires_at: Instant::now() + ttl.min(MAX_CACHE_TTL),
                        },
                    );
                    return Ok(addresses);
                }
                Err(Error::DnsTimeout) => {
                    log::debug!("DNS query for {} timed out (attempt {})", hostname, attempt);
                    last_error = Error::DnsTimeout;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    /// Resolve a hostname to a single socket address.
    pub async fn resolve_addr(&self, hostname: &str, port: u16) -> Result<SocketAddr> {
        let addrs = self.resolve(hostname).await?;
        let ip = addrs
            .into_iter()
            .next()
            .ok_or_else(|| Error::DnsNoRecords(hostname.to_string()))?;
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    }

    async fn query(&self, hostname: &str) -> Result<(Vec<Ipv4Addr>, Duration)> {
        let id: u16 = rand::random();
        let query = build_dns_query(id, hostname)?;

        let mut conn = UdpConnection::connect(self.netstack.clone(), self.server)?;
        conn.write_all(&query).await?;

        let mut buf = vec![0u8; 1500];
        let exchange = async {
            loop {
                let n = conn.read(&mut buf).await?;
                if n >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                    return parse_dns_response(&buf[..n], hostname);
                }
                log::debug!("Ignoring DNS answer with mismatched id");
            }
        };

        tokio::time::timeout(QUERY_TIMEOUT, exchange)
            .await
            .map_err(|_| Error::DnsTimeout)?
    }
}

/// Build a DNS query in wire format.
fn build_dns_query(id: u16, hostname: &str) -> Result<Vec<u8>> {
    let mut query = Vec::with_capacity(hostname.len() + 18);

    query.extend_from_slice(&id.to_be_bytes());
    // Standard query, recursion desired
    query.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT = 1, ANCOUNT = NSCOUNT = ARCOUNT = 0
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    for label in hostname.trim_end_matches('.').split('.') {
        if label.len() > 63 {
            return Err(Error::DnsLabelTooLong(label.to_string()));
        }
        query.push(label.len() as u8);
        query.extend_from_slice(label.as_bytes());
    }
    query.push(0);

    // QTYPE = A, QCLASS = IN
    query.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]);

    Ok(query)
}

const TYPE_A: u16 = 1;

/// Read position inside a DNS message.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.data.get(self.pos..self.pos.checked_add(n)?)?;
        self.pos += n;
        Some(bytes)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Type, TTL and data of the resource record at the cursor, after its name.
    fn record(&mut self) -> Option<(u16, u32, &'a [u8])> {
        let rtype = self.u16()?;
        let _class = self.u16()?;
        let ttl = self.u32()?;
        let len = self.u16()?;
        Some((rtype, ttl, self.take(len.into())?))
    }

    /// Step over a name, stopping at the first compression pointer.
    fn skip_name(&mut self) -> Result<()> {
        loop {
            let len = *self.data.get(self.pos).ok_or(Error::DnsNameTooLong)?;
            if len & 0xC0 == 0xC0 {
                self.pos += 2;
                return Ok(());
            }
            self.pos += 1 + len as usize;
            if len == 0 {
                return Ok(());
            }
        }
    }
}

/// Parse a DNS response, returning the A records and the smallest TTL.
///
/// A truncated answer section ends parsing; whatever was read before it
/// still counts.
fn parse_dns_response(data: &[u8], hostname: &str) -> Result<(Vec<Ipv4Addr>, Duration)> {
    let mut msg = Cursor { data, pos: 0 };
    let header = msg.take(12).ok_or(Error::DnsResponseTooShort)?;

    let rcode = header[3] & 0x0F;
    if rcode != 0 {
        return Err(Error::DnsError(rcode.into()));
    }
    let questions = u16::from_be_bytes([header[4], header[5]]);
    let answers = u16::from_be_bytes([header[6], header[7]]);

    for _ in 0..questions {
        msg.skip_name()?;
        msg.take(4).ok_or(Error::DnsResponseTooShort)?;
    }

    let mut addresses = Vec::new();
    let mut min_ttl = u32::MAX;
    for _ in 0..answers {
        if msg.pos >= data.len() {
            break;
        }
        msg.skip_name()?;

        let Some((rtype, ttl, rdata)) = msg.record() else {
            break;
        };

        if let (TYPE_A, &[a, b, c, d]) = (rtype, rdata) {
            let ip = Ipv4Addr::new(a, b, c, d);
            log::debug!("Resolved {} -> {}", hostname, ip);
            addresses.push(ip);
            min_ttl = min_ttl.min(ttl);
        }
    }

    if addresses.is_empty() {
        return Err(Error::DnsNoRecords(hostname.to_string()));
    }
    Ok((addresses, Duration::from_secs(min_ttl.into())))
}
