//! Error types for arc-netstack.

use std::fmt;
use std::net::SocketAddr;

/// Result type alias for arc-netstack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The step of tunnel construction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Allocating the userspace network stack and packet device.
    Allocate,
    /// Applying the peer configuration to the WireGuard device.
    Configure,
    /// Bringing the interface up.
    Up,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Allocate => "allocate network stack",
            Stage::Configure => "configure device",
            Stage::Up => "bring interface up",
        };
        f.write_str(name)
    }
}

/// Errors that can occur in arc-netstack.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to parse config: {0}")]
    ConfigParse(String),

    #[error("Invalid base64 key: {0}")]
    InvalidKey(String),

    #[error("Invalid endpoint format: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid MTU: {0}")]
    InvalidMtu(u16),

    #[error("Invalid device configuration: {0}")]
    InvalidIpc(String),

    #[error("Failed to determine connection information. Please bootstrap or create a new session from the user console.")]
    MissingPeerSession,

    #[error("Failed to {stage}: {message}")]
    TunnelConstruction { stage: Stage, message: String },

    #[error("Tunnel is closed")]
    TunnelClosed,

    #[error("Device is not configured")]
    NotConfigured,

    #[error("Failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Dial deadline exceeded")]
    DialTimeout,

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("No DNS records found for '{0}'")]
    DnsNoRecords(String),

    #[error("DNS error: RCODE={0}")]
    DnsError(u16),

    #[error("DNS response too short")]
    DnsResponseTooShort,

    #[error("DNS name extends beyond packet")]
    DnsNameTooLong,

    #[error("DNS label too long: {0}")]
    DnsLabelTooLong(String),

    #[error("DNS query timeout")]
    DnsTimeout,

    #[error("WireGuard handshake timeout after {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("TCP connection to {addr} failed: {message}")]
    TcpConnect { addr: SocketAddr, message: String },

    #[error("TCP connection failed: {0}")]
    TcpConnectGeneric(String),

    #[error("TCP connection timeout")]
    TcpTimeout,

    #[error("TCP send failed: {0}")]
    TcpSend(String),

    #[error("TCP receive failed: {0}")]
    TcpRecv(String),

    #[error("UDP bind failed: {0}")]
    UdpBind(String),

    #[error("UDP send failed: {0}")]
    UdpSend(String),

    #[error("UDP receive failed: {0}")]
    UdpRecv(String),

    #[error("IPv6 not supported")]
    Ipv6NotSupported,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn construction(stage: Stage, err: impl fmt::Display) -> Self {
        Error::TunnelConstruction {
            stage,
            message: err.to_string(),
        }
    }

    pub(crate) fn dial(address: &str, err: Error) -> Self {
        Error::Dial {
            address: address.to_string(),
            source: Box::new(err),
        }
    }

    /// The construction stage that failed, if this is a construction error.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::TunnelConstruction { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}
