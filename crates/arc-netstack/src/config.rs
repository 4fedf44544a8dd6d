//! SORACOM Arc client configuration.
//!
//! The native format is the `arc.json` document written by the bootstrap
//! tooling. A standard WireGuard `.conf` file is accepted as well and mapped
//! onto the same [`Config`].

use base64::{engine::general_purpose::STANDARD, Engine};
use gotatun::x25519::{PublicKey, StaticSecret};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

/// Default interface MTU, matching the reference WireGuard implementation.
pub const DEFAULT_MTU: u16 = 1420;

/// Default log level (verbose).
pub const DEFAULT_LOG_LEVEL: u8 = 2;

/// A 32-byte Curve25519 key, base64 encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key([u8; 32]);

impl Key {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a base64-encoded 32-byte key.
    pub fn from_base64(b64: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(b64.trim())
            .map_err(|_| Error::InvalidKey(b64.to_string()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::InvalidKey(format!("Key must be 32 bytes, got {} bytes", v.len()))
        })?;
        Ok(Self(bytes))
    }

    /// Decode a hex-encoded 32-byte key, as used by the device IPC text.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.len() != 64 || !hex.is_ascii() {
            return Err(Error::InvalidKey(hex.to_string()));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidKey(hex.to_string()))?;
        }
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the public key, treating this key as a private key.
    pub fn public_key(&self) -> Key {
        let secret = StaticSecret::from(self.0);
        Key(PublicKey::from(&secret).to_bytes())
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Key::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

/// Peer session assigned by the Arc service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArcSession {
    /// Public key of the Arc server peer.
    pub arc_server_peer_public_key: Key,
    /// Arc server endpoint (`host:port`).
    pub arc_server_endpoint: String,
    /// Routes the server advertises for this session.
    #[serde(rename = "arcAllowedIPs", default)]
    pub arc_allowed_ips: Vec<String>,
    /// Our address inside the tunnel.
    pub arc_client_peer_ip_address: Ipv4Addr,
}

/// Arc client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub private_key: Key,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sim_id: Option<String>,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Device log level: 0 silent, 1 errors, 2 verbose.
    #[serde(default = "default_log_level")]
    pub log_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
    #[serde(rename = "arcSessionStatus", default, skip_serializing_if = "Option::is_none")]
    pub arc_session: Option<ArcSession>,
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

fn default_log_level() -> u8 {
    DEFAULT_LOG_LEVEL
}

impl Config {
    /// Load a configuration file. Files ending in `.conf` are read as
    /// WireGuard INI, anything else as `arc.json`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigParse(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        if path.extension().is_some_and(|ext| ext == "conf") {
            Self::from_wg_conf(&content)
        } else {
            Self::from_json(&content)
        }
    }

    /// Parse an `arc.json` document.
    pub fn from_json(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))
    }

    /// Parse a WireGuard configuration file.
    pub fn from_wg_conf(content: &str) -> Result<Self> {
        let raw: RawWgConfig =
            serde_ini::from_str(content).map_err(|e| Error::ConfigParse(e.to_string()))?;

        let private_key = Key::from_base64(&raw.interface.private_key)?;

        // Strip CIDR notation, take the first address if comma-separated
        let first = raw
            .interface
            .address
            .split(',')
            .next()
            .unwrap_or(&raw.interface.address)
            .trim();
        let ip_str = first.split('/').next().unwrap_or(first);
        let address: Ipv4Addr = ip_str
            .parse()
            .map_err(|_| Error::InvalidAddress(raw.interface.address.clone()))?;

        // Validate the endpoint now rather than at tunnel construction
        split_host_port(&raw.peer.endpoint)?;

        let allowed_ips = raw
            .peer
            .allowed_ips
            .as_deref()
            .map(|ips| {
                ips.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            private_key,
            public_key: Some(private_key.public_key()),
            sim_id: None,
            mtu: raw.interface.mtu.unwrap_or(DEFAULT_MTU),
            log_level: DEFAULT_LOG_LEVEL,
            persistent_keepalive: raw.peer.persistent_keepalive,
            arc_session: Some(ArcSession {
                arc_server_peer_public_key: Key::from_base64(&raw.peer.public_key)?,
                arc_server_endpoint: raw.peer.endpoint,
                arc_allowed_ips: allowed_ips,
                arc_client_peer_ip_address: address,
            }),
        })
    }

    /// The peer session, required before any tunnel can be built.
    pub fn session(&self) -> Result<&ArcSession> {
        self.arc_session.as_ref().ok_or(Error::MissingPeerSession)
    }

    /// Our public key, derived from the private key when not stored.
    pub fn public_key(&self) -> Key {
        self.public_key
            .unwrap_or_else(|| self.private_key.public_key())
    }
}

/// Renders the configuration as a WireGuard INI document.
impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        if let Some(session) = &self.arc_session {
            writeln!(f, "Address = {}/32", session.arc_client_peer_ip_address)?;
        }
        writeln!(f, "PrivateKey = {}", self.private_key.to_base64())?;
        writeln!(f, "MTU = {}", self.mtu)?;

        if let Some(session) = &self.arc_session {
            let allowed_ips = if session.arc_allowed_ips.is_empty() {
                "0.0.0.0/0".to_string()
            } else {
                session.arc_allowed_ips.join(", ")
            };

            writeln!(f)?;
            writeln!(f, "[Peer]")?;
            writeln!(
                f,
                "PublicKey = {}",
                session.arc_server_peer_public_key.to_base64()
            )?;
            writeln!(f, "AllowedIPs = {}", allowed_ips)?;
            writeln!(f, "Endpoint = {}", session.arc_server_endpoint)?;
            if let Some(keepalive) = self.persistent_keepalive {
                writeln!(f, "PersistentKeepalive = {}", keepalive)?;
            }
        }
        Ok(())
    }
}

/// Raw WireGuard configuration as parsed from the INI file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawWgConfig {
    interface: InterfaceSection,
    peer: PeerSection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InterfaceSection {
    private_key: String,
    address: String,
    #[serde(rename = "MTU")]
    mtu: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PeerSection {
    public_key: String,
    endpoint: String,
    #[serde(default, rename = "AllowedIPs")]
    allowed_ips: Option<String>,
    #[serde(default)]
    persistent_keepalive: Option<u16>,
}

/// Split a `host:port` string.
pub fn split_host_port(endpoint: &str) -> Result<(String, u16)> {
    // Handle IPv6 addresses in brackets: [::1]:51820
    if endpoint.starts_with('[') {
        if let Some(bracket_end) = endpoint.find(']') {
            let host = endpoint[1..bracket_end].to_string();
            let port_str = endpoint[bracket_end + 1..].trim_start_matches(':');
            let port: u16 = port_str
                .parse()
                .map_err(|_| Error::InvalidEndpoint(endpoint.to_string()))?;
            return Ok((host, port));
        }
    }

    match endpoint.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port: u16 = port_str
                .parse()
                .map_err(|_| Error::InvalidEndpoint(endpoint.to_string()))?;
            Ok((host.to_string(), port))
        }
        _ => Err(Error::InvalidEndpoint(format!(
            "Invalid endpoint format (expected host:port): {}",
            endpoint
        ))),
    }
}
