//! Userspace WireGuard tunnel to SORACOM Arc with a TCP/IP network stack.
//!
//! This crate provides:
//! - The Arc client configuration (`arc.json` or a WireGuard `.conf`)
//! - A WireGuard device using gotatun, configured with IPC text
//! - A userspace TCP/UDP stack using smoltcp
//! - A DNS resolver that queries through the tunnel
//! - [`Tunnel`], which ties them together and dials connections
//!
//! # Example
//!
//! ```no_run
//! use arc_netstack::{Config, Network, Tunnel};
//! use tokio::io::AsyncWriteExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("arc.json")?;
//!     let tunnel = Tunnel::new(&config).await?;
//!
//!     let mut conn = tunnel.dial(Network::Tcp, "100.127.69.42:80", None).await?;
//!     conn.write_all(b"GET / HTTP/1.1\r\nHost: 100.127.69.42\r\n\r\n").await?;
//!
//!     tunnel.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dns;
pub mod error;
pub mod netstack;
pub mod tunnel;
pub mod wireguard;

pub use config::{split_host_port, ArcSession, Config, Key, DEFAULT_LOG_LEVEL, DEFAULT_MTU};
pub use dns::Resolver;
pub use error::{Error, Result, Stage};
pub use netstack::{NetStack, TcpConnection, TunDevice, UdpConnection};
pub use tunnel::{Connection, Network, Tunnel, DNS_SERVERS};
pub use wireguard::{AllowedIp, PeerConfig, WireGuardDevice};
