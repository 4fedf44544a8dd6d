//! Short-lived clients over a SORACOM Arc tunnel.
//!
//! Each client builds and owns one [`arc_netstack::Tunnel`]:
//!
//! - [`RawClient`]: a single TCP or UDP connection
//! - [`HttpClient`]: GET/POST to an arbitrary URL (`http` or `https`)
//! - [`FixedEndpointHttpClient`]: GET/POST to the Unified Endpoint
//!
//! Closing a client closes its tunnel. The [`Dialer`] trait is the seam the
//! clients dial through, so they can run over something other than a tunnel.
//!
//! # Example
//!
//! ```no_run
//! use arc_client::HttpClient;
//! use arc_netstack::Config;
//! use bytes::Bytes;
//! use http::Method;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("arc.json")?;
//!     let client = HttpClient::new(&config, "http://harvest.soracom.io/", vec![]).await?;
//!
//!     let response = client.send(Method::POST, Bytes::from_static(b"{\"temp\":21}")).await?;
//!     println!("{}", String::from_utf8_lossy(response.body()));
//!
//!     client.close();
//!     Ok(())
//! }
//! ```

mod connector;
mod endpoint;
pub mod error;
mod http_client;
mod raw;

pub use connector::{BoxFuture, BoxStream, Dialer, Stream, TunnelConnector, TunnelStream};
pub use endpoint::{
    join_url, FixedEndpointHttpClient, UNIFIED_ENDPOINT_HOSTNAME, UNIFIED_ENDPOINT_PORT,
};
pub use error::{Error, Result};
pub use http_client::HttpClient;
pub use raw::RawClient;

// Re-export arc-netstack types for convenience
pub use arc_netstack::{Config, Network, Tunnel};
