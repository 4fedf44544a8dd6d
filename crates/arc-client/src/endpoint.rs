//! Client for the Unified Endpoint, reachable only inside the tunnel.

use crate::connector::Dialer;
use crate::error::Result;
use crate::http_client::Transport;
use arc_netstack::{Config, Tunnel};
use bytes::Bytes;
use http::{Method, Response};
use std::sync::Arc;

/// Address of the Unified Endpoint inside the tunnel.
pub const UNIFIED_ENDPOINT_HOSTNAME: &str = "100.127.69.42";

pub const UNIFIED_ENDPOINT_PORT: u16 = 80;

/// Join a base URL and a request path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// An HTTP client whose every request goes to the Unified Endpoint.
pub struct FixedEndpointHttpClient {
    transport: Transport,
    base: String,
}

impl FixedEndpointHttpClient {
    /// Build a tunnel from `config` and a client for the Unified Endpoint.
    pub async fn new(config: &Config, headers: Vec<String>) -> Result<Self> {
        config.session()?;
        let tunnel = Tunnel::new(config).await?;
        Ok(Self::with_dialer(Arc::new(tunnel), headers))
    }

    /// Build a client over an existing dialer, which [`Self::close`] closes.
    pub fn with_dialer(dialer: Arc<dyn Dialer>, headers: Vec<String>) -> Self {
        Self {
            transport: Transport::new(dialer, headers),
            base: format!(
                "http://{}:{}",
                UNIFIED_ENDPOINT_HOSTNAME, UNIFIED_ENDPOINT_PORT
            ),
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.transport.set_verbose(verbose);
    }

    pub fn verbose(&self) -> bool {
        self.transport.verbose()
    }

    pub fn headers(&self) -> &[String] {
        self.transport.headers()
    }

    /// The URL a request for `path` is sent to.
    pub fn request_url(&self, path: &str) -> String {
        join_url(&self.base, path)
    }

    /// Send a GET or POST for `path`.
    ///
    /// Statuses of 400 and above come back as
    /// [`crate::Error::UpstreamStatus`].
    pub async fn send(&self, method: Method, path: &str, body: Bytes) -> Result<Response<Bytes>> {
        self.transport
            .execute(method, self.request_url(path), body)
            .await
    }

    /// Close the HTTP client and then the tunnel under it.
    pub fn close(self) {
        self.transport.close();
    }
}
