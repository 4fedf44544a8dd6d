//! Custom connector for hyper that dials through the Arc tunnel.
//!
//! Connections come from a [`Dialer`], normally an
//! [`arc_netstack::Tunnel`]. `https` targets are wrapped with rustls using
//! the webpki root store.

use crate::error::{Error, Result};
use arc_netstack::{Network, Tunnel};
use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tower_service::Service;

/// How long an HTTP connection may take to establish.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> Stream for T {}

pub type BoxStream = Box<dyn Stream>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Something that can open connections by address.
pub trait Dialer: Send + Sync {
    /// Open a connection to `address` (`host:port`), giving up at `deadline`.
    fn dial<'a>(
        &'a self,
        network: Network,
        address: &'a str,
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, arc_netstack::Result<BoxStream>>;

    /// Release whatever the dialer holds. Later dials must fail.
    fn close(&self) {}
}

impl Dialer for Tunnel {
    fn dial<'a>(
        &'a self,
        network: Network,
        address: &'a str,
        deadline: Option<Instant>,
    ) -> BoxFuture<'a, arc_netstack::Result<BoxStream>> {
        Box::pin(async move {
            let conn = Tunnel::dial(self, network, address, deadline).await?;
            Ok(Box::new(conn) as BoxStream)
        })
    }

    fn close(&self) {
        Tunnel::close(self);
    }
}

/// A hyper connector whose TCP connections all go through a [`Dialer`].
#[derive(Clone)]
pub struct TunnelConnector {
    dialer: Arc<dyn Dialer>,
    tls_connector: TlsConnector,
}

impl TunnelConnector {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        // Install ring as the crypto provider (may already be installed)
        let _ = rustls::crypto::ring::default_provider().install_default();

        let root_store =
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            dialer,
            tls_connector: TlsConnector::from(Arc::new(tls_config)),
        }
    }
}

impl Service<Uri> for TunnelConnector {
    type Response = TunnelStream;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = self.dialer.clone();
        let tls_connector = self.tls_connector.clone();

        Box::pin(async move {
            let host = uri
                .host()
                .ok_or_else(|| Error::NoHost(uri.to_string()))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();

            let is_https = uri.scheme_str() == Some("https");
            let port = uri.port_u16().unwrap_or(if is_https { 443 } else { 80 });

            let address = if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            };

            log::debug!("Connecting to {} (TLS: {})", address, is_https);

            let deadline = Instant::now() + CONNECT_TIMEOUT;
            let stream = dialer.dial(Network::Tcp, &address, Some(deadline)).await?;

            if is_https {
                let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                    .map_err(|e| Error::InvalidServerName(e.to_string()))?;

                log::debug!("Starting TLS handshake with {}", host);
                let tls_stream = tls_connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| Error::TlsHandshake(e.to_string()))?;

                log::debug!("TLS handshake completed with {}", host);
                Ok(TunnelStream::Tls(Box::new(tls_stream)))
            } else {
                Ok(TunnelStream::Plain(stream))
            }
        })
    }
}

/// A stream that can be either plain or TLS-wrapped.
pub enum TunnelStream {
    Plain(BoxStream),
    Tls(Box<TlsStream<BoxStream>>),
}

impl Connection for TunnelStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
            TunnelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
            TunnelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
            TunnelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            TunnelStream::Plain(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
            TunnelStream::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

// hyper's Read, bridged through a temporary tokio ReadBuf
impl Read for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let mut temp_buf = [0u8; 8192];
        let unfilled_len = unsafe { buf.as_mut().len() };
        let read_len = temp_buf.len().min(unfilled_len);

        let mut read_buf = ReadBuf::new(&mut temp_buf[..read_len]);

        match <Self as AsyncRead>::poll_read(self, cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let filled = read_buf.filled();
                if !filled.is_empty() {
                    unsafe {
                        let unfilled = buf.as_mut();
                        for (i, byte) in filled.iter().enumerate() {
                            unfilled[i].write(*byte);
                        }
                        buf.advance(filled.len());
                    }
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Write for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        <Self as AsyncWrite>::poll_write(self, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        <Self as AsyncWrite>::poll_flush(self, cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        <Self as AsyncWrite>::poll_shutdown(self, cx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Dialer that serves every connection from an in-memory peer.
    pub(crate) struct FakeDialer {
        pub(crate) dials: AtomicUsize,
        pub(crate) addresses: std::sync::Mutex<Vec<String>>,
        serve: fn(DuplexStream) -> BoxFuture<'static, ()>,
    }

    impl FakeDialer {
        pub(crate) fn new(serve: fn(DuplexStream) -> BoxFuture<'static, ()>) -> Arc<Self> {
            Arc::new(Self {
                dials: AtomicUsize::new(0),
                addresses: std::sync::Mutex::new(Vec::new()),
                serve,
            })
        }

        pub(crate) fn dial_count(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    impl Dialer for FakeDialer {
        fn dial<'a>(
            &'a self,
            _network: Network,
            address: &'a str,
            _deadline: Option<Instant>,
        ) -> BoxFuture<'a, arc_netstack::Result<BoxStream>> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            self.addresses.lock().unwrap().push(address.to_string());
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn((self.serve)(server));
            Box::pin(async move { Ok(Box::new(client) as BoxStream) })
        }
    }

    /// Read one HTTP request (headers plus Content-Length body).
    pub(crate) async fn read_request(stream: &mut DuplexStream) -> Vec<u8> {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return data;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&data[..end]).to_lowercase();
                let len = headers
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + len {
                    return data;
                }
            }
        }
    }

    pub(crate) fn respond(
        mut stream: DuplexStream,
        response: &'static [u8],
    ) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            read_request(&mut stream).await;
            stream.write_all(response).await.unwrap();
            stream.flush().await.unwrap();
        })
    }

    fn echo_ok(stream: DuplexStream) -> BoxFuture<'static, ()> {
        respond(stream, b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
    }

    #[tokio::test]
    async fn test_connector_dials_host_and_default_port() {
        let dialer = FakeDialer::new(echo_ok);
        let mut connector = TunnelConnector::new(dialer.clone());

        let stream = connector
            .call("http://100.127.69.42/v1/sim".parse().unwrap())
            .await
            .unwrap();
        assert!(matches!(stream, TunnelStream::Plain(_)));
        assert_eq!(
            *dialer.addresses.lock().unwrap(),
            vec!["100.127.69.42:80".to_string()]
        );
    }

    #[tokio::test]
    async fn test_connector_requires_host() {
        let dialer = FakeDialer::new(echo_ok);
        let mut connector = TunnelConnector::new(dialer.clone());

        let result = connector.call(Uri::from_static("/relative")).await;
        assert!(matches!(result, Err(Error::NoHost(_))));
        assert_eq!(dialer.dial_count(), 0);
    }
}
