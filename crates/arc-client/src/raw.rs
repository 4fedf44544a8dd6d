//! A single TCP or UDP connection over the tunnel.

use crate::connector::{BoxStream, Dialer};
use crate::error::Result;
use arc_netstack::{Config, Network, Tunnel};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

/// One connection dialed through a tunnel it owns.
pub struct RawClient {
    conn: BoxStream,
    dialer: Option<Arc<dyn Dialer>>,
    verbose: bool,
}

impl RawClient {
    /// Build a tunnel from `config` and dial `address` through it.
    ///
    /// For UDP, `deadline` also bounds every read and write on the
    /// connection.
    pub async fn connect(
        config: &Config,
        network: Network,
        address: &str,
        deadline: Option<Instant>,
    ) -> Result<Self> {
        config.session()?;
        let tunnel = Tunnel::new(config).await?;
        Self::dial(Arc::new(tunnel), network, address, deadline).await
    }

    /// Dial through `dialer`, which [`RawClient::close`] closes.
    pub async fn dial(
        dialer: Arc<dyn Dialer>,
        network: Network,
        address: &str,
        deadline: Option<Instant>,
    ) -> Result<Self> {
        let conn = match dialer.dial(network, address, deadline).await {
            Ok(conn) => conn,
            Err(e) => {
                dialer.close();
                return Err(e.into());
            }
        };
        log::debug!("Connected to {} over {}", address, network);

        Ok(Self {
            conn,
            dialer: Some(dialer),
            verbose: false,
        })
    }

    /// Wrap an already established connection.
    pub fn with_connection(conn: BoxStream) -> Self {
        Self {
            conn,
            dialer: None,
            verbose: false,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Read whatever is available into `buf`. Returns 0 at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.conn.read(buf).await?;
        if self.verbose {
            eprintln!("{} bytes received", n);
        }
        Ok(n)
    }

    /// Drain `body` into memory, then write all of it.
    pub async fn write<R: AsyncRead + Unpin>(&mut self, mut body: R) -> Result<usize> {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;

        self.conn.write_all(&data).await?;
        self.conn.flush().await?;

        if self.verbose {
            eprintln!("{} bytes sent", data.len());
        }
        Ok(data.len())
    }

    /// Close the connection, then the tunnel.
    ///
    /// The runtime gets one turn between the two so the stack can hand the
    /// FIN to the tunnel before the device stops.
    pub async fn close(mut self) -> Result<()> {
        let shutdown = self.conn.shutdown().await;
        drop(self.conn);
        tokio::task::yield_now().await;
        if let Some(dialer) = self.dialer.take() {
            dialer.close();
        }
        shutdown?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::FakeDialer;
    use crate::connector::BoxFuture;
    use tokio::io::DuplexStream;

    fn echo(mut stream: DuplexStream) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn test_write_then_read_echoes() {
        let (client, server) = tokio::io::duplex(4096);
        tokio::spawn(echo(server));

        let mut raw = RawClient::with_connection(Box::new(client));
        let payload = b"hello arc".to_vec();

        let sent = raw.write(payload.as_slice()).await.unwrap();
        assert_eq!(sent, payload.len());

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        while received.len() < sent {
            let n = raw.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.extend_from_slice(&buf[..n]);
        }
        assert_eq!(received, payload);

        raw.close().await.unwrap();
    }

    /// Dialer handing out one prepared connection and recording events.
    struct OneShotDialer {
        conn: std::sync::Mutex<Option<DuplexStream>>,
        events: Arc<std::sync::Mutex<Vec<&'static str>>>,
    }

    impl Dialer for OneShotDialer {
        fn dial<'a>(
            &'a self,
            _network: Network,
            _address: &'a str,
            _deadline: Option<Instant>,
        ) -> BoxFuture<'a, arc_netstack::Result<BoxStream>> {
            let conn = self.conn.lock().unwrap().take();
            Box::pin(async move {
                conn.map(|c| Box::new(c) as BoxStream)
                    .ok_or(arc_netstack::Error::TunnelClosed)
            })
        }

        fn close(&self) {
            self.events.lock().unwrap().push("tunnel closed");
        }
    }

    #[tokio::test]
    async fn test_close_ends_connection_before_tunnel() {
        let (client, mut server) = tokio::io::duplex(1024);
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));

        let peer_events = events.clone();
        let peer = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            while server.read(&mut buf).await.unwrap() > 0 {}
            peer_events.lock().unwrap().push("peer saw end of stream");
        });

        let dialer = Arc::new(OneShotDialer {
            conn: std::sync::Mutex::new(Some(client)),
            events: events.clone(),
        });
        let raw = RawClient::dial(dialer, Network::Tcp, "100.127.10.16:23080", None)
            .await
            .unwrap();

        raw.close().await.unwrap();
        peer.await.unwrap();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["peer saw end of stream", "tunnel closed"]
        );
    }

    #[tokio::test]
    async fn test_failed_dial_closes_dialer() {
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let dialer = Arc::new(OneShotDialer {
            conn: std::sync::Mutex::new(None),
            events: events.clone(),
        });

        let result = RawClient::dial(dialer, Network::Udp, "100.127.10.16:5683", None).await;
        assert!(result.is_err());
        assert_eq!(*events.lock().unwrap(), vec!["tunnel closed"]);
    }

    #[tokio::test]
    async fn test_dial_uses_dialer() {
        let dialer = FakeDialer::new(echo);
        let mut raw = RawClient::dial(dialer.clone(), Network::Udp, "100.127.10.16:5683", None)
            .await
            .unwrap();
        assert_eq!(dialer.dial_count(), 1);

        raw.write(&b"ping"[..]).await.unwrap();
        let mut buf = [0u8; 4];
        raw.read(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        raw.close().await.unwrap();
    }
}
