//! Local HTTP proxy for the Unified Endpoint.
//!
//! Every POST is forwarded with its path and body through the tunnel, and
//! the upstream status and body are relayed back. Other methods are answered
//! locally with 405.

use arc_client::{BoxFuture, FixedEndpointHttpClient};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Errors that stop the proxy.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("proxy server error: {0}")]
    Accept(io::Error),

    #[error("proxy server task failed: {0}")]
    Task(String),
}

/// Where the proxy sends forwarded requests.
pub trait Upstream: Send + Sync + 'static {
    fn forward<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, arc_client::Result<Response<Bytes>>>;
}

impl Upstream for FixedEndpointHttpClient {
    fn forward<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, arc_client::Result<Response<Bytes>>> {
        Box::pin(self.send(method, path, body))
    }
}

fn text_response(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Answer one local request.
pub async fn handle<U, B>(upstream: &U, request: Request<B>) -> Response<Full<Bytes>>
where
    U: Upstream + ?Sized,
    B: Body,
    B::Error: Display,
{
    let method = request.method().clone();
    log::debug!("route {} {} to Unified Endpoint", method, request.uri());

    if method != Method::POST {
        log::error!("unsupported HTTP method: {}", method);
        return text_response(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("unsupported HTTP method: {}", method),
        );
    }

    let path = request.uri().path().trim_start_matches('/').to_string();
    let body = match request.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            log::error!("failed to read request body: {}", e);
            return text_response(
                StatusCode::BAD_REQUEST,
                format!("failed to read request body: {}", e),
            );
        }
    };

    match upstream.forward(method, &path, body).await {
        Ok(upstream_response) => {
            let (parts, body) = upstream_response.into_parts();
            let mut response = Response::new(Full::new(body));
            *response.status_mut() = parts.status;
            if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, content_type.clone());
            }
            response
        }
        Err(arc_client::Error::UpstreamStatus { status, body, .. }) => {
            log::debug!("Unified Endpoint answered {}", status);
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            response
        }
        Err(e) => {
            log::error!("failed to get response from Unified Endpoint: {}", e);
            text_response(
                StatusCode::BAD_GATEWAY,
                format!("failed to get response from Unified Endpoint: {}", e),
            )
        }
    }
}

/// Accept connections until the listener fails, one task per connection.
pub async fn serve<U: Upstream>(listener: TcpListener, upstream: Arc<U>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        log::trace!("Accepted connection from {}", peer);

        let upstream = upstream.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let upstream = upstream.clone();
                async move { Ok::<_, Infallible>(handle(upstream.as_ref(), request).await) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                log::debug!("Connection from {} ended with error: {}", peer, e);
            }
        });
    }
}

/// A bound proxy listener.
pub struct ProxyServer<U> {
    listener: TcpListener,
    upstream: Arc<U>,
}

impl<U: Upstream> ProxyServer<U> {
    pub async fn bind(addr: SocketAddr, upstream: Arc<U>) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Self { listener, upstream })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve on a background task until `shutdown` completes or the listener
    /// fails. In-flight requests are not drained.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        supervise(serve(self.listener, self.upstream), shutdown).await
    }
}

/// Run `server` on its own task and return when it ends or `shutdown`
/// completes, whichever is first.
async fn supervise<S, F>(server: S, shutdown: F) -> Result<(), Error>
where
    S: Future<Output = io::Result<()>> + Send + 'static,
    F: Future<Output = ()>,
{
    let mut server = tokio::spawn(server);

    tokio::select! {
        result = &mut server => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                log::error!("proxy server error: {}", e);
                Err(Error::Accept(e))
            }
            Err(e) => Err(Error::Task(e.to_string())),
        },
        _ = shutdown => {
            server.abort();
            log::info!("proxy shut down");
            Ok(())
        }
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl+C elsewhere) and return its name.
pub async fn shutdown_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => Ok("SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(Method, String, Bytes)>>,
    }

    impl Upstream for Recorder {
        fn forward<'a>(
            &'a self,
            method: Method,
            path: &'a str,
            body: Bytes,
        ) -> BoxFuture<'a, arc_client::Result<Response<Bytes>>> {
            self.calls
                .lock()
                .unwrap()
                .push((method, path.to_string(), body.clone()));
            Box::pin(async move {
                match path {
                    "missing" => Err(arc_client::Error::UpstreamStatus {
                        status: StatusCode::NOT_FOUND,
                        method: Method::POST,
                        url: "http://100.127.69.42:80/missing".into(),
                        body: "not found".into(),
                    }),
                    "unreachable" => Err(arc_client::Error::Dial {
                        address: "100.127.69.42:80".into(),
                        message: "Dial deadline exceeded".into(),
                    }),
                    _ => Ok(Response::new(body)),
                }
            })
        }
    }

    fn post(path: &str, body: &'static str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Full::new(Bytes::from_static(body.as_bytes())))
            .unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_post_is_forwarded_with_path_and_body() {
        let upstream = Recorder::default();

        let response = handle(&upstream, post("/v1/echo", "{\"k\":\"v\"}")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "{\"k\":\"v\"}");

        let calls = upstream.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Method::POST);
        assert_eq!(calls[0].1, "v1/echo");
        assert_eq!(calls[0].2.as_ref(), b"{\"k\":\"v\"}");
    }

    #[tokio::test]
    async fn test_other_methods_are_answered_locally() {
        let upstream = Recorder::default();

        for method in [Method::GET, Method::PUT, Method::DELETE] {
            let request = Request::builder()
                .method(method.clone())
                .uri("/v1/echo")
                .body(Full::new(Bytes::new()))
                .unwrap();
            let response = handle(&upstream, request).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            assert_eq!(
                body_text(response).await,
                format!("unsupported HTTP method: {}", method)
            );
        }
        assert!(upstream.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upstream_error_status_is_relayed() {
        let upstream = Recorder::default();

        let response = handle(&upstream, post("/missing", "{}")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_text(response).await, "not found");
    }

    #[tokio::test]
    async fn test_forwarding_failure_is_bad_gateway() {
        let upstream = Recorder::default();

        let response = handle(&upstream, post("/unreachable", "{}")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            body_text(response).await,
            "failed to get response from Unified Endpoint: \
             Failed to dial 100.127.69.42:80: Dial deadline exceeded"
        );
    }

    #[tokio::test]
    async fn test_run_until_returns_on_shutdown() {
        let upstream = Arc::new(Recorder::default());
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), upstream)
            .await
            .unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);

        server.run_until(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_error_ends_run_before_shutdown() {
        let failing = async {
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        };

        let result = supervise(failing, std::future::pending::<()>()).await;
        match result {
            Err(Error::Accept(e)) => assert_eq!(e.to_string(), "too many open files"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_server() {
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let server = std::future::pending::<io::Result<()>>();

        stop.send(()).unwrap();
        let result = supervise(server, async {
            let _ = stopped.await;
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let upstream = Arc::new(Recorder::default());
        let first = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), upstream.clone())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        let second = ProxyServer::bind(taken, upstream).await;
        assert!(matches!(second, Err(Error::Bind { addr, .. }) if addr == taken));
    }
}
