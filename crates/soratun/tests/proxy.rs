use arc_client::BoxFuture;
use bytes::Bytes;
use http::{Method, Response};
use soratun::proxy::{ProxyServer, Upstream};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;

#[derive(Default)]
struct Recording {
    calls: Mutex<Vec<(Method, String, Bytes)>>,
}

impl Upstream for Recording {
    fn forward<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, arc_client::Result<Response<Bytes>>> {
        self.calls
            .lock()
            .unwrap()
            .push((method, path.to_string(), body));
        Box::pin(async { Ok(Response::new(Bytes::from_static(b"{\"ok\":true}"))) })
    }
}

async fn exchange(addr: std::net::SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn test_proxy_forwards_post_and_rejects_get() {
    let upstream = Arc::new(Recording::default());
    let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), upstream.clone())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let running = tokio::spawn(server.run_until(async {
        let _ = stopped.await;
    }));

    let response = exchange(
        addr,
        "POST /v1/echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 9\r\n\
         Connection: close\r\n\r\n{\"k\":\"v\"}",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "{}", response);
    assert!(response.ends_with("{\"ok\":true}"), "{}", response);

    let response = exchange(
        addr,
        "GET /v1/echo HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 405"), "{}", response);
    assert!(response.ends_with("unsupported HTTP method: GET"), "{}", response);

    {
        let calls = upstream.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Method::POST);
        assert_eq!(calls[0].1, "v1/echo");
        assert_eq!(calls[0].2.as_ref(), b"{\"k\":\"v\"}");
    }

    stop.send(()).unwrap();
    running.await.unwrap().unwrap();
}
