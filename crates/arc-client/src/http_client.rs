//! HTTP over the tunnel.
//!
//! [`HttpClient`] targets an arbitrary URL. The request machinery it shares
//! with [`crate::FixedEndpointHttpClient`] lives in [`Transport`].

use crate::connector::{Dialer, TunnelConnector};
use crate::error::{Error, Result};
use arc_netstack::{Config, Tunnel};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::response::Parts;
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::fmt::Write as _;
use std::sync::Arc;
use url::Url;

/// Reject anything other than GET and POST.
pub(crate) fn check_method(method: &Method) -> Result<()> {
    if *method == Method::GET || *method == Method::POST {
        Ok(())
    } else {
        Err(Error::UnsupportedMethod(method.clone()))
    }
}

/// Build a request, applying each `Name: Value` header.
///
/// Entries without a colon, or whose name or value is not valid HTTP, are
/// skipped.
pub(crate) fn build_request(
    method: Method,
    url: &str,
    headers: &[String],
    body: Bytes,
) -> Result<Request<Full<Bytes>>> {
    let mut builder = Request::builder().method(method).uri(url);

    for header in headers {
        let Some((name, value)) = header.split_once(':') else {
            log::debug!("Skipping malformed header: {}", header);
            continue;
        };
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value.trim()),
        ) {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => log::debug!("Skipping invalid header: {}", header),
        }
    }

    Ok(builder.body(Full::new(body))?)
}

const REQUEST_DUMP_START: &str = "--- Request dump ---------------------------------";
const REQUEST_DUMP_END: &str = "--- End of request dump --------------------------";
const RESPONSE_DUMP_START: &str = "--- Response dump --------------------------------";
const RESPONSE_DUMP_END: &str = "--- End of response dump -------------------------";

/// The request as sent, framed for the verbose stderr dump.
fn dump_request(request: &Request<Full<Bytes>>, body: &[u8]) -> String {
    let uri = request.uri();
    let mut out = format!("{}\n", REQUEST_DUMP_START);
    let _ = write!(
        out,
        "{} {} HTTP/1.1\r\n",
        request.method(),
        uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
    );
    if let Some(authority) = uri.authority() {
        let _ = write!(out, "Host: {}\r\n", authority);
    }
    for (name, value) in request.headers() {
        let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(body));
    let _ = write!(out, "\n{}", REQUEST_DUMP_END);
    out
}

fn dump_response(parts: &Parts, body: &[u8]) -> String {
    let mut out = format!("{}\n", RESPONSE_DUMP_START);
    let _ = write!(out, "{:?} {}\r\n", parts.version, parts.status);
    for (name, value) in &parts.headers {
        let _ = write!(out, "{}: {}\r\n", name, String::from_utf8_lossy(value.as_bytes()));
    }
    out.push_str("\r\n");
    out.push_str(&String::from_utf8_lossy(body));
    let _ = write!(out, "\n{}", RESPONSE_DUMP_END);
    out
}

/// Map a hyper client error back to the dial error behind it, if any.
fn request_error(err: hyper_util::client::legacy::Error) -> Error {
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        if let Some(Error::Dial { address, message }) = cause.downcast_ref::<Error>() {
            return Error::Dial {
                address: address.clone(),
                message: message.clone(),
            };
        }
        source = cause.source();
    }
    Error::Http(err)
}

/// A hyper client bound to a dialer, plus the headers and verbosity every
/// request uses.
pub(crate) struct Transport {
    dialer: Arc<dyn Dialer>,
    client: Client<TunnelConnector, Full<Bytes>>,
    headers: Vec<String>,
    verbose: bool,
}

impl Transport {
    pub(crate) fn new(dialer: Arc<dyn Dialer>, headers: Vec<String>) -> Self {
        let client =
            Client::builder(TokioExecutor::new()).build(TunnelConnector::new(dialer.clone()));
        Self {
            dialer,
            client,
            headers,
            verbose: false,
        }
    }

    pub(crate) fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub(crate) fn verbose(&self) -> bool {
        self.verbose
    }

    pub(crate) fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Send one request and collect the whole response.
    pub(crate) async fn execute(
        &self,
        method: Method,
        url: String,
        body: Bytes,
    ) -> Result<Response<Bytes>> {
        check_method(&method)?;

        let request = build_request(method.clone(), &url, &self.headers, body.clone())?;
        if self.verbose {
            eprintln!("{}", dump_request(&request, &body));
        }

        log::debug!("{} {}", method, url);
        let response = self.client.request(request).await.map_err(request_error)?;

        let (parts, incoming) = response.into_parts();
        let body = incoming.collect().await?.to_bytes();
        if self.verbose {
            eprintln!("{}", dump_response(&parts, &body));
        }

        if parts.status.as_u16() >= 400 {
            return Err(Error::UpstreamStatus {
                status: parts.status,
                method,
                url,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        Ok(Response::from_parts(parts, body))
    }

    /// Drop the HTTP client, then release the dialer.
    pub(crate) fn close(self) {
        let Self { dialer, client, .. } = self;
        drop(client);
        dialer.close();
    }
}

/// Parse a target URL, accepting only `http` and `https` with a host.
pub(crate) fn parse_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).map_err(|e| Error::InvalidUrl(format!("{}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::InvalidUrl(format!(
            "{}: unsupported scheme {}",
            raw,
            url.scheme()
        )));
    }
    if url.host().is_none() {
        return Err(Error::NoHost(raw.to_string()));
    }
    Ok(url)
}

/// `scheme://host:port/path`, with the port always spelled out and the
/// query string kept.
pub(crate) fn request_url(url: &Url) -> String {
    let mut out = String::new();
    let host = url.host().map(|h| h.to_string()).unwrap_or_default();
    let port = url.port_or_known_default().unwrap_or(80);
    let _ = write!(
        out,
        "{}://{}:{}/{}",
        url.scheme(),
        host,
        port,
        url.path().trim_start_matches('/')
    );
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// An HTTP client for one target URL, dialing through its own tunnel.
pub struct HttpClient {
    transport: Transport,
    url: Url,
}

impl HttpClient {
    /// Build a tunnel from `config` and a client for `url`.
    pub async fn new(config: &Config, url: &str, headers: Vec<String>) -> Result<Self> {
        config.session()?;
        let url = parse_url(url)?;
        let tunnel = Tunnel::new(config).await?;
        Ok(Self::with_dialer(Arc::new(tunnel), url, headers))
    }

    /// Build a client over an existing dialer. The client takes ownership of
    /// the dialer's lifetime: [`HttpClient::close`] closes it.
    pub fn with_dialer(dialer: Arc<dyn Dialer>, url: Url, headers: Vec<String>) -> Self {
        Self {
            transport: Transport::new(dialer, headers),
            url,
        }
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.transport.set_verbose(verbose);
    }

    pub fn verbose(&self) -> bool {
        self.transport.verbose()
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &[String] {
        self.transport.headers()
    }

    /// The URL requests are actually sent to.
    pub fn request_url(&self) -> String {
        request_url(&self.url)
    }

    /// Send a GET or POST to the target URL.
    ///
    /// Statuses of 400 and above come back as [`Error::UpstreamStatus`].
    pub async fn send(&self, method: Method, body: Bytes) -> Result<Response<Bytes>> {
        check_method(&method)?;
        self.transport.execute(method, self.request_url(), body).await
    }

    /// Close the HTTP client and then the tunnel under it.
    pub fn close(self) {
        self.transport.close();
    }
}
