//! `soratun curl`: one HTTP request through the tunnel.

use anyhow::{anyhow, Context, Result};
use arc_client::HttpClient;
use arc_netstack::Config;
use bytes::Bytes;
use http::Method;
use tokio::io::{AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone)]
pub struct CurlOptions {
    pub url: String,
    pub method: Method,
    /// Inline body, or `@path` to read it from a file.
    pub data: Option<String>,
    pub headers: Vec<String>,
}

/// Parse a `--request` value. Case is ignored.
pub fn parse_method(method: &str) -> Result<Method> {
    Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| anyhow!("invalid HTTP method: {}", method))
}

impl CurlOptions {
    /// GET never carries a body.
    pub fn sends_body(&self) -> bool {
        self.method != Method::GET
    }
}

pub async fn run<W>(
    config: &Config,
    options: &CurlOptions,
    body: Bytes,
    verbose: bool,
    out: &mut W,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    super::ensure_session(config)?;

    let mut client = HttpClient::new(config, &options.url, options.headers.clone())
        .await
        .context("Failed to create a new client")?;
    client.set_verbose(verbose);

    let body = if options.sends_body() { body } else { Bytes::new() };
    let response = client.send(options.method.clone(), body).await;
    client.close();

    let response =
        response.with_context(|| format!("Failed to get response from {}", options.url))?;
    out.write_all(response.body())
        .await
        .with_context(|| format!("Failed to read response body from {}", options.url))?;
    out.flush().await?;
    Ok(())
}
