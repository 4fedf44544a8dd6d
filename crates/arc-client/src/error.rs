//! Error types for arc-client.

use http::{Method, StatusCode};

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Arc clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The configuration cannot be used to build a tunnel at all.
    #[error("{0}")]
    Precondition(String),

    #[error(transparent)]
    Tunnel(arc_netstack::Error),

    #[error("Failed to dial {address}: {message}")]
    Dial { address: String, message: String },

    #[error("unsupported HTTP method: {0}")]
    UnsupportedMethod(Method),

    /// The server answered with a status of 400 or above.
    #[error("{status}: {method} {url}: {body}")]
    UpstreamStatus {
        status: StatusCode,
        method: Method,
        url: String,
        body: String,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URI has no host: {0}")]
    NoHost(String),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] hyper_util::client::legacy::Error),

    #[error("Failed to read response body: {0}")]
    Body(#[from] hyper::Error),

    #[error("Invalid request: {0}")]
    Request(#[from] http::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<arc_netstack::Error> for Error {
    fn from(err: arc_netstack::Error) -> Self {
        match err {
            arc_netstack::Error::MissingPeerSession => Error::Precondition(err.to_string()),
            arc_netstack::Error::Dial { address, source } => Error::Dial {
                address,
                message: source.to_string(),
            },
            other => Error::Tunnel(other),
        }
    }
}

impl Error {
    /// Status of the upstream response, if this error carries one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::UpstreamStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_session_maps_to_precondition() {
        let err = Error::from(arc_netstack::Error::MissingPeerSession);
        assert!(matches!(err, Error::Precondition(_)));
        assert!(err.to_string().starts_with("Failed to determine connection information"));
    }

    #[test]
    fn test_dial_keeps_address() {
        let err = Error::from(arc_netstack::Error::Dial {
            address: "example.com:80".into(),
            source: Box::new(arc_netstack::Error::DialTimeout),
        });
        assert_eq!(
            err.to_string(),
            "Failed to dial example.com:80: Dial deadline exceeded"
        );
    }

    #[test]
    fn test_upstream_status_message() {
        let err = Error::UpstreamStatus {
            status: StatusCode::NOT_FOUND,
            method: Method::POST,
            url: "http://100.127.69.42:80/missing".into(),
            body: "not found".into(),
        };
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(
            err.to_string(),
            "404 Not Found: POST http://100.127.69.42:80/missing: not found"
        );
    }
}
