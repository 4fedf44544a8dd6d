//! Handlers behind the CLI subcommands.
//!
//! Each handler takes the loaded [`Config`] and an options struct built from
//! the parsed arguments.

pub mod curl;
pub mod nc;
pub mod up;
pub mod wg_config;

pub use curl::CurlOptions;
pub use nc::NcOptions;
pub use up::ProxyOptions;

use anyhow::{Context, Result};
use arc_netstack::Config;
use bytes::Bytes;
use std::io::IsTerminal;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;

/// Set to any non-empty value to dump requests and responses to stderr.
pub const VERBOSE_ENV: &str = "SORACOM_VERBOSE";

pub const MISSING_SESSION_MESSAGE: &str = "Failed to determine connection information. \
     Please bootstrap or create a new session from the user console.";

pub fn verbose_from_env() -> bool {
    std::env::var_os(VERBOSE_ENV).is_some_and(|value| !value.is_empty())
}

/// Fail with the user-facing message when the config carries no session.
pub fn ensure_session(config: &Config) -> Result<()> {
    config.session().context(MISSING_SESSION_MESSAGE)?;
    Ok(())
}

/// True when stdin is a pipe or file rather than a terminal.
pub fn stdin_is_piped() -> bool {
    !std::io::stdin().is_terminal()
}

/// Where a request body comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodySource {
    Stdin,
    File(PathBuf),
    Inline(String),
    Empty,
}

impl BodySource {
    /// Piped stdin wins over `data`. A `data` starting with `@` names a file.
    pub fn select(stdin_piped: bool, data: Option<&str>) -> Self {
        if stdin_piped {
            return BodySource::Stdin;
        }
        match data {
            Some(data) if data.starts_with('@') => BodySource::File(PathBuf::from(&data[1..])),
            Some(data) if !data.is_empty() => BodySource::Inline(data.to_string()),
            _ => BodySource::Empty,
        }
    }

    pub async fn read(self) -> Result<Bytes> {
        match self {
            BodySource::Stdin => {
                let mut buf = Vec::new();
                tokio::io::stdin()
                    .read_to_end(&mut buf)
                    .await
                    .context("Failed to get body to send")?;
                Ok(Bytes::from(buf))
            }
            BodySource::File(path) => {
                let data = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Ok(Bytes::from(data))
            }
            BodySource::Inline(data) => Ok(Bytes::from(data)),
            BodySource::Empty => Ok(Bytes::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_select_body_source() {
        assert_eq!(BodySource::select(true, Some("x")), BodySource::Stdin);
        assert_eq!(
            BodySource::select(false, Some("@body.json")),
            BodySource::File(PathBuf::from("body.json"))
        );
        assert_eq!(
            BodySource::select(false, Some("{\"k\":1}")),
            BodySource::Inline("{\"k\":1}".into())
        );
        assert_eq!(BodySource::select(false, Some("")), BodySource::Empty);
        assert_eq!(BodySource::select(false, None), BodySource::Empty);
    }

    #[tokio::test]
    async fn test_read_body_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"temp\":21}").unwrap();

        let data = format!("@{}", file.path().display());
        let body = BodySource::select(false, Some(&data)).read().await.unwrap();
        assert_eq!(body.as_ref(), b"{\"temp\":21}");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = BodySource::File(dir.path().join("absent.json"));
        assert!(source.read().await.is_err());
    }
}
