//! Error types for each pipeline stage.
//!
//! Feed-scoped errors ([`FetchError`], [`DecodeError`]) are absorbed by the
//! orchestrator and only ever counted. Everything else can escape a run and is
//! surfaced to the caller as an [`anyhow::Error`].

use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Problems with the feed registry document.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document exists but could not be read.
    #[error("failed to read feed config {path}: {cause}")]
    Read { path: PathBuf, cause: std::io::Error },

    /// The document is not valid YAML. Fatal to the whole registry load.
    #[error("feed config {path} is not valid YAML: {cause}")]
    Parse {
        path: PathBuf,
        cause: serde_yaml::Error,
    },

    /// `custom_feeds` is present but is not a mapping of feed ids.
    #[error("feed config {path}: `custom_feeds` must be a mapping")]
    NotAMapping { path: PathBuf },

    /// A feed entry has no `url`.
    #[error("feed '{feed_id}' has no realtime vehicle positions url")]
    MissingUrl { feed_id: String },

    /// A feed entry has the wrong shape (e.g. `headers` is not a string map).
    #[error("feed '{feed_id}' is malformed: {cause}")]
    InvalidEntry {
        feed_id: String,
        cause: serde_yaml::Error,
    },

    /// A header name or value cannot be sent over HTTP.
    #[error("feed '{feed_id}' has an invalid header '{name}'")]
    InvalidHeader { feed_id: String, name: String },
}

/// Why a single feed could not be fetched.
#[derive(Error, Debug)]
pub enum FetchCause {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("server responded with HTTP {0}")]
    Status(StatusCode),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error(transparent)]
    Network(reqwest::Error),
}

impl FetchCause {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchCause::Timeout(_))
    }
}

/// A feed-scoped fetch failure. The cause is rendered inline.
#[derive(Error, Debug)]
#[error("failed to fetch feed '{feed_id}': {cause}")]
pub struct FetchError {
    pub feed_id: String,
    pub cause: FetchCause,
}

/// A feed payload that is not a valid `FeedMessage`.
#[derive(Error, Debug)]
#[error("failed to decode feed '{feed_id}': {cause}")]
pub struct DecodeError {
    pub feed_id: String,
    pub cause: prost::DecodeError,
}

/// Failures of the metadata index.
#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("index entry for {0} already exists")]
    DuplicatePath(String),

    #[error("index column {column} holds an unreadable value '{value}'")]
    Corrupt { column: &'static str, value: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures while writing a partition file or its index row.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("partition file {0} already exists")]
    PathCollision(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Metadata(#[from] serde_json::Error),

    #[error(transparent)]
    Index(#[from] IndexError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_missing_url() {
        let err = ConfigError::MissingUrl {
            feed_id: "mta".into(),
        };
        assert_eq!(
            err.to_string(),
            "feed 'mta' has no realtime vehicle positions url"
        );
    }

    #[test]
    fn test_display_fetch_timeout() {
        let err = FetchError {
            feed_id: "mbta".into(),
            cause: FetchCause::Timeout(Duration::from_secs(30)),
        };
        assert_eq!(
            err.to_string(),
            "failed to fetch feed 'mbta': timed out after 30s"
        );
        assert!(err.cause.is_timeout());
    }

    #[test]
    fn test_display_fetch_status() {
        let err = FetchError {
            feed_id: "mbta".into(),
            cause: FetchCause::Status(StatusCode::SERVICE_UNAVAILABLE),
        };
        assert_eq!(
            err.to_string(),
            "failed to fetch feed 'mbta': server responded with HTTP 503 Service Unavailable"
        );
    }

    #[test]
    fn test_display_path_collision() {
        let err =
            PersistError::PathCollision(PathBuf::from("data/2024/01/01/00/0000.geoparquet"));
        assert_eq!(
            err.to_string(),
            "partition file data/2024/01/01/00/0000.geoparquet already exists"
        );
    }

    #[test]
    fn test_chained_persist_error_names_cause_once() {
        let io = std::io::Error::new(std::io::ErrorKind::NotADirectory, "Not a directory");
        let err = anyhow::Error::new(PersistError::from(io)).context("failed to persist run");
        let chain = format!("{err:#}");
        assert_eq!(chain, "failed to persist run: Not a directory");
        assert_eq!(chain.matches("Not a directory").count(), 1);
    }

    #[test]
    fn test_chained_index_error_names_cause_once() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = anyhow::Error::new(PersistError::from(IndexError::from(io)))
            .context("failed to persist run");
        assert_eq!(format!("{err:#}").matches("denied").count(), 1);
    }

    #[test]
    fn test_chained_decode_error_names_cause_once() {
        let cause = crate::parser::parse_feed(&[0xFF, 0xFE, 0x00, 0x01]).unwrap_err();
        let detail = cause.to_string();
        let err = anyhow::Error::new(DecodeError {
            feed_id: "mta".into(),
            cause,
        });
        assert_eq!(format!("{err:#}").matches(detail.as_str()).count(), 1);
    }
}
