//! Feed registry: loads the feeds to ingest from a YAML document.
//!
//! ```yaml
//! custom_feeds:
//!   mta-bus:
//!     url: https://example.com/vehicle_positions
//!     api_token: secret
//!     headers:
//!       x-client: ingest
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::fetch::auth::request_headers;

/// One feed to ingest, immutable for the duration of a run.
#[derive(Debug, Clone)]
pub struct FeedDescriptor {
    pub id: String,
    /// Realtime vehicle positions endpoint.
    pub url: String,
    /// Explicit headers merged with the bearer header derived from the token.
    pub headers: HeaderMap,
}

impl FeedDescriptor {
    /// A feed with no authentication or extra headers.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }
}

/// Result of loading the registry.
///
/// Entries that fail validation are reported in `rejected` instead of
/// aborting the load, so one bad entry does not take down every other feed.
#[derive(Debug, Default)]
pub struct FeedRegistration {
    pub feeds: Vec<FeedDescriptor>,
    pub rejected: Vec<ConfigError>,
}

impl FeedRegistration {
    pub fn feed_ids(&self) -> Vec<String> {
        self.feeds.iter().map(|f| f.id.clone()).collect()
    }
}

/// Source of feed descriptors for a run.
pub trait FeedSource: Send + Sync {
    /// Loads all configured feeds in a deterministic order.
    ///
    /// # Errors
    ///
    /// Returns an error only when the source as a whole is unusable.
    fn load_feeds(&self) -> Result<FeedRegistration, ConfigError>;
}

impl FeedSource for Vec<FeedDescriptor> {
    fn load_feeds(&self) -> Result<FeedRegistration, ConfigError> {
        Ok(FeedRegistration {
            feeds: self.clone(),
            rejected: Vec::new(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    url: Option<String>,
    api_token: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// Reads the `custom_feeds` section of a YAML document on every load, so edits
/// take effect on the next run.
pub struct YamlFeedRegistry {
    path: PathBuf,
}

impl YamlFeedRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FeedSource for YamlFeedRegistry {
    fn load_feeds(&self) -> Result<FeedRegistration, ConfigError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "Feed config not found, no feeds configured");
            return Ok(FeedRegistration::default());
        }

        let content = std::fs::read_to_string(&self.path).map_err(|cause| ConfigError::Read {
            path: self.path.clone(),
            cause,
        })?;

        parse_registry(&self.path, &content)
    }
}

/// Parses a registry document. `path` is only used in error messages.
pub fn parse_registry(path: &Path, content: &str) -> Result<FeedRegistration, ConfigError> {
    let document: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|cause| ConfigError::Parse {
            path: path.to_path_buf(),
            cause,
        })?;

    let custom_feeds = match document.get("custom_feeds") {
        None | Some(serde_yaml::Value::Null) => return Ok(FeedRegistration::default()),
        Some(serde_yaml::Value::Mapping(feeds)) => feeds,
        Some(_) => {
            return Err(ConfigError::NotAMapping {
                path: path.to_path_buf(),
            });
        }
    };

    let mut registration = FeedRegistration::default();

    for (key, value) in custom_feeds {
        let feed_id = match key {
            serde_yaml::Value::String(s) => s.clone(),
            other => serde_yaml::to_string(other)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
        };

        match build_descriptor(&feed_id, value.clone()) {
            Ok(descriptor) => registration.feeds.push(descriptor),
            Err(e) => {
                warn!(feed_id = %feed_id, error = %e, "Rejected feed entry");
                registration.rejected.push(e);
            }
        }
    }

    Ok(registration)
}

fn build_descriptor(
    feed_id: &str,
    value: serde_yaml::Value,
) -> Result<FeedDescriptor, ConfigError> {
    let entry: FeedEntry =
        serde_yaml::from_value(value).map_err(|cause| ConfigError::InvalidEntry {
            feed_id: feed_id.to_string(),
            cause,
        })?;

    let url = entry
        .url
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingUrl {
            feed_id: feed_id.to_string(),
        })?;

    let headers = request_headers(&entry.headers, entry.api_token.as_deref()).map_err(|e| {
        ConfigError::InvalidHeader {
            feed_id: feed_id.to_string(),
            name: e.name,
        }
    })?;

    Ok(FeedDescriptor {
        id: feed_id.to_string(),
        url,
        headers,
    })
}
