//! Feed fetching over HTTP.
//!
//! [`FeedFetcher`] is the seam the orchestrator depends on; [`HttpFetcher`]
//! implements it with one bounded GET per feed and no internal retry.

pub mod auth;
mod client;

pub use client::{BasicClient, HttpClient};

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::error::{FetchCause, FetchError};
use crate::registry::FeedDescriptor;

/// Default per-feed time budget, covering connect, headers and body.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Retrieves the raw GTFS-RT payload for one feed.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, feed: &FeedDescriptor) -> Result<Bytes, FetchError>;
}

/// Fetches feeds through an [`HttpClient`] with a fixed timeout.
pub struct HttpFetcher<C = BasicClient> {
    client: C,
    timeout: Duration,
}

impl HttpFetcher<BasicClient> {
    /// # Errors
    ///
    /// Fails only if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        Ok(Self::with_client(BasicClient::new()?, timeout))
    }
}

impl<C: HttpClient> HttpFetcher<C> {
    pub fn with_client(client: C, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn classify(&self, feed_id: &str, err: reqwest::Error) -> FetchError {
        let cause = if err.is_timeout() {
            FetchCause::Timeout(self.timeout)
        } else {
            FetchCause::Network(err)
        };
        FetchError {
            feed_id: feed_id.to_string(),
            cause,
        }
    }
}

#[async_trait]
impl<C: HttpClient> FeedFetcher for HttpFetcher<C> {
    async fn fetch(&self, feed: &FeedDescriptor) -> Result<Bytes, FetchError> {
        let url = feed.url.parse::<reqwest::Url>().map_err(|_| FetchError {
            feed_id: feed.id.clone(),
            cause: FetchCause::InvalidUrl(feed.url.clone()),
        })?;

        let mut req = reqwest::Request::new(reqwest::Method::GET, url);
        *req.headers_mut() = feed.headers.clone();
        *req.timeout_mut() = Some(self.timeout);

        let resp = self
            .client
            .execute(req)
            .await
            .map_err(|e| self.classify(&feed.id, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError {
                feed_id: feed.id.clone(),
                cause: FetchCause::Status(status),
            });
        }

        let body = resp.bytes().await.map_err(|e| self.classify(&feed.id, e))?;
        debug!(feed_id = %feed.id, bytes = body.len(), "Feed bytes received");
        Ok(body)
    }
}
