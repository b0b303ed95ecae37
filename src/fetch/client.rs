use async_trait::async_trait;

/// Transport seam under [`super::HttpFetcher`]; lets tests and wrappers
/// intercept requests without a real network.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response>;
}

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Pooled `reqwest` client shared by every feed of a pipeline.
///
/// Identifies itself with the crate name and version and accepts gzip
/// bodies, which several agencies serve.
#[derive(Clone)]
pub struct BasicClient(reqwest::Client);

impl BasicClient {
    pub fn new() -> reqwest::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .gzip(true)
            .build()?;
        Ok(Self(client))
    }
}

#[async_trait]
impl HttpClient for BasicClient {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.0.execute(req).await
    }
}
