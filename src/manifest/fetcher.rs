use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Client;

use super::Result;

/// Status and body of one catalog request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

/// One HTTP GET. Timeouts and retries belong to the caller.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<FetchResponse>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self { client: Client::new() }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ManifestFetcher for HttpFetcher {
    async fn get(&self, url: &str) -> Result<FetchResponse> {
        let response = self.client.get(url).header(ACCEPT, "application/json").send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(FetchResponse { status, body })
    }
}
