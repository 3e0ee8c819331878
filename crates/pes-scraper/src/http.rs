//! Blocking HTTP facade
//!
//! The scan worker is a plain thread. Each client owns a current-thread
//! tokio runtime and blocks on the async reqwest calls.

use crate::{ArtifactFetcher, ScraperError};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue};
use std::time::Duration;

/// Non-success HTTP status as [`ScraperError::BadStatus`]
fn check_status(url: &str, status: StatusCode) -> Result<(), ScraperError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ScraperError::BadStatus(format!("{} returned {}", url, status)))
    }
}

pub struct HttpClient {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpClient {
    /// Create a client with a per-request timeout and user agent
    pub fn new(timeout: Duration, user_agent: &str) -> Result<Self, ScraperError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            runtime,
            client,
            timeout,
        })
    }

    /// GET a URL and return the body as text
    pub fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, ScraperError> {
        tracing::debug!("GET {}", url);

        self.runtime.block_on(async {
            let request = async {
                let response = self.client.get(url).query(query).send().await?;
                check_status(url, response.status())?;
                Ok::<_, ScraperError>(response.text().await?)
            };

            tokio::time::timeout(self.timeout, request)
                .await
                .map_err(|_| ScraperError::Timeout(url.to_string()))?
        })
    }

    /// GET a URL and return the raw body
    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>, ScraperError> {
        tracing::debug!("Downloading {}", url);

        self.runtime.block_on(async {
            let request = async {
                let response = self.client.get(url).send().await?;
                check_status(url, response.status())?;
                Ok::<_, ScraperError>(response.bytes().await?.to_vec())
            };

            tokio::time::timeout(self.timeout, request)
                .await
                .map_err(|_| ScraperError::Timeout(url.to_string()))?
        })
    }
}

impl ArtifactFetcher for HttpClient {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, ScraperError> {
        self.get_bytes(url)
    }
}
