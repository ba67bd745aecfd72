use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RestError {
    #[error("Failed to build HTTP client: {0}")]
    Build(#[source] reqwest::Error),
    #[error("POST {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Join a base URL and a path with exactly one `/` in between.
pub fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// POSTs to paths below one base URL.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, RestError> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build().map_err(RestError::Build)?,
            base_url: base_url.to_string(),
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    /// POST `payload` to `base_url/path`. An empty payload is sent as a bodiless POST.
    pub async fn post(&self, path: &str, payload: Bytes) -> Result<StatusCode, RestError> {
        let url = self.url_for(path);
        info!("FULL URL: {}", url);

        let request = self.http.post(&url);
        let request = if payload.is_empty() {
            request
        } else {
            debug!("POST body of {} bytes", payload.len());
            request.body(payload)
        };

        let response = request
            .send()
            .await
            .map_err(|source| RestError::Request { url, source })?;
        Ok(response.status())
    }
}
