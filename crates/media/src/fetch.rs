//! Byte fetching for attachments and media streams.

use async_trait::async_trait;
use futures::StreamExt;
use gemcord_core::error::MediaError;
use std::time::Duration;
use tracing::debug;

/// Bytes downloaded from a URL, with the content type the server reported.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
}

/// Downloads raw bytes. Implementations must stop at `max_bytes`.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Fetched, MediaError>;
}

/// HTTP(S) fetcher with a size cap; `file://` URLs are read from disk.
pub struct HttpFetcher {
    client: reqwest::Client,
    max_bytes: u64,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, max_bytes: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, max_bytes }
    }

    fn too_large(&self, url: &str) -> MediaError {
        MediaError::Download {
            source_ref: url.to_string(),
            reason: format!("larger than {} bytes", self.max_bytes),
        }
    }

    async fn fetch_file(&self, url: &str, path: &str) -> Result<Fetched, MediaError> {
        let data = tokio::fs::read(path).await.map_err(|e| MediaError::Download {
            source_ref: url.to_string(),
            reason: e.to_string(),
        })?;
        if data.len() as u64 > self.max_bytes {
            return Err(self.too_large(url));
        }
        Ok(Fetched {
            data,
            content_type: None,
        })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Fetched, MediaError> {
        if let Some(path) = url.strip_prefix("file://") {
            return self.fetch_file(url, path).await;
        }

        let download_error = |reason: String| MediaError::Download {
            source_ref: url.to_string(),
            reason,
        };

        debug!(url = %url, "Downloading media");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| download_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(download_error(format!("HTTP {}", status.as_u16())));
        }

        if response.content_length().is_some_and(|len| len > self.max_bytes) {
            return Err(self.too_large(url));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut data = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| download_error(e.to_string()))?;
            if (data.len() + chunk.len()) as u64 > self.max_bytes {
                return Err(self.too_large(url));
            }
            data.extend_from_slice(&chunk);
        }

        Ok(Fetched { data, content_type })
    }
}
