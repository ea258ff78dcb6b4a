//! Image download collaborators.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, header};

use vault_sync_core::Error;

/// How a download is attempted.
///
/// `Primary` identifies the app through an `Origin` header; hosts that reject
/// cross-origin requests are retried once with a bare `Fallback` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    Primary,
    Fallback,
}

/// Bytes and type of a downloaded image.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedImage {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn download(&self, url: &str, mode: FetchMode) -> Result<DownloadedImage, Error>;
}

/// Configuration for [`HttpImageSource`].
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// User agent string (default: "vault-sync/0.1")
    pub user_agent: String,

    /// Origin sent on primary attempts, if any.
    pub origin: Option<String>,

    /// Maximum image size in bytes (default: 10MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            user_agent: "vault-sync/0.1".to_string(),
            origin: None,
            max_bytes: 10 * 1024 * 1024,
            timeout: Duration::from_secs(20),
        }
    }
}

/// reqwest-backed [`ImageSource`].
pub struct HttpImageSource {
    http: Client,
    config: HttpSourceConfig,
}

impl HttpImageSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::FetchFailed(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, config })
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn download(&self, url: &str, mode: FetchMode) -> Result<DownloadedImage, Error> {
        let mut request = self.http.get(url);
        if mode == FetchMode::Primary {
            request = request.header(header::ACCEPT, "image/avif,image/webp,image/*,*/*;q=0.8");
            if let Some(origin) = &self.config.origin {
                request = request.header(header::ORIGIN, origin);
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::FetchFailed(format!("network error: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::FetchFailed(format!("status {}", status.as_u16())));
        }

        if let Some(len) = response.content_length()
            && len as usize > self.config.max_bytes
        {
            return Err(Error::SizeExceeded { what: url.to_string(), bytes: len as usize, limit: self.config.max_bytes });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::FetchFailed(format!("failed to read response: {}", e)))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::SizeExceeded { what: url.to_string(), bytes: bytes.len(), limit: self.config.max_bytes });
        }

        tracing::debug!(url, bytes = bytes.len(), ?mode, "downloaded image");
        Ok(DownloadedImage { bytes, content_type })
    }
}
