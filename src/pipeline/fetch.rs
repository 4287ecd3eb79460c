//! Source fetch: load the original PDF bytes named by a job's `source_url`.
//!
//! `http(s)://` sources are downloaded with a shared `reqwest` client;
//! `file://` sources are read with `tokio::fs`. Bytes are returned in memory:
//! the extractor and renderer both work on the whole buffer, so there is no
//! temp file to manage.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{FetchError, PipelineError};

/// Loads source documents.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// [`SourceFetcher`] for `http://`, `https://` and `file://` URLs.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl UrlFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| PipelineError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            timeout_secs,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        info!("Downloading PDF from: {}", url);

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    secs: self.timeout_secs,
                }
            } else {
                FetchError::Transport {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            }
        })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        debug!("Downloaded {} bytes from {}", bytes.len(), url);
        Ok(bytes.to_vec())
    }

    async fn read_local(&self, url: &str, path: &str) -> Result<Vec<u8>, FetchError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        debug!("Read {} bytes from {}", bytes.len(), path);
        Ok(bytes)
    }
}

#[async_trait]
impl SourceFetcher for UrlFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        match classify(url) {
            Some(Source::Http) => self.download(url).await,
            Some(Source::File(path)) => self.read_local(url, path).await,
            None => Err(FetchError::UnsupportedScheme(url.to_string())),
        }
    }
}

enum Source<'a> {
    Http,
    File(&'a str),
}

fn classify(url: &str) -> Option<Source<'_>> {
    let lower = url.get(..8).unwrap_or(url).to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(Source::Http);
    }
    url.get(..7)
        .filter(|scheme| scheme.eq_ignore_ascii_case("file://"))
        .and_then(|_| url.get(7..))
        .filter(|path| !path.is_empty())
        .map(Source::File)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_supported_schemes() {
        assert!(matches!(classify("https://x/a.pdf"), Some(Source::Http)));
        assert!(matches!(classify("HTTP://x/a.pdf"), Some(Source::Http)));
        assert!(matches!(classify("file:///tmp/a.pdf"), Some(Source::File("/tmp/a.pdf"))));
        assert!(classify("s3://bucket/a.pdf").is_none());
        assert!(classify("file://").is_none());
    }

    #[tokio::test]
    async fn reads_file_urls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        std::fs::write(&path, b"%PDF-1.7").unwrap();

        let fetcher = UrlFetcher::new(5).unwrap();
        let url = format!("file://{}", path.display());
        assert_eq!(fetcher.fetch(&url).await.unwrap(), b"%PDF-1.7");
    }

    #[tokio::test]
    async fn missing_file_is_a_fetch_error() {
        let fetcher = UrlFetcher::new(5).unwrap();
        let err = fetcher.fetch("file:///definitely/not/here.pdf").await.unwrap_err();
        assert!(matches!(err, FetchError::Transport { .. }));
        let job_err: PipelineError = err.into();
        assert!(job_err.is_retryable());
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let fetcher = UrlFetcher::new(5).unwrap();
        let err = fetcher.fetch("ftp://x/a.pdf").await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(_)));
    }
}
