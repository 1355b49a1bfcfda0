//! Polite HTTP client with conditional requests, retries, and a file cache.
//!
//! Downloads land in the cache directory under `sha256(url)` plus the URL's
//! extension, so re-runs can serve conditional requests and 304 responses
//! can reuse the cached artifact without a second download.

use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::{Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use pmda_common::checksum::{sha256_file, sha256_hex};

use crate::config::FetchSettings;
use crate::error::{EtlError, Result};
use crate::state::Watermark;

/// Outcome of fetching one URL.
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub url: String,
    /// Cached artifact on disk (also valid when `unchanged`).
    pub path: PathBuf,
    pub content_hash: String,
    pub watermark: Watermark,
    /// True when the server answered 304 Not Modified.
    pub unchanged: bool,
}

pub struct FetchClient {
    client: reqwest::Client,
    settings: FetchSettings,
}

impl FetchClient {
    pub fn new(settings: FetchSettings) -> Result<Self> {
        std::fs::create_dir_all(&settings.cache_dir)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .user_agent(concat!("pmda-etl/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(FetchClient { client, settings })
    }

    /// Cache location for a URL: `sha256(url)` plus the URL's extension.
    pub fn cache_path(&self, url: &str) -> PathBuf {
        let hash = sha256_hex(url.as_bytes());
        self.settings
            .cache_dir
            .join(format!("{hash}{}", url_extension(url)))
    }

    /// Download `url` unless the prior watermark still matches upstream.
    ///
    /// Conditional headers are sent only when the cached file is still on
    /// disk; otherwise a 304 would leave nothing to load from.
    pub async fn fetch(&self, url: &str, prior: &Watermark) -> Result<FetchResult> {
        let cache_path = self.cache_path(url);
        let conditional = cache_path.is_file() && !prior.is_empty();

        let response = self
            .request_with_retries(url, if conditional { Some(prior) } else { None })
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            info!(url, "Source not modified, reusing cached artifact");
            let content_hash = sha256_file(&cache_path)?;
            return Ok(FetchResult {
                url: url.to_string(),
                path: cache_path,
                content_hash,
                watermark: prior.clone(),
                unchanged: true,
            });
        }

        let etag = header_str(&response, ETAG.as_str());
        let last_modified = header_str(&response, LAST_MODIFIED.as_str());
        let body = response.bytes().await?;

        std::fs::write(&cache_path, &body)?;
        let content_hash = sha256_hex(&body);
        let watermark =
            Watermark::from_validators(etag.as_deref(), last_modified.as_deref(), &content_hash);
        info!(url, bytes = body.len(), path = %cache_path.display(), "Downloaded artifact");

        Ok(FetchResult {
            url: url.to_string(),
            path: cache_path,
            content_hash,
            watermark,
            unchanged: false,
        })
    }

    /// Fetch a page body as text, without caching or conditional headers.
    /// Used for link discovery on index pages.
    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.request_with_retries(url, None).await?;
        Ok(response.text().await?)
    }

    async fn request_with_retries(
        &self,
        url: &str,
        prior: Option<&Watermark>,
    ) -> Result<Response> {
        let attempts = self.settings.retries.max(1);
        let mut last_error = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = self.settings.backoff_factor * f64::powi(2.0, attempt as i32 - 1);
                let jitter = rand::random::<f64>() * 0.1;
                tokio::time::sleep(Duration::from_secs_f64(backoff + jitter)).await;
            }
            // Politeness delay ahead of every request to the portal
            if self.settings.rate_limit_seconds > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(self.settings.rate_limit_seconds))
                    .await;
            }

            let mut request = self.client.get(url);
            if let Some(prior) = prior {
                if let Some(etag) = prior.etag() {
                    request = request.header(IF_NONE_MATCH, etag);
                }
                if let Some(last_modified) = prior.last_modified() {
                    request = request.header(IF_MODIFIED_SINCE, last_modified);
                }
            }

            match request.send().await {
                Ok(response) if response.status().is_server_error() => {
                    warn!(url, status = %response.status(), attempt, "Server error, will retry");
                    last_error = Some(EtlError::Fetch(format!(
                        "server error {} fetching {url}",
                        response.status()
                    )));
                }
                Ok(response) if response.status().is_client_error() => {
                    return Err(EtlError::Fetch(format!(
                        "client error {} fetching {url}",
                        response.status()
                    )));
                }
                Ok(response) => {
                    debug!(url, status = %response.status(), "Request succeeded");
                    return Ok(response);
                }
                Err(err) => {
                    warn!(url, attempt, error = %err, "Transport error, will retry");
                    last_error = Some(EtlError::Fetch(format!(
                        "transport error fetching {url}: {err}"
                    )));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EtlError::Fetch(format!("request to {url} failed with no attempts made"))
        }))
    }
}

fn header_str(response: &Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn url_extension(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.rsplit('/').next().unwrap_or("");
    match segment.rfind('.') {
        Some(idx) if idx > 0 => segment[idx..].to_string(),
        _ => String::new(),
    }
}

/// Read a cached artifact back into memory.
pub fn read_cached(path: &Path) -> Result<Vec<u8>> {
    Ok(std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings(cache_dir: &Path) -> FetchSettings {
        FetchSettings {
            retries: 3,
            backoff_factor: 0.01,
            rate_limit_seconds: 0.0,
            timeout_seconds: 5,
            cache_dir: cache_dir.to_path_buf(),
        }
    }

    #[test]
    fn test_url_extension() {
        assert_eq!(url_extension("http://h/p/file.zip"), ".zip");
        assert_eq!(url_extension("http://h/p/file.csv?dl=1"), ".csv");
        assert_eq!(url_extension("http://h/p/page"), "");
        assert_eq!(url_extension("http://h/p/.hidden"), "");
    }

    #[tokio::test]
    async fn test_fetch_downloads_and_caches() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.csv"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("id,name\n1,a\n")
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = FetchClient::new(test_settings(dir.path())).unwrap();
        let url = format!("{}/data.csv", server.uri());

        let result = client.fetch(&url, &Watermark::empty()).await.unwrap();
        assert!(!result.unchanged);
        assert_eq!(result.watermark.etag(), Some("\"v1\""));
        assert_eq!(result.path.extension().unwrap(), "csv");
        assert_eq!(std::fs::read(&result.path).unwrap(), b"id,name\n1,a\n");
        assert_eq!(result.content_hash, sha256_hex(b"id,name\n1,a\n"));
    }

    #[tokio::test]
    async fn test_fetch_sends_conditional_headers_and_honors_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.csv"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = FetchClient::new(test_settings(dir.path())).unwrap();
        let url = format!("{}/data.csv", server.uri());

        // Seed the cache as if a prior run had downloaded this file
        std::fs::write(client.cache_path(&url), b"id,name\n1,a\n").unwrap();
        let prior = Watermark::from_validators(Some("\"v1\""), None, "h");

        let result = client.fetch(&url, &prior).await.unwrap();
        assert!(result.unchanged);
        assert_eq!(result.watermark, prior);
        assert_eq!(result.content_hash, sha256_hex(b"id,name\n1,a\n"));
    }

    #[tokio::test]
    async fn test_no_conditional_headers_without_cached_file() {
        let server = MockServer::start().await;
        // A conditional request would match this 304 mock first
        Mock::given(method("GET"))
            .and(path("/data.csv"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data.csv"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fresh"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = FetchClient::new(test_settings(dir.path())).unwrap();
        let url = format!("{}/data.csv", server.uri());
        let prior = Watermark::from_validators(Some("\"v1\""), None, "h");

        let result = client.fetch(&url, &prior).await.unwrap();
        assert!(!result.unchanged);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = FetchClient::new(test_settings(dir.path())).unwrap();
        let url = format!("{}/flaky", server.uri());

        let result = client.fetch(&url, &Watermark::empty()).await.unwrap();
        assert!(!result.unchanged);
        assert_eq!(std::fs::read(&result.path).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_client_errors_fail_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = FetchClient::new(test_settings(dir.path())).unwrap();
        let url = format!("{}/gone", server.uri());

        let err = client.fetch(&url, &Watermark::empty()).await.unwrap_err();
        assert!(matches!(err, EtlError::Fetch(_)));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_last_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = FetchClient::new(test_settings(dir.path())).unwrap();
        let url = format!("{}/down", server.uri());

        let err = client.fetch(&url, &Watermark::empty()).await.unwrap_err();
        assert!(matches!(err, EtlError::Fetch(_)));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_exhausted_transport_errors_surface_as_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.retries = 1;
        let client = FetchClient::new(settings).unwrap();

        // Port 9 (discard) refuses connections: no HTTP response at all
        let err = client
            .fetch("http://127.0.0.1:9/data.csv", &Watermark::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, EtlError::Fetch(_)));
        assert!(err.to_string().contains("transport error"));
    }
}
