//! HTTP fetch utilities + Postgres persistence for the registry sync.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

mod postgres;

pub use postgres::{
    load_license_type_seeds, CompanyStore, LicenseTypeSeed, LicenseTypeSeedFile, PgStore,
    UpsertOutcome, SCHEMA_SQL,
};

pub const CRATE_NAME: &str = "lcr-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Honor `HTTP_PROXY`-style environment settings. Off for registry fetches.
    pub trust_env_proxy: bool,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            trust_env_proxy: false,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Strip the access key from a URL before it reaches logs or error messages.
pub fn redact_url(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let query = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if key.eq_ignore_ascii_case("api_key") => format!("{key}=***"),
            _ => pair.to_string(),
        })
        .collect::<Vec<_>>()
        .join("&");
    format!("{base}?{query}")
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if !config.trust_env_proxy {
            builder = builder.no_proxy();
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let redacted = redact_url(url);
        let span = info_span!("http_fetch", %run_id, url = %redacted);
        self.fetch_with_retries(url, &redacted).instrument(span).await
    }

    pub async fn fetch_json<T: DeserializeOwned>(&self, run_id: Uuid, url: &str) -> Result<T, FetchError> {
        let response = self.fetch_bytes(run_id, url).await?;
        serde_json::from_slice(&response.body).map_err(|source| FetchError::Decode {
            url: redact_url(url),
            source,
        })
    }

    async fn fetch_with_retries(&self, url: &str, redacted: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse { status, body });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retryable http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: redacted.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err.without_url(), attempt, "retryable transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_backoff_doubles_from_half_a_second_up_to_five() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries, 2);

        let delays = (0..6).map(|i| policy.delay_for_attempt(i)).collect::<Vec<_>>();
        assert_eq!(
            delays,
            [500, 1000, 2000, 4000, 5000, 5000].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(5));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn api_key_is_redacted_from_urls() {
        let url = "https://apidata.mos.ru/v1/datasets/586/rows?$skip=0&$top=1000&api_key=secret";
        assert_eq!(
            redact_url(url),
            "https://apidata.mos.ru/v1/datasets/586/rows?$skip=0&$top=1000&api_key=***"
        );
        assert_eq!(redact_url("https://example.org/count"), "https://example.org/count");
    }

    #[test]
    fn fetcher_builds_without_proxy_trust() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(1),
            user_agent: Some("lcr-test".into()),
            ..Default::default()
        });
        assert!(fetcher.is_ok());
    }
}
