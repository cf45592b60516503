//! Shared HTTP fetcher with global and per-source limits.
//!
//! The fetcher performs exactly one request per call. Retrying is left to the
//! caller so a single retry policy applies across all sources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{info_span, Instrument};

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
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket that sustains roughly `requests_per_second` with a matching burst.
    pub fn per_second(requests_per_second: f64) -> Option<Self> {
        if !requests_per_second.is_finite() || requests_per_second <= 0.0 {
            return None;
        }
        Some(Self {
            capacity: (requests_per_second.ceil() as u32).max(1),
            refill_every: Duration::from_secs_f64(1.0 / requests_per_second),
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
    pub source_buckets: HashMap<String, TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            token_bucket: None,
            source_buckets: HashMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_nanos() > 0 {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("http fetcher is shut down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(StatusCode::TOO_MANY_REQUESTS.as_u16())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    default_bucket: Option<TokenBucketConfig>,
    bucket_configs: HashMap<String, TokenBucketConfig>,
    buckets: Mutex<HashMap<String, Arc<SimpleTokenBucket>>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            default_bucket: config.token_bucket,
            bucket_configs: config.source_buckets,
            buckets: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn per_source_bucket(&self, source_id: &str) -> Option<Arc<SimpleTokenBucket>> {
        let config = self
            .bucket_configs
            .get(source_id)
            .copied()
            .or(self.default_bucket)?;
        let mut map = self.buckets.lock().await;
        Some(
            map.entry(source_id.to_string())
                .or_insert_with(|| Arc::new(SimpleTokenBucket::new(config.capacity, config.refill_every)))
                .clone(),
        )
    }

    /// Wait for the source's rate budget, then for a global and a
    /// per-source concurrency slot. The token comes first so a throttled
    /// source never sits on a global slot.
    async fn admit(&self, source_id: &str) -> Result<(OwnedSemaphorePermit, OwnedSemaphorePermit), FetchError> {
        if let Some(bucket) = self.per_source_bucket(source_id).await {
            bucket.take().await;
        }
        let global = self
            .global_limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        let source = self
            .per_source_semaphore(source_id)
            .await
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Closed)?;
        Ok((global, source))
    }

    /// One GET request, gated by the source's token bucket, the global limit
    /// and the source's concurrency limit. Non-2xx answers become
    /// [`FetchError::HttpStatus`].
    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        let _permits = self.admit(source_id).await?;

        let span = info_span!("http_fetch", source_id, url);
        let outcome: Result<FetchedResponse, FetchError> = async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if status.is_success() {
                let body = resp.bytes().await?.to_vec();
                return Ok(FetchedResponse {
                    status,
                    final_url,
                    body,
                });
            }

            Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                retry_after: parse_retry_after(resp.headers()),
            })
        }
        .instrument(span)
        .await;
        outcome
    }
}
