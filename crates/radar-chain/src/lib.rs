//! Bounded, retrying JSON fetch utilities and the explorer API client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use radar_core::Chain;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "radar-chain";

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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
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
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
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
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
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

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} from {host}")]
    HttpStatus { status: u16, host: String },
    #[error("decoding response from {host}: {message}")]
    Decode { host: String, message: String },
}

/// JSON-over-HTTP fetcher with retry classification, capped exponential
/// backoff, and global plus per-host concurrency limits. API keys travel in
/// query strings, so spans record the host only.
#[derive(Debug)]
pub struct JsonFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl JsonFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        cycle_id: Uuid,
        host: &str,
        url: &str,
    ) -> Result<T, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_host = self.per_host_semaphore(host).await;
        let _host_permit = per_host.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("json_fetch", %cycle_id, host);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = resp.bytes().await?;
                        return serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode {
                            host: host.to_string(),
                            message: e.to_string(),
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        host: host.to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

// ---------------------------------------------------------------------------
// Explorer client
// ---------------------------------------------------------------------------

/// Etherscan-family API root for a chain, if one exists.
pub fn explorer_base(chain: Chain) -> Option<&'static str> {
    match chain {
        Chain::Ethereum => Some("https://api.etherscan.io/api"),
        Chain::Bsc => Some("https://api.bscscan.com/api"),
        Chain::Polygon => Some("https://api.polygonscan.com/api"),
        Chain::Arbitrum => Some("https://api.arbiscan.io/api"),
        Chain::Optimism => Some("https://api-optimistic.etherscan.io/api"),
        Chain::Solana => None,
    }
}

/// Response wrapper shared by the explorer APIs. `result` stays untyped
/// because error responses carry a message string where rows would be.
#[derive(Debug, Clone, Deserialize)]
pub struct ExplorerEnvelope {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: serde_json::Value,
}

/// One transaction row as the explorer APIs report it. Numeric fields come
/// back as decimal strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExplorerTx {
    pub hash: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "contractAddress")]
    pub contract_address: String,
    #[serde(rename = "tokenName")]
    pub token_name: String,
    #[serde(rename = "tokenSymbol")]
    pub token_symbol: String,
    #[serde(rename = "timeStamp")]
    pub time_stamp: String,
    pub value: String,
}

impl ExplorerTx {
    pub fn unix_timestamp(&self) -> Option<i64> {
        self.time_stamp.parse().ok()
    }
}

#[derive(Debug)]
pub struct ExplorerClient {
    chain: Chain,
    base: &'static str,
    api_key: String,
    fetcher: Arc<JsonFetcher>,
}

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("chain {0:?} has no explorer API")]
    Unsupported(Chain),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ExplorerClient {
    /// The api key is treated as an opaque credential and only ever appended
    /// to the query string.
    pub fn new(chain: Chain, api_key: impl Into<String>, fetcher: Arc<JsonFetcher>) -> Result<Self, ExplorerError> {
        let base = explorer_base(chain).ok_or(ExplorerError::Unsupported(chain))?;
        Ok(Self {
            chain,
            base,
            api_key: api_key.into(),
            fetcher,
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    fn host(&self) -> &'static str {
        self.base
    }

    async fn fetch_txs(&self, cycle_id: Uuid, url: String) -> Result<Vec<ExplorerTx>, ExplorerError> {
        let envelope: ExplorerEnvelope =
            self.fetcher.get_json(cycle_id, self.host(), &url).await?;
        // Explorer APIs signal "no rows" (and soft errors) via status != "1".
        if envelope.status != "1" {
            return Ok(Vec::new());
        }
        serde_json::from_value(envelope.result).map_err(|e| {
            ExplorerError::Fetch(FetchError::Decode {
                host: self.host().to_string(),
                message: e.to_string(),
            })
        })
    }

    /// Most recent token transfer rows, chain-wide, newest first.
    pub async fn recent_token_transfers(&self, cycle_id: Uuid) -> Result<Vec<ExplorerTx>, ExplorerError> {
        let url = format!(
            "{}?module=account&action=tokentx&startblock=0&endblock=latest&sort=desc&apikey={}",
            self.base, self.api_key
        );
        self.fetch_txs(cycle_id, url).await
    }

    /// Normal transactions for one wallet, newest first.
    pub async fn wallet_transactions(
        &self,
        cycle_id: Uuid,
        address: &str,
    ) -> Result<Vec<ExplorerTx>, ExplorerError> {
        let url = format!(
            "{}?module=account&action=txlist&address={}&startblock=0&endblock=99999999&sort=desc&apikey={}",
            self.base, address, self.api_key
        );
        self.fetch_txs(cycle_id, url).await
    }

    /// Token transfers touching one wallet, newest first.
    pub async fn wallet_token_transfers(
        &self,
        cycle_id: Uuid,
        address: &str,
    ) -> Result<Vec<ExplorerTx>, ExplorerError> {
        let url = format!(
            "{}?module=account&action=tokentx&address={}&sort=desc&apikey={}",
            self.base, address, self.api_key
        );
        self.fetch_txs(cycle_id, url).await
    }
}

/// EVM contract address shape check: 0x followed by 40 hex characters.
pub fn is_valid_contract_address(address: &str) -> bool {
    let Some(body) = address.strip_prefix("0x") else {
        return false;
    };
    body.len() == 40 && hex::decode(body).is_ok()
}
