//! Rate-limited Solana RPC access.
//!
//! Every chain call in the process goes through [`RateLimitedChainClient`]:
//! a reservoir of `RPS` permits refills once per second, and the permit guard
//! is held for the duration of the call so at most one request is in flight.
//! Transient failures retry with exponential backoff before surfacing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::GetConfirmedSignaturesForAddress2Config;
use solana_client::rpc_config::RpcTransactionConfig;
use solana_commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::UiTransactionEncoding;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::warn;

use crate::metrics::{RpcMethod, RpcMetrics};

/// Total attempts per logical call, including the first.
const MAX_RETRIES: usize = 5;
/// First retry delay; doubles on each subsequent attempt.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);
/// The permit reservoir fully refills on this cadence.
const REFILL_WINDOW: Duration = Duration::from_secs(1);

/// A signature entry returned by `getSignaturesForAddress`, newest-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureInfo {
    pub signature: String,
    pub slot: u64,
    /// Seconds since epoch; the node may omit it.
    pub block_time: Option<i64>,
    /// Present when the transaction failed on-chain.
    pub err: Option<String>,
}

/// The slice of a parsed transaction the indexer consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionLogs {
    pub block_time: Option<i64>,
    pub log_messages: Vec<String>,
}

/// Chain operations the scanners and the price oracle depend on.
#[async_trait]
pub trait ChainApi: Send + Sync {
    /// Newest-first page of signatures for `program`. `before` excludes that
    /// signature and everything newer; `until` excludes it and everything
    /// older.
    async fn list_signatures(
        &self,
        program: &Pubkey,
        limit: usize,
        before: Option<&str>,
        until: Option<&str>,
    ) -> Result<Vec<SignatureInfo>>;

    /// Parsed transaction logs, or `None` when the node does not know the
    /// signature.
    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionLogs>>;

    /// Raw account data bytes.
    async fn get_account_data(&self, pubkey: &Pubkey) -> Result<Vec<u8>>;
}

struct Reservoir {
    window_start: Instant,
    remaining: u32,
}

/// Token-bucket limiter with full refill every second and single-lane
/// serialization: the permit guard doubles as the in-flight lock.
pub struct RateLimiter {
    capacity: u32,
    state: Mutex<Reservoir>,
}

/// Held for the duration of one call; dropping it opens the lane.
pub struct Permit<'a> {
    _guard: MutexGuard<'a, Reservoir>,
}

impl RateLimiter {
    pub fn new(rps: u32) -> Self {
        let capacity = rps.max(1);
        Self {
            capacity,
            state: Mutex::new(Reservoir {
                window_start: Instant::now(),
                remaining: capacity,
            }),
        }
    }

    /// Wait for a permit. Callers queue; none are dropped or coalesced.
    pub async fn acquire(&self) -> Permit<'_> {
        let mut res = self.state.lock().await;
        loop {
            let now = Instant::now();
            if now.duration_since(res.window_start) >= REFILL_WINDOW {
                res.window_start = now;
                res.remaining = self.capacity;
            }
            if res.remaining > 0 {
                res.remaining -= 1;
                return Permit { _guard: res };
            }
            let wait = REFILL_WINDOW - now.duration_since(res.window_start);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Run `op` up to `max_attempts` times, sleeping `initial_delay × 2ⁿ`
/// between attempts. The final error surfaces unchanged.
pub(crate) async fn retry_with_backoff<T, E, F, Fut>(
    method: &'static str,
    max_attempts: usize,
    initial_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                warn!(method, attempt, delay = ?delay, error = %e, "Call failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The process-wide chain client: shared by both scanners and the price
/// oracle, and the sole authority for the RPS budget.
pub struct RateLimitedChainClient {
    client: Arc<RpcClient>,
    limiter: RateLimiter,
    metrics: Arc<RpcMetrics>,
}

impl RateLimitedChainClient {
    pub fn new(rpc_url: String, rps: u32, metrics: Arc<RpcMetrics>) -> Self {
        let client = Arc::new(RpcClient::new_with_commitment(
            rpc_url,
            CommitmentConfig::confirmed(),
        ));
        Self {
            client,
            limiter: RateLimiter::new(rps),
            metrics,
        }
    }

    async fn call<T, F, Fut>(&self, method: RpcMethod, op: F) -> Result<T, ClientError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        retry_with_backoff(method.as_str(), MAX_RETRIES, INITIAL_BACKOFF, || {
            let fut = op();
            async move {
                let _permit = self.limiter.acquire().await;
                let start = Instant::now();
                let result = fut.await;
                self.metrics.record(method, start.elapsed(), result.is_ok());
                result
            }
        })
        .await
    }
}

/// `getTransaction` answers `null` for signatures the node does not know,
/// which the client surfaces as a deserialization failure.
fn is_not_found(err: &ClientError) -> bool {
    matches!(err.kind(), ClientErrorKind::SerdeJson(_)) || err.to_string().contains("not found")
}

fn parse_signature(raw: &str, role: &str) -> Result<Signature> {
    Signature::from_str(raw).map_err(|e| anyhow::anyhow!("invalid {role} signature {raw}: {e}"))
}

#[async_trait]
impl ChainApi for RateLimitedChainClient {
    async fn list_signatures(
        &self,
        program: &Pubkey,
        limit: usize,
        before: Option<&str>,
        until: Option<&str>,
    ) -> Result<Vec<SignatureInfo>> {
        let before = match before {
            Some(raw) => Some(parse_signature(raw, "before")?),
            None => None,
        };
        let until = match until {
            Some(raw) => Some(parse_signature(raw, "until")?),
            None => None,
        };

        let statuses = self
            .call(RpcMethod::ListSignatures, || {
                let client = self.client.clone();
                let program = *program;
                async move {
                    client
                        .get_signatures_for_address_with_config(
                            &program,
                            GetConfirmedSignaturesForAddress2Config {
                                before,
                                until,
                                limit: Some(limit),
                                commitment: Some(CommitmentConfig::confirmed()),
                            },
                        )
                        .await
                }
            })
            .await
            .with_context(|| format!("getSignaturesForAddress({program})"))?;

        Ok(statuses
            .into_iter()
            .map(|s| SignatureInfo {
                signature: s.signature,
                slot: s.slot,
                block_time: s.block_time,
                err: s.err.map(|e| e.to_string()),
            })
            .collect())
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionLogs>> {
        let sig = parse_signature(signature, "transaction")?;

        let transaction = self
            .call(RpcMethod::GetTransaction, || {
                let client = self.client.clone();
                async move {
                    let config = RpcTransactionConfig {
                        encoding: Some(UiTransactionEncoding::Json),
                        commitment: Some(CommitmentConfig::confirmed()),
                        max_supported_transaction_version: Some(0),
                    };
                    match client.get_transaction_with_config(&sig, config).await {
                        Ok(tx) => Ok(Some(tx)),
                        Err(e) if is_not_found(&e) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            })
            .await
            .with_context(|| format!("getTransaction({signature})"))?;

        Ok(transaction.map(|tx| TransactionLogs {
            block_time: tx.block_time,
            log_messages: tx
                .transaction
                .meta
                .and_then(|meta| Option::<Vec<String>>::from(meta.log_messages))
                .unwrap_or_default(),
        }))
    }

    async fn get_account_data(&self, pubkey: &Pubkey) -> Result<Vec<u8>> {
        let account = self
            .call(RpcMethod::GetAccount, || {
                let client = self.client.clone();
                let pubkey = *pubkey;
                async move { client.get_account(&pubkey).await }
            })
            .await
            .with_context(|| format!("getAccountInfo({pubkey})"))?;
        Ok(account.data)
    }
}
