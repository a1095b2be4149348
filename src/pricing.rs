//! USD pricing for Solana mints.
//!
//! Prices come from the Jupiter price service and are cached at two levels:
//! an in-process map with a 10-minute TTL and the shared redis KV. Decimals
//! are a property of the mint and never expire; they resolve through the
//! in-process map, redis, a small table of well-known mints, and finally the
//! raw on-chain mint account.

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use reqwest::StatusCode;
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::order::{Pricing, PricingError};
use crate::rpc::ChainApi;

/// Base58 of the all-zero native-SOL sentinel address.
pub const NATIVE_SOL_MINT: &str = "11111111111111111111111111111111";
/// Wrapped-SOL mint the price provider quotes.
pub const WRAPPED_SOL_MINT: &str = "So11111111111111111111111111111111111111112";

const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";
const BONK_MINT: &str = "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263";
const JUP_MINT: &str = "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN";

/// In-process and redis price TTL.
const PRICE_TTL: Duration = Duration::from_secs(600);
/// Retries after the first attempt when the price service rate-limits.
const PRICE_MAX_RETRIES: usize = 3;
const PRICE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// SPL mint account layout: the decimals byte sits at offset 44.
const MINT_DECIMALS_OFFSET: usize = 44;
const MIN_MINT_DATA_LEN: usize = 45;

/// Rewrite the native-SOL sentinel to wrapped SOL; other mints pass through.
pub fn alias_native_mint(mint: &str) -> &str {
    if mint == NATIVE_SOL_MINT {
        WRAPPED_SOL_MINT
    } else {
        mint
    }
}

fn known_decimals(mint: &str) -> Option<u8> {
    match mint {
        WRAPPED_SOL_MINT => Some(9),
        USDC_MINT => Some(6),
        USDT_MINT => Some(6),
        BONK_MINT => Some(5),
        JUP_MINT => Some(6),
        _ => None,
    }
}

/// Decode a fixed-width big-endian amount.
pub fn amount_from_be(bytes: &[u8]) -> BigUint {
    BigUint::from_bytes_be(bytes)
}

/// `(A div 10^d + (A mod 10^d) / 10^d) × p`, exact integer split before the
/// float conversion so large raw amounts keep their whole-unit precision.
pub fn calculate_usd_value(amount: &BigUint, decimals: u8, price: f64) -> f64 {
    let divisor = num_traits::pow(BigUint::from(10u32), decimals as usize);
    let whole = amount / &divisor;
    let fractional = amount % &divisor;
    let whole = whole.to_f64().unwrap_or(f64::INFINITY);
    let fractional =
        fractional.to_f64().unwrap_or(0.0) / divisor.to_f64().unwrap_or(f64::INFINITY);
    (whole + fractional) * price
}

/// Thin wrapper over the shared redis KV that degrades to a miss on any
/// error, so a cache outage never blocks pricing.
struct SharedCache {
    con: Option<MultiplexedConnection>,
}

impl SharedCache {
    fn new(con: Option<MultiplexedConnection>) -> Self {
        Self { con }
    }

    async fn get(&self, key: &str) -> Option<String> {
        let mut con = self.con.clone()?;
        match con.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                debug!(key, error = %e, "Shared cache read failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &str) {
        let Some(mut con) = self.con.clone() else {
            return;
        };
        if let Err(e) = con.set::<_, _, ()>(key, value).await {
            debug!(key, error = %e, "Shared cache write failed");
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) {
        let Some(mut con) = self.con.clone() else {
            return;
        };
        if let Err(e) = con.set_ex::<_, _, ()>(key, value, ttl_secs).await {
            debug!(key, error = %e, "Shared cache write failed");
        }
    }
}

#[derive(Deserialize)]
struct JupiterPrice {
    #[serde(rename = "usdPrice")]
    usd_price: f64,
}

/// Mint pricing with layered caches. Shared by both scanners; all interior
/// state is synchronized.
pub struct PriceOracle {
    http: reqwest::Client,
    price_url: String,
    api_key: String,
    cache: SharedCache,
    chain: Arc<dyn ChainApi>,
    prices: std::sync::Mutex<HashMap<String, (f64, Instant)>>,
    decimals: std::sync::Mutex<HashMap<String, u8>>,
    /// Per-mint gates collapsing concurrent on-chain decimals fetches.
    inflight: tokio::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PriceOracle {
    pub fn new(
        price_url: String,
        api_key: String,
        redis: Option<MultiplexedConnection>,
        chain: Arc<dyn ChainApi>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            price_url,
            api_key,
            cache: SharedCache::new(redis),
            chain,
            prices: std::sync::Mutex::new(HashMap::new()),
            decimals: std::sync::Mutex::new(HashMap::new()),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Value `amount` raw units of `mint` in USD.
    pub async fn usd_value(&self, mint: &str, amount: &BigUint) -> Pricing {
        if amount.is_zero() {
            return Pricing::Priced(0.0);
        }
        let mint = alias_native_mint(mint);
        let Some(price) = self.price(mint).await else {
            return Pricing::Failed(PricingError::NoPrice);
        };
        let Some(decimals) = self.decimals(mint).await else {
            return Pricing::Failed(PricingError::NoDecimals);
        };
        Pricing::Priced(calculate_usd_value(amount, decimals, price))
    }

    /// Current USD price for `mint`, or `None` when no source has one.
    pub async fn price(&self, mint: &str) -> Option<f64> {
        let mint = alias_native_mint(mint);
        {
            let prices = self.prices.lock().unwrap();
            if let Some((price, cached_at)) = prices.get(mint) {
                if cached_at.elapsed() < PRICE_TTL {
                    return Some(*price);
                }
            }
        }

        let key = format!("price:solana:{mint}");
        if let Some(raw) = self.cache.get(&key).await {
            if let Ok(price) = raw.parse::<f64>() {
                self.remember_price(mint, price);
                return Some(price);
            }
        }

        let price = self.fetch_price(mint).await?;
        self.remember_price(mint, price);
        self.cache
            .set_ex(&key, &price.to_string(), PRICE_TTL.as_secs())
            .await;
        Some(price)
    }

    /// Decimals for `mint`, or `None` when no source knows them.
    pub async fn decimals(&self, mint: &str) -> Option<u8> {
        let mint = alias_native_mint(mint);
        if let Some(d) = self.decimals.lock().unwrap().get(mint).copied() {
            return Some(d);
        }

        let key = format!("decimals:solana:{mint}");
        if let Some(raw) = self.cache.get(&key).await {
            if let Ok(d) = raw.parse::<u8>() {
                self.remember_decimals(mint, d);
                return Some(d);
            }
        }

        if let Some(d) = known_decimals(mint) {
            self.remember_decimals(mint, d);
            self.cache.set(&key, &d.to_string()).await;
            return Some(d);
        }

        // On-chain fallback, at most one fetch per mint at a time.
        let gate = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(mint.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let guard = gate.lock().await;

        // Another waiter may have resolved the mint while we queued.
        let already_cached = self.decimals.lock().unwrap().get(mint).copied();
        if let Some(d) = already_cached {
            drop(guard);
            self.inflight.lock().await.remove(mint);
            return Some(d);
        }

        let fetched = self.fetch_onchain_decimals(mint).await;
        if let Some(d) = fetched {
            self.remember_decimals(mint, d);
            self.cache.set(&key, &d.to_string()).await;
        }

        drop(guard);
        self.inflight.lock().await.remove(mint);
        fetched
    }

    fn remember_price(&self, mint: &str, price: f64) {
        self.prices
            .lock()
            .unwrap()
            .insert(mint.to_string(), (price, Instant::now()));
    }

    fn remember_decimals(&self, mint: &str, decimals: u8) {
        self.decimals
            .lock()
            .unwrap()
            .insert(mint.to_string(), decimals);
    }

    async fn fetch_price(&self, mint: &str) -> Option<f64> {
        let mut delay = PRICE_RETRY_DELAY;
        let mut retries = 0;
        loop {
            let response = match self
                .http
                .get(&self.price_url)
                .query(&[("ids", mint)])
                .header("x-api-key", &self.api_key)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(mint, error = %e, "Price service request failed");
                    return None;
                }
            };

            if response.status() == StatusCode::TOO_MANY_REQUESTS {
                if retries >= PRICE_MAX_RETRIES {
                    warn!(mint, "Price service kept rate-limiting, giving up");
                    return None;
                }
                retries += 1;
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                continue;
            }

            if !response.status().is_success() {
                debug!(mint, status = %response.status(), "No price from service");
                return None;
            }

            let prices: HashMap<String, JupiterPrice> = match response.json().await {
                Ok(p) => p,
                Err(e) => {
                    warn!(mint, error = %e, "Failed to parse price response");
                    return None;
                }
            };
            return prices.get(mint).map(|p| p.usd_price);
        }
    }

    async fn fetch_onchain_decimals(&self, mint: &str) -> Option<u8> {
        let pubkey = Pubkey::from_str(mint).ok()?;
        match self.chain.get_account_data(&pubkey).await {
            Ok(data) if data.len() >= MIN_MINT_DATA_LEN => Some(data[MINT_DECIMALS_OFFSET]),
            Ok(data) => {
                warn!(mint, len = data.len(), "Mint account data too short");
                None
            }
            Err(e) => {
                warn!(mint, error = %e, "Failed to fetch mint account");
                None
            }
        }
    }
}
