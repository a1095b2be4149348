//! Application configuration loaded from environment variables.
//!
//! Required: `JUPITER_API_KEY`
//! Optional: `SOLANA_RPC_URL`, `SOLANA_RPS`, `CLICKHOUSE_HOST`,
//! `CLICKHOUSE_DATABASE`, `CLICKHOUSE_USER`, `CLICKHOUSE_PASSWORD`,
//! `REDIS_URL`, `INDEXER_BATCH_SIZE`, `INDEXER_DELAY_MS`, `HTTP_PORT`,
//! `INDEXER_TARGET_ORDERS`, `LOG_LEVEL`

use anyhow::{Context, Result};
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

/// DLN source program — emits `CreatedOrder` / `CreatedOrderId` events.
pub const SRC_PROGRAM: &str = "src5qyZHqTqecJV4aY6Cb6zDZLMDzrDKKezs22MPHr4";
/// DLN destination program — emits `Fulfilled` events.
pub const DST_PROGRAM: &str = "dst5MGcFPoBeREFAA5E3tU5ij8m5uVYwkzkSAbsLbNo";
/// DLN chain identifier for Solana.
pub const SOLANA_CHAIN_ID: u64 = 7565164;

/// Jupiter price API base.
pub const JUPITER_PRICE_URL: &str = "https://api.jup.ag/price/v3";
/// DLN order API base.
pub const DLN_API_URL: &str = "https://dln-api.debridge.finance";

/// Application configuration for the DLN indexer.
///
/// Loaded once at startup via [`AppConfig::from_env`] and cheaply cloned
/// across async tasks.
#[derive(Clone)]
pub struct AppConfig {
    /// Solana JSON-RPC endpoint (HTTP).
    pub rpc_url: String,
    /// Chain RPC budget in requests per second.
    pub rps: u32,
    /// ClickHouse HTTP endpoint.
    pub clickhouse_host: String,
    pub clickhouse_database: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
    /// Redis endpoint for checkpoints and the shared price cache.
    pub redis_url: String,
    /// Signature page size per scanner pass.
    pub batch_size: usize,
    /// Idle sleep between empty scanner passes, in milliseconds.
    pub delay_ms: u64,
    /// API key sent to the Jupiter price service.
    pub jupiter_api_key: String,
    /// Port for the probe / read HTTP server.
    pub http_port: u16,
    /// Optional stop bound: exit once both order kinds reach this count.
    pub target_orders: Option<u64>,
    /// Parsed source program address.
    pub src_program: Pubkey,
    /// Parsed destination program address.
    pub dst_program: Pubkey,
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {name}: {raw}")),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Returns a descriptive error if any required variable is missing or invalid.
    pub fn from_env() -> Result<Self> {
        let rpc_url =
            std::env::var("SOLANA_RPC_URL").unwrap_or_else(|_| "http://127.0.0.1:8899".into());
        let rps = env_or("SOLANA_RPS", 10u32)?;

        let clickhouse_host =
            std::env::var("CLICKHOUSE_HOST").unwrap_or_else(|_| "http://127.0.0.1:8123".into());
        let clickhouse_database =
            std::env::var("CLICKHOUSE_DATABASE").unwrap_or_else(|_| "default".into());
        let clickhouse_user = std::env::var("CLICKHOUSE_USER").unwrap_or_else(|_| "default".into());
        let clickhouse_password = std::env::var("CLICKHOUSE_PASSWORD").unwrap_or_default();

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let batch_size = env_or("INDEXER_BATCH_SIZE", 50usize)?;
        let delay_ms = env_or("INDEXER_DELAY_MS", 10_000u64)?;

        let jupiter_api_key =
            std::env::var("JUPITER_API_KEY").context("JUPITER_API_KEY env var must be set")?;

        let http_port = env_or("HTTP_PORT", 8080u16)?;

        let target_orders = match std::env::var("INDEXER_TARGET_ORDERS") {
            Ok(raw) => Some(
                raw.parse()
                    .with_context(|| format!("invalid INDEXER_TARGET_ORDERS: {raw}"))?,
            ),
            Err(_) => None,
        };

        let src_program = Pubkey::from_str(SRC_PROGRAM)
            .map_err(|e| anyhow::anyhow!("invalid source program address: {e}"))?;
        let dst_program = Pubkey::from_str(DST_PROGRAM)
            .map_err(|e| anyhow::anyhow!("invalid destination program address: {e}"))?;

        anyhow::ensure!(
            batch_size > 0 && batch_size <= 1000,
            "INDEXER_BATCH_SIZE must be within 1..=1000"
        );
        anyhow::ensure!(rps > 0, "SOLANA_RPS must be positive");

        Ok(Self {
            rpc_url,
            rps,
            clickhouse_host,
            clickhouse_database,
            clickhouse_user,
            clickhouse_password,
            redis_url,
            batch_size,
            delay_ms,
            jupiter_api_key,
            http_port,
            target_orders,
            src_program,
            dst_program,
        })
    }
}
