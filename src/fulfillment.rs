//! USD valuation for fulfilled orders.
//!
//! A `Fulfilled` event carries no amount, so the resolver fetches the
//! original order's lite model from the DLN order API and values its take
//! side with the price oracle. The API is throttled to one request per
//! second with a single request in flight.

use async_trait::async_trait;
use num_bigint::BigUint;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SOLANA_CHAIN_ID;
use crate::events::Offer;
use crate::order::{Pricing, PricingError};
use crate::pricing::{PriceOracle, amount_from_be};
use crate::rpc::RateLimiter;
use crate::scanner::OrderPricer;

/// Total attempts per order lookup, including the first.
const MAX_RETRIES: usize = 10;
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(1000);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Deserialize)]
struct LiteModel {
    #[serde(rename = "takeOffer")]
    take_offer: TakeOffer,
}

#[derive(Deserialize)]
struct TakeOffer {
    #[serde(rename = "chainId")]
    chain_id: BigIntegerValue,
    #[serde(rename = "tokenAddress")]
    token_address: StringValue,
    amount: StringValue,
}

#[derive(Deserialize)]
struct BigIntegerValue {
    #[serde(rename = "bigIntegerValue")]
    big_integer_value: u64,
}

#[derive(Deserialize)]
struct StringValue {
    #[serde(rename = "stringValue")]
    string_value: String,
}

/// Prefix bare hex order ids with `0x` for the order API path.
fn normalize_order_id(order_id: &str) -> String {
    if order_id.starts_with("0x") {
        order_id.to_string()
    } else {
        format!("0x{order_id}")
    }
}

/// Extract the Solana take side of a lite model, or the pricing error that
/// ends the valuation.
fn take_side(lite: &LiteModel) -> Result<(String, BigUint), PricingError> {
    if lite.take_offer.chain_id.big_integer_value != SOLANA_CHAIN_ID {
        return Err(PricingError::NotSolana);
    }
    let amount = BigUint::parse_bytes(lite.take_offer.amount.string_value.as_bytes(), 10)
        .ok_or(PricingError::RequestFailed)?;
    Ok((lite.take_offer.token_address.string_value.clone(), amount))
}

/// Resolves fulfilled orders to USD via the DLN order API + price oracle.
pub struct FulfillmentResolver {
    http: reqwest::Client,
    api_url: String,
    limiter: RateLimiter,
    oracle: Arc<PriceOracle>,
}

impl FulfillmentResolver {
    pub fn new(api_url: String, oracle: Arc<PriceOracle>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            api_url,
            limiter: RateLimiter::new(1),
            oracle,
        }
    }

    /// Value the take side of `order_id_hex` in USD.
    pub async fn resolve(&self, order_id_hex: &str) -> Pricing {
        let order_id = normalize_order_id(order_id_hex);
        let lite = match self.fetch_lite_model(&order_id).await {
            Ok(lite) => lite,
            Err(e) => return Pricing::Failed(e),
        };

        let (token_address, amount) = match take_side(&lite) {
            Ok(side) => side,
            Err(e) => return Pricing::Failed(e),
        };

        self.oracle.usd_value(&token_address, &amount).await
    }

    async fn fetch_lite_model(&self, order_id: &str) -> Result<LiteModel, PricingError> {
        let url = format!("{}/api/Orders/{}/liteModel", self.api_url, order_id);
        let mut delay = INITIAL_RETRY_DELAY;

        for attempt in 1..=MAX_RETRIES {
            let response = {
                let _permit = self.limiter.acquire().await;
                self.http.get(&url).send().await
            };

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        if attempt == MAX_RETRIES {
                            return Err(PricingError::MaxRetriesExceeded);
                        }
                        debug!(order_id, attempt, delay = ?delay, "Order API rate-limited, retrying");
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2).min(MAX_RETRY_DELAY);
                        continue;
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Err(PricingError::OrderNotFound);
                    }
                    if !status.is_success() {
                        return Err(PricingError::ApiStatus(status.as_u16()));
                    }
                    return resp.json::<LiteModel>().await.map_err(|e| {
                        warn!(order_id, error = %e, "Failed to parse order lite model");
                        PricingError::RequestFailed
                    });
                }
                Err(e) => {
                    if attempt == MAX_RETRIES {
                        return Err(PricingError::RequestFailed);
                    }
                    warn!(order_id, attempt, error = %e, "Order API request failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2).min(MAX_RETRY_DELAY);
                }
            }
        }

        Err(PricingError::MaxRetriesExceeded)
    }
}

/// Live [`OrderPricer`]: oracle for created orders, order API + oracle for
/// fulfilled ones.
pub struct UsdPricer {
    oracle: Arc<PriceOracle>,
    resolver: FulfillmentResolver,
}

impl UsdPricer {
    pub fn new(oracle: Arc<PriceOracle>, resolver: FulfillmentResolver) -> Self {
        Self { oracle, resolver }
    }
}

#[async_trait]
impl OrderPricer for UsdPricer {
    async fn price_created(&self, give: &Offer) -> Pricing {
        // The scanner filters non-Solana give tokens before pricing.
        if give.token_address.len() != 32 {
            return Pricing::Failed(PricingError::NoPrice);
        }
        let mint = bs58::encode(&give.token_address).into_string();
        self.oracle
            .usd_value(&mint, &amount_from_be(&give.amount))
            .await
    }

    async fn price_fulfilled(&self, order_id_hex: &str) -> Pricing {
        self.resolver.resolve(order_id_hex).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::NATIVE_SOL_MINT;

    fn lite_model(json: &str) -> LiteModel {
        serde_json::from_str(json).expect("valid lite model")
    }

    #[test]
    fn normalizes_bare_hex_ids() {
        assert_eq!(normalize_order_id("de01"), "0xde01");
        assert_eq!(normalize_order_id("0xde01"), "0xde01");
    }

    #[test]
    fn parses_lite_model_fields() {
        let lite = lite_model(
            r#"{
                "orderId": {"stringValue": "0xde01"},
                "takeOffer": {
                    "chainId": {"bigIntegerValue": 7565164},
                    "tokenAddress": {"stringValue": "11111111111111111111111111111111"},
                    "amount": {"stringValue": "1000000000"}
                }
            }"#,
        );

        let (token, amount) = take_side(&lite).expect("solana take side");
        assert_eq!(token, NATIVE_SOL_MINT);
        assert_eq!(amount, BigUint::from(1_000_000_000u64));
    }

    #[test]
    fn non_solana_take_side_is_rejected() {
        let lite = lite_model(
            r#"{
                "takeOffer": {
                    "chainId": {"bigIntegerValue": 1},
                    "tokenAddress": {"stringValue": "0xdeadbeef"},
                    "amount": {"stringValue": "5"}
                }
            }"#,
        );

        assert_eq!(take_side(&lite).unwrap_err(), PricingError::NotSolana);
    }

    #[test]
    fn malformed_amount_is_request_failed() {
        let lite = lite_model(
            r#"{
                "takeOffer": {
                    "chainId": {"bigIntegerValue": 7565164},
                    "tokenAddress": {"stringValue": "11111111111111111111111111111111"},
                    "amount": {"stringValue": "not-a-number"}
                }
            }"#,
        );

        assert_eq!(take_side(&lite).unwrap_err(), PricingError::RequestFailed);
    }
}
