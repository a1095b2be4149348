//! Enriched-order model shared by the scanners and the analytics sink.

use std::fmt;

/// Which side of the protocol an order row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Created,
    Fulfilled,
}

impl OrderKind {
    /// Value stored in the `event_type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderKind::Created => "created",
            OrderKind::Fulfilled => "fulfilled",
        }
    }
}

/// Terminal failure of a USD-valuation attempt.
///
/// These are not scanner errors: an order carrying one of these tags is
/// still persisted, with a null `usd_value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PricingError {
    /// The take side of a fulfilled order settles on another chain.
    NotSolana,
    /// The price service has no quote for the mint.
    NoPrice,
    /// The mint's decimals could not be established anywhere.
    NoDecimals,
    /// The order API returned 404 for this order id.
    OrderNotFound,
    /// The order API returned an unexpected status.
    ApiStatus(u16),
    /// The order API request failed in transport.
    RequestFailed,
    /// The order API kept rate-limiting until the retry budget ran out.
    MaxRetriesExceeded,
}

impl PricingError {
    pub fn tag(&self) -> String {
        match self {
            PricingError::NotSolana => "not_solana".into(),
            PricingError::NoPrice => "no_price".into(),
            PricingError::NoDecimals => "no_decimals".into(),
            PricingError::OrderNotFound => "order_not_found".into(),
            PricingError::ApiStatus(code) => format!("api_status_{code}"),
            PricingError::RequestFailed => "request_failed".into(),
            PricingError::MaxRetriesExceeded => "max_retries_exceeded".into(),
        }
    }
}

impl fmt::Display for PricingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Outcome of valuing one order in USD.
#[derive(Debug, Clone, PartialEq)]
pub enum Pricing {
    Priced(f64),
    Failed(PricingError),
}

impl Pricing {
    /// Value for the nullable `usd_value` column.
    pub fn usd_value(&self) -> Option<f64> {
        match self {
            Pricing::Priced(v) => Some(*v),
            Pricing::Failed(_) => None,
        }
    }

    /// Value for the `pricing_status` column.
    pub fn status(&self) -> &'static str {
        match self {
            Pricing::Priced(_) => "ok",
            Pricing::Failed(_) => "error",
        }
    }

    /// Value for the nullable `pricing_error` column.
    pub fn error_tag(&self) -> Option<String> {
        match self {
            Pricing::Priced(_) => None,
            Pricing::Failed(e) => Some(e.tag()),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Pricing::Priced(_))
    }
}

/// One persisted order row.
#[derive(Debug, Clone)]
pub struct EnrichedOrder {
    /// 64-char lowercase hex order id.
    pub order_id: String,
    pub tx_signature: String,
    /// Seconds since epoch, UTC.
    pub block_time: i64,
    pub pricing: Pricing,
    pub kind: OrderKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_pricing_has_value_and_no_tag() {
        let p = Pricing::Priced(150.0);
        assert_eq!(p.status(), "ok");
        assert_eq!(p.usd_value(), Some(150.0));
        assert_eq!(p.error_tag(), None);
    }

    #[test]
    fn failed_pricing_has_tag_and_no_value() {
        let p = Pricing::Failed(PricingError::NoDecimals);
        assert_eq!(p.status(), "error");
        assert_eq!(p.usd_value(), None);
        assert_eq!(p.error_tag().as_deref(), Some("no_decimals"));
    }

    #[test]
    fn api_status_tag_carries_code() {
        assert_eq!(PricingError::ApiStatus(503).tag(), "api_status_503");
        assert_eq!(PricingError::OrderNotFound.tag(), "order_not_found");
        assert_eq!(PricingError::MaxRetriesExceeded.tag(), "max_retries_exceeded");
    }

    #[test]
    fn event_type_labels() {
        assert_eq!(OrderKind::Created.as_str(), "created");
        assert_eq!(OrderKind::Fulfilled.as_str(), "fulfilled");
    }
}
