//! ClickHouse-backed analytics sink.
//!
//! Talks to the ClickHouse HTTP interface: inserts go in as `JSONEachRow`
//! batches into `orders`, reads come back as `JSONEachRow` from the
//! `daily_volumes_mv` rollup. The table deduplicates on
//! `(order_id, event_type)`, so re-inserting an order seen during a re-scan
//! is harmless; counting queries use `DISTINCT order_id` to stay exact
//! before background merges run.

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::order::{EnrichedOrder, OrderKind};

/// Filters for the daily volume rollup; all optional, composed with AND.
#[derive(Debug, Clone, Default)]
pub struct VolumeFilter {
    pub event_type: Option<OrderKind>,
    /// Inclusive lower date bound; anything longer than `YYYY-MM-DD` is
    /// truncated.
    pub from: Option<String>,
    /// Inclusive upper date bound.
    pub to: Option<String>,
}

/// One row of the daily rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyVolume {
    pub period: String,
    pub order_count: u64,
    pub volume_usd: f64,
}

/// Stored min/max dates; both empty when nothing is indexed yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateRange {
    pub from: String,
    pub to: String,
}

/// Write/read surface of the analytics store.
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// Append a batch of enriched orders.
    async fn insert(&self, orders: &[EnrichedOrder]) -> Result<()>;
    /// Distinct orders of one kind.
    async fn order_count(&self, kind: OrderKind) -> Result<u64>;
    /// Daily order counts and USD volumes, ascending by date.
    async fn daily_volume(&self, filter: &VolumeFilter) -> Result<Vec<DailyVolume>>;
    /// Stored min/max dates for default dashboard bounds.
    async fn default_range(&self) -> Result<DateRange>;
    async fn close(&self) -> Result<()>;
}

#[derive(Serialize)]
struct OrderRow<'a> {
    order_id: &'a str,
    tx_signature: &'a str,
    block_time: String,
    usd_value: Option<f64>,
    pricing_status: &'static str,
    pricing_error: Option<String>,
    event_type: &'static str,
}

/// `YYYY-MM-DD HH:MM:SS` UTC, ClickHouse `DateTime` literal form.
fn format_block_time(seconds: i64) -> String {
    chrono::DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "1970-01-01 00:00:00".to_string())
}

/// First 10 characters: a full timestamp string becomes its date part.
fn truncate_date(raw: &str) -> &str {
    raw.get(..10).unwrap_or(raw)
}

fn order_row(order: &EnrichedOrder) -> OrderRow<'_> {
    OrderRow {
        order_id: &order.order_id,
        tx_signature: &order.tx_signature,
        block_time: format_block_time(order.block_time),
        usd_value: order.pricing.usd_value(),
        pricing_status: order.pricing.status(),
        pricing_error: order.pricing.error_tag(),
        event_type: order.kind.as_str(),
    }
}

/// ClickHouse HTTP client implementing the sink.
pub struct ClickHouseSink {
    http: reqwest::Client,
    url: String,
    database: String,
    user: String,
    password: String,
}

impl ClickHouseSink {
    pub fn new(url: String, database: String, user: String, password: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");
        Self {
            http,
            url,
            database,
            user,
            password,
        }
    }

    /// Run one statement; `params` bind `{name:Type}` placeholders, `body`
    /// carries insert rows.
    async fn execute(
        &self,
        query: &str,
        params: &[(String, String)],
        body: Option<String>,
    ) -> Result<String> {
        let mut request = self
            .http
            .post(&self.url)
            .query(&[
                ("database", self.database.as_str()),
                ("query", query),
                // Plain numbers in JSON output, not quoted 64-bit strings.
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .header("X-ClickHouse-User", &self.user);
        if !self.password.is_empty() {
            request = request.header("X-ClickHouse-Key", &self.password);
        }
        for (name, value) in params {
            request = request.query(&[(format!("param_{name}"), value)]);
        }

        let response = request
            .body(body.unwrap_or_default())
            .send()
            .await
            .context("ClickHouse request failed")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read ClickHouse response")?;
        ensure!(
            status.is_success(),
            "ClickHouse returned {status}: {}",
            text.trim()
        );
        Ok(text)
    }

    fn parse_rows<T: for<'de> Deserialize<'de>>(text: &str) -> Result<Vec<T>> {
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Failed to parse ClickHouse row"))
            .collect()
    }
}

fn daily_volume_query(filter: &VolumeFilter) -> (String, Vec<(String, String)>) {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if let Some(kind) = filter.event_type {
        clauses.push("event_type = {event_type:String}");
        params.push(("event_type".to_string(), kind.as_str().to_string()));
    }
    if let Some(from) = &filter.from {
        clauses.push("date >= {from:Date}");
        params.push(("from".to_string(), truncate_date(from).to_string()));
    }
    if let Some(to) = &filter.to {
        clauses.push("date <= {to:Date}");
        params.push(("to".to_string(), truncate_date(to).to_string()));
    }

    let mut query = String::from(
        "SELECT toString(date) AS period, \
         sum(order_count) AS order_count, \
         sum(volume_usd) AS volume_usd \
         FROM daily_volumes_mv",
    );
    if !clauses.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&clauses.join(" AND "));
    }
    query.push_str(" GROUP BY date ORDER BY date FORMAT JSONEachRow");

    (query, params)
}

#[derive(Deserialize)]
struct RangeRow {
    min_date: String,
    max_date: String,
    total: u64,
}

#[async_trait]
impl AnalyticsSink for ClickHouseSink {
    async fn insert(&self, orders: &[EnrichedOrder]) -> Result<()> {
        if orders.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for order in orders {
            let line = serde_json::to_string(&order_row(order))
                .context("Failed to serialize order row")?;
            body.push_str(&line);
            body.push('\n');
        }
        self.execute(
            "INSERT INTO orders \
             (order_id, tx_signature, block_time, usd_value, pricing_status, pricing_error, event_type) \
             FORMAT JSONEachRow",
            &[],
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn order_count(&self, kind: OrderKind) -> Result<u64> {
        let text = self
            .execute(
                "SELECT count(DISTINCT order_id) FROM orders \
                 WHERE event_type = {event_type:String} FORMAT TabSeparated",
                &[("event_type".to_string(), kind.as_str().to_string())],
                None,
            )
            .await?;
        text.trim()
            .parse()
            .with_context(|| format!("unexpected count response: {text}"))
    }

    async fn daily_volume(&self, filter: &VolumeFilter) -> Result<Vec<DailyVolume>> {
        let (query, params) = daily_volume_query(filter);
        let text = self.execute(&query, &params, None).await?;
        Self::parse_rows(&text)
    }

    async fn default_range(&self) -> Result<DateRange> {
        let text = self
            .execute(
                "SELECT toString(min(date)) AS min_date, \
                 toString(max(date)) AS max_date, \
                 count() AS total \
                 FROM daily_volumes_mv FORMAT JSONEachRow",
                &[],
                None,
            )
            .await?;
        let rows: Vec<RangeRow> = Self::parse_rows(&text)?;
        Ok(match rows.first() {
            Some(row) if row.total > 0 => DateRange {
                from: row.min_date.clone(),
                to: row.max_date.clone(),
            },
            _ => DateRange {
                from: String::new(),
                to: String::new(),
            },
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MemorySink;
    use super::*;
    use crate::order::{Pricing, PricingError};

    fn order(id: &str, kind: OrderKind, pricing: Pricing) -> EnrichedOrder {
        EnrichedOrder {
            order_id: id.to_string(),
            tx_signature: "sig".to_string(),
            block_time: 1_700_000_000,
            pricing,
            kind,
        }
    }

    #[test]
    fn block_time_formats_as_utc_seconds() {
        assert_eq!(format_block_time(0), "1970-01-01 00:00:00");
        assert_eq!(format_block_time(1_700_000_000), "2023-11-14 22:13:20");
    }

    #[test]
    fn date_filters_truncate_to_ten_chars() {
        assert_eq!(truncate_date("2024-03-01T12:30:00Z"), "2024-03-01");
        assert_eq!(truncate_date("2024-03-01"), "2024-03-01");
        assert_eq!(truncate_date("short"), "short");
    }

    #[test]
    fn order_row_serialization_matches_columns() {
        let priced = order("de01", OrderKind::Created, Pricing::Priced(150.0));
        let json = serde_json::to_string(&order_row(&priced)).unwrap();
        assert_eq!(
            json,
            r#"{"order_id":"de01","tx_signature":"sig","block_time":"2023-11-14 22:13:20","usd_value":150.0,"pricing_status":"ok","pricing_error":null,"event_type":"created"}"#
        );

        let failed = order(
            "de02",
            OrderKind::Fulfilled,
            Pricing::Failed(PricingError::NotSolana),
        );
        let json = serde_json::to_string(&order_row(&failed)).unwrap();
        assert_eq!(
            json,
            r#"{"order_id":"de02","tx_signature":"sig","block_time":"2023-11-14 22:13:20","usd_value":null,"pricing_status":"error","pricing_error":"not_solana","event_type":"fulfilled"}"#
        );
    }

    #[test]
    fn daily_volume_query_composes_filters_with_and() {
        let (query, params) = daily_volume_query(&VolumeFilter::default());
        assert!(!query.contains("WHERE"));
        assert!(params.is_empty());

        let filter = VolumeFilter {
            event_type: Some(OrderKind::Created),
            from: Some("2024-01-01T00:00:00".to_string()),
            to: Some("2024-02-01".to_string()),
        };
        let (query, params) = daily_volume_query(&filter);
        assert!(query.contains(
            "WHERE event_type = {event_type:String} AND date >= {from:Date} AND date <= {to:Date}"
        ));
        assert_eq!(
            params,
            vec![
                ("event_type".to_string(), "created".to_string()),
                ("from".to_string(), "2024-01-01".to_string()),
                ("to".to_string(), "2024-02-01".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_insert_counts_once() {
        let sink = MemorySink::shared();
        let o = order("de01", OrderKind::Created, Pricing::Priced(1.0));
        sink.insert(std::slice::from_ref(&o)).await.unwrap();
        sink.insert(std::slice::from_ref(&o)).await.unwrap();
        assert_eq!(sink.order_count(OrderKind::Created).await.unwrap(), 1);
        assert_eq!(sink.order_count(OrderKind::Fulfilled).await.unwrap(), 0);
    }

    #[test]
    fn rows_parse_from_json_each_row() {
        let text = "{\"period\":\"2024-01-01\",\"order_count\":3,\"volume_usd\":10.5}\n\
                    {\"period\":\"2024-01-02\",\"order_count\":1,\"volume_usd\":2.0}\n";
        let rows: Vec<DailyVolume> = ClickHouseSink::parse_rows(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].period, "2024-01-01");
        assert_eq!(rows[1].order_count, 1);
    }
}
