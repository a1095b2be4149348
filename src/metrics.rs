//! Process metrics for the DLN indexer.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::info;

use crate::order::OrderKind;

/// Aggregated indexing metrics, shared by both scanners and the HTTP probes.
pub struct Metrics {
    /// Total signatures pulled through either scanner.
    pub signatures_processed: AtomicU64,
    /// Created-order rows written to the sink.
    pub orders_created: AtomicU64,
    /// Fulfilled-order rows written to the sink.
    pub orders_fulfilled: AtomicU64,
    /// Rows persisted with a pricing error tag.
    pub pricing_failures: AtomicU64,
    /// Scanner passes that errored and backed off.
    pub scan_errors: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            signatures_processed: AtomicU64::new(0),
            orders_created: AtomicU64::new(0),
            orders_fulfilled: AtomicU64::new(0),
            pricing_failures: AtomicU64::new(0),
            scan_errors: AtomicU64::new(0),
        }
    }

    pub fn record_signature(&self) {
        self.signatures_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_order(&self, kind: OrderKind, priced: bool) {
        match kind {
            OrderKind::Created => self.orders_created.fetch_add(1, Ordering::Relaxed),
            OrderKind::Fulfilled => self.orders_fulfilled.fetch_add(1, Ordering::Relaxed),
        };
        if !priced {
            self.pricing_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_scan_error(&self) {
        self.scan_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "signatures_processed": self.signatures_processed.load(Ordering::Relaxed),
            "orders_created": self.orders_created.load(Ordering::Relaxed),
            "orders_fulfilled": self.orders_fulfilled.load(Ordering::Relaxed),
            "pricing_failures": self.pricing_failures.load(Ordering::Relaxed),
            "scan_errors": self.scan_errors.load(Ordering::Relaxed),
        })
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Chain RPC methods tracked per 60-second window.
#[derive(Debug, Clone, Copy)]
pub enum RpcMethod {
    ListSignatures,
    GetTransaction,
    GetAccount,
}

impl RpcMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RpcMethod::ListSignatures => "getSignaturesForAddress",
            RpcMethod::GetTransaction => "getTransaction",
            RpcMethod::GetAccount => "getAccountInfo",
        }
    }
}

#[derive(Default)]
struct MethodWindow {
    calls: AtomicU64,
    errors: AtomicU64,
    latency_ms: AtomicU64,
}

impl MethodWindow {
    fn record(&self, latency: Duration, ok: bool) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn take(&self) -> (u64, u64, u64) {
        (
            self.calls.swap(0, Ordering::Relaxed),
            self.errors.swap(0, Ordering::Relaxed),
            self.latency_ms.swap(0, Ordering::Relaxed),
        )
    }
}

/// Per-method chain RPC counters, reset and logged every window.
#[derive(Default)]
pub struct RpcMetrics {
    list_signatures: MethodWindow,
    get_transaction: MethodWindow,
    get_account: MethodWindow,
}

/// How often the RPC window is logged and reset.
pub const RPC_WINDOW: Duration = Duration::from_secs(60);

impl RpcMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn window(&self, method: RpcMethod) -> &MethodWindow {
        match method {
            RpcMethod::ListSignatures => &self.list_signatures,
            RpcMethod::GetTransaction => &self.get_transaction,
            RpcMethod::GetAccount => &self.get_account,
        }
    }

    pub fn record(&self, method: RpcMethod, latency: Duration, ok: bool) {
        self.window(method).record(latency, ok);
    }

    /// Log the current window for each method, then reset the counters.
    pub fn log_and_reset(&self) {
        for method in [
            RpcMethod::ListSignatures,
            RpcMethod::GetTransaction,
            RpcMethod::GetAccount,
        ] {
            let (calls, errors, latency_ms) = self.window(method).take();
            if calls == 0 {
                continue;
            }
            info!(
                method = method.as_str(),
                calls,
                errors,
                avg_latency_ms = latency_ms / calls,
                "RPC window"
            );
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let snapshot = |w: &MethodWindow| {
            serde_json::json!({
                "calls": w.calls.load(Ordering::Relaxed),
                "errors": w.errors.load(Ordering::Relaxed),
                "latency_ms": w.latency_ms.load(Ordering::Relaxed),
            })
        };
        serde_json::json!({
            "getSignaturesForAddress": snapshot(&self.list_signatures),
            "getTransaction": snapshot(&self.get_transaction),
            "getAccountInfo": snapshot(&self.get_account),
        })
    }
}

/// Background task logging and resetting the RPC window every 60 s.
pub fn spawn_rpc_window_logger(metrics: Arc<RpcMetrics>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(RPC_WINDOW);
        // The first tick fires immediately; skip it so the first log covers
        // a full window.
        tick.tick().await;
        loop {
            tick.tick().await;
            metrics.log_and_reset();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_counters_track_kind_and_failures() {
        let m = Metrics::new();
        m.record_order(OrderKind::Created, true);
        m.record_order(OrderKind::Fulfilled, false);
        assert_eq!(m.orders_created.load(Ordering::Relaxed), 1);
        assert_eq!(m.orders_fulfilled.load(Ordering::Relaxed), 1);
        assert_eq!(m.pricing_failures.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn rpc_window_take_resets() {
        let m = RpcMetrics::new();
        m.record(RpcMethod::GetTransaction, Duration::from_millis(20), true);
        m.record(RpcMethod::GetTransaction, Duration::from_millis(40), false);
        let (calls, errors, latency) = m.get_transaction.take();
        assert_eq!((calls, errors, latency), (2, 1, 60));
        let (calls, _, _) = m.get_transaction.take();
        assert_eq!(calls, 0);
    }
}
