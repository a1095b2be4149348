//! Bidirectional signature scanner for one DLN program.
//!
//! Each pass pulls the signatures strictly newer than the checkpoint's `to`
//! boundary (oldest-first) and, when that forward page is not full, one page
//! older than `from` as backfill. Every processed signature advances the
//! matching window boundary, and enriched orders are persisted before the
//! window moves so a crash never acknowledges unpersisted work.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::analytics::AnalyticsSink;
use crate::checkpoint::{CheckpointStore, SignatureWindow, WindowBound};
use crate::events::{Offer, decode_events, fulfilled_orders, paired_created_orders};
use crate::metrics::Metrics;
use crate::order::{EnrichedOrder, OrderKind, Pricing};
use crate::rpc::{ChainApi, SignatureInfo};

/// USD valuation seam consumed by the scanner; implemented over the price
/// oracle and the fulfillment resolver, substituted in tests.
#[async_trait]
pub trait OrderPricer: Send + Sync {
    /// Value the give side of a freshly created order.
    async fn price_created(&self, give: &Offer) -> Pricing;
    /// Value a fulfilled order by its hex id.
    async fn price_fulfilled(&self, order_id_hex: &str) -> Pricing;
}

/// Which window boundary a processed signature advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Shared services a scanner operates on.
#[derive(Clone)]
pub struct ScannerContext {
    pub chain: Arc<dyn ChainApi>,
    pub pricer: Arc<dyn OrderPricer>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub sink: Arc<dyn AnalyticsSink>,
    pub metrics: Arc<Metrics>,
}

/// Scanner for one program. `src` indexes created orders, `dst` fulfilled
/// ones; both share the same loop.
pub struct Scanner {
    name: &'static str,
    program: Pubkey,
    kind: OrderKind,
    ctx: ScannerContext,
    batch_size: usize,
    delay: Duration,
    stop: watch::Receiver<bool>,
}

impl Scanner {
    pub fn new(
        name: &'static str,
        program: Pubkey,
        kind: OrderKind,
        ctx: ScannerContext,
        batch_size: usize,
        delay: Duration,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name,
            program,
            kind,
            ctx,
            batch_size,
            delay,
            stop,
        }
    }

    /// Run until the stop signal fires. No pass error is fatal.
    pub async fn run(mut self) {
        info!(scanner = self.name, program = %self.program, "Scanner starting");

        let mut window = loop {
            if self.stopped() {
                return;
            }
            match self.ctx.checkpoints.get(self.name).await {
                Ok(window) => break window,
                Err(e) => {
                    error!(scanner = self.name, error = %e, "Failed to load checkpoint, retrying");
                    if self.sleep_or_stop(self.delay).await {
                        return;
                    }
                }
            }
        };

        match &window {
            Some(w) => info!(
                scanner = self.name,
                from = %w.from.signature,
                to = %w.to.signature,
                "Resuming from checkpoint"
            ),
            None => info!(scanner = self.name, "No checkpoint, starting from chain head"),
        }

        loop {
            if self.stopped() {
                break;
            }
            match self.run_pass(&mut window).await {
                Ok(0) => {
                    if self.sleep_or_stop(self.delay).await {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.ctx.metrics.record_scan_error();
                    error!(scanner = self.name, error = %e, "Scan pass failed");
                    if self.sleep_or_stop(self.delay * 2).await {
                        break;
                    }
                }
            }
        }

        info!(scanner = self.name, "Scanner stopped");
    }

    fn stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep for `delay`, returning early with `true` on stop.
    async fn sleep_or_stop(&mut self, delay: Duration) -> bool {
        let sender_gone = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            changed = self.stop.changed() => changed.is_err(),
        };
        sender_gone || self.stopped()
    }

    /// One forward pass plus optional backward backfill. Returns how many
    /// signatures were processed.
    async fn run_pass(&self, window: &mut Option<SignatureWindow>) -> Result<usize> {
        let forward = self.collect_forward(window.as_ref()).await?;
        let forward_len = forward.len();
        let mut processed = 0;

        for sig in &forward {
            if self.stopped() {
                return Ok(processed);
            }
            self.process_signature(sig, Direction::Forward, window).await?;
            processed += 1;
        }

        // Steady state: the head is caught up, spend the rest of the pass
        // backfilling history older than `from`.
        if forward_len < self.batch_size && !self.stopped() {
            if let Some(w) = window.clone() {
                let page = self
                    .ctx
                    .chain
                    .list_signatures(
                        &self.program,
                        self.batch_size,
                        Some(&w.from.signature),
                        None,
                    )
                    .await?;
                for sig in &page {
                    if self.stopped() {
                        return Ok(processed);
                    }
                    self.process_signature(sig, Direction::Backward, window).await?;
                    processed += 1;
                }
            }
        }

        Ok(processed)
    }

    /// Signatures strictly newer than the window head, oldest-first.
    async fn collect_forward(
        &self,
        window: Option<&SignatureWindow>,
    ) -> Result<Vec<SignatureInfo>> {
        let Some(w) = window else {
            let mut page = self
                .ctx
                .chain
                .list_signatures(&self.program, self.batch_size, None, None)
                .await?;
            page.reverse();
            return Ok(page);
        };

        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .ctx
                .chain
                .list_signatures(
                    &self.program,
                    self.batch_size,
                    cursor.as_deref(),
                    Some(&w.to.signature),
                )
                .await?;
            let page_len = page.len();

            // Keep only what is strictly newer than the window head.
            if let Some(pos) = page.iter().position(|s| s.signature == w.to.signature) {
                collected.extend(page.into_iter().take(pos));
                break;
            }
            cursor = page.last().map(|s| s.signature.clone());
            collected.extend(page);
            if page_len < self.batch_size {
                break;
            }
        }

        collected.reverse();
        Ok(collected)
    }

    async fn process_signature(
        &self,
        sig: &SignatureInfo,
        direction: Direction,
        window: &mut Option<SignatureWindow>,
    ) -> Result<()> {
        if sig.err.is_some() {
            debug!(scanner = self.name, signature = %sig.signature, "Skipping failed transaction");
        } else {
            match self.ctx.chain.get_transaction(&sig.signature).await? {
                Some(tx) => {
                    self.index_events(&tx.log_messages, sig, tx.block_time).await?;
                }
                None => {
                    debug!(scanner = self.name, signature = %sig.signature, "Transaction not found, skipping");
                }
            }
        }

        self.ctx.metrics.record_signature();
        self.advance_window(sig, direction, window).await
    }

    async fn index_events(
        &self,
        logs: &[String],
        sig: &SignatureInfo,
        block_time: Option<i64>,
    ) -> Result<()> {
        let events = decode_events(logs, &self.program);
        if events.is_empty() {
            return Ok(());
        }
        let block_time = block_time
            .or(sig.block_time)
            .unwrap_or_else(|| Utc::now().timestamp());

        match self.kind {
            OrderKind::Created => {
                for created in paired_created_orders(&events) {
                    if created.give.token_address.len() != 32 {
                        warn!(
                            scanner = self.name,
                            signature = %sig.signature,
                            "Give token is not a Solana mint, skipping order"
                        );
                        continue;
                    }
                    let pricing = self.ctx.pricer.price_created(&created.give).await;
                    self.persist(hex::encode(created.order_id), sig, block_time, pricing)
                        .await?;
                }
            }
            OrderKind::Fulfilled => {
                for (order_id, _taker) in fulfilled_orders(&events) {
                    let order_id = hex::encode(order_id);
                    let pricing = self.ctx.pricer.price_fulfilled(&order_id).await;
                    self.persist(order_id, sig, block_time, pricing).await?;
                }
            }
        }
        Ok(())
    }

    async fn persist(
        &self,
        order_id: String,
        sig: &SignatureInfo,
        block_time: i64,
        pricing: Pricing,
    ) -> Result<()> {
        let priced = pricing.is_ok();
        let order = EnrichedOrder {
            order_id,
            tx_signature: sig.signature.clone(),
            block_time,
            pricing,
            kind: self.kind,
        };

        match order.pricing.usd_value() {
            Some(usd_value) => info!(
                scanner = self.name,
                order_id = %order.order_id,
                usd_value,
                "Indexed order"
            ),
            None => info!(
                scanner = self.name,
                order_id = %order.order_id,
                pricing_error = order.pricing.error_tag().as_deref().unwrap_or(""),
                "Indexed order without price"
            ),
        }

        self.ctx.sink.insert(std::slice::from_ref(&order)).await?;
        self.ctx.metrics.record_order(self.kind, priced);
        Ok(())
    }

    async fn advance_window(
        &self,
        sig: &SignatureInfo,
        direction: Direction,
        window: &mut Option<SignatureWindow>,
    ) -> Result<()> {
        let bound = WindowBound {
            signature: sig.signature.clone(),
            block_time: sig.block_time.unwrap_or_else(|| Utc::now().timestamp()),
        };

        let next = match window.as_ref() {
            None => SignatureWindow {
                from: bound.clone(),
                to: bound,
            },
            Some(current) => {
                let mut next = current.clone();
                match direction {
                    Direction::Forward => next.to = bound,
                    Direction::Backward => next.from = bound,
                }
                next
            }
        };

        self.ctx.checkpoints.set(self.name, &next).await?;
        *window = Some(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::test_support::MemorySink;
    use crate::analytics::{DailyVolume, DateRange, VolumeFilter};
    use crate::checkpoint::test_support::MemoryCheckpoints;
    use crate::events::test_support::{data_line, encode_order_body, framed, sample_order_body};
    use crate::events::Offer;
    use crate::order::PricingError;
    use crate::rpc::TransactionLogs;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ScriptedChain {
        pages: Mutex<VecDeque<Vec<SignatureInfo>>>,
        list_calls: Mutex<Vec<(Option<String>, Option<String>)>>,
        txs: Mutex<HashMap<String, TransactionLogs>>,
        tx_fetches: AtomicU64,
    }

    impl ScriptedChain {
        fn new(pages: Vec<Vec<SignatureInfo>>) -> Arc<Self> {
            Arc::new(Self {
                pages: Mutex::new(pages.into()),
                list_calls: Mutex::new(Vec::new()),
                txs: Mutex::new(HashMap::new()),
                tx_fetches: AtomicU64::new(0),
            })
        }

        fn with_logs(self: Arc<Self>, signature: &str, logs: Vec<String>, block_time: i64) -> Arc<Self> {
            self.txs.lock().unwrap().insert(
                signature.to_string(),
                TransactionLogs {
                    block_time: Some(block_time),
                    log_messages: logs,
                },
            );
            self
        }

        fn list_calls(&self) -> Vec<(Option<String>, Option<String>)> {
            self.list_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChainApi for ScriptedChain {
        async fn list_signatures(
            &self,
            _program: &Pubkey,
            _limit: usize,
            before: Option<&str>,
            until: Option<&str>,
        ) -> Result<Vec<SignatureInfo>> {
            self.list_calls
                .lock()
                .unwrap()
                .push((before.map(String::from), until.map(String::from)));
            Ok(self.pages.lock().unwrap().pop_front().unwrap_or_default())
        }

        async fn get_transaction(&self, signature: &str) -> Result<Option<TransactionLogs>> {
            self.tx_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(Some(
                self.txs
                    .lock()
                    .unwrap()
                    .get(signature)
                    .cloned()
                    .unwrap_or(TransactionLogs {
                        block_time: None,
                        log_messages: vec![],
                    }),
            ))
        }

        async fn get_account_data(&self, _pubkey: &Pubkey) -> Result<Vec<u8>> {
            anyhow::bail!("not used by the scanner")
        }
    }

    struct FixedPricer {
        result: Pricing,
        created_calls: Mutex<Vec<Offer>>,
        fulfilled_calls: Mutex<Vec<String>>,
    }

    impl FixedPricer {
        fn new(result: Pricing) -> Arc<Self> {
            Arc::new(Self {
                result,
                created_calls: Mutex::new(Vec::new()),
                fulfilled_calls: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl OrderPricer for FixedPricer {
        async fn price_created(&self, give: &Offer) -> Pricing {
            self.created_calls.lock().unwrap().push(give.clone());
            self.result.clone()
        }

        async fn price_fulfilled(&self, order_id_hex: &str) -> Pricing {
            self.fulfilled_calls
                .lock()
                .unwrap()
                .push(order_id_hex.to_string());
            self.result.clone()
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AnalyticsSink for FailingSink {
        async fn insert(&self, _orders: &[EnrichedOrder]) -> Result<()> {
            anyhow::bail!("analytics store unavailable")
        }
        async fn order_count(&self, _kind: OrderKind) -> Result<u64> {
            Ok(0)
        }
        async fn daily_volume(&self, _filter: &VolumeFilter) -> Result<Vec<DailyVolume>> {
            Ok(vec![])
        }
        async fn default_range(&self) -> Result<DateRange> {
            Ok(DateRange {
                from: String::new(),
                to: String::new(),
            })
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn sig(signature: &str, block_time: i64) -> SignatureInfo {
        SignatureInfo {
            signature: signature.to_string(),
            slot: block_time as u64,
            block_time: Some(block_time),
            err: None,
        }
    }

    fn window(from: (&str, i64), to: (&str, i64)) -> SignatureWindow {
        SignatureWindow {
            from: WindowBound {
                signature: from.0.to_string(),
                block_time: from.1,
            },
            to: WindowBound {
                signature: to.0.to_string(),
                block_time: to.1,
            },
        }
    }

    struct Harness {
        scanner: Scanner,
        chain: Arc<ScriptedChain>,
        sink: Arc<MemorySink>,
        checkpoints: Arc<MemoryCheckpoints>,
        pricer: Arc<FixedPricer>,
        _stop: watch::Sender<bool>,
    }

    fn harness(kind: OrderKind, chain: Arc<ScriptedChain>, pricing: Pricing) -> Harness {
        let sink = MemorySink::shared();
        let checkpoints = MemoryCheckpoints::shared();
        let pricer = FixedPricer::new(pricing);
        let (stop, rx) = watch::channel(false);

        let scanner = Scanner::new(
            "src",
            Pubkey::new_unique(),
            kind,
            ScannerContext {
                chain: chain.clone(),
                pricer: pricer.clone(),
                checkpoints: checkpoints.clone(),
                sink: sink.clone(),
                metrics: Arc::new(Metrics::new()),
            },
            50,
            Duration::from_millis(10),
            rx,
        );

        Harness {
            scanner,
            chain,
            sink,
            checkpoints,
            pricer,
            _stop: stop,
        }
    }

    #[tokio::test]
    async fn forward_steady_state_advances_to() {
        // Window head is B@200; the node returns the two newer signatures.
        let chain = ScriptedChain::new(vec![vec![sig("D", 400), sig("C", 300)]]);
        let h = harness(OrderKind::Created, chain, Pricing::Priced(1.0));

        let mut w = Some(window(("A", 100), ("B", 200)));
        let processed = h.scanner.run_pass(&mut w).await.unwrap();

        assert_eq!(processed, 2);
        assert_eq!(w, Some(window(("A", 100), ("D", 400))));

        // Forward page was until-bounded by the head, then one backfill page.
        assert_eq!(
            h.chain.list_calls(),
            vec![
                (None, Some("B".to_string())),
                (Some("A".to_string()), None),
            ]
        );

        // C was processed before D.
        let tos: Vec<String> = h
            .checkpoints
            .writes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, w)| w.to.signature.clone())
            .collect();
        assert_eq!(tos, vec!["C".to_string(), "D".to_string()]);
    }

    #[tokio::test]
    async fn backward_backfill_advances_from() {
        // Forward pass is empty; the backfill page is older than A.
        let chain = ScriptedChain::new(vec![vec![], vec![sig("Z", 50), sig("Y", 40)]]);
        let h = harness(OrderKind::Created, chain, Pricing::Priced(1.0));

        let mut w = Some(window(("A", 100), ("B", 200)));
        let processed = h.scanner.run_pass(&mut w).await.unwrap();

        assert_eq!(processed, 2);
        assert_eq!(w, Some(window(("Y", 40), ("B", 200))));

        let froms: Vec<String> = h
            .checkpoints
            .writes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, w)| w.from.signature.clone())
            .collect();
        assert_eq!(froms, vec!["Z".to_string(), "Y".to_string()]);
    }

    #[tokio::test]
    async fn cold_start_processes_newest_page_oldest_first() {
        let chain = ScriptedChain::new(vec![
            vec![sig("C", 300), sig("B", 200), sig("A", 100)],
            vec![],
        ]);
        let h = harness(OrderKind::Created, chain, Pricing::Priced(1.0));

        let mut w = None;
        h.scanner.run_pass(&mut w).await.unwrap();

        assert_eq!(w, Some(window(("A", 100), ("C", 300))));
        // The first processed signature seeds both boundaries.
        let first = &h.checkpoints.writes.lock().unwrap()[0].1;
        assert_eq!(first.from.signature, "A");
        assert_eq!(first.to.signature, "A");
    }

    #[tokio::test]
    async fn forward_pagination_follows_before_cursor() {
        let chain = ScriptedChain::new(vec![
            vec![sig("E", 500), sig("D", 400)],
            vec![sig("C", 300)],
            vec![],
        ]);
        let mut h = harness(OrderKind::Created, chain, Pricing::Priced(1.0));
        h.scanner.batch_size = 2;

        let mut w = Some(window(("A", 100), ("B", 200)));
        h.scanner.run_pass(&mut w).await.unwrap();

        assert_eq!(w, Some(window(("A", 100), ("E", 500))));
        assert_eq!(
            h.chain.list_calls(),
            vec![
                (None, Some("B".to_string())),
                (Some("D".to_string()), Some("B".to_string())),
                (Some("A".to_string()), None),
            ]
        );
    }

    #[tokio::test]
    async fn full_forward_page_skips_backfill() {
        let chain = ScriptedChain::new(vec![vec![sig("D", 400), sig("C", 300)]]);
        let mut h = harness(OrderKind::Created, chain, Pricing::Priced(1.0));
        h.scanner.batch_size = 2;

        let mut w = Some(window(("A", 100), ("B", 200)));
        h.scanner.run_pass(&mut w).await.unwrap();

        // The full first page keeps pagination on the forward cursor; no
        // backfill request (before = "A") is issued.
        assert_eq!(
            h.chain.list_calls(),
            vec![
                (None, Some("B".to_string())),
                (Some("C".to_string()), Some("B".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn failed_transaction_advances_window_without_decoding() {
        let mut errored = sig("C", 300);
        errored.err = Some("InstructionError".to_string());
        let chain = ScriptedChain::new(vec![vec![errored], vec![]]);
        let h = harness(OrderKind::Created, chain, Pricing::Priced(1.0));

        let mut w = Some(window(("A", 100), ("B", 200)));
        h.scanner.run_pass(&mut w).await.unwrap();

        assert_eq!(w.as_ref().unwrap().to.signature, "C");
        assert_eq!(h.chain.tx_fetches.load(Ordering::SeqCst), 0);
        assert!(h.sink.orders().is_empty());
    }

    #[tokio::test]
    async fn created_order_is_enriched_and_persisted() {
        let program = Pubkey::new_unique();
        let give = Offer {
            chain_id: [0u8; 32],
            token_address: vec![7u8; 32],
            amount: {
                let mut amount = [0u8; 32];
                amount[31] = 1;
                amount
            },
        };
        let body = sample_order_body(give.clone());
        let mut id = [0u8; 32];
        id[0] = 0xDE;
        id[31] = 0x01;
        let logs = framed(
            &program,
            vec![
                data_line("CreatedOrder", &encode_order_body(&body)),
                data_line("CreatedOrderId", &id),
            ],
        );

        let chain = ScriptedChain::new(vec![vec![sig("C", 300)], vec![]])
            .with_logs("C", logs, 300);
        let mut h = harness(OrderKind::Created, chain, Pricing::Priced(150.0));
        h.scanner.program = program;

        let mut w = Some(window(("A", 100), ("B", 200)));
        h.scanner.run_pass(&mut w).await.unwrap();

        let orders = h.sink.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].order_id, hex::encode(id));
        assert_eq!(orders[0].kind, OrderKind::Created);
        assert_eq!(orders[0].block_time, 300);
        assert_eq!(orders[0].pricing, Pricing::Priced(150.0));
        assert_eq!(h.pricer.created_calls.lock().unwrap()[0], give);
    }

    #[tokio::test]
    async fn fulfilled_order_propagates_pricing_error() {
        let program = Pubkey::new_unique();
        let order_id = [0xABu8; 32];
        let mut payload = order_id.to_vec();
        payload.extend_from_slice(&[0x01u8; 32]);
        let logs = framed(&program, vec![data_line("Fulfilled", &payload)]);

        let chain = ScriptedChain::new(vec![vec![sig("C", 300)], vec![]])
            .with_logs("C", logs, 300);
        let mut h = harness(
            OrderKind::Fulfilled,
            chain,
            Pricing::Failed(PricingError::NotSolana),
        );
        h.scanner.program = program;

        let mut w = Some(window(("A", 100), ("B", 200)));
        h.scanner.run_pass(&mut w).await.unwrap();

        let orders = h.sink.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].kind, OrderKind::Fulfilled);
        assert_eq!(orders[0].pricing.status(), "error");
        assert_eq!(
            orders[0].pricing.error_tag().as_deref(),
            Some("not_solana")
        );
        assert_eq!(
            h.pricer.fulfilled_calls.lock().unwrap()[0],
            hex::encode(order_id)
        );
    }

    #[tokio::test]
    async fn sink_failure_leaves_window_unadvanced() {
        let program = Pubkey::new_unique();
        let order_id = [0xABu8; 32];
        let mut payload = order_id.to_vec();
        payload.extend_from_slice(&[0x01u8; 32]);
        let logs = framed(&program, vec![data_line("Fulfilled", &payload)]);

        let chain = ScriptedChain::new(vec![vec![sig("C", 300)], vec![]])
            .with_logs("C", logs, 300);
        let mut h = harness(OrderKind::Fulfilled, chain, Pricing::Priced(1.0));
        h.scanner.program = program;
        h.scanner.ctx.sink = Arc::new(FailingSink);

        let mut w = Some(window(("A", 100), ("B", 200)));
        assert!(h.scanner.run_pass(&mut w).await.is_err());

        // The order was not acknowledged: no checkpoint write, window intact.
        assert_eq!(h.checkpoints.write_count(), 0);
        assert_eq!(w, Some(window(("A", 100), ("B", 200))));
    }

    #[tokio::test]
    async fn empty_logs_advance_window_without_orders() {
        let chain = ScriptedChain::new(vec![vec![sig("C", 300)], vec![]]);
        let h = harness(OrderKind::Created, chain, Pricing::Priced(1.0));

        let mut w = Some(window(("A", 100), ("B", 200)));
        h.scanner.run_pass(&mut w).await.unwrap();

        assert!(h.sink.orders().is_empty());
        assert_eq!(w.as_ref().unwrap().to.signature, "C");
    }

    #[tokio::test]
    async fn stop_signal_halts_between_signatures() {
        let chain = ScriptedChain::new(vec![vec![sig("D", 400), sig("C", 300)]]);
        let sink = MemorySink::shared();
        let checkpoints = MemoryCheckpoints::shared();
        let (tx, rx) = watch::channel(true);

        let scanner = Scanner::new(
            "src",
            Pubkey::new_unique(),
            OrderKind::Created,
            ScannerContext {
                chain,
                pricer: FixedPricer::new(Pricing::Priced(1.0)),
                checkpoints: checkpoints.clone(),
                sink,
                metrics: Arc::new(Metrics::new()),
            },
            50,
            Duration::from_millis(10),
            rx,
        );
        drop(tx);

        let mut w = Some(window(("A", 100), ("B", 200)));
        let processed = scanner.run_pass(&mut w).await.unwrap();

        // Stop was already requested: nothing is processed and the
        // checkpoint does not move.
        assert_eq!(processed, 0);
        assert_eq!(checkpoints.write_count(), 0);
    }
}
