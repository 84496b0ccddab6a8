use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::provider::{ModelInfo, PricingInfo};
use crate::storage::cost_store::CostStore;

pub const DEFAULT_MAX_RECORDS: usize = 10_000;
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// A single completed call translated into currency. Never mutated once
/// appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub input_cost: Decimal,
    pub output_cost: Decimal,
    pub total_cost: Decimal,
    pub latency_ms: u64,
    #[serde(default)]
    pub use_case: Option<String>,
    #[serde(default)]
    pub cached: bool,
}

/// What the manager knows about a call when it records its cost.
#[derive(Debug, Clone, Default)]
pub struct CostEntry {
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub use_case: Option<String>,
    pub cached: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CostBreakdown {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cost: Decimal,
}

impl CostBreakdown {
    fn add(&mut self, record: &CostRecord) {
        self.requests += 1;
        self.input_tokens += record.input_tokens as u64;
        self.output_tokens += record.output_tokens as u64;
        self.total_tokens += record.total_tokens as u64;
        self.cost += record.total_cost;
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CostSummary {
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub average_latency_ms: f64,
    pub by_provider: BTreeMap<String, CostBreakdown>,
    /// Keyed by `provider:model`.
    pub by_model: BTreeMap<String, CostBreakdown>,
    pub by_use_case: BTreeMap<String, CostBreakdown>,
}

enum FlushCommand {
    Dirty,
    Shutdown(oneshot::Sender<()>),
}

struct TrackerInner {
    records: Mutex<VecDeque<CostRecord>>,
    loaded: OnceCell<()>,
    /// Set when persisted history could not be read; saving would replace it.
    persist_disabled: AtomicBool,
    store: Arc<dyn CostStore>,
    max_records: usize,
}

impl TrackerInner {
    /// Pulls persisted records in front of anything recorded so far. Runs at
    /// most once. A failed load starts from an empty history and disables
    /// saving so the unread file survives.
    async fn ensure_loaded(&self) {
        self.loaded
            .get_or_init(|| async {
                match self.store.load().await {
                    Ok(persisted) => {
                        let mut records = self.records.lock();
                        let count = persisted.len();
                        for record in persisted.into_iter().rev() {
                            records.push_front(record);
                        }
                        while records.len() > self.max_records {
                            records.pop_front();
                        }
                        debug!("Cost tracker loaded {} persisted records", count);
                    }
                    Err(e) => {
                        self.persist_disabled.store(true, Ordering::SeqCst);
                        warn!(
                            "Failed to load cost records, starting empty with persistence off: {}",
                            e
                        );
                    }
                }
            })
            .await;
    }

    async fn flush(&self) {
        // Never save over history that was not read yet.
        self.ensure_loaded().await;
        if self.persist_disabled.load(Ordering::SeqCst) {
            debug!("Cost persistence disabled, skipping flush");
            return;
        }
        let snapshot: Vec<CostRecord> = self.records.lock().iter().cloned().collect();
        match self.store.save(&snapshot).await {
            Ok(()) => debug!("Flushed {} cost records", snapshot.len()),
            Err(e) => warn!("Failed to persist cost records: {}", e),
        }
    }
}

/// In-memory cost ledger with debounced persistence. Recording never waits
/// on disk; a background task coalesces bursts of writes into one save per
/// debounce interval.
pub struct CostTracker {
    inner: Arc<TrackerInner>,
    pricing: RwLock<HashMap<String, PricingInfo>>,
    flush_tx: mpsc::UnboundedSender<FlushCommand>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl CostTracker {
    /// Must be called inside a tokio runtime; the flush task starts
    /// immediately.
    pub fn new(store: Arc<dyn CostStore>, max_records: usize, debounce: Duration) -> Self {
        let inner = Arc::new(TrackerInner {
            records: Mutex::new(VecDeque::new()),
            loaded: OnceCell::new(),
            persist_disabled: AtomicBool::new(false),
            store,
            max_records: max_records.max(1),
        });
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let flusher = tokio::spawn(run_flusher(inner.clone(), flush_rx, debounce));

        Self {
            inner,
            pricing: RwLock::new(HashMap::new()),
            flush_tx,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Adds every catalog entry to the pricing table.
    pub fn register_pricing(&self, models: &[ModelInfo]) {
        let mut pricing = self.pricing.write();
        for model in models {
            pricing.insert(format!("{}:{}", model.provider, model.id), model.pricing());
        }
    }

    pub fn pricing_for(&self, provider: &str, model: &str) -> Option<PricingInfo> {
        self.pricing
            .read()
            .get(&format!("{}:{}", provider, model))
            .copied()
    }

    pub async fn record_cost(&self, entry: CostEntry) -> CostRecord {
        self.inner.ensure_loaded().await;

        let pricing = self.pricing_for(&entry.provider, &entry.model).unwrap_or_else(|| {
            debug!(
                "No pricing for {}:{}, recording zero cost",
                entry.provider, entry.model
            );
            PricingInfo::free()
        });
        let (input_cost, output_cost) = pricing.calculate_cost(entry.input_tokens, entry.output_tokens);

        let record = CostRecord {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            provider: entry.provider,
            model: entry.model,
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            total_tokens: entry.input_tokens.saturating_add(entry.output_tokens),
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            latency_ms: entry.latency_ms,
            use_case: entry.use_case,
            cached: entry.cached,
        };

        {
            let mut records = self.inner.records.lock();
            records.push_back(record.clone());
            while records.len() > self.inner.max_records {
                records.pop_front();
            }
        }
        self.mark_dirty();

        debug!(
            provider = %record.provider,
            model = %record.model,
            tokens = record.total_tokens,
            cost = %record.total_cost,
            "Recorded cost"
        );
        record
    }

    pub async fn get_summary(&self) -> CostSummary {
        self.inner.ensure_loaded().await;
        let records = self.inner.records.lock();

        let mut summary = CostSummary::default();
        let mut latency_total: u128 = 0;
        for record in records.iter() {
            summary.total_requests += 1;
            summary.total_input_tokens += record.input_tokens as u64;
            summary.total_output_tokens += record.output_tokens as u64;
            summary.total_tokens += record.total_tokens as u64;
            summary.total_cost += record.total_cost;
            latency_total += record.latency_ms as u128;

            summary
                .by_provider
                .entry(record.provider.clone())
                .or_default()
                .add(record);
            summary
                .by_model
                .entry(format!("{}:{}", record.provider, record.model))
                .or_default()
                .add(record);
            if let Some(use_case) = &record.use_case {
                summary
                    .by_use_case
                    .entry(use_case.clone())
                    .or_default()
                    .add(record);
            }
        }
        if summary.total_requests > 0 {
            summary.average_latency_ms = latency_total as f64 / summary.total_requests as f64;
        }
        summary
    }

    /// Newest first.
    pub async fn get_recent_records(&self, limit: usize) -> Vec<CostRecord> {
        self.inner.ensure_loaded().await;
        self.inner
            .records
            .lock()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn clear_records(&self) {
        self.inner.ensure_loaded().await;
        let cleared = {
            let mut records = self.inner.records.lock();
            let count = records.len();
            records.clear();
            count
        };
        info!("Cleared {} cost records", cleared);
        self.mark_dirty();
    }

    pub async fn len(&self) -> usize {
        self.inner.ensure_loaded().await;
        self.inner.records.lock().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stops the flush task after a final save. Later records stay in memory
    /// only.
    pub async fn shutdown(&self) {
        let handle = self.flusher.lock().take();
        let Some(handle) = handle else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.flush_tx.send(FlushCommand::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = handle.await {
            warn!("Cost flush task ended abnormally: {}", e);
        }
        info!("Cost tracker shut down");
    }

    fn mark_dirty(&self) {
        if self.flush_tx.send(FlushCommand::Dirty).is_err() {
            debug!("Cost flush task stopped, record kept in memory only");
        }
    }
}

/// Exits when shut down or when the tracker is dropped; a pending debounce
/// still flushes on the way out.
async fn run_flusher(
    inner: Arc<TrackerInner>,
    mut rx: mpsc::UnboundedReceiver<FlushCommand>,
    debounce: Duration,
) {
    while let Some(command) = rx.recv().await {
        match command {
            FlushCommand::Shutdown(ack) => {
                inner.flush().await;
                let _ = ack.send(());
                return;
            }
            FlushCommand::Dirty => {
                let deadline = tokio::time::sleep(debounce);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = &mut deadline => {
                            inner.flush().await;
                            break;
                        }
                        next = rx.recv() => match next {
                            Some(FlushCommand::Dirty) => continue,
                            Some(FlushCommand::Shutdown(ack)) => {
                                inner.flush().await;
                                let _ = ack.send(());
                                return;
                            }
                            None => {
                                inner.flush().await;
                                return;
                            }
                        },
                    }
                }
            }
        }
    }
}
