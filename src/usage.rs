//! Usage-logging subsystem: in-memory batching over the durable store.
//!
//! Producers append completed-request entries to a buffer under a short
//! lock; the flusher task swaps the buffer out and performs the durable
//! insert unlocked, so request paths never block on storage I/O. The
//! buffer drains when it reaches [`FLUSH_BATCH_SIZE`] entries or every
//! [`FLUSH_INTERVAL`], and once more on shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::store::{Store, UsageFilter, UsageLogEntry};

pub const FLUSH_BATCH_SIZE: usize = 100;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Aggregation over a set of usage entries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageStats {
    pub total_requests: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Summed cost in dollars.
    pub total_cost_usd: f64,
    pub error_count: u64,
    pub by_provider: HashMap<String, BreakdownEntry>,
    pub by_model: HashMap<String, BreakdownEntry>,
    pub by_app: HashMap<String, BreakdownEntry>,
    pub by_endpoint: HashMap<String, BreakdownEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakdownEntry {
    pub requests: u64,
    pub cost_usd: f64,
}

/// Aggregate a slice of entries into totals and per-dimension breakdowns.
pub fn stats(entries: &[UsageLogEntry]) -> UsageStats {
    let mut out = UsageStats::default();
    for e in entries {
        out.total_requests += 1;
        out.total_input_tokens += e.input_tokens as u64;
        out.total_output_tokens += e.output_tokens as u64;
        let cost_usd = e.cost_cents as f64 / 100.0;
        out.total_cost_usd += cost_usd;
        if e.status >= 400 {
            out.error_count += 1;
        }

        for (map, key) in [
            (&mut out.by_provider, e.provider.clone()),
            (&mut out.by_model, e.model.clone()),
            (
                &mut out.by_app,
                e.app_id.clone().unwrap_or_else(|| "unknown".to_string()),
            ),
            (&mut out.by_endpoint, e.endpoint.clone()),
        ] {
            let slot = map.entry(key).or_default();
            slot.requests += 1;
            slot.cost_usd += cost_usd;
        }
    }
    out
}

#[derive(Clone)]
pub struct UsageLog {
    store: Store,
    buffer: Arc<Mutex<Vec<UsageLogEntry>>>,
}

impl UsageLog {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Append one entry. Flushes inline when the batch threshold is hit.
    pub fn log(&self, entry: UsageLogEntry) {
        let should_flush = {
            let mut buffer = self.buffer.lock().expect("usage buffer lock poisoned");
            buffer.push(entry);
            buffer.len() >= FLUSH_BATCH_SIZE
        };
        if should_flush {
            self.flush();
        }
    }

    /// Swap the buffer out under the lock, then insert the batch with the
    /// lock released. Entries are pushed back on failure so a transient
    /// storage error loses nothing.
    pub fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().expect("usage buffer lock poisoned");
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return;
        }

        debug!(entries = batch.len(), "flushing usage batch");
        if let Err(err) = self.store.insert_usage_batch(&batch) {
            warn!("usage flush failed, re-buffering {} entries: {}", batch.len(), err);
            let mut buffer = self.buffer.lock().expect("usage buffer lock poisoned");
            let mut batch = batch;
            batch.extend(buffer.drain(..));
            *buffer = batch;
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().expect("usage buffer lock poisoned").len()
    }

    /// Durable + buffered spend for one user over `[start, end)`, in
    /// cents. The cost guard uses this so a request is gated on spend
    /// the flusher has not persisted yet.
    pub fn spend_cents_between(
        &self,
        user_id: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> anyhow::Result<i64> {
        let durable = self.store.sum_cost_cents(user_id, start_ms, end_ms)?;
        let buffered: i64 = {
            let buffer = self.buffer.lock().expect("usage buffer lock poisoned");
            buffer
                .iter()
                .filter(|e| e.user_id == user_id && e.ts_ms >= start_ms && e.ts_ms < end_ms)
                .map(|e| e.cost_cents)
                .sum()
        };
        Ok(durable + buffered)
    }

    /// Filtered query against the durable log (flushes first so recent
    /// entries are visible).
    pub fn query(&self, filter: &UsageFilter) -> anyhow::Result<Vec<UsageLogEntry>> {
        self.flush();
        self.store.query_usage(filter)
    }

    pub fn count(&self) -> anyhow::Result<i64> {
        self.flush();
        self.store.count_usage()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Background task draining the buffer on a fixed cadence.
    pub fn spawn_flusher(&self) -> tokio::task::JoinHandle<()> {
        let log = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                log.flush();
            }
        })
    }
}
