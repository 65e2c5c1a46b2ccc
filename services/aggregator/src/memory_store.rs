//! In-process log storage.
//!
//! All state sits behind one reader/writer lock: queries share the read side,
//! inserts and pruning take the write side. Batches are staged in full before
//! anything is published, so a failure part-way through a batch leaves the
//! store untouched.
//!
//! The lock is a blocking `parking_lot` lock taken inside the context's
//! `run`, so a deadline is checked before the lock is requested but cannot
//! interrupt the wait. No critical section awaits or does I/O.

use crate::log_store::{
    retention_cutoff, LogEntry, LogStorage, StorageError, StorageResult, StoredLogEntry,
};
use crate::query_filter::QueryFilter;
use crate::request_context::RequestContext;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, instrument};

#[derive(Debug, Default)]
struct MemoryState {
    entries: Vec<StoredLogEntry>,
    last_id: i64,
}

/// Log storage held entirely in memory
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    state: RwLock<MemoryState>,
    capacity: Option<usize>,
    closed: AtomicBool,
}

impl MemoryLogStore {
    /// Unbounded store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects any batch which would push it past `capacity`
    /// entries
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::default()
        }
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn append_batch(&self, entries: Vec<LogEntry>) -> StorageResult<()> {
        let mut state = self.state.write();
        let created_at = Utc::now();

        let mut staged = Vec::with_capacity(entries.len());
        let mut next_id = state.last_id;

        for entry in entries {
            if let Some(capacity) = self.capacity {
                if state.entries.len() + staged.len() >= capacity {
                    return Err(StorageError::CapacityExceeded { capacity });
                }
            }

            next_id += 1;
            staged.push(StoredLogEntry {
                id: next_id,
                timestamp: entry.timestamp,
                service: entry.service,
                level: entry.level,
                message: entry.message,
                fields: entry.fields,
                created_at,
            });
        }

        state.last_id = next_id;
        state.entries.extend(staged);

        Ok(())
    }
}

#[async_trait]
impl LogStorage for MemoryLogStore {
    async fn insert_log(&self, ctx: &RequestContext, entry: LogEntry) -> StorageResult<()> {
        self.insert_logs(ctx, vec![entry]).await
    }

    #[instrument(skip(self, ctx, entries), fields(count = entries.len()))]
    async fn insert_logs(
        &self,
        ctx: &RequestContext,
        entries: Vec<LogEntry>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;

        ctx.run("insert_logs", async move { self.append_batch(entries) })
            .await?;

        debug!("Batch appended to memory store");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn query_logs(
        &self,
        ctx: &RequestContext,
        filter: &QueryFilter,
    ) -> StorageResult<Vec<StoredLogEntry>> {
        self.ensure_open()?;

        ctx.run("query_logs", async {
            let state = self.state.read();

            let mut matched: Vec<StoredLogEntry> = state
                .entries
                .iter()
                .filter(|e| filter.matches(e.timestamp, &e.service, &e.level))
                .cloned()
                .collect();
            drop(state);

            // Equal timestamps fall back to newest insertion first
            matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));

            let limit = filter.effective_limit().unwrap_or(usize::MAX);
            Ok(matched
                .into_iter()
                .skip(filter.effective_offset())
                .take(limit)
                .collect())
        })
        .await
    }

    #[instrument(skip(self, ctx))]
    async fn delete_old_logs(
        &self,
        ctx: &RequestContext,
        older_than: Duration,
    ) -> StorageResult<u64> {
        self.ensure_open()?;

        let cutoff = retention_cutoff(older_than);

        ctx.run("delete_old_logs", async {
            let mut state = self.state.write();
            let before = state.entries.len();
            state.entries.retain(|e| e.created_at >= cutoff);
            Ok((before - state.entries.len()) as u64)
        })
        .await
    }

    async fn health_check(&self, ctx: &RequestContext) -> StorageResult<()> {
        ctx.run("health_check", async { self.ensure_open() }).await
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Memory store closed");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
