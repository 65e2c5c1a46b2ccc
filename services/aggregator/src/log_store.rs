//! Storage engine abstraction for log entries.
//!
//! [`LogStorage`] is the capability set every backend provides: insert,
//! filtered query, retention pruning, health check and close. Two backends
//! ship with the service:
//!
//! - [`PostgresLogStore`](crate::postgres_store::PostgresLogStore): pooled,
//!   transactional PostgreSQL storage
//! - [`MemoryLogStore`](crate::memory_store::MemoryLogStore): lock-guarded
//!   in-process storage for embedded deployments and tests

use crate::config::{StorageBackend, StorageConfig};
use crate::memory_store::MemoryLogStore;
use crate::postgres_store::PostgresLogStore;
use crate::query_filter::QueryFilter;
use crate::request_context::RequestContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors surfaced by storage backends
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to connect to storage backend: {0}")]
    Connection(String),

    #[error("Failed to serialize log fields: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage operation '{0}' timed out")]
    Timeout(&'static str),

    #[error("Storage operation '{0}' was cancelled")]
    Cancelled(&'static str),

    #[error("Storage capacity of {capacity} entries exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("Storage is closed")]
    Closed,
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A log event ready to be persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Event time as reported by the producer
    pub timestamp: DateTime<Utc>,
    /// Originating service
    pub service: String,
    /// Severity, stored verbatim
    pub level: String,
    pub message: String,
    /// Free-form key/value context
    #[serde(default)]
    pub fields: HashMap<String, String>,
}

impl LogEntry {
    pub fn new(
        timestamp: DateTime<Utc>,
        service: impl Into<String>,
        level: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            service: service.into(),
            level: level.into(),
            message: message.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// A log entry as it exists in a backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredLogEntry {
    /// Backend-assigned, strictly increasing in insertion order
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub level: String,
    pub message: String,
    pub fields: HashMap<String, String>,
    /// Ingestion time; drives retention
    pub created_at: DateTime<Utc>,
}

impl From<StoredLogEntry> for LogEntry {
    fn from(stored: StoredLogEntry) -> Self {
        Self {
            timestamp: stored.timestamp,
            service: stored.service,
            level: stored.level,
            message: stored.message,
            fields: stored.fields,
        }
    }
}

/// Capability set shared by all log storage backends.
///
/// Implementations must be safe for concurrent use without external locking.
/// Every operation honours the deadline and cancellation of its
/// [`RequestContext`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogStorage: Send + Sync {
    /// Persist a single entry
    async fn insert_log(&self, ctx: &RequestContext, entry: LogEntry) -> StorageResult<()>;

    /// Persist a batch as one all-or-nothing unit. An empty batch returns
    /// immediately without touching the backend.
    async fn insert_logs(&self, ctx: &RequestContext, entries: Vec<LogEntry>)
        -> StorageResult<()>;

    /// Entries matching `filter`, most recent event timestamp first
    async fn query_logs(
        &self,
        ctx: &RequestContext,
        filter: &QueryFilter,
    ) -> StorageResult<Vec<StoredLogEntry>>;

    /// Delete entries ingested more than `older_than` ago; returns the count
    async fn delete_old_logs(&self, ctx: &RequestContext, older_than: Duration)
        -> StorageResult<u64>;

    /// Lightweight round trip to the backend
    async fn health_check(&self, ctx: &RequestContext) -> StorageResult<()>;

    /// Release held resources. Idempotent.
    async fn close(&self) -> StorageResult<()>;

    /// Short backend label for logs and metrics
    fn backend_name(&self) -> &'static str;
}

/// Ingestion time before which entries are pruned for a given retention age.
/// Ages too large to represent clamp to the earliest representable instant.
pub fn retention_cutoff(older_than: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(older_than)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Build the configured storage backend.
///
/// For PostgreSQL this connects, pings and initializes the schema, so an
/// unreachable database fails here rather than on the first request.
pub async fn open_storage(config: &StorageConfig) -> anyhow::Result<Box<dyn LogStorage>> {
    let storage: Box<dyn LogStorage> = match config.backend {
        StorageBackend::Postgres => Box::new(PostgresLogStore::connect(config).await?),
        StorageBackend::Memory => {
            let store = match config.memory_capacity {
                Some(capacity) => MemoryLogStore::with_capacity(capacity),
                None => MemoryLogStore::new(),
            };
            Box::new(store)
        }
    };

    info!(backend = storage.backend_name(), "Storage backend initialized");

    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_builder() {
        let now = Utc::now();
        let entry = LogEntry::new(now, "api", "info", "started")
            .with_field("region", "eu-west-1")
            .with_field("pod", "api-7f9c");

        assert_eq!(entry.service, "api");
        assert_eq!(entry.fields.len(), 2);
        assert_eq!(entry.fields["region"], "eu-west-1");
    }

    #[test]
    fn test_stored_entry_into_log_entry() {
        let now = Utc::now();
        let stored = StoredLogEntry {
            id: 7,
            timestamp: now,
            service: "worker".to_string(),
            level: "warn".to_string(),
            message: "queue depth high".to_string(),
            fields: HashMap::from([("depth".to_string(), "1200".to_string())]),
            created_at: now,
        };

        let entry: LogEntry = stored.into();
        assert_eq!(entry.timestamp, now);
        assert_eq!(entry.fields["depth"], "1200");
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::Timeout("query_logs");
        assert_eq!(err.to_string(), "Storage operation 'query_logs' timed out");

        let err = StorageError::CapacityExceeded { capacity: 10 };
        assert_eq!(err.to_string(), "Storage capacity of 10 entries exceeded");
    }

    #[test]
    fn test_retention_cutoff() {
        let before = Utc::now();
        let cutoff = retention_cutoff(Duration::from_secs(3600));
        let expected = before - chrono::Duration::seconds(3600);
        assert!(cutoff >= expected);
        assert!(cutoff < before);

        assert_eq!(retention_cutoff(Duration::MAX), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn test_open_memory_storage() {
        let config = StorageConfig {
            backend: StorageBackend::Memory,
            ..StorageConfig::default()
        };

        let storage = open_storage(&config).await.unwrap();
        assert_eq!(storage.backend_name(), "memory");
        storage.close().await.unwrap();
    }
}
