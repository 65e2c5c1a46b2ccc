//! Loghaven Aggregator
//!
//! Ingestion and storage engine for the Loghaven log aggregation platform.
//! Producers submit structured log events in batches over gRPC; consumers
//! query them back filtered by service and severity, most recent first.
//!
//! ## Features
//!
//! - **Atomic Batch Ingestion**: every `SendLogs` batch is stored completely
//!   or not at all
//! - **Pluggable Storage**: PostgreSQL for durable deployments, an in-memory
//!   store for embedded use and tests
//! - **Injection-Safe Queries**: filters compile to parameterized statements
//! - **Retention**: background pruning by ingestion age
//! - **Bounded Operations**: every storage call carries a deadline and a
//!   cancellation token
//!
//! ## Architecture
//!
//! ```text
//!  gRPC callers                                   Storage
//! ┌──────────────┐   SendLogs    ┌──────────────┐  ┌──────────────────┐
//! │ HTTP gateway │──────────────▶│ LogAggregator│─▶│ PostgresLogStore │
//! │ / producers  │◀──────────────│ Service      │  │   or             │
//! └──────────────┘   QueryLogs   └──────────────┘  │ MemoryLogStore   │
//!                                  ▲        ▲      └──────────────────┘
//!                                  │        │
//!                         ┌────────┴──┐  ┌──┴──────────┐
//!                         │ Retention │  │ Health      │
//!                         │ pruner    │  │ probes      │
//!                         └───────────┘  └─────────────┘
//! ```

pub mod config;
pub mod health_api;
pub mod log_aggregator;
pub mod log_store;
pub mod maintenance;
pub mod memory_store;
pub mod postgres_store;
pub mod proto;
pub mod query_filter;
pub mod request_context;

pub use config::{Config, StorageBackend, StorageConfig};
pub use log_aggregator::{LogAggregatorService, DEFAULT_QUERY_LIMIT};
pub use log_store::{open_storage, LogEntry, LogStorage, StorageError, StorageResult, StoredLogEntry};
pub use memory_store::MemoryLogStore;
pub use postgres_store::PostgresLogStore;
pub use query_filter::QueryFilter;
pub use request_context::RequestContext;
