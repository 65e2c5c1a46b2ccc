//! gRPC-facing log aggregation service.
//!
//! [`LogAggregatorService`] validates and normalizes incoming batches, hands
//! them to the storage engine it owns, and shapes query results back into
//! wire events. It has two states: ready (constructed with a healthy backend)
//! and closed.

use crate::log_store::{LogEntry, LogStorage, StorageError, StorageResult, StoredLogEntry};
use crate::proto::log_aggregator_server::LogAggregator;
use crate::proto::{LogBatch, LogEvent, QueryRequest, SendLogsResponse};
use crate::query_filter::QueryFilter;
use crate::request_context::{parse_grpc_timeout, RequestContext};
use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{error, info, instrument, warn};

/// Result ceiling applied to every `QueryLogs` call
pub const DEFAULT_QUERY_LIMIT: i64 = 1000;

/// Bound on the health check performed during construction
pub const STARTUP_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Parse a wire timestamp (RFC 3339, any sub-second precision) into UTC
pub fn parse_event_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Render a timestamp in the wire format: RFC 3339, nanoseconds, `Z` suffix
pub fn format_event_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Map a storage failure onto the closest gRPC status
pub fn status_from_storage(err: &StorageError) -> Status {
    let message = err.to_string();
    match err {
        StorageError::Timeout(_) => Status::deadline_exceeded(message),
        StorageError::Cancelled(_) => Status::cancelled(message),
        StorageError::Closed => Status::unavailable(message),
        StorageError::CapacityExceeded { .. } => Status::resource_exhausted(message),
        StorageError::Database(_) | StorageError::Connection(_) => Status::unavailable(message),
        StorageError::Serialization(_) => Status::internal(message),
    }
}

fn to_wire_event(entry: StoredLogEntry) -> LogEvent {
    LogEvent {
        timestamp: format_event_timestamp(&entry.timestamp),
        service: entry.service,
        level: entry.level,
        message: entry.message,
        fields: entry.fields,
    }
}

/// Log aggregation service; owns its storage engine exclusively
pub struct LogAggregatorService {
    storage: Box<dyn LogStorage>,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl LogAggregatorService {
    /// Take ownership of `storage` after verifying it is healthy.
    ///
    /// A failed check closes the storage and returns an error; there is no
    /// degraded start.
    pub async fn new(storage: Box<dyn LogStorage>, request_timeout: Duration) -> anyhow::Result<Self> {
        let ctx = RequestContext::with_timeout(STARTUP_HEALTH_TIMEOUT);

        if let Err(e) = storage.health_check(&ctx).await {
            if let Err(close_err) = storage.close().await {
                warn!(error = %close_err, "Failed to close storage after failed health check");
            }
            return Err(e).context("Storage health check failed");
        }

        info!(
            backend = storage.backend_name(),
            request_timeout_secs = request_timeout.as_secs(),
            "Log aggregator ready"
        );

        Ok(Self {
            storage,
            request_timeout,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn backend_name(&self) -> &'static str {
        self.storage.backend_name()
    }

    fn ensure_ready(&self) -> Result<(), Status> {
        if self.is_closed() {
            Err(Status::unavailable("log aggregator is shut down"))
        } else {
            Ok(())
        }
    }

    /// Build the storage context for an incoming request: the configured
    /// request timeout, tightened by the caller's `grpc-timeout` if shorter
    pub fn request_context(&self, metadata: &MetadataMap) -> RequestContext {
        let ctx = RequestContext::with_timeout(self.request_timeout);

        match metadata
            .get("grpc-timeout")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_grpc_timeout)
        {
            Some(caller_timeout) => ctx.tighten(caller_timeout),
            None => ctx,
        }
    }

    /// Store a batch of wire events.
    ///
    /// Unparsable timestamps are replaced with the current time. A storage
    /// failure is reported as `ok: false` with the error message; only a
    /// closed service fails at the transport level.
    #[instrument(skip(self, ctx, batch), fields(count = batch.events.len()))]
    pub async fn send_logs(
        &self,
        ctx: &RequestContext,
        batch: LogBatch,
    ) -> Result<SendLogsResponse, Status> {
        self.ensure_ready()?;
        if batch.events.is_empty() {
            return Ok(SendLogsResponse {
                ok: true,
                error: String::new(),
            });
        }

        info!("Receiving log batch");
        metrics::counter!("aggregator.logs.received").increment(batch.events.len() as u64);

        let entries: Vec<LogEntry> = batch
            .events
            .into_iter()
            .map(|event| {
                let timestamp = match parse_event_timestamp(&event.timestamp) {
                    Some(ts) => ts,
                    None => {
                        warn!(
                            raw_timestamp = %event.timestamp,
                            service = %event.service,
                            "Failed to parse timestamp, using current time"
                        );
                        metrics::counter!("aggregator.timestamps.substituted").increment(1);
                        Utc::now()
                    }
                };

                LogEntry {
                    timestamp,
                    service: event.service,
                    level: event.level,
                    message: event.message,
                    fields: event.fields,
                }
            })
            .collect();

        let count = entries.len();
        if let Err(e) = self.storage.insert_logs(ctx, entries).await {
            error!(error = %e, "Failed to insert logs");
            metrics::counter!("aggregator.batches.failed").increment(1);
            return Ok(SendLogsResponse {
                ok: false,
                error: e.to_string(),
            });
        }

        info!(count = count, "Successfully stored logs");
        metrics::counter!("aggregator.logs.stored").increment(count as u64);

        Ok(SendLogsResponse {
            ok: true,
            error: String::new(),
        })
    }

    /// Query stored events by service and level, newest first, capped at
    /// [`DEFAULT_QUERY_LIMIT`]
    #[instrument(skip(self, ctx, request), fields(service = %request.service, level = %request.level))]
    pub async fn query_logs(
        &self,
        ctx: &RequestContext,
        request: QueryRequest,
    ) -> Result<LogBatch, Status> {
        self.ensure_ready()?;

        info!("Querying logs");
        metrics::counter!("aggregator.queries").increment(1);

        let filter = QueryFilter::new()
            .service(request.service)
            .level(request.level)
            .limit(DEFAULT_QUERY_LIMIT);

        let entries = self.storage.query_logs(ctx, &filter).await.map_err(|e| {
            error!(error = %e, "Failed to query logs");
            status_from_storage(&e)
        })?;

        let events: Vec<LogEvent> = entries.into_iter().map(to_wire_event).collect();

        info!(count = events.len(), "Successfully retrieved logs");
        metrics::histogram!("aggregator.query.results").record(events.len() as f64);

        Ok(LogBatch { events })
    }

    /// Delete entries ingested more than `older_than` ago
    pub async fn prune(&self, ctx: &RequestContext, older_than: Duration) -> StorageResult<u64> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        self.storage.delete_old_logs(ctx, older_than).await
    }

    pub async fn health_check(&self, ctx: &RequestContext) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        self.storage.health_check(ctx).await
    }

    /// Move to the closed state and release the storage engine.
    /// Later calls are no-ops.
    pub async fn close(&self) -> StorageResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Closing log aggregator");
        self.storage.close().await
    }
}

#[tonic::async_trait]
impl LogAggregator for LogAggregatorService {
    async fn send_logs(
        &self,
        request: Request<LogBatch>,
    ) -> Result<Response<SendLogsResponse>, Status> {
        let ctx = self.request_context(request.metadata());
        let response = LogAggregatorService::send_logs(self, &ctx, request.into_inner()).await?;
        Ok(Response::new(response))
    }

    async fn query_logs(
        &self,
        request: Request<QueryRequest>,
    ) -> Result<Response<LogBatch>, Status> {
        let ctx = self.request_context(request.metadata());
        let batch = LogAggregatorService::query_logs(self, &ctx, request.into_inner()).await?;
        Ok(Response::new(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_store::MockLogStorage;
    use std::collections::HashMap;

    fn healthy_mock() -> MockLogStorage {
        let mut mock = MockLogStorage::new();
        mock.expect_health_check().returning(|_| Ok(()));
        mock.expect_backend_name().return_const("mock");
        mock
    }

    async fn service(mock: MockLogStorage) -> LogAggregatorService {
        LogAggregatorService::new(Box::new(mock), Duration::from_secs(30))
            .await
            .unwrap()
    }

    fn event(timestamp: &str, service: &str, level: &str, message: &str) -> LogEvent {
        LogEvent {
            timestamp: timestamp.to_string(),
            service: service.to_string(),
            level: level.to_string(),
            message: message.to_string(),
            fields: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_send_logs_success() {
        let mut mock = healthy_mock();
        mock.expect_insert_logs()
            .withf(|_, entries| {
                entries.len() == 1
                    && entries[0].service == "api"
                    && entries[0].fields.get("key").map(String::as_str) == Some("value")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let srv = service(mock).await;
        let mut ev = event(&format_event_timestamp(&Utc::now()), "api", "info", "Test message");
        ev.fields.insert("key".to_string(), "value".to_string());

        let resp = srv
            .send_logs(&RequestContext::background(), LogBatch { events: vec![ev] })
            .await
            .unwrap();
        assert!(resp.ok);
        assert!(resp.error.is_empty());
    }

    #[tokio::test]
    async fn test_send_logs_empty_batch_skips_storage() {
        // No insert_logs expectation: any call would panic
        let srv = service(healthy_mock()).await;

        let resp = srv
            .send_logs(&RequestContext::background(), LogBatch { events: vec![] })
            .await
            .unwrap();
        assert!(resp.ok);
    }

    #[tokio::test]
    async fn test_send_logs_multiple_events() {
        let mut mock = healthy_mock();
        mock.expect_insert_logs()
            .withf(|_, entries| entries.len() == 2)
            .times(1)
            .returning(|_, _| Ok(()));

        let srv = service(mock).await;
        let now = format_event_timestamp(&Utc::now());
        let batch = LogBatch {
            events: vec![
                event(&now, "api", "info", "Message 1"),
                event(&now, "worker", "debug", "Message 2"),
            ],
        };

        let resp = srv.send_logs(&RequestContext::background(), batch).await.unwrap();
        assert!(resp.ok);
    }

    #[tokio::test]
    async fn test_send_logs_substitutes_bad_timestamp() {
        let call_start = Utc::now();
        let mut mock = healthy_mock();
        mock.expect_insert_logs()
            .withf(move |_, entries| entries.len() == 2 && entries[1].timestamp >= call_start)
            .times(1)
            .returning(|_, _| Ok(()));

        let srv = service(mock).await;
        let batch = LogBatch {
            events: vec![
                event("2024-01-01T00:00:00.123456789Z", "api", "info", "good"),
                event("yesterday-ish", "api", "info", "bad"),
            ],
        };

        let resp = srv.send_logs(&RequestContext::background(), batch).await.unwrap();
        assert!(resp.ok);
    }

    #[tokio::test]
    async fn test_send_logs_storage_failure_returns_not_ok() {
        let mut mock = healthy_mock();
        mock.expect_insert_logs()
            .times(1)
            .returning(|_, _| Err(StorageError::Connection("connection reset".to_string())));

        let srv = service(mock).await;
        let batch = LogBatch {
            events: vec![event("2024-01-01T00:00:00Z", "api", "info", "lost")],
        };

        let resp = srv.send_logs(&RequestContext::background(), batch).await.unwrap();
        assert!(!resp.ok);
        assert!(resp.error.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_query_logs_applies_default_limit_and_formats_events() {
        let ts = parse_event_timestamp("2024-05-01T08:30:00.000000042Z").unwrap();
        let mut mock = healthy_mock();
        mock.expect_query_logs()
            .withf(|_, filter| {
                filter.service == "api"
                    && filter.level == "info"
                    && filter.limit == DEFAULT_QUERY_LIMIT
                    && filter.start.is_none()
                    && filter.end.is_none()
            })
            .times(1)
            .returning(move |_, _| {
                Ok(vec![StoredLogEntry {
                    id: 1,
                    timestamp: ts,
                    service: "api".to_string(),
                    level: "info".to_string(),
                    message: "Test log".to_string(),
                    fields: HashMap::from([("user".to_string(), "42".to_string())]),
                    created_at: Utc::now(),
                }])
            });

        let srv = service(mock).await;
        let resp = srv
            .query_logs(
                &RequestContext::background(),
                QueryRequest {
                    service: "api".to_string(),
                    level: "info".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(resp.events.len(), 1);
        assert_eq!(resp.events[0].timestamp, "2024-05-01T08:30:00.000000042Z");
        assert_eq!(resp.events[0].fields["user"], "42");
    }

    #[tokio::test]
    async fn test_query_logs_storage_error_maps_to_status() {
        let mut mock = healthy_mock();
        mock.expect_query_logs()
            .returning(|_, _| Err(StorageError::Timeout("query_logs")));

        let srv = service(mock).await;
        let status = srv
            .query_logs(&RequestContext::background(), QueryRequest::default())
            .await
            .unwrap_err();

        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_new_fails_on_unhealthy_storage() {
        let mut mock = MockLogStorage::new();
        mock.expect_health_check()
            .returning(|_| Err(StorageError::Connection("refused".to_string())));
        mock.expect_close().times(1).returning(|| Ok(()));

        let result = LogAggregatorService::new(Box::new(mock), Duration::from_secs(30)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_requests() {
        let mut mock = healthy_mock();
        mock.expect_close().times(1).returning(|| Ok(()));

        let srv = service(mock).await;
        srv.close().await.unwrap();
        srv.close().await.unwrap();
        assert!(srv.is_closed());

        let status = srv
            .query_logs(&RequestContext::background(), QueryRequest::default())
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_request_context_honours_grpc_timeout() {
        let srv = service(healthy_mock()).await;

        let mut metadata = MetadataMap::new();
        metadata.insert("grpc-timeout", "100m".parse().unwrap());
        let ctx = srv.request_context(&metadata);
        assert!(ctx.remaining().unwrap() <= Duration::from_millis(100));

        let ctx = srv.request_context(&MetadataMap::new());
        let remaining = ctx.remaining().unwrap();
        assert!(remaining > Duration::from_secs(29) && remaining <= Duration::from_secs(30));
    }

    #[test]
    fn test_timestamp_format_roundtrip() {
        let ts = parse_event_timestamp("2024-02-29T23:59:59.999999999+02:00").unwrap();
        assert_eq!(format_event_timestamp(&ts), "2024-02-29T21:59:59.999999999Z");
        assert!(parse_event_timestamp("2024-02-29 23:59:59").is_none());
        assert!(parse_event_timestamp("").is_none());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_from_storage(&StorageError::Cancelled("x")).code(),
            tonic::Code::Cancelled
        );
        assert_eq!(
            status_from_storage(&StorageError::CapacityExceeded { capacity: 1 }).code(),
            tonic::Code::ResourceExhausted
        );
        assert_eq!(
            status_from_storage(&StorageError::Closed).code(),
            tonic::Code::Unavailable
        );
    }
}
