//! Wire types for the `loghaven.v1.LogAggregator` gRPC service.
//!
//! Field tags match `proto/log_aggregator.proto`.

use std::collections::HashMap;

/// A single structured log event as it travels over the wire
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogEvent {
    /// RFC 3339 timestamp with nanosecond precision
    #[prost(string, tag = "1")]
    pub timestamp: String,
    #[prost(string, tag = "2")]
    pub service: String,
    #[prost(string, tag = "3")]
    pub level: String,
    #[prost(string, tag = "4")]
    pub message: String,
    #[prost(map = "string, string", tag = "5")]
    pub fields: HashMap<String, String>,
}

/// Batch of log events, used both for ingestion and query results
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LogBatch {
    #[prost(message, repeated, tag = "1")]
    pub events: Vec<LogEvent>,
}

/// Acknowledgment for a `SendLogs` call
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendLogsResponse {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    /// Storage error that rejected the batch, empty when `ok` is true
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Filter for `QueryLogs`; empty strings match everything
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct QueryRequest {
    #[prost(string, tag = "1")]
    pub service: String,
    #[prost(string, tag = "2")]
    pub level: String,
}

include!(concat!(env!("OUT_DIR"), "/loghaven.v1.LogAggregator.rs"));
