//! Build script for the LogAggregator gRPC stubs
//!
//! Message types are declared with prost derives in `src/proto.rs`, so only the
//! service plumbing is generated here. The manual builder does not shell out
//! to `protoc`. `proto/log_aggregator.proto` is the wire contract these
//! definitions mirror.

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=proto/log_aggregator.proto");

    let send_logs = tonic_build::manual::Method::builder()
        .name("send_logs")
        .route_name("SendLogs")
        .input_type("crate::proto::LogBatch")
        .output_type("crate::proto::SendLogsResponse")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let query_logs = tonic_build::manual::Method::builder()
        .name("query_logs")
        .route_name("QueryLogs")
        .input_type("crate::proto::QueryRequest")
        .output_type("crate::proto::LogBatch")
        .codec_path("tonic::codec::ProstCodec")
        .build();

    let service = tonic_build::manual::Service::builder()
        .name("LogAggregator")
        .package("loghaven.v1")
        .method(send_logs)
        .method(query_logs)
        .build();

    tonic_build::manual::Builder::new().compile(&[service]);
}
