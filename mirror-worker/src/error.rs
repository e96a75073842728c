use mirror_common::cursor::CursorError;
use mirror_common::pipeline::PipelineError;
use mirror_common::rpc::RpcError;
use thiserror::Error;

/// Errors ending a source session. Everything but `ReconnectCeiling` and
/// `InvalidPackage` is retried by the reconnect loop.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("failed to connect: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("stream failed: {0}")]
    Status(#[from] tonic::Status),
    #[error("invalid stream metadata: {0}")]
    Metadata(String),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Cursor(#[from] CursorError),
    #[error("failed to decode block output: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("the server reported a fatal error: {0}")]
    Fatal(String),
    #[error("outgoing request stream closed")]
    RequestChannelClosed,
    #[error("no data received for too long")]
    Stale,
    #[error("invalid substreams package: {0}")]
    InvalidPackage(String),
    #[error("{source_name} gave up after {attempts} consecutive failures")]
    ReconnectCeiling {
        source_name: &'static str,
        attempts: u32,
    },
}
