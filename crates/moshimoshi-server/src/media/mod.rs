//! Media Engine Adapter
//!
//! The only place that talks to the media engine. Transports, producers and
//! consumers are referred to by the string ids the engine hands out. Nothing
//! here retries; callers decide what to do with an [`EngineError`].

mod local;

pub use local::LocalEngine;

use async_trait::async_trait;
use moshimoshi_protocol::{
    ConsumerParams, DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters,
    TransportDirection, TransportParams,
};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// The object existed but was closed before this call
    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    #[error("Transport {0} cannot be used for this operation")]
    WrongDirection(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Cannot consume producer {0} with the given capabilities")]
    CannotConsume(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Codecs and extensions the router accepts
    fn capabilities(&self) -> RtpCapabilities;

    async fn create_transport(&self, direction: TransportDirection) -> EngineResult<TransportParams>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    /// Returns the new producer's id
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<String>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        caller_capabilities: &RtpCapabilities,
    ) -> EngineResult<ConsumerParams>;

    /// Also closes every producer and consumer created on the transport
    async fn close_transport(&self, transport_id: &str) -> EngineResult<()>;

    /// Also closes every consumer of the producer
    async fn close_producer(&self, producer_id: &str) -> EngineResult<()>;

    async fn close_consumer(&self, consumer_id: &str) -> EngineResult<()>;
}

/// Router codecs: Opus for audio, VP8 for video
pub fn default_router_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: Some(100),
                clock_rate: 48000,
                channels: Some(2),
                parameters: Map::new(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: Some(101),
                clock_rate: 90000,
                channels: None,
                parameters: {
                    let mut params = Map::new();
                    params.insert("x-google-start-bitrate".to_string(), Value::from(1000));
                    params
                },
            },
        ],
        header_extensions: Vec::new(),
    }
}

/// Treat "already closed" as success; every other failure is returned
pub fn tolerate_closed(result: EngineResult<()>) -> EngineResult<()> {
    match result {
        Err(EngineError::AlreadyClosed(id)) => {
            tracing::debug!("{} was already closed", id);
            Ok(())
        }
        other => other,
    }
}
