//! In-process media engine
//!
//! Hands out transport/producer/consumer ids, negotiates codecs against the
//! router capabilities and tracks object lifetimes the way an external SFU
//! would. It does not move RTP; pointing the adapter at a real engine means
//! implementing [`MediaEngine`] for that engine's client.

use super::{EngineError, EngineResult, MediaEngine, default_router_capabilities};
use async_trait::async_trait;
use moshimoshi_protocol::{
    ConsumerParams, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters,
    MediaKind, RtpCapabilities, RtpParameters, TransportDirection, TransportParams,
};
use rand::{Rng, distributions::Alphanumeric};
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

/// How many closed ids are remembered for `AlreadyClosed` answers
const TOMBSTONE_CAPACITY: usize = 4096;

struct TransportEntry {
    direction: TransportDirection,
    connected: bool,
}

struct ProducerEntry {
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct ConsumerEntry {
    transport_id: String,
    producer_id: String,
}

/// Recently closed ids, oldest forgotten first
#[derive(Default)]
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Tombstones {
    fn bury(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Only open objects are kept; closed ids go to the tombstones
#[derive(Default)]
struct EngineState {
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    closed: Tombstones,
}

impl EngineState {
    fn missing(&self, id: &str, not_found: fn(String) -> EngineError) -> EngineError {
        if self.closed.contains(id) {
            EngineError::AlreadyClosed(id.to_string())
        } else {
            not_found(id.to_string())
        }
    }

    fn open_transport(&self, transport_id: &str) -> EngineResult<&TransportEntry> {
        self.transports
            .get(transport_id)
            .ok_or_else(|| self.missing(transport_id, EngineError::TransportNotFound))
    }

    fn remove_consumers(&mut self, keep: impl Fn(&ConsumerEntry) -> bool) {
        let closed: Vec<String> = self
            .consumers
            .iter()
            .filter(|(_, c)| !keep(c))
            .map(|(id, _)| id.clone())
            .collect();
        for id in closed {
            self.consumers.remove(&id);
            self.closed.bury(id);
        }
    }

    fn remove_producer(&mut self, producer_id: &str) {
        self.producers.remove(producer_id);
        self.closed.bury(producer_id.to_string());
        self.remove_consumers(|c| c.producer_id != producer_id);
    }
}

pub struct LocalEngine {
    capabilities: RtpCapabilities,
    announced_ip: String,
    state: Mutex<EngineState>,
}

impl LocalEngine {
    pub fn new(announced_ip: impl Into<String>) -> Self {
        Self {
            capabilities: default_router_capabilities(),
            announced_ip: announced_ip.into(),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Number of transports, producers and consumers not yet closed
    pub async fn open_objects(&self) -> usize {
        let state = self.state.lock().await;
        state.transports.len() + state.producers.len() + state.consumers.len()
    }

    fn random_token(len: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn random_fingerprint() -> String {
        let mut rng = rand::thread_rng();
        (0..32)
            .map(|_| format!("{:02X}", rng.r#gen::<u8>()))
            .collect::<Vec<_>>()
            .join(":")
    }

    fn transport_params(&self, id: String) -> TransportParams {
        let port = rand::thread_rng().gen_range(40000..50000);

        TransportParams {
            id,
            ice_parameters: IceParameters {
                username_fragment: Self::random_token(16),
                password: Self::random_token(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: 1_076_302_079,
                ip: self.announced_ip.clone(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: Self::random_fingerprint(),
                }],
            },
        }
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    async fn create_transport(&self, direction: TransportDirection) -> EngineResult<TransportParams> {
        let id = Uuid::new_v4().to_string();
        let params = self.transport_params(id.clone());

        self.state.lock().await.transports.insert(
            id.clone(),
            TransportEntry {
                direction,
                connected: false,
            },
        );

        tracing::debug!("Engine created {:?} transport {}", direction, id);
        Ok(params)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Engine(
                "DTLS parameters carry no fingerprint".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        state.open_transport(transport_id)?;

        if let Some(transport) = state.transports.get_mut(transport_id) {
            if transport.connected {
                return Err(EngineError::Engine(format!(
                    "Transport {} is already connected",
                    transport_id
                )));
            }
            transport.connected = true;
        }

        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<String> {
        let codec = rtp_parameters
            .codecs
            .iter()
            .find(|c| c.mime_type.to_ascii_lowercase().starts_with(kind.mime_prefix()))
            .ok_or_else(|| EngineError::UnsupportedCodec(format!("no {:?} codec offered", kind)))?;

        if !self.capabilities.supports(&codec.mime_type) {
            return Err(EngineError::UnsupportedCodec(codec.mime_type.clone()));
        }

        let mut state = self.state.lock().await;
        let transport = state.open_transport(transport_id)?;
        if transport.direction != TransportDirection::Send {
            return Err(EngineError::WrongDirection(transport_id.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            ProducerEntry {
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters,
            },
        );

        tracing::debug!("Engine created {:?} producer {} on {}", kind, id, transport_id);
        Ok(id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        caller_capabilities: &RtpCapabilities,
    ) -> EngineResult<ConsumerParams> {
        let mut state = self.state.lock().await;

        let transport = state.open_transport(transport_id)?;
        if transport.direction != TransportDirection::Recv {
            return Err(EngineError::WrongDirection(transport_id.to_string()));
        }

        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| state.missing(producer_id, EngineError::ProducerNotFound))?;

        let codecs: Vec<_> = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| caller_capabilities.supports(&c.mime_type))
            .cloned()
            .collect();

        if codecs.is_empty() {
            return Err(EngineError::CannotConsume(producer_id.to_string()));
        }

        let params = ConsumerParams {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            rtp_parameters: RtpParameters {
                codecs,
                ..producer.rtp_parameters.clone()
            },
        };

        state.consumers.insert(
            params.id.clone(),
            ConsumerEntry {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        );

        Ok(params)
    }

    async fn close_transport(&self, transport_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.open_transport(transport_id)?;

        state.transports.remove(transport_id);
        state.closed.bury(transport_id.to_string());

        let producers: Vec<String> = state
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in &producers {
            state.remove_producer(producer_id);
        }
        state.remove_consumers(|c| c.transport_id != transport_id);

        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;

        if !state.producers.contains_key(producer_id) {
            return Err(state.missing(producer_id, EngineError::ProducerNotFound));
        }
        state.remove_producer(producer_id);

        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;

        if state.consumers.remove(consumer_id).is_none() {
            return Err(state.missing(consumer_id, EngineError::ConsumerNotFound));
        }
        state.closed.bury(consumer_id.to_string());

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::tolerate_closed;
    use moshimoshi_protocol::RtpCodecParameters;
    use serde_json::Map;

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 101,
                clock_rate: 90000,
                channels: None,
                parameters: Map::new(),
                rtcp_feedback: vec![],
            }],
            ..Default::default()
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AB:CD".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_produce_and_consume() {
        let engine = LocalEngine::new("127.0.0.1");
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let recv = engine.create_transport(TransportDirection::Recv).await.unwrap();
        engine.connect_transport(&send.id, dtls()).await.unwrap();

        let producer_id = engine
            .produce(&send.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let consumer = engine
            .consume(&recv.id, &producer_id, &engine.capabilities())
            .await
            .unwrap();

        assert_eq!(consumer.producer_id, producer_id);
        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(consumer.rtp_parameters.codecs.len(), 1);
        assert_eq!(engine.open_objects().await, 4);
    }

    #[tokio::test]
    async fn test_produce_on_recv_transport_fails() {
        let engine = LocalEngine::new("127.0.0.1");
        let recv = engine.create_transport(TransportDirection::Recv).await.unwrap();

        let result = engine.produce(&recv.id, MediaKind::Video, vp8_parameters()).await;
        assert_eq!(result, Err(EngineError::WrongDirection(recv.id)));
    }

    #[tokio::test]
    async fn test_unsupported_codec_is_rejected() {
        let engine = LocalEngine::new("127.0.0.1");
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let mut params = vp8_parameters();
        params.codecs[0].mime_type = "video/H265".to_string();

        let result = engine.produce(&send.id, MediaKind::Video, params).await;
        assert!(matches!(result, Err(EngineError::UnsupportedCodec(_))));
    }

    #[tokio::test]
    async fn test_consume_without_matching_codec_fails() {
        let engine = LocalEngine::new("127.0.0.1");
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let recv = engine.create_transport(TransportDirection::Recv).await.unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        let audio_only = RtpCapabilities {
            codecs: engine
                .capabilities()
                .codecs
                .into_iter()
                .filter(|c| c.kind == MediaKind::Audio)
                .collect(),
            header_extensions: vec![],
        };

        let result = engine.consume(&recv.id, &producer_id, &audio_only).await;
        assert_eq!(result.err(), Some(EngineError::CannotConsume(producer_id)));
    }

    #[tokio::test]
    async fn test_second_close_reports_already_closed() {
        let engine = LocalEngine::new("127.0.0.1");
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();

        engine.close_transport(&send.id).await.unwrap();
        let again = engine.close_transport(&send.id).await;

        assert_eq!(again, Err(EngineError::AlreadyClosed(send.id.clone())));
        assert!(tolerate_closed(again).is_ok());
    }

    #[tokio::test]
    async fn test_closing_transport_cascades() {
        let engine = LocalEngine::new("127.0.0.1");
        let send = engine.create_transport(TransportDirection::Send).await.unwrap();
        let recv = engine.create_transport(TransportDirection::Recv).await.unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let consumer = engine
            .consume(&recv.id, &producer_id, &engine.capabilities())
            .await
            .unwrap();

        engine.close_transport(&send.id).await.unwrap();

        assert_eq!(
            engine.close_producer(&producer_id).await,
            Err(EngineError::AlreadyClosed(producer_id.clone()))
        );
        assert_eq!(
            engine.close_consumer(&consumer.id).await,
            Err(EngineError::AlreadyClosed(consumer.id.clone()))
        );
        assert_eq!(engine.open_objects().await, 1);
    }

    #[tokio::test]
    async fn test_closed_objects_are_evicted() {
        let engine = LocalEngine::new("127.0.0.1");

        let mut ids = Vec::new();
        for _ in 0..TOMBSTONE_CAPACITY + 10 {
            let transport = engine.create_transport(TransportDirection::Send).await.unwrap();
            engine.close_transport(&transport.id).await.unwrap();
            ids.push(transport.id);
        }

        let state = engine.state.lock().await;
        assert!(state.transports.is_empty());
        assert_eq!(state.closed.order.len(), TOMBSTONE_CAPACITY);
        drop(state);

        assert_eq!(
            engine.close_transport(&ids[0]).await,
            Err(EngineError::TransportNotFound(ids[0].clone()))
        );
        let last = ids.last().unwrap();
        assert_eq!(
            engine.close_transport(last).await,
            Err(EngineError::AlreadyClosed(last.clone()))
        );
    }
}
