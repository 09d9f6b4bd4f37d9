use super::registry::SessionRegistry;
use super::session::{
    ConsumerHandle, DrainedMedia, OrphanedConsumer, PeerSession, ProducerHandle, TransportHandle,
};
use crate::directory::{DirectoryError, ParticipantDirectory};
use crate::error::{AppError, Result};
use crate::media::{EngineResult, MediaEngine, tolerate_closed};
use crate::models::{AttendOutcome, LeaveOutcome};
use moshimoshi_protocol::{
    ConsumerParams, DtlsParameters, MediaKind, ParticipantData, RtpCapabilities, RtpParameters,
    ServerMessage, TransportDirection, TransportParams,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use uuid::Uuid;

type RoomLocks = StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>;

/// Held for the duration of a room's critical section. Dropping a guard
/// prunes every lock nobody holds or waits on, including ones left behind by
/// cancelled waiters.
struct RoomGuard<'a> {
    locks: &'a RoomLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RoomGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

fn connection_closed(connection_id: Uuid) -> AppError {
    AppError::NotFound(format!("connection {connection_id} is closed"))
}

/// Close failures during teardown are logged and otherwise ignored
fn log_close(what: &str, id: &str, result: EngineResult<()>) {
    if let Err(e) = tolerate_closed(result) {
        tracing::warn!("Failed to close {} {}: {}", what, id, e);
    }
}

/// Keeps live sessions, the media engine and the participant directory in
/// agreement. Attend, produce, leave and disconnect for one meeting run one
/// at a time; engine calls stay outside that section.
pub struct RoomCoordinator {
    directory: Arc<dyn ParticipantDirectory>,
    engine: Arc<dyn MediaEngine>,
    registry: SessionRegistry,
    room_locks: RoomLocks,
}

impl RoomCoordinator {
    pub fn new(directory: Arc<dyn ParticipantDirectory>, engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            directory,
            engine,
            registry: SessionRegistry::new(),
            room_locks: StdMutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    async fn lock_room(&self, meeting_id: Uuid) -> RoomGuard<'_> {
        let lock = {
            let mut locks = self.room_locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(meeting_id).or_default().clone()
        };

        RoomGuard {
            locks: &self.room_locks,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Run `op` on its own task so it completes even when the caller is
    /// dropped halfway, as an HTTP handler is when its client goes away
    async fn detached<T, F, Fut>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(op(Arc::clone(self)))
            .await
            .map_err(|e| AppError::Internal(e.into()))?
    }

    /// Number of meetings with a live critical-section lock
    pub fn room_lock_count(&self) -> usize {
        self.room_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn broadcast(&self, meeting_id: Uuid, except: Option<Uuid>, message: &ServerMessage) {
        for member in self.registry.room_members(meeting_id).await {
            if Some(member.connection_id) != except {
                member.send(message);
            }
        }
    }

    pub async fn register(
        &self,
        connection_id: Uuid,
        user_id: Uuid,
        sender: mpsc::UnboundedSender<String>,
    ) -> Arc<PeerSession> {
        let session = self
            .registry
            .insert(PeerSession::new(connection_id, user_id, sender))
            .await;
        tracing::debug!("Registered session {} for user {}", connection_id, user_id);
        session
    }

    pub fn capabilities(&self) -> RtpCapabilities {
        self.engine.capabilities()
    }

    pub async fn create_transport(
        &self,
        connection_id: Uuid,
        direction: TransportDirection,
    ) -> Result<TransportParams> {
        if !self.registry.is_connected(connection_id).await {
            return Err(connection_closed(connection_id));
        }

        let params = self.engine.create_transport(direction).await?;

        let handle = TransportHandle {
            id: params.id.clone(),
            direction,
        };
        if !self.registry.add_transport(connection_id, handle).await {
            log_close("transport", &params.id, self.engine.close_transport(&params.id).await);
            return Err(connection_closed(connection_id));
        }

        Ok(params)
    }

    pub async fn connect_transport(
        &self,
        connection_id: Uuid,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let transport = self
            .registry
            .transport(connection_id, transport_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("transport {transport_id} not found")))?;

        self.engine
            .connect_transport(&transport.id, dtls_parameters)
            .await?;
        Ok(())
    }

    /// Record attendance and, for a socket, join the room. Called without a
    /// connection from the HTTP API.
    pub async fn attend(
        self: &Arc<Self>,
        meeting_id: Uuid,
        user_id: Uuid,
        connection_id: Option<Uuid>,
    ) -> Result<AttendOutcome> {
        self.detached(move |rooms| async move {
            rooms.attend_room(meeting_id, user_id, connection_id).await
        })
        .await
    }

    async fn attend_room(
        &self,
        meeting_id: Uuid,
        user_id: Uuid,
        connection_id: Option<Uuid>,
    ) -> Result<AttendOutcome> {
        let _room = self.lock_room(meeting_id).await;

        let outcome = self.directory.upsert_attend(meeting_id, user_id).await?;

        if let Some(conn) = connection_id {
            if !self.registry.join_room(conn, meeting_id).await {
                // The record was created for a session that is already gone
                if !outcome.already {
                    if let Err(e) = self.directory.remove_participant(meeting_id, user_id).await {
                        tracing::warn!(
                            "Failed to drop record of {} in {} after disconnect: {}",
                            user_id,
                            meeting_id,
                            e
                        );
                    }
                }
                return Err(connection_closed(conn));
            }
        }

        if !outcome.already {
            let joined = ServerMessage::ParticipantJoined {
                meeting_id,
                user_id,
            };
            self.broadcast(meeting_id, connection_id, &joined).await;
            tracing::info!("User {} attended meeting {}", user_id, meeting_id);
        }

        Ok(outcome)
    }

    pub async fn produce(
        &self,
        connection_id: Uuid,
        meeting_id: Uuid,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<String> {
        let session = self
            .registry
            .get(connection_id)
            .await
            .ok_or_else(|| connection_closed(connection_id))?;

        let transport = self
            .registry
            .transport(connection_id, transport_id)
            .await
            .filter(|t| t.direction == TransportDirection::Send)
            .ok_or_else(|| AppError::NotFound(format!("send transport {transport_id} not found")))?;

        let producer_id = self
            .engine
            .produce(&transport.id, kind, rtp_parameters)
            .await?;

        let handle = ProducerHandle {
            id: producer_id.clone(),
            kind,
            meeting_id,
        };

        if let Err(e) = self.publish_producer(&session, handle).await {
            log_close("producer", &producer_id, self.engine.close_producer(&producer_id).await);
            return Err(e);
        }

        Ok(producer_id)
    }

    /// Directory write, then registry, then the push; all inside the room
    async fn publish_producer(&self, session: &PeerSession, producer: ProducerHandle) -> Result<()> {
        let meeting_id = producer.meeting_id;
        let producer_id = producer.id.clone();
        let kind = producer.kind;
        let _room = self.lock_room(meeting_id).await;

        let participant = self
            .directory
            .upsert_producer(meeting_id, session.user_id, &producer_id)
            .await?;

        if !self.registry.add_producer(session.connection_id, producer).await {
            return Err(connection_closed(session.connection_id));
        }

        let message = ServerMessage::NewProducer {
            meeting_id,
            participant: participant.into(),
        };
        self.broadcast(meeting_id, Some(session.connection_id), &message)
            .await;

        tracing::info!(
            "User {} producing {:?} {} in meeting {}",
            session.user_id,
            kind,
            producer_id,
            meeting_id
        );
        Ok(())
    }

    /// Consume a producer of the caller's room. Without explicit
    /// capabilities the router's own are used.
    pub async fn consume(
        &self,
        connection_id: Uuid,
        transport_id: &str,
        producer_id: &str,
        capabilities: Option<RtpCapabilities>,
    ) -> Result<ConsumerParams> {
        let transport = self
            .registry
            .transport(connection_id, transport_id)
            .await
            .filter(|t| t.direction == TransportDirection::Recv)
            .ok_or_else(|| {
                AppError::NotFound(format!("receive transport {transport_id} not found"))
            })?;

        let not_found = || AppError::NotFound(format!("producer {producer_id} not found"));
        let owner = self
            .registry
            .producer_owner(producer_id)
            .await
            .ok_or_else(not_found)?;
        if !self.registry.is_member(owner.meeting_id, connection_id).await {
            return Err(not_found());
        }

        let capabilities = capabilities.unwrap_or_else(|| self.engine.capabilities());
        let params = self
            .engine
            .consume(&transport.id, producer_id, &capabilities)
            .await?;

        let handle = ConsumerHandle {
            id: params.id.clone(),
            producer_id: producer_id.to_string(),
            meeting_id: owner.meeting_id,
        };
        if !self.registry.add_consumer(connection_id, handle).await {
            log_close("consumer", &params.id, self.engine.close_consumer(&params.id).await);
            return Err(not_found());
        }

        Ok(params)
    }

    pub async fn close_producer(&self, connection_id: Uuid, producer_id: &str) -> Result<()> {
        let session = self
            .registry
            .get(connection_id)
            .await
            .ok_or_else(|| connection_closed(connection_id))?;
        let (producer, orphans) = self
            .registry
            .remove_producer(connection_id, producer_id)
            .await
            .ok_or_else(|| AppError::NotFound(format!("producer {producer_id} not found")))?;

        self.forget_producer(session.user_id, &producer).await;
        log_close("producer", &producer.id, self.engine.close_producer(&producer.id).await);
        self.release_orphans(orphans).await;

        tracing::debug!("Closed producer {} of {}", producer.id, connection_id);
        Ok(())
    }

    /// Drop the stored producer id so newcomers are not sent to a dead producer
    async fn forget_producer(&self, user_id: Uuid, producer: &ProducerHandle) {
        let _room = self.lock_room(producer.meeting_id).await;

        if let Err(e) = self
            .directory
            .clear_producer(producer.meeting_id, user_id, &producer.id)
            .await
        {
            tracing::warn!(
                "Failed to clear producer {} of {} in {}: {}",
                producer.id,
                user_id,
                producer.meeting_id,
                e
            );
        }
    }

    /// Durable records, with the producer filled in from a live session in
    /// the room when the record has none. A stored producer id always wins.
    pub async fn participants(&self, meeting_id: Uuid) -> Result<Vec<ParticipantData>> {
        let records = self.directory.list_active(meeting_id).await?;

        let mut participants = Vec::with_capacity(records.len());
        for record in records {
            let mut data = ParticipantData::from(record);
            if data.producer_id.is_none() {
                data.producer_id = self.registry.live_producer(meeting_id, data.user_id).await;
            }
            participants.push(data);
        }

        Ok(participants)
    }

    /// Remove the user from the meeting. Every session of the user leaves the
    /// room and its media there is closed.
    pub async fn leave(self: &Arc<Self>, meeting_id: Uuid, user_id: Uuid) -> Result<LeaveOutcome> {
        self.detached(move |rooms| async move { rooms.leave_room(meeting_id, user_id).await })
            .await
    }

    async fn leave_room(&self, meeting_id: Uuid, user_id: Uuid) -> Result<LeaveOutcome> {
        let (outcome, media) = {
            let _room = self.lock_room(meeting_id).await;

            let outcome = self.directory.remove_participant(meeting_id, user_id).await?;

            let mut media = DrainedMedia::default();
            for conn in self.registry.user_sessions_in_room(meeting_id, user_id).await {
                media.extend(self.registry.leave_room(conn, meeting_id).await);
            }

            self.announce_departure(meeting_id, user_id, outcome).await;
            (outcome, media)
        };

        self.release_media(media).await;

        if outcome.meeting_finished {
            tracing::info!("Owner {} left; meeting {} finished", user_id, meeting_id);
        } else {
            tracing::info!("User {} left meeting {}", user_id, meeting_id);
        }
        Ok(outcome)
    }

    /// Connection teardown. Runs once per connection; later calls do nothing.
    pub async fn disconnect(&self, connection_id: Uuid) {
        let Some(removed) = self.registry.remove(connection_id).await else {
            return;
        };
        let user_id = removed.session.user_id;

        self.release_media(removed.media).await;

        for meeting_id in removed.meetings {
            let _room = self.lock_room(meeting_id).await;

            if !self
                .registry
                .user_sessions_in_room(meeting_id, user_id)
                .await
                .is_empty()
            {
                tracing::debug!(
                    "User {} still has a session in meeting {}; keeping record",
                    user_id,
                    meeting_id
                );
                continue;
            }

            match self.directory.remove_participant(meeting_id, user_id).await {
                Ok(outcome) => self.announce_departure(meeting_id, user_id, outcome).await,
                Err(DirectoryError::ParticipantNotFound { .. }) => {
                    tracing::debug!("User {} had no record in meeting {}", user_id, meeting_id);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to remove user {} from meeting {} on disconnect: {}",
                        user_id,
                        meeting_id,
                        e
                    );
                }
            }
        }

        tracing::info!("Session {} of user {} torn down", connection_id, user_id);
    }

    /// Release every live session's media. Participant records are kept,
    /// minus their producers, so clients can attend again after a restart.
    pub async fn shutdown(&self) {
        for connection_id in self.registry.connection_ids().await {
            if let Some(removed) = self.registry.remove(connection_id).await {
                for producer in &removed.media.producers {
                    self.forget_producer(removed.session.user_id, producer).await;
                }
                self.release_media(removed.media).await;
            }
        }
        tracing::info!("Released all sessions");
    }

    async fn announce_departure(&self, meeting_id: Uuid, user_id: Uuid, outcome: LeaveOutcome) {
        let message = if outcome.meeting_finished {
            ServerMessage::MeetingFinished { meeting_id }
        } else {
            ServerMessage::ParticipantLeft {
                meeting_id,
                user_id,
            }
        };
        self.broadcast(meeting_id, None, &message).await;
    }

    /// Close consumers first, then producers, then transports
    async fn release_media(&self, media: DrainedMedia) {
        for consumer in &media.consumers {
            log_close("consumer", &consumer.id, self.engine.close_consumer(&consumer.id).await);
        }
        for producer in &media.producers {
            log_close("producer", &producer.id, self.engine.close_producer(&producer.id).await);
        }
        for transport in &media.transports {
            log_close("transport", &transport.id, self.engine.close_transport(&transport.id).await);
        }
        self.release_orphans(media.orphans).await;
    }

    async fn release_orphans(&self, orphans: Vec<OrphanedConsumer>) {
        for orphan in orphans {
            log_close(
                "consumer",
                &orphan.consumer_id,
                self.engine.close_consumer(&orphan.consumer_id).await,
            );

            if let Some(session) = self.registry.get(orphan.connection_id).await {
                session.send(&ServerMessage::ProducerClosed {
                    producer_id: orphan.producer_id,
                });
            }
        }
    }
}
