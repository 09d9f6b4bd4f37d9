use super::session::{
    ConsumerHandle, DrainedMedia, OrphanedConsumer, PeerSession, ProducerHandle, SessionMedia,
    TransportHandle,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Who a live producer belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerOwner {
    pub connection_id: Uuid,
    pub user_id: Uuid,
    pub meeting_id: Uuid,
    /// Registration order, newest wins when a user has several
    seq: u64,
}

/// A session taken out of the registry with everything it owned
#[derive(Debug)]
pub struct RemovedSession {
    pub session: Arc<PeerSession>,
    pub meetings: HashSet<Uuid>,
    pub media: DrainedMedia,
}

struct SessionEntry {
    session: Arc<PeerSession>,
    media: SessionMedia,
    meetings: HashSet<Uuid>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<Uuid, SessionEntry>,
    /// Meeting id to connection ids in the room
    rooms: HashMap<Uuid, HashSet<Uuid>>,
    producers: HashMap<String, ProducerOwner>,
    /// Producer id to (connection id, consumer id)
    consumers_by_producer: HashMap<String, Vec<(Uuid, String)>>,
    next_seq: u64,
}

impl RegistryState {
    fn unindex_consumer(&mut self, connection_id: Uuid, consumer: &ConsumerHandle) {
        if let Some(list) = self.consumers_by_producer.get_mut(&consumer.producer_id) {
            list.retain(|(conn, id)| !(*conn == connection_id && *id == consumer.id));
            if list.is_empty() {
                self.consumers_by_producer.remove(&consumer.producer_id);
            }
        }
    }

    /// Drop the producer from the indexes and detach every consumer still on it
    fn unindex_producer(&mut self, producer_id: &str) -> Vec<OrphanedConsumer> {
        self.producers.remove(producer_id);

        let mut orphans = Vec::new();
        for (conn, consumer_id) in self
            .consumers_by_producer
            .remove(producer_id)
            .unwrap_or_default()
        {
            if let Some(entry) = self.sessions.get_mut(&conn) {
                if entry.media.consumers.remove(&consumer_id).is_some() {
                    orphans.push(OrphanedConsumer {
                        connection_id: conn,
                        consumer_id,
                        producer_id: producer_id.to_string(),
                    });
                }
            }
        }
        orphans
    }

    fn leave_room(&mut self, connection_id: Uuid, meeting_id: Uuid) {
        if let Some(members) = self.rooms.get_mut(&meeting_id) {
            members.remove(&connection_id);
            if members.is_empty() {
                self.rooms.remove(&meeting_id);
            }
        }
    }
}

/// Live sessions keyed by connection id, with reverse indexes for room
/// membership, producer ownership and consumers per producer. Every method
/// takes the lock once and never awaits anything else while holding it.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; registering an existing connection returns the stored session
    pub async fn insert(&self, session: PeerSession) -> Arc<PeerSession> {
        let mut state = self.inner.write().await;
        let entry = state
            .sessions
            .entry(session.connection_id)
            .or_insert_with(|| SessionEntry {
                session: Arc::new(session),
                media: SessionMedia::default(),
                meetings: HashSet::new(),
            });
        entry.session.clone()
    }

    pub async fn get(&self, connection_id: Uuid) -> Option<Arc<PeerSession>> {
        self.inner
            .read()
            .await
            .sessions
            .get(&connection_id)
            .map(|e| e.session.clone())
    }

    pub async fn is_connected(&self, connection_id: Uuid) -> bool {
        self.inner.read().await.sessions.contains_key(&connection_id)
    }

    pub async fn connection_ids(&self) -> Vec<Uuid> {
        self.inner.read().await.sessions.keys().copied().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Detach the session from every room and index in one step. Returns
    /// `None` when it was already removed.
    pub async fn remove(&self, connection_id: Uuid) -> Option<RemovedSession> {
        let mut state = self.inner.write().await;
        let entry = state.sessions.remove(&connection_id)?;

        for meeting_id in &entry.meetings {
            state.leave_room(connection_id, *meeting_id);
        }

        let mut media = DrainedMedia::default();
        for consumer in entry.media.consumers.into_values() {
            state.unindex_consumer(connection_id, &consumer);
            media.consumers.push(consumer);
        }
        for producer in entry.media.producers.into_values() {
            media.orphans.extend(state.unindex_producer(&producer.id));
            media.producers.push(producer);
        }
        media.transports.extend(entry.media.transports.into_values());

        Some(RemovedSession {
            session: entry.session,
            meetings: entry.meetings,
            media,
        })
    }

    /// Returns false when the session is gone
    pub async fn join_room(&self, connection_id: Uuid, meeting_id: Uuid) -> bool {
        let mut guard = self.inner.write().await;
        let state = &mut *guard;
        match state.sessions.get_mut(&connection_id) {
            Some(entry) => {
                entry.meetings.insert(meeting_id);
                state.rooms.entry(meeting_id).or_default().insert(connection_id);
                true
            }
            None => false,
        }
    }

    /// Take the session out of the room along with the media it holds there.
    /// Transports go too once the session is in no other room.
    pub async fn leave_room(&self, connection_id: Uuid, meeting_id: Uuid) -> DrainedMedia {
        let mut state = self.inner.write().await;
        let mut media = DrainedMedia::default();

        let Some(entry) = state.sessions.get_mut(&connection_id) else {
            return media;
        };
        entry.meetings.remove(&meeting_id);
        let release_all = entry.meetings.is_empty();

        let consumer_ids: Vec<String> = entry
            .media
            .consumers
            .values()
            .filter(|c| release_all || c.meeting_id == meeting_id)
            .map(|c| c.id.clone())
            .collect();
        let producer_ids: Vec<String> = entry
            .media
            .producers
            .values()
            .filter(|p| release_all || p.meeting_id == meeting_id)
            .map(|p| p.id.clone())
            .collect();

        for id in &consumer_ids {
            if let Some(consumer) = entry.media.consumers.remove(id) {
                media.consumers.push(consumer);
            }
        }
        for id in &producer_ids {
            if let Some(producer) = entry.media.producers.remove(id) {
                media.producers.push(producer);
            }
        }
        if release_all {
            media
                .transports
                .extend(entry.media.transports.drain().map(|(_, t)| t));
        }

        state.leave_room(connection_id, meeting_id);
        for consumer in &media.consumers {
            state.unindex_consumer(connection_id, consumer);
        }
        for producer in &media.producers {
            let orphans = state.unindex_producer(&producer.id);
            media.orphans.extend(orphans);
        }

        media
    }

    pub async fn room_members(&self, meeting_id: Uuid) -> Vec<Arc<PeerSession>> {
        let state = self.inner.read().await;
        state
            .rooms
            .get(&meeting_id)
            .into_iter()
            .flatten()
            .filter_map(|conn| state.sessions.get(conn).map(|e| e.session.clone()))
            .collect()
    }

    pub async fn is_member(&self, meeting_id: Uuid, connection_id: Uuid) -> bool {
        self.inner
            .read()
            .await
            .rooms
            .get(&meeting_id)
            .is_some_and(|members| members.contains(&connection_id))
    }

    /// Connections of `user_id` currently in the room
    pub async fn user_sessions_in_room(&self, meeting_id: Uuid, user_id: Uuid) -> Vec<Uuid> {
        let state = self.inner.read().await;
        state
            .rooms
            .get(&meeting_id)
            .into_iter()
            .flatten()
            .filter(|conn| {
                state
                    .sessions
                    .get(conn)
                    .is_some_and(|e| e.session.user_id == user_id)
            })
            .copied()
            .collect()
    }

    pub async fn add_transport(&self, connection_id: Uuid, transport: TransportHandle) -> bool {
        let mut state = self.inner.write().await;
        match state.sessions.get_mut(&connection_id) {
            Some(entry) => {
                entry.media.transports.insert(transport.id.clone(), transport);
                true
            }
            None => false,
        }
    }

    /// A transport only resolves for the session that created it
    pub async fn transport(&self, connection_id: Uuid, transport_id: &str) -> Option<TransportHandle> {
        self.inner
            .read()
            .await
            .sessions
            .get(&connection_id)
            .and_then(|e| e.media.transports.get(transport_id).cloned())
    }

    /// Record the producer and put the session in its room. Returns false
    /// when the session is gone.
    pub async fn add_producer(&self, connection_id: Uuid, producer: ProducerHandle) -> bool {
        let mut guard = self.inner.write().await;
        let state = &mut *guard;

        let Some(entry) = state.sessions.get_mut(&connection_id) else {
            return false;
        };

        let seq = state.next_seq;
        state.next_seq += 1;

        entry.meetings.insert(producer.meeting_id);
        state
            .rooms
            .entry(producer.meeting_id)
            .or_default()
            .insert(connection_id);
        state.producers.insert(
            producer.id.clone(),
            ProducerOwner {
                connection_id,
                user_id: entry.session.user_id,
                meeting_id: producer.meeting_id,
                seq,
            },
        );
        entry.media.producers.insert(producer.id.clone(), producer);
        true
    }

    /// Remove a producer owned by `connection_id`
    pub async fn remove_producer(
        &self,
        connection_id: Uuid,
        producer_id: &str,
    ) -> Option<(ProducerHandle, Vec<OrphanedConsumer>)> {
        let mut state = self.inner.write().await;

        let producer = state
            .sessions
            .get_mut(&connection_id)?
            .media
            .producers
            .remove(producer_id)?;
        let orphans = state.unindex_producer(producer_id);

        Some((producer, orphans))
    }

    pub async fn producer_owner(&self, producer_id: &str) -> Option<ProducerOwner> {
        self.inner.read().await.producers.get(producer_id).cloned()
    }

    /// Returns false when the session or the producer is gone
    pub async fn add_consumer(&self, connection_id: Uuid, consumer: ConsumerHandle) -> bool {
        let mut guard = self.inner.write().await;
        let state = &mut *guard;

        if !state.producers.contains_key(&consumer.producer_id) {
            return false;
        }
        let Some(entry) = state.sessions.get_mut(&connection_id) else {
            return false;
        };

        state
            .consumers_by_producer
            .entry(consumer.producer_id.clone())
            .or_default()
            .push((connection_id, consumer.id.clone()));
        entry.media.consumers.insert(consumer.id.clone(), consumer);
        true
    }

    /// Newest producer of `user_id` whose session is in the room
    pub async fn live_producer(&self, meeting_id: Uuid, user_id: Uuid) -> Option<String> {
        let state = self.inner.read().await;
        let members = state.rooms.get(&meeting_id)?;

        state
            .producers
            .iter()
            .filter(|(_, owner)| {
                owner.user_id == user_id
                    && owner.meeting_id == meeting_id
                    && members.contains(&owner.connection_id)
            })
            .max_by_key(|(_, owner)| owner.seq)
            .map(|(id, _)| id.clone())
    }
}
