use super::{DirectoryError, DirectoryResult, ParticipantDirectory};
use crate::models::{
    AttendOutcome, LeaveOutcome, Meeting, MeetingMember, MeetingWithParticipants, Participant,
    placeholder_name,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

struct ParticipantRow {
    is_owner: bool,
    producer_id: Option<String>,
    attended_at: DateTime<Utc>,
    /// Insertion order, breaks ties between equal timestamps
    seq: u64,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, String>,
    meetings: HashMap<Uuid, Meeting>,
    participants: HashMap<(Uuid, Uuid), ParticipantRow>,
    next_seq: u64,
}

impl MemoryState {
    fn user_name(&self, user_id: Uuid) -> String {
        self.users
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| placeholder_name(user_id))
    }

    fn active_meeting(&self, meeting_id: Uuid) -> DirectoryResult<&Meeting> {
        self.meetings
            .get(&meeting_id)
            .filter(|m| !m.is_finished())
            .ok_or(DirectoryError::MeetingNotFound(meeting_id))
    }

    fn insert_participant(&mut self, meeting_id: Uuid, user_id: Uuid, is_owner: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.participants.insert(
            (meeting_id, user_id),
            ParticipantRow {
                is_owner,
                producer_id: None,
                attended_at: Utc::now(),
                seq,
            },
        );
    }

    fn participant(&self, meeting_id: Uuid, user_id: Uuid, row: &ParticipantRow) -> Participant {
        Participant {
            meeting_id,
            user_id,
            user_name: self.user_name(user_id),
            is_owner: row.is_owner,
            producer_id: row.producer_id.clone(),
            attended_at: row.attended_at,
        }
    }

    fn participants_of(&self, meeting_id: Uuid) -> Vec<Participant> {
        let mut rows: Vec<_> = self
            .participants
            .iter()
            .filter(|((m, _), _)| *m == meeting_id)
            .collect();
        rows.sort_by_key(|(_, row)| (!row.is_owner, row.attended_at, row.seq));

        rows.into_iter()
            .map(|((m, u), row)| self.participant(*m, *u, row))
            .collect()
    }

    fn with_participants(&self, meeting: &Meeting) -> MeetingWithParticipants {
        MeetingWithParticipants {
            meeting: meeting.clone(),
            participants: self
                .participants_of(meeting.id)
                .into_iter()
                .map(|p| MeetingMember {
                    user_id: p.user_id,
                    user_name: p.user_name,
                    is_owner: p.is_owner,
                })
                .collect(),
        }
    }
}

/// In-process directory with the same atomicity guarantees as the database
/// one: every call runs under a single lock.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<MemoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make a display name known for `user_id`
    pub async fn add_user(&self, user_id: Uuid, name: impl Into<String>) {
        self.state.lock().await.users.insert(user_id, name.into());
    }

    /// Number of participant records across all meetings
    pub async fn participant_count(&self) -> usize {
        self.state.lock().await.participants.len()
    }
}

#[async_trait]
impl ParticipantDirectory for MemoryDirectory {
    async fn find_active_meetings(&self) -> DirectoryResult<Vec<MeetingWithParticipants>> {
        let state = self.state.lock().await;

        let mut meetings: Vec<&Meeting> = state
            .meetings
            .values()
            .filter(|m| !m.is_finished())
            .collect();
        meetings.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(meetings
            .into_iter()
            .map(|m| state.with_participants(m))
            .collect())
    }

    async fn find_meeting(&self, meeting_id: Uuid) -> DirectoryResult<MeetingWithParticipants> {
        let state = self.state.lock().await;
        let meeting = state
            .meetings
            .get(&meeting_id)
            .ok_or(DirectoryError::MeetingNotFound(meeting_id))?;

        Ok(state.with_participants(meeting))
    }

    async fn create_meeting(&self, name: &str, owner_id: Uuid) -> DirectoryResult<Meeting> {
        let meeting = Meeting {
            id: Uuid::new_v4(),
            name: name.to_string(),
            created_at: Utc::now(),
            finished_at: None,
        };

        let mut state = self.state.lock().await;
        state.meetings.insert(meeting.id, meeting.clone());
        state.insert_participant(meeting.id, owner_id, true);

        Ok(meeting)
    }

    async fn upsert_attend(&self, meeting_id: Uuid, user_id: Uuid) -> DirectoryResult<AttendOutcome> {
        let mut state = self.state.lock().await;
        state.active_meeting(meeting_id)?;

        if let Some(row) = state.participants.get(&(meeting_id, user_id)) {
            return Ok(AttendOutcome {
                already: true,
                is_owner: row.is_owner,
            });
        }

        let is_owner = !state.participants.keys().any(|(m, _)| *m == meeting_id);
        state.insert_participant(meeting_id, user_id, is_owner);

        Ok(AttendOutcome {
            already: false,
            is_owner,
        })
    }

    async fn upsert_producer(
        &self,
        meeting_id: Uuid,
        user_id: Uuid,
        producer_id: &str,
    ) -> DirectoryResult<Participant> {
        let mut state = self.state.lock().await;
        state.active_meeting(meeting_id)?;

        let row = state
            .participants
            .get_mut(&(meeting_id, user_id))
            .ok_or(DirectoryError::ParticipantNotFound { meeting_id, user_id })?;
        row.producer_id = Some(producer_id.to_string());
        row.attended_at = Utc::now();

        let state = &*state;
        let row = state
            .participants
            .get(&(meeting_id, user_id))
            .ok_or(DirectoryError::ParticipantNotFound { meeting_id, user_id })?;
        Ok(state.participant(meeting_id, user_id, row))
    }

    async fn clear_producer(&self, meeting_id: Uuid, user_id: Uuid, producer_id: &str) -> DirectoryResult<()> {
        let mut state = self.state.lock().await;

        if let Some(row) = state.participants.get_mut(&(meeting_id, user_id)) {
            if row.producer_id.as_deref() == Some(producer_id) {
                row.producer_id = None;
            }
        }
        Ok(())
    }

    async fn remove_participant(&self, meeting_id: Uuid, user_id: Uuid) -> DirectoryResult<LeaveOutcome> {
        let mut state = self.state.lock().await;

        let row = state
            .participants
            .remove(&(meeting_id, user_id))
            .ok_or(DirectoryError::ParticipantNotFound { meeting_id, user_id })?;

        let mut meeting_finished = false;
        if row.is_owner {
            if let Some(meeting) = state.meetings.get_mut(&meeting_id) {
                if meeting.finished_at.is_none() {
                    meeting.finished_at = Some(Utc::now());
                    meeting_finished = true;
                }
            }
        }

        Ok(LeaveOutcome { meeting_finished })
    }

    async fn finish_room(&self, meeting_id: Uuid) -> DirectoryResult<()> {
        let mut state = self.state.lock().await;
        let meeting = state
            .meetings
            .get_mut(&meeting_id)
            .ok_or(DirectoryError::MeetingNotFound(meeting_id))?;

        if meeting.finished_at.is_none() {
            meeting.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_active(&self, meeting_id: Uuid) -> DirectoryResult<Vec<Participant>> {
        let state = self.state.lock().await;
        let meeting = state
            .meetings
            .get(&meeting_id)
            .ok_or(DirectoryError::MeetingNotFound(meeting_id))?;

        if meeting.is_finished() {
            return Ok(Vec::new());
        }
        Ok(state.participants_of(meeting_id))
    }
}
