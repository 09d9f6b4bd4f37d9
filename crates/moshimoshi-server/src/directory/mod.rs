//! Participant Directory
//!
//! Durable meeting and attendance records. Every method is one atomic unit:
//! a concurrent reader never observes a half-applied write.

mod memory;
mod postgres;

pub use memory::MemoryDirectory;
pub use postgres::PgDirectory;

use crate::models::{AttendOutcome, LeaveOutcome, Meeting, MeetingWithParticipants, Participant};
use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Meeting {0} not found or finished")]
    MeetingNotFound(Uuid),

    #[error("User {user_id} is not attending meeting {meeting_id}")]
    ParticipantNotFound { meeting_id: Uuid, user_id: Uuid },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type DirectoryResult<T> = std::result::Result<T, DirectoryError>;

#[async_trait]
pub trait ParticipantDirectory: Send + Sync {
    /// Unfinished meetings, newest first, each with its participants
    async fn find_active_meetings(&self) -> DirectoryResult<Vec<MeetingWithParticipants>>;

    /// Any meeting by id, finished or not
    async fn find_meeting(&self, meeting_id: Uuid) -> DirectoryResult<MeetingWithParticipants>;

    /// Create a meeting together with its owner's participant record
    async fn create_meeting(&self, name: &str, owner_id: Uuid) -> DirectoryResult<Meeting>;

    /// Record attendance. Existing records are left untouched and reported as
    /// `already`; a new record is the owner iff the room has no participants.
    /// Fails with `MeetingNotFound` for unknown or finished meetings.
    async fn upsert_attend(&self, meeting_id: Uuid, user_id: Uuid) -> DirectoryResult<AttendOutcome>;

    /// Store the participant's latest producer and bump `attended_at`
    async fn upsert_producer(
        &self,
        meeting_id: Uuid,
        user_id: Uuid,
        producer_id: &str,
    ) -> DirectoryResult<Participant>;

    /// Forget `producer_id` if it is still the stored producer. A missing
    /// record or a newer producer is left alone.
    async fn clear_producer(&self, meeting_id: Uuid, user_id: Uuid, producer_id: &str) -> DirectoryResult<()>;

    /// Delete the record; finishes the meeting in the same unit when the
    /// participant is the owner
    async fn remove_participant(&self, meeting_id: Uuid, user_id: Uuid) -> DirectoryResult<LeaveOutcome>;

    /// Mark the meeting finished. Finishing twice keeps the first timestamp.
    async fn finish_room(&self, meeting_id: Uuid) -> DirectoryResult<()>;

    /// Participants of an unfinished meeting, owner first then by attendance
    async fn list_active(&self, meeting_id: Uuid) -> DirectoryResult<Vec<Participant>>;
}
