use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Longest meeting name accepted by `create_meeting`
pub const MAX_MEETING_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Meeting {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>, // Some => closed for good
}

impl Meeting {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }
}

/// Participant summary embedded in meeting listings
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct MeetingMember {
    pub user_id: Uuid,
    pub user_name: String,
    pub is_owner: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeetingWithParticipants {
    #[serde(flatten)]
    pub meeting: Meeting,
    /// Owner first
    pub participants: Vec<MeetingMember>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMeeting {
    pub name: String,
}

impl CreateMeeting {
    pub fn validated_name(&self) -> Result<&str, String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("Meeting name must not be empty".to_string());
        }
        if name.chars().count() > MAX_MEETING_NAME_LEN {
            return Err(format!(
                "Meeting name must be at most {} characters",
                MAX_MEETING_NAME_LEN
            ));
        }
        Ok(name)
    }
}
