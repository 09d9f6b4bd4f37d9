use chrono::{DateTime, Utc};
use moshimoshi_protocol::ParticipantData;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Durable attendance record for one user in one meeting
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, PartialEq)]
pub struct Participant {
    pub meeting_id: Uuid,
    pub user_id: Uuid,
    pub user_name: String,
    pub is_owner: bool,
    pub producer_id: Option<String>,
    pub attended_at: DateTime<Utc>,
}

impl From<Participant> for ParticipantData {
    fn from(p: Participant) -> Self {
        ParticipantData {
            user_id: p.user_id,
            user_name: p.user_name,
            is_owner: p.is_owner,
            producer_id: p.producer_id,
            attended_at: Some(p.attended_at),
        }
    }
}

/// Result of an attend call; `already` is the non-error "already attending" state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttendOutcome {
    pub already: bool,
    pub is_owner: bool,
}

impl AttendOutcome {
    pub fn message(&self) -> &'static str {
        if self.already { "Already attended" } else { "attended" }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The leave finished the meeting (owner left)
    pub meeting_finished: bool,
}

/// Fallback display name for users unknown to the directory
pub fn placeholder_name(user_id: Uuid) -> String {
    let id = user_id.simple().to_string();
    format!("User {}", &id[..8])
}
