use super::{DirectoryError, DirectoryResult, ParticipantDirectory};
use crate::models::{
    AttendOutcome, LeaveOutcome, Meeting, MeetingMember, MeetingWithParticipants, Participant,
};
use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

const USER_NAME: &str = "COALESCE(u.name, 'User ' || LEFT(p.user_id::text, 8))";

#[derive(FromRow)]
struct MemberRow {
    meeting_id: Uuid,
    user_id: Uuid,
    user_name: String,
    is_owner: bool,
}

impl From<MemberRow> for MeetingMember {
    fn from(row: MemberRow) -> Self {
        MeetingMember {
            user_id: row.user_id,
            user_name: row.user_name,
            is_owner: row.is_owner,
        }
    }
}

/// Directory backed by the `meetings` and `participants` tables
#[derive(Clone)]
pub struct PgDirectory {
    db: PgPool,
}

impl PgDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn members_of(&self, meeting_ids: &[Uuid]) -> DirectoryResult<HashMap<Uuid, Vec<MeetingMember>>> {
        if meeting_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = sqlx::query_as::<_, MemberRow>(&format!(
            r#"
            SELECT p.meeting_id, p.user_id, {USER_NAME} AS user_name, p.is_owner
            FROM participants p
            LEFT JOIN users u ON u.id = p.user_id
            WHERE p.meeting_id = ANY($1)
            ORDER BY p.is_owner DESC, p.attended_at
            "#
        ))
        .bind(meeting_ids)
        .fetch_all(&self.db)
        .await?;

        let mut members: HashMap<Uuid, Vec<MeetingMember>> = HashMap::new();
        for row in rows {
            members.entry(row.meeting_id).or_default().push(row.into());
        }
        Ok(members)
    }
}

#[async_trait]
impl ParticipantDirectory for PgDirectory {
    async fn find_active_meetings(&self) -> DirectoryResult<Vec<MeetingWithParticipants>> {
        let meetings = sqlx::query_as::<_, Meeting>(
            r#"
            SELECT id, name, created_at, finished_at
            FROM meetings
            WHERE finished_at IS NULL
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        let ids: Vec<Uuid> = meetings.iter().map(|m| m.id).collect();
        let mut members = self.members_of(&ids).await?;

        Ok(meetings
            .into_iter()
            .map(|meeting| MeetingWithParticipants {
                participants: members.remove(&meeting.id).unwrap_or_default(),
                meeting,
            })
            .collect())
    }

    async fn find_meeting(&self, meeting_id: Uuid) -> DirectoryResult<MeetingWithParticipants> {
        let meeting = sqlx::query_as::<_, Meeting>(
            "SELECT id, name, created_at, finished_at FROM meetings WHERE id = $1",
        )
        .bind(meeting_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(DirectoryError::MeetingNotFound(meeting_id))?;

        let participants = self
            .members_of(&[meeting_id])
            .await?
            .remove(&meeting_id)
            .unwrap_or_default();

        Ok(MeetingWithParticipants {
            meeting,
            participants,
        })
    }

    async fn create_meeting(&self, name: &str, owner_id: Uuid) -> DirectoryResult<Meeting> {
        let mut tx = self.db.begin().await?;

        let meeting = sqlx::query_as::<_, Meeting>(
            r#"
            INSERT INTO meetings (id, name, created_at)
            VALUES ($1, $2, NOW())
            RETURNING id, name, created_at, finished_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO participants (meeting_id, user_id, is_owner, attended_at)
            VALUES ($1, $2, TRUE, NOW())
            "#,
        )
        .bind(meeting.id)
        .bind(owner_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!("Created meeting {} owned by {}", meeting.id, owner_id);
        Ok(meeting)
    }

    async fn upsert_attend(&self, meeting_id: Uuid, user_id: Uuid) -> DirectoryResult<AttendOutcome> {
        let mut tx = self.db.begin().await?;

        // Row lock on the meeting serializes attends and leaves for this room
        let active: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM meetings WHERE id = $1 AND finished_at IS NULL FOR UPDATE",
        )
        .bind(meeting_id)
        .fetch_optional(&mut *tx)
        .await?;

        if active.is_none() {
            return Err(DirectoryError::MeetingNotFound(meeting_id));
        }

        let existing: Option<bool> = sqlx::query_scalar(
            "SELECT is_owner FROM participants WHERE meeting_id = $1 AND user_id = $2",
        )
        .bind(meeting_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(is_owner) = existing {
            tx.commit().await?;
            return Ok(AttendOutcome {
                already: true,
                is_owner,
            });
        }

        let has_participants: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM participants WHERE meeting_id = $1)",
        )
        .bind(meeting_id)
        .fetch_one(&mut *tx)
        .await?;
        let is_owner = !has_participants;

        let inserted = sqlx::query(
            r#"
            INSERT INTO participants (meeting_id, user_id, is_owner, attended_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (meeting_id, user_id) DO NOTHING
            "#,
        )
        .bind(meeting_id)
        .bind(user_id)
        .bind(is_owner)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(AttendOutcome {
            already: inserted.rows_affected() == 0,
            is_owner,
        })
    }

    async fn upsert_producer(
        &self,
        meeting_id: Uuid,
        user_id: Uuid,
        producer_id: &str,
    ) -> DirectoryResult<Participant> {
        sqlx::query_as::<_, Participant>(&format!(
            r#"
            UPDATE participants p
            SET producer_id = $3, attended_at = NOW()
            FROM meetings m
            LEFT JOIN users u ON u.id = $2
            WHERE p.meeting_id = $1 AND p.user_id = $2
              AND m.id = p.meeting_id AND m.finished_at IS NULL
            RETURNING p.meeting_id, p.user_id, {USER_NAME} AS user_name,
                      p.is_owner, p.producer_id, p.attended_at
            "#
        ))
        .bind(meeting_id)
        .bind(user_id)
        .bind(producer_id)
        .fetch_optional(&self.db)
        .await?
        .ok_or(DirectoryError::ParticipantNotFound { meeting_id, user_id })
    }

    async fn clear_producer(&self, meeting_id: Uuid, user_id: Uuid, producer_id: &str) -> DirectoryResult<()> {
        sqlx::query(
            r#"
            UPDATE participants SET producer_id = NULL
            WHERE meeting_id = $1 AND user_id = $2 AND producer_id = $3
            "#,
        )
        .bind(meeting_id)
        .bind(user_id)
        .bind(producer_id)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn remove_participant(&self, meeting_id: Uuid, user_id: Uuid) -> DirectoryResult<LeaveOutcome> {
        let mut tx = self.db.begin().await?;

        let is_owner: bool = sqlx::query_scalar(
            r#"
            SELECT is_owner FROM participants
            WHERE meeting_id = $1 AND user_id = $2
            FOR UPDATE
            "#,
        )
        .bind(meeting_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DirectoryError::ParticipantNotFound { meeting_id, user_id })?;

        let mut meeting_finished = false;
        if is_owner {
            let finished = sqlx::query(
                "UPDATE meetings SET finished_at = NOW() WHERE id = $1 AND finished_at IS NULL",
            )
            .bind(meeting_id)
            .execute(&mut *tx)
            .await?;
            meeting_finished = finished.rows_affected() > 0;
        }

        sqlx::query("DELETE FROM participants WHERE meeting_id = $1 AND user_id = $2")
            .bind(meeting_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(LeaveOutcome { meeting_finished })
    }

    async fn finish_room(&self, meeting_id: Uuid) -> DirectoryResult<()> {
        let result = sqlx::query(
            "UPDATE meetings SET finished_at = COALESCE(finished_at, NOW()) WHERE id = $1",
        )
        .bind(meeting_id)
        .execute(&self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DirectoryError::MeetingNotFound(meeting_id));
        }
        Ok(())
    }

    async fn list_active(&self, meeting_id: Uuid) -> DirectoryResult<Vec<Participant>> {
        let finished_at: Option<Option<chrono::DateTime<chrono::Utc>>> =
            sqlx::query_scalar("SELECT finished_at FROM meetings WHERE id = $1")
                .bind(meeting_id)
                .fetch_optional(&self.db)
                .await?;

        match finished_at {
            None => return Err(DirectoryError::MeetingNotFound(meeting_id)),
            Some(Some(_)) => return Ok(Vec::new()),
            Some(None) => {}
        }

        let participants = sqlx::query_as::<_, Participant>(&format!(
            r#"
            SELECT p.meeting_id, p.user_id, {USER_NAME} AS user_name,
                   p.is_owner, p.producer_id, p.attended_at
            FROM participants p
            LEFT JOIN users u ON u.id = p.user_id
            WHERE p.meeting_id = $1
            ORDER BY p.is_owner DESC, p.attended_at
            "#
        ))
        .bind(meeting_id)
        .fetch_all(&self.db)
        .await?;

        Ok(participants)
    }
}
