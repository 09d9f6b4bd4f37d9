use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::models::{CreateMeeting, Meeting, MeetingWithParticipants};
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use moshimoshi_protocol::ParticipantData;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize)]
pub struct AttendResponse {
    pub already: bool,
    pub is_owner: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub success: bool,
    pub meeting_finished: bool,
    pub message: String,
}

pub async fn list_meetings(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Result<Json<Vec<MeetingWithParticipants>>> {
    let meetings = state.directory.find_active_meetings().await?;
    Ok(Json(meetings))
}

pub async fn create_meeting(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(input): Json<CreateMeeting>,
) -> Result<(StatusCode, Json<Meeting>)> {
    let name = input.validated_name().map_err(AppError::BadRequest)?;
    let meeting = state.directory.create_meeting(name, auth.user_id).await?;

    tracing::info!("{} created meeting {} ({})", auth.name, meeting.id, meeting.name);
    Ok((StatusCode::CREATED, Json(meeting)))
}

pub async fn get_meeting(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<MeetingWithParticipants>> {
    let meeting = state.directory.find_meeting(id).await?;
    Ok(Json(meeting))
}

pub async fn attend_meeting(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<AttendResponse>> {
    let outcome = state.rooms.attend(id, auth.user_id, None).await?;

    Ok(Json(AttendResponse {
        already: outcome.already,
        is_owner: outcome.is_owner,
        message: outcome.message().to_string(),
    }))
}

pub async fn leave_meeting(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<LeaveResponse>> {
    let outcome = state.rooms.leave(id, auth.user_id).await?;

    Ok(Json(LeaveResponse {
        success: true,
        meeting_finished: outcome.meeting_finished,
        message: "left".to_string(),
    }))
}

pub async fn list_participants(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ParticipantData>>> {
    let participants = state.rooms.participants(id).await?;
    Ok(Json(participants))
}
