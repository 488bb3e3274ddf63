use axum::{
    extract::{Path, Query, State},
    Json,
};
use std::sync::Arc;

use crate::auth::CurrentUser;
use crate::error::{ApiResult, AppError};
use crate::lifecycle::{self, Action};
use crate::models::{
    ApiResponse, Appointment, AppointmentView, AppointmentsQuery, CreateAppointmentRequest, ListRole,
};
use crate::{booking, AppState};

/// POST /api/appointments
pub async fn create(
    State(state): State<Arc<AppState>>,
    CurrentUser(client): CurrentUser,
    Json(req): Json<CreateAppointmentRequest>,
) -> ApiResult<Appointment> {
    let booked = booking::create_appointment(&state.db, &state.locks, &client, req).await?;
    state.notifications.publish_all(booked.notifications);
    Ok(Json(ApiResponse::success(booked.appointment)))
}

/// GET /api/appointments/my?role=master|client. Masters default to their own
/// bookings, everyone else to the appointments they made.
pub async fn list(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(q): Query<AppointmentsQuery>,
) -> ApiResult<Vec<AppointmentView>> {
    let role = q.role.unwrap_or(if user.is_master() {
        ListRole::Master
    } else {
        ListRole::Client
    });
    let appointments = booking::list_appointments(&state.db, &user, role).await?;
    Ok(Json(ApiResponse::success(appointments)))
}

/// PATCH /api/appointments/{id}/{action}
pub async fn transition(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path((id, action)): Path<(i64, String)>,
) -> ApiResult<Appointment> {
    let action = Action::parse(&action).ok_or(AppError::NotFound("action"))?;
    let transition = lifecycle::apply(&state.db, &state.locks, id, &user, action).await?;
    state.notifications.publish_all(transition.notifications);
    Ok(Json(ApiResponse::success(transition.appointment)))
}
