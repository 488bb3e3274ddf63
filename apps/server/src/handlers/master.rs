//! Master dashboard: profile, working dates, service catalog.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::auth::CurrentUser;
use crate::error::{ApiResult, AppError};
use crate::models::{ApiResponse, CreateServiceRequest, Service, UpdateProfileRequest, User, WorkingDatesRequest};
use crate::{catalog, users, AppState};

fn require_master(user: User) -> Result<User, AppError> {
    if user.is_master() {
        Ok(user)
    } else {
        Err(AppError::AccessDenied)
    }
}

/// GET /api/master/profile
pub async fn get_profile(CurrentUser(user): CurrentUser) -> ApiResult<User> {
    Ok(Json(ApiResponse::success(require_master(user)?)))
}

/// PUT /api/master/profile
pub async fn update_profile(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<UpdateProfileRequest>,
) -> ApiResult<User> {
    let updated = users::update_profile(&state.db, &user, req).await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// PUT /api/master/working-dates replaces the whole map.
///
/// The body is decoded here rather than by the `Json` extractor so a bad
/// date or window comes back as a 400 in the usual envelope.
pub async fn set_working_dates(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<User> {
    let req: WorkingDatesRequest =
        serde_json::from_value(body).map_err(|e| AppError::Validation(e.to_string()))?;
    let updated = users::set_working_dates(&state.db, &user, &req.working_dates).await?;
    Ok(Json(ApiResponse::success(updated)))
}

/// GET /api/master/services
pub async fn list_services(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Vec<Service>> {
    let master = require_master(user)?;
    let services = catalog::list_active(&state.db, master.id).await?;
    Ok(Json(ApiResponse::success(services)))
}

/// POST /api/master/services
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateServiceRequest>,
) -> ApiResult<Service> {
    let service = catalog::create(&state.db, &user, req).await?;
    Ok(Json(ApiResponse::success(service)))
}

/// DELETE /api/master/services/{id}
pub async fn delete_service(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<i64>,
) -> ApiResult<()> {
    catalog::deactivate(&state.db, &user, id).await?;
    tracing::info!(master_id = user.id, service_id = id, "service deactivated");
    Ok(Json(ApiResponse::success(())))
}
