//! Unauthenticated views of a master, used by the booking page.

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::error::{ApiResult, AppError};
use crate::models::{ApiResponse, PublicMaster, Service};
use crate::{catalog, reviews, users, AppState};

/// GET /api/public/masters/{id}
pub async fn master(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult<PublicMaster> {
    let user = users::find_by_id(&state.db, id)
        .await?
        .ok_or(AppError::NotFound("master"))?;
    let profile = user.master_profile().ok_or(AppError::NotFound("master"))?;
    let rating = reviews::rating_summary(&state.db, id).await?;

    Ok(Json(ApiResponse::success(PublicMaster {
        id: user.id,
        name: user.public_name().to_string(),
        description: profile.description.clone(),
        avatar_url: profile.avatar_url.clone(),
        phone: profile.phone.clone(),
        location: profile.location.clone(),
        rating,
    })))
}

/// GET /api/public/services/{master_id}
pub async fn services(State(state): State<Arc<AppState>>, Path(master_id): Path<i64>) -> ApiResult<Vec<Service>> {
    let services = catalog::list_active(&state.db, master_id).await?;
    Ok(Json(ApiResponse::success(services)))
}
