use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::auth::CurrentUser;
use crate::error::ApiResult;
use crate::models::{ApiResponse, CanLeaveReview, CreateReviewRequest, MasterReviews, Review};
use crate::{reviews, AppState};

/// POST /api/reviews
pub async fn create(
    State(state): State<Arc<AppState>>,
    CurrentUser(client): CurrentUser,
    Json(req): Json<CreateReviewRequest>,
) -> ApiResult<Review> {
    let review = reviews::create(&state.db, &client, req).await?;
    Ok(Json(ApiResponse::success(review)))
}

/// GET /api/reviews/master/{id}
pub async fn for_master(State(state): State<Arc<AppState>>, Path(master_id): Path<i64>) -> ApiResult<MasterReviews> {
    let list = reviews::list_for_master(&state.db, master_id).await?;
    let rating = reviews::rating_summary(&state.db, master_id).await?;
    Ok(Json(ApiResponse::success(MasterReviews { reviews: list, rating })))
}

/// GET /api/reviews/can-leave/{appointment_id}
pub async fn can_leave(
    State(state): State<Arc<AppState>>,
    CurrentUser(client): CurrentUser,
    Path(appointment_id): Path<i64>,
) -> ApiResult<CanLeaveReview> {
    let can_leave = reviews::can_leave(&state.db, &client, appointment_id).await?;
    Ok(Json(ApiResponse::success(CanLeaveReview { can_leave })))
}
