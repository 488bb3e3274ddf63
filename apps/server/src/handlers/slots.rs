use axum::{
    extract::{Query, State},
    Json,
};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::models::{ApiResponse, SlotsQuery};
use crate::schedule::Slot;
use crate::{booking, AppState};

/// GET /api/slots?master_id=&date=YYYY-MM-DD&service_id=
pub async fn available_slots(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SlotsQuery>,
) -> ApiResult<Vec<Slot>> {
    let slots = booking::service_slots(&state.db, q.master_id, q.service_id, &q.date).await?;
    Ok(Json(ApiResponse::success(slots)))
}
