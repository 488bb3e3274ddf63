use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use std::sync::Arc;

use crate::auth::{self, CurrentUser};
use crate::error::{ApiResult, AppError};
use crate::models::{ApiResponse, LoginRequest, User};
use crate::{users, AppState};

/// POST /api/auth/login: register or refresh the caller. Init data may come
/// in the body (`{"init_data": ...}`) or in the usual auth headers.
pub async fn login(State(state): State<Arc<AppState>>, headers: HeaderMap, body: Bytes) -> ApiResult<User> {
    let from_body = if body.is_empty() {
        None
    } else {
        serde_json::from_slice::<LoginRequest>(&body)
            .map_err(|e| AppError::Validation(format!("invalid login body: {e}")))?
            .init_data
    };

    let init_data = from_body
        .as_deref()
        .or_else(|| auth::init_data_from_headers(&headers))
        .ok_or_else(|| AppError::Unauthorized("missing Telegram auth".into()))?;

    let tg = auth::authenticate(init_data, &state)?;
    let user = users::login_or_register(&state.db, &tg).await?;
    tracing::info!(user_id = user.id, telegram_id = %user.telegram_id, "login");

    Ok(Json(ApiResponse::success(user)))
}

/// POST /api/auth/become-master
pub async fn become_master(State(state): State<Arc<AppState>>, CurrentUser(user): CurrentUser) -> ApiResult<User> {
    let master = users::become_master(&state.db, user.id, state.default_gap_minutes).await?;
    Ok(Json(ApiResponse::success(master)))
}
