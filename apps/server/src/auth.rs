use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::AppError;
use crate::models::{TelegramUser, User};
use crate::{users, AppState};

type HmacSha256 = Hmac<Sha256>;

pub const INIT_DATA_HEADER: &str = "x-telegram-init-data";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InitDataError {
    #[error("init data has no hash")]
    MissingHash,
    #[error("init data has no auth_date")]
    MissingAuthDate,
    #[error("init data expired {age}s ago")]
    Expired { age: i64 },
    #[error("init data signature mismatch")]
    BadSignature,
    #[error("init data has no user")]
    MissingUser,
    #[error("init data user is malformed")]
    MalformedUser,
}

/// secret_key = HMAC-SHA256(key = "WebAppData", msg = bot_token)
fn secret_key(bot_token: &str) -> Result<Vec<u8>, InitDataError> {
    let mut mac = HmacSha256::new_from_slice(b"WebAppData").map_err(|_| InitDataError::BadSignature)?;
    mac.update(bot_token.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sorted `key=value` pairs except `hash`, joined by newlines.
fn data_check_string(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .filter(|(k, _)| k.as_str() != "hash")
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Validates Telegram Mini App initData and extracts the user.
/// See: https://core.telegram.org/bots/webapps#validating-data-received-via-the-mini-app
pub fn validate_init_data(
    init_data: &str,
    bot_token: &str,
    max_age_secs: i64,
) -> Result<TelegramUser, InitDataError> {
    let params: BTreeMap<String, String> = url::form_urlencoded::parse(init_data.as_bytes())
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let hash = params.get("hash").ok_or(InitDataError::MissingHash)?;
    let expected = hex::decode(hash).map_err(|_| InitDataError::BadSignature)?;

    let mut mac =
        HmacSha256::new_from_slice(&secret_key(bot_token)?).map_err(|_| InitDataError::BadSignature)?;
    mac.update(data_check_string(&params).as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| InitDataError::BadSignature)?;

    // Replay protection
    let auth_date: i64 = params
        .get("auth_date")
        .and_then(|v| v.parse().ok())
        .ok_or(InitDataError::MissingAuthDate)?;
    let age = chrono::Utc::now().timestamp() - auth_date;
    if age > max_age_secs {
        return Err(InitDataError::Expired { age });
    }

    let user_json = params.get("user").ok_or(InitDataError::MissingUser)?;
    serde_json::from_str(user_json).map_err(|_| InitDataError::MalformedUser)
}

/// Raw init data from `Authorization: tma <initData>` or `X-Telegram-Init-Data`.
pub fn init_data_from_headers(headers: &HeaderMap) -> Option<&str> {
    let from_authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("tma "));

    from_authorization.or_else(|| headers.get(INIT_DATA_HEADER).and_then(|v| v.to_str().ok()))
}

pub fn authenticate(init_data: &str, state: &AppState) -> Result<TelegramUser, AppError> {
    validate_init_data(init_data, &state.bot_token, state.auth_max_age_secs).map_err(|e| {
        tracing::warn!(error = %e, "rejected init data");
        AppError::Unauthorized("invalid Telegram auth".into())
    })
}

// ── Extractors ──

/// A verified Telegram identity, registered or not.
#[derive(Debug, Clone)]
pub struct TelegramIdentity(pub TelegramUser);

impl FromRequestParts<Arc<AppState>> for TelegramIdentity {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let init_data = init_data_from_headers(&parts.headers)
            .ok_or_else(|| AppError::Unauthorized("missing Telegram auth".into()))?;
        authenticate(init_data, state).map(TelegramIdentity)
    }
}

/// The registered user behind the request.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub User);

impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let TelegramIdentity(tg) = TelegramIdentity::from_request_parts(parts, state).await?;
        let user = users::find_by_telegram_id(&state.db, &tg.id.to_string())
            .await?
            .ok_or_else(|| AppError::Unauthorized("user is not registered".into()))?;
        Ok(CurrentUser(user))
    }
}

/// Build signed init data the way Telegram does. Test helper.
#[cfg(test)]
pub fn sign_init_data(user_json: &str, auth_date: i64, bot_token: &str) -> String {
    let mut params = BTreeMap::new();
    params.insert("auth_date".to_string(), auth_date.to_string());
    params.insert("query_id".to_string(), "AAH".to_string());
    params.insert("user".to_string(), user_json.to_string());

    let mut mac = HmacSha256::new_from_slice(&secret_key(bot_token).unwrap()).unwrap();
    mac.update(data_check_string(&params).as_bytes());
    let hash = hex::encode(mac.finalize().into_bytes());

    let mut encoded = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &params {
        encoded.append_pair(k, v);
    }
    encoded.append_pair("hash", &hash);
    encoded.finish()
}
