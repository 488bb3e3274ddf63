//! Users and master profiles.

use sqlx::types::Json;
use sqlx::{SqliteExecutor, SqlitePool};

use crate::error::AppError;
use crate::models::{MasterProfile, TelegramUser, UpdateProfileRequest, User, UserRow};
use crate::schedule::WorkingDates;

/// Longest gap a master may configure between appointments.
pub const MAX_GAP_MINUTES: i64 = 120;

const USER_SELECT: &str =
    "SELECT u.id, u.telegram_id, u.first_name, u.username, u.role,
            p.user_id IS NOT NULL AS has_profile,
            p.display_name, p.description, p.avatar_url, p.phone,
            p.location, p.working_dates, p.gap_minutes
     FROM users u
     LEFT JOIN master_profiles p ON p.user_id = u.id";

pub async fn find_by_id<'e, E: SqliteExecutor<'e>>(
    executor: E,
    id: i64,
) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query_as::<_, UserRow>(&format!("{USER_SELECT} WHERE u.id = ?"))
        .bind(id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(User::from))
}

pub async fn find_by_telegram_id<'e, E: SqliteExecutor<'e>>(
    executor: E,
    telegram_id: &str,
) -> Result<Option<User>, sqlx::Error> {
    let row = sqlx::query_as::<_, UserRow>(&format!("{USER_SELECT} WHERE u.telegram_id = ?"))
        .bind(telegram_id)
        .fetch_optional(executor)
        .await?;
    Ok(row.map(User::from))
}

/// Register a Telegram user as a client, or refresh the name fields of an
/// existing one.
pub async fn login_or_register(db: &SqlitePool, tg: &TelegramUser) -> Result<User, AppError> {
    let telegram_id = tg.id.to_string();

    sqlx::query(
        "INSERT INTO users (telegram_id, first_name, username, role)
         VALUES (?, ?, ?, 'client')
         ON CONFLICT(telegram_id) DO UPDATE SET
             first_name = excluded.first_name,
             username = excluded.username",
    )
    .bind(&telegram_id)
    .bind(&tg.first_name)
    .bind(&tg.username)
    .execute(db)
    .await?;

    find_by_telegram_id(db, &telegram_id)
        .await?
        .ok_or(AppError::NotFound("user"))
}

/// Turn a user into a master with an empty calendar. Idempotent: an
/// existing profile is kept as is.
pub async fn become_master(db: &SqlitePool, user_id: i64, gap_minutes: i64) -> Result<User, AppError> {
    let mut tx = db.begin().await?;

    let updated = sqlx::query("UPDATE users SET role = 'master' WHERE id = ?")
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound("user"));
    }

    sqlx::query(
        "INSERT INTO master_profiles (user_id, working_dates, gap_minutes)
         VALUES (?, ?, ?)
         ON CONFLICT(user_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(Json(WorkingDates::new()))
    .bind(gap_minutes)
    .execute(&mut *tx)
    .await?;

    let user = find_by_id(&mut *tx, user_id)
        .await?
        .ok_or(AppError::NotFound("user"))?;
    tx.commit().await?;

    tracing::info!(user_id, "user became a master");
    Ok(user)
}

/// Apply the fields present in `req` to the master's profile.
pub async fn update_profile(
    db: &SqlitePool,
    master: &User,
    req: UpdateProfileRequest,
) -> Result<User, AppError> {
    let current = master.master_profile().ok_or(AppError::AccessDenied)?;

    if let Some(gap) = req.gap_minutes {
        if !(0..=MAX_GAP_MINUTES).contains(&gap) {
            return Err(AppError::Validation(format!(
                "gap_minutes must be between 0 and {MAX_GAP_MINUTES}"
            )));
        }
    }

    let merged = MasterProfile {
        display_name: req.display_name.unwrap_or_else(|| current.display_name.clone()),
        description: req.description.unwrap_or_else(|| current.description.clone()),
        avatar_url: req.avatar_url.or_else(|| current.avatar_url.clone()),
        phone: req.phone.or_else(|| current.phone.clone()),
        location: req.location.or_else(|| current.location.clone()),
        working_dates: current.working_dates.clone(),
        gap_minutes: req.gap_minutes.unwrap_or(current.gap_minutes),
    };

    sqlx::query(
        "UPDATE master_profiles
         SET display_name = ?, description = ?, avatar_url = ?, phone = ?,
             location = ?, gap_minutes = ?
         WHERE user_id = ?",
    )
    .bind(&merged.display_name)
    .bind(&merged.description)
    .bind(&merged.avatar_url)
    .bind(&merged.phone)
    .bind(merged.location.as_ref().map(Json))
    .bind(merged.gap_minutes)
    .bind(master.id)
    .execute(db)
    .await?;

    find_by_id(db, master.id)
        .await?
        .ok_or(AppError::NotFound("user"))
}

/// Replace the master's whole working-dates map. Windows were validated
/// when the map was deserialized.
pub async fn set_working_dates(
    db: &SqlitePool,
    master: &User,
    dates: &WorkingDates,
) -> Result<User, AppError> {
    if !master.is_master() {
        return Err(AppError::AccessDenied);
    }

    sqlx::query("UPDATE master_profiles SET working_dates = ? WHERE user_id = ?")
        .bind(Json(dates))
        .bind(master.id)
        .execute(db)
        .await?;

    tracing::info!(master_id = master.id, dates = dates.len(), "working dates replaced");

    find_by_id(db, master.id)
        .await?
        .ok_or(AppError::NotFound("user"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::UserKind;

    fn tg(id: i64, name: &str) -> TelegramUser {
        TelegramUser {
            id,
            first_name: name.into(),
            last_name: None,
            username: Some(format!("{name}_tg")),
        }
    }

    #[tokio::test]
    async fn test_register_creates_client() {
        let db = test_pool().await;
        let user = login_or_register(&db, &tg(100, "anna")).await.unwrap();
        assert_eq!(user.telegram_id, "100");
        assert!(matches!(user.kind, UserKind::Client));
    }

    #[tokio::test]
    async fn test_login_refreshes_names() {
        let db = test_pool().await;
        let first = login_or_register(&db, &tg(100, "anna")).await.unwrap();
        let second = login_or_register(&db, &tg(100, "anya")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.first_name, "anya");
    }

    #[tokio::test]
    async fn test_become_master_creates_empty_profile() {
        let db = test_pool().await;
        let user = login_or_register(&db, &tg(100, "anna")).await.unwrap();
        let master = become_master(&db, user.id, 15).await.unwrap();
        let profile = master.master_profile().unwrap();
        assert!(profile.working_dates.is_empty());
        assert_eq!(profile.gap_minutes, 15);

        // second call keeps the profile
        let again = become_master(&db, user.id, 30).await.unwrap();
        assert_eq!(again.master_profile().unwrap().gap_minutes, 15);
    }

    #[tokio::test]
    async fn test_update_profile_rejects_large_gap() {
        let db = test_pool().await;
        let user = login_or_register(&db, &tg(100, "anna")).await.unwrap();
        let master = become_master(&db, user.id, 15).await.unwrap();
        let err = update_profile(
            &db,
            &master,
            UpdateProfileRequest {
                display_name: None,
                description: None,
                avatar_url: None,
                phone: None,
                location: None,
                gap_minutes: Some(500),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_set_working_dates_roundtrip() {
        let db = test_pool().await;
        let user = login_or_register(&db, &tg(100, "anna")).await.unwrap();
        let master = become_master(&db, user.id, 15).await.unwrap();
        let dates: WorkingDates =
            serde_json::from_str(r#"{"2025-06-10": {"start": "09:00", "end": "12:00"}}"#).unwrap();

        let updated = set_working_dates(&db, &master, &dates).await.unwrap();
        assert_eq!(updated.master_profile().unwrap().working_dates, dates);
    }

    #[tokio::test]
    async fn test_client_cannot_set_working_dates() {
        let db = test_pool().await;
        let user = login_or_register(&db, &tg(100, "anna")).await.unwrap();
        let err = set_working_dates(&db, &user, &WorkingDates::new()).await.unwrap_err();
        assert!(matches!(err, AppError::AccessDenied));
    }
}
