//! A master's service catalog. Services are soft-deleted so past
//! appointments keep pointing at them.

use sqlx::{SqliteExecutor, SqlitePool};

use crate::error::AppError;
use crate::models::{CreateServiceRequest, LocationType, Service, User};

/// Longest bookable service (12 hours).
pub const MAX_DURATION_MIN: i64 = 720;

const SERVICE_SELECT: &str =
    "SELECT id, master_id, title, price, duration_min, currency, is_active, location_type, image_url
     FROM services";

pub async fn find<'e, E: SqliteExecutor<'e>>(
    executor: E,
    service_id: i64,
) -> Result<Option<Service>, sqlx::Error> {
    sqlx::query_as::<_, Service>(&format!("{SERVICE_SELECT} WHERE id = ?"))
        .bind(service_id)
        .fetch_optional(executor)
        .await
}

pub async fn list_active(db: &SqlitePool, master_id: i64) -> Result<Vec<Service>, sqlx::Error> {
    sqlx::query_as::<_, Service>(&format!(
        "{SERVICE_SELECT} WHERE master_id = ? AND is_active = 1 ORDER BY id ASC"
    ))
    .bind(master_id)
    .fetch_all(db)
    .await
}

fn validate(req: &CreateServiceRequest) -> Result<(), AppError> {
    if req.title.trim().is_empty() {
        return Err(AppError::Validation("title must not be empty".into()));
    }
    if req.price <= 0 {
        return Err(AppError::Validation("price must be positive".into()));
    }
    if !(1..=MAX_DURATION_MIN).contains(&req.duration_min) {
        return Err(AppError::Validation(format!(
            "duration_min must be between 1 and {MAX_DURATION_MIN}"
        )));
    }
    if let Some(currency) = &req.currency {
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(AppError::Validation("currency must be a 3-letter code".into()));
        }
    }
    Ok(())
}

pub async fn create(db: &SqlitePool, master: &User, req: CreateServiceRequest) -> Result<Service, AppError> {
    if !master.is_master() {
        return Err(AppError::AccessDenied);
    }
    validate(&req)?;

    let id = sqlx::query(
        "INSERT INTO services (master_id, title, price, duration_min, currency, location_type, image_url)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(master.id)
    .bind(req.title.trim())
    .bind(req.price)
    .bind(req.duration_min)
    .bind(req.currency.as_deref().unwrap_or("RUB"))
    .bind(req.location_type.unwrap_or(LocationType::AtMaster))
    .bind(&req.image_url)
    .execute(db)
    .await?
    .last_insert_rowid();

    tracing::info!(master_id = master.id, service_id = id, "service created");

    find(db, id).await?.ok_or(AppError::NotFound("service"))
}

/// Soft delete. Only the owning master may deactivate a service.
pub async fn deactivate(db: &SqlitePool, master: &User, service_id: i64) -> Result<(), AppError> {
    let updated = sqlx::query("UPDATE services SET is_active = 0 WHERE id = ? AND master_id = ? AND is_active = 1")
        .bind(service_id)
        .bind(master.id)
        .execute(db)
        .await?;

    if updated.rows_affected() == 0 {
        return Err(AppError::NotFound("service"));
    }
    Ok(())
}
