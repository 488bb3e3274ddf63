//! Client reviews of completed appointments.

use sqlx::SqlitePool;

use crate::error::AppError;
use crate::lifecycle::{self, AppointmentStatus};
use crate::models::{CreateReviewRequest, RatingSummary, Review, ReviewView, User};

pub const LIST_LIMIT: i64 = 50;
pub const MAX_COMMENT_LEN: usize = 1000;

async fn exists_for(db: &SqlitePool, appointment_id: i64) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) > 0 FROM reviews WHERE appointment_id = ?")
        .bind(appointment_id)
        .fetch_one(db)
        .await
}

pub async fn create(db: &SqlitePool, client: &User, req: CreateReviewRequest) -> Result<Review, AppError> {
    if !(1..=5).contains(&req.rating) {
        return Err(AppError::Validation("rating must be between 1 and 5".into()));
    }
    let comment = req
        .comment
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if comment.as_ref().is_some_and(|c| c.chars().count() > MAX_COMMENT_LEN) {
        return Err(AppError::Validation(format!(
            "comment must be at most {MAX_COMMENT_LEN} characters"
        )));
    }

    let appointment = lifecycle::find(db, req.appointment_id)
        .await?
        .ok_or(AppError::NotFound("appointment"))?;
    if appointment.client_id != client.id {
        return Err(AppError::AccessDenied);
    }
    if appointment.status != AppointmentStatus::Completed {
        return Err(AppError::ReviewNotAllowed("appointment is not completed"));
    }
    if exists_for(db, appointment.id).await? {
        return Err(AppError::ReviewNotAllowed("appointment already reviewed"));
    }

    let inserted = sqlx::query(
        "INSERT INTO reviews (master_id, client_id, appointment_id, rating, comment)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(appointment.master_id)
    .bind(client.id)
    .bind(appointment.id)
    .bind(req.rating)
    .bind(&comment)
    .execute(db)
    .await;

    let id = match inserted {
        Ok(result) => result.last_insert_rowid(),
        // A concurrent review won the race on the unique index.
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
            return Err(AppError::ReviewNotAllowed("appointment already reviewed"));
        }
        Err(e) => return Err(e.into()),
    };

    tracing::info!(
        review_id = id,
        appointment_id = appointment.id,
        master_id = appointment.master_id,
        rating = req.rating,
        "review created"
    );

    let review = sqlx::query_as::<_, Review>(
        "SELECT id, master_id, client_id, appointment_id, rating, comment, created_at
         FROM reviews WHERE id = ?",
    )
    .bind(id)
    .fetch_one(db)
    .await?;
    Ok(review)
}

/// Newest first.
pub async fn list_for_master(db: &SqlitePool, master_id: i64) -> Result<Vec<ReviewView>, sqlx::Error> {
    sqlx::query_as::<_, ReviewView>(
        "SELECT r.id, r.appointment_id, r.rating, r.comment, r.created_at,
                u.first_name AS client_first_name, u.username AS client_username
         FROM reviews r
         JOIN users u ON u.id = r.client_id
         WHERE r.master_id = ?
         ORDER BY r.created_at DESC, r.id DESC
         LIMIT ?",
    )
    .bind(master_id)
    .bind(LIST_LIMIT)
    .fetch_all(db)
    .await
}

/// Average rounded to one decimal; `{0, 0}` without reviews.
pub async fn rating_summary(db: &SqlitePool, master_id: i64) -> Result<RatingSummary, sqlx::Error> {
    let (average, count): (Option<f64>, i64) =
        sqlx::query_as("SELECT AVG(rating), COUNT(*) FROM reviews WHERE master_id = ?")
            .bind(master_id)
            .fetch_one(db)
            .await?;

    Ok(RatingSummary {
        average: average.map(|a| (a * 10.0).round() / 10.0).unwrap_or(0.0),
        count,
    })
}

/// Whether `client` may review `appointment_id` right now.
pub async fn can_leave(db: &SqlitePool, client: &User, appointment_id: i64) -> Result<bool, AppError> {
    let Some(appointment) = lifecycle::find(db, appointment_id).await? else {
        return Ok(false);
    };
    if appointment.client_id != client.id || appointment.status != AppointmentStatus::Completed {
        return Ok(false);
    }
    Ok(!exists_for(db, appointment_id).await?)
}
