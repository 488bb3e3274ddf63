//! Slot availability and booking admission.
//!
//! A booking is admitted only if its `[start, end)` does not overlap any
//! pending or confirmed appointment of the same master. The overlap check and
//! the insert run inside one transaction while holding that master's lock, so
//! two concurrent requests can never both see a free slot.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::AppError;
use crate::lifecycle;
use crate::models::{
    Appointment, AppointmentView, CreateAppointmentRequest, ListRole, LocationType, Service, User,
};
use crate::notify::{self, Notification};
use crate::schedule::{self, compute_slots, Interval, Slot, TimeOfDay};
use crate::{catalog, users};

/// Gap used when a master profile does not set one.
pub const DEFAULT_GAP_MINUTES: i64 = 15;

pub const MAX_COMMENT_LEN: usize = 500;

// ── Per-master locks ──

type LockMap = DashMap<i64, Arc<Mutex<()>>>;

/// One async mutex per master, created on first use and dropped again once
/// nobody holds or waits for it.
#[derive(Debug, Clone, Default)]
pub struct MasterLocks {
    inner: Arc<LockMap>,
}

impl MasterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, master_id: i64) -> MasterGuard {
        let lock = self.inner.entry(master_id).or_default().clone();
        MasterGuard {
            guard: Some(lock.lock_owned().await),
            master_id,
            locks: Arc::clone(&self.inner),
        }
    }

    /// Masters that currently have a lock entry.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Held for the duration of a check-and-write on one master's calendar.
#[derive(Debug)]
pub struct MasterGuard {
    guard: Option<OwnedMutexGuard<()>>,
    master_id: i64,
    locks: Arc<LockMap>,
}

impl Drop for MasterGuard {
    fn drop(&mut self) {
        // Release first so our own Arc no longer counts.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.master_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// ── Availability ──

/// Pending and confirmed appointments of `master_id` that touch `range`,
/// leaving out `except` when given.
pub(crate) async fn busy_intervals(
    conn: &mut SqliteConnection,
    master_id: i64,
    range: Interval,
    except: Option<i64>,
) -> Result<Vec<Interval>, sqlx::Error> {
    let rows: Vec<(DateTime<Utc>, DateTime<Utc>)> = sqlx::query_as(
        "SELECT start_time, end_time FROM appointments
         WHERE master_id = ?
           AND status IN ('pending', 'confirmed')
           AND start_time < ? AND end_time > ?
           AND (? IS NULL OR id != ?)
         ORDER BY start_time ASC",
    )
    .bind(master_id)
    .bind(range.end)
    .bind(range.start)
    .bind(except)
    .bind(except)
    .fetch_all(conn)
    .await?;

    Ok(rows.into_iter().map(|(s, e)| Interval::new(s, e)).collect())
}

/// The slot grid of `master` on `date` for a service of `duration_minutes`.
/// A date the master does not work yields no slots.
pub async fn day_slots(
    db: &SqlitePool,
    master_id: i64,
    date: NaiveDate,
    duration_minutes: i64,
) -> Result<Vec<Slot>, AppError> {
    let master = users::find_by_id(db, master_id)
        .await?
        .ok_or(AppError::MasterNotConfigured)?;
    let profile = master.master_profile().ok_or(AppError::MasterNotConfigured)?;

    let Some(window) = profile.working_dates.window_for(date) else {
        return Ok(Vec::new());
    };

    let mut conn = db.acquire().await?;
    let busy = busy_intervals(&mut *conn, master_id, window.on(date), None).await?;

    Ok(compute_slots(date, window, duration_minutes, &busy))
}

/// Slot grid for a specific service of a master.
pub async fn service_slots(
    db: &SqlitePool,
    master_id: i64,
    service_id: i64,
    raw_date: &str,
) -> Result<Vec<Slot>, AppError> {
    let date = schedule::parse_date(raw_date)?;
    let service = catalog::find(db, service_id)
        .await?
        .ok_or(AppError::NotFound("service"))?;
    if service.master_id != master_id {
        return Err(AppError::ServiceOwnershipMismatch);
    }
    day_slots(db, master_id, date, service.duration_min).await
}

// ── Admission ──

#[derive(Debug)]
pub struct Booked {
    pub appointment: Appointment,
    pub notifications: Vec<Notification>,
}

fn resolve_location(
    service: &Service,
    requested: Option<LocationType>,
    has_address: bool,
) -> Result<LocationType, AppError> {
    let chosen = match (service.location_type, requested) {
        (LocationType::Both, None) => LocationType::AtMaster,
        (offered, None) => offered,
        (_, Some(LocationType::Both)) => {
            return Err(AppError::Validation(
                "location_type must be at_master or at_client".into(),
            ))
        }
        (LocationType::Both, Some(wanted)) => wanted,
        (offered, Some(wanted)) if offered == wanted => wanted,
        (_, Some(_)) => {
            return Err(AppError::Validation(
                "service is not offered at this location".into(),
            ))
        }
    };
    if chosen == LocationType::AtClient && !has_address {
        return Err(AppError::Validation(
            "address is required for a visit at the client".into(),
        ));
    }
    Ok(chosen)
}

/// Admit a new pending appointment for `client`, or fail without writing.
pub async fn create_appointment(
    db: &SqlitePool,
    locks: &MasterLocks,
    client: &User,
    req: CreateAppointmentRequest,
) -> Result<Booked, AppError> {
    let date = schedule::parse_date(&req.date)?;
    let time = TimeOfDay::parse(&req.time)?;
    let start = schedule::anchor(date, time);

    if client.id == req.master_id {
        return Err(AppError::Validation("cannot book an appointment with yourself".into()));
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

    let guard = locks.acquire(req.master_id).await;
    let mut tx = crate::db::begin_write(db).await?;

    let service = catalog::find(&mut *tx, req.service_id)
        .await?
        .filter(|s| s.is_active)
        .ok_or(AppError::ServiceNotFound)?;
    if service.master_id != req.master_id {
        return Err(AppError::ServiceOwnershipMismatch);
    }

    let master = users::find_by_id(&mut *tx, req.master_id)
        .await?
        .ok_or(AppError::MasterNotConfigured)?;
    let profile = master.master_profile().ok_or(AppError::MasterNotConfigured)?;

    let window = profile
        .working_dates
        .window_for(date)
        .ok_or_else(|| AppError::Validation(format!("master does not work on {date}")))?;
    if !window.on(date).contains(&Interval::starting_at(start, service.duration_min)) {
        return Err(AppError::Validation(
            "service does not fit into the working hours".into(),
        ));
    }

    let location = resolve_location(&service, req.location_type, req.address.is_some())?;

    let end = start + Duration::minutes(service.duration_min + profile.gap_minutes);
    let requested = Interval::new(start, end);

    if !busy_intervals(&mut *tx, req.master_id, requested, None).await?.is_empty() {
        tracing::info!(
            master_id = req.master_id,
            client_id = client.id,
            start = %start,
            "slot taken"
        );
        return Err(AppError::SlotTaken);
    }

    let id = sqlx::query(
        "INSERT INTO appointments
             (master_id, client_id, service_id, start_time, end_time, status,
              client_comment, location_type, address)
         VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?)",
    )
    .bind(req.master_id)
    .bind(client.id)
    .bind(service.id)
    .bind(start)
    .bind(end)
    .bind(&comment)
    .bind(location)
    .bind(req.address.map(Json))
    .execute(&mut *tx)
    .await?
    .last_insert_rowid();

    let appointment = lifecycle::find(&mut *tx, id)
        .await?
        .ok_or(AppError::NotFound("appointment"))?;
    tx.commit().await?;
    drop(guard);

    tracing::info!(
        appointment_id = id,
        master_id = appointment.master_id,
        client_id = appointment.client_id,
        start = %appointment.start_time,
        end = %appointment.end_time,
        "appointment created"
    );

    let notifications = match notify::load_context(db, id).await {
        Ok(Some(details)) => notify::for_new_booking(&details),
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::warn!(appointment_id = id, error = %e, "could not load notification context");
            Vec::new()
        }
    };

    Ok(Booked {
        appointment,
        notifications,
    })
}

// ── Listing ──

/// Appointments where `user` is on the `role` side, newest start first.
pub async fn list_appointments(
    db: &SqlitePool,
    user: &User,
    role: ListRole,
) -> Result<Vec<AppointmentView>, sqlx::Error> {
    let column = match role {
        ListRole::Master => "a.master_id",
        ListRole::Client => "a.client_id",
    };
    sqlx::query_as::<_, AppointmentView>(&format!(
        "SELECT a.id, a.master_id, a.client_id, a.service_id,
                s.title AS service_title, s.price AS service_price, s.currency,
                COALESCE(NULLIF(p.display_name, ''), m.first_name) AS master_name,
                c.first_name AS client_name, c.username AS client_username,
                a.start_time, a.end_time, a.status, a.client_comment,
                a.location_type, a.address, r.rating AS review_rating
         FROM appointments a
         JOIN users m ON m.id = a.master_id
         JOIN users c ON c.id = a.client_id
         LEFT JOIN master_profiles p ON p.user_id = a.master_id
         LEFT JOIN services s ON s.id = a.service_id
         LEFT JOIN reviews r ON r.appointment_id = a.id
         WHERE {column} = ?
         ORDER BY a.start_time DESC, a.id DESC"
    ))
    .bind(user.id)
    .fetch_all(db)
    .await
}
