//! Appointment status lifecycle.
//!
//! ```text
//! pending ──confirm──▶ confirmed ──mark-complete──▶ awaiting_review ──confirm-complete──▶ completed
//!    │                   ▲    │                          │
//!    │reject/cancel      │    │cancel                    │dispute-complete
//!    ▼                   │    ▼                          │
//! cancelled ◀────────────┼────┘                          │
//!                        └───────────────────────────────┘
//! ```
//!
//! Every transition is a compare-and-set on the status column, so of two
//! concurrent actions on the same appointment at most one can win. A
//! transition that puts an appointment back on the calendar (dispute) also
//! re-checks overlap under the master's lock and a write transaction.

use serde::{Deserialize, Serialize};
use sqlx::{SqliteExecutor, SqlitePool};
use std::fmt;

use crate::booking::{self, MasterLocks};
use crate::error::AppError;
use crate::models::{Appointment, User};
use crate::notify::{self, Notification};
use crate::schedule::Interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    AwaitingReview,
    Completed,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::AwaitingReview => "awaiting_review",
            AppointmentStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::Completed)
    }

    /// Statuses that hold a master's time.
    pub fn blocks_time(self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of an appointment an actor stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Master,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Confirm,
    Reject,
    Cancel,
    MarkComplete,
    ConfirmComplete,
    DisputeComplete,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Confirm,
        Action::Reject,
        Action::Cancel,
        Action::MarkComplete,
        Action::ConfirmComplete,
        Action::DisputeComplete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::Confirm => "confirm",
            Action::Reject => "reject",
            Action::Cancel => "cancel",
            Action::MarkComplete => "mark-complete",
            Action::ConfirmComplete => "confirm-complete",
            Action::DisputeComplete => "dispute-complete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == raw)
    }

    /// The party allowed to take this action; `None` means either.
    fn allowed_party(self) -> Option<Party> {
        match self {
            Action::Confirm | Action::Reject | Action::MarkComplete => Some(Party::Master),
            Action::ConfirmComplete | Action::DisputeComplete => Some(Party::Client),
            Action::Cancel => None,
        }
    }

    fn sources(self) -> &'static [AppointmentStatus] {
        use AppointmentStatus::*;
        match self {
            Action::Confirm | Action::Reject => &[Pending],
            Action::Cancel => &[Pending, Confirmed],
            Action::MarkComplete => &[Confirmed],
            Action::ConfirmComplete | Action::DisputeComplete => &[AwaitingReview],
        }
    }

    pub fn target(self) -> AppointmentStatus {
        match self {
            Action::Confirm => AppointmentStatus::Confirmed,
            Action::Reject | Action::Cancel => AppointmentStatus::Cancelled,
            Action::MarkComplete => AppointmentStatus::AwaitingReview,
            Action::ConfirmComplete => AppointmentStatus::Completed,
            Action::DisputeComplete => AppointmentStatus::Confirmed,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve which party `actor` acts as. Master-only actions also require
/// the actor to currently be a master.
pub fn authorize(action: Action, appointment: &Appointment, actor: &User) -> Result<Party, AppError> {
    let is_master = actor.id == appointment.master_id;
    let is_client = actor.id == appointment.client_id;

    match action.allowed_party() {
        Some(Party::Master) if is_master && actor.is_master() => Ok(Party::Master),
        Some(Party::Client) if is_client => Ok(Party::Client),
        None if is_master => Ok(Party::Master),
        None if is_client => Ok(Party::Client),
        _ => Err(AppError::AccessDenied),
    }
}

/// The status `action` moves `from` into, if legal.
pub fn next_status(action: Action, from: AppointmentStatus) -> Result<AppointmentStatus, AppError> {
    if action.sources().contains(&from) {
        Ok(action.target())
    } else {
        Err(AppError::InvalidStateTransition { from, action })
    }
}

pub async fn find<'e, E: SqliteExecutor<'e>>(
    executor: E,
    appointment_id: i64,
) -> Result<Option<Appointment>, sqlx::Error> {
    sqlx::query_as::<_, Appointment>(
        "SELECT id, master_id, client_id, service_id, start_time, end_time, status,
                client_comment, location_type, address, created_at
         FROM appointments WHERE id = ?",
    )
    .bind(appointment_id)
    .fetch_optional(executor)
    .await
}

/// Outcome of a successful transition.
#[derive(Debug)]
pub struct Transition {
    pub appointment: Appointment,
    pub notifications: Vec<Notification>,
}

async fn compare_and_set<'e, E: SqliteExecutor<'e>>(
    executor: E,
    appointment_id: i64,
    from: AppointmentStatus,
    to: AppointmentStatus,
) -> Result<bool, sqlx::Error> {
    let updated = sqlx::query("UPDATE appointments SET status = ? WHERE id = ? AND status = ?")
        .bind(to)
        .bind(appointment_id)
        .bind(from)
        .execute(executor)
        .await?;
    Ok(updated.rows_affected() > 0)
}

/// Put `appointment` back on its master's calendar, unless its time has been
/// booked by someone else meanwhile.
async fn reactivate(
    db: &SqlitePool,
    locks: &MasterLocks,
    appointment: &Appointment,
    from: AppointmentStatus,
    to: AppointmentStatus,
) -> Result<bool, AppError> {
    let guard = locks.acquire(appointment.master_id).await;
    let mut tx = crate::db::begin_write(db).await?;

    let own = Interval::new(appointment.start_time, appointment.end_time);
    let clashes =
        booking::busy_intervals(&mut *tx, appointment.master_id, own, Some(appointment.id)).await?;
    if !clashes.is_empty() {
        tracing::info!(
            appointment_id = appointment.id,
            master_id = appointment.master_id,
            "time re-booked, cannot reactivate"
        );
        return Err(AppError::SlotTaken);
    }

    let updated = compare_and_set(&mut *tx, appointment.id, from, to).await?;
    tx.commit().await?;
    drop(guard);
    Ok(updated)
}

/// Load, authorize, validate, then apply `action` in one conditional update.
/// Nothing is written unless every check passes.
pub async fn apply(
    db: &SqlitePool,
    locks: &MasterLocks,
    appointment_id: i64,
    actor: &User,
    action: Action,
) -> Result<Transition, AppError> {
    let appointment = find(db, appointment_id)
        .await?
        .ok_or(AppError::NotFound("appointment"))?;

    let party = authorize(action, &appointment, actor)?;
    let from = appointment.status;
    let to = next_status(action, from)?;

    let updated = if to.blocks_time() && !from.blocks_time() {
        reactivate(db, locks, &appointment, from, to).await?
    } else {
        compare_and_set(db, appointment_id, from, to).await?
    };

    if !updated {
        // Lost a race: someone moved the appointment after we read it.
        let current = find(db, appointment_id)
            .await?
            .map(|a| a.status)
            .unwrap_or(from);
        return Err(AppError::InvalidStateTransition { from: current, action });
    }

    tracing::info!(
        appointment_id,
        actor_id = actor.id,
        action = %action,
        from = %from,
        to = %to,
        "appointment transition"
    );

    let notifications = match notify::load_context(db, appointment_id).await {
        Ok(Some(ctx)) => notify::for_transition(action, party, &ctx),
        Ok(None) => Vec::new(),
        Err(e) => {
            tracing::warn!(appointment_id, error = %e, "could not load notification context");
            Vec::new()
        }
    };

    Ok(Transition {
        appointment: Appointment {
            status: to,
            ..appointment
        },
        notifications,
    })
}
