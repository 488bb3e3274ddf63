use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;

use crate::lifecycle::AppointmentStatus;
use crate::schedule::WorkingDates;

// ── Users ──

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub telegram_id: String,
    pub first_name: String,
    pub username: Option<String>,
    #[serde(flatten)]
    pub kind: UserKind,
}

/// A user is either a plain client or a master carrying a profile; a client
/// never has a profile to read.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "role", content = "profile", rename_all = "lowercase")]
pub enum UserKind {
    Client,
    Master(MasterProfile),
}

impl User {
    pub fn master_profile(&self) -> Option<&MasterProfile> {
        match &self.kind {
            UserKind::Master(profile) => Some(profile),
            UserKind::Client => None,
        }
    }

    pub fn is_master(&self) -> bool {
        self.master_profile().is_some()
    }

    /// Name shown to the other party: the master's display name when set.
    pub fn public_name(&self) -> &str {
        match self.master_profile() {
            Some(p) if !p.display_name.is_empty() => &p.display_name,
            _ => &self.first_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterProfile {
    pub display_name: String,
    pub description: String,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub location: Option<MasterLocation>,
    pub working_dates: WorkingDates,
    pub gap_minutes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationMode {
    Fixed,
    Mobile,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterLocation {
    pub mode: LocationMode,
    pub address: Option<Address>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub text: String,
    /// `[lat, lng]`
    pub coordinates: [f64; 2],
}

/// Flat row of `users LEFT JOIN master_profiles`.
#[derive(Debug, sqlx::FromRow)]
pub struct UserRow {
    pub id: i64,
    pub telegram_id: String,
    pub first_name: String,
    pub username: Option<String>,
    pub role: String,
    pub has_profile: bool,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub location: Option<Json<MasterLocation>>,
    pub working_dates: Option<Json<WorkingDates>>,
    pub gap_minutes: Option<i64>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let kind = if row.role == "master" && row.has_profile {
            UserKind::Master(MasterProfile {
                display_name: row.display_name.unwrap_or_default(),
                description: row.description.unwrap_or_default(),
                avatar_url: row.avatar_url,
                phone: row.phone,
                location: row.location.map(|l| l.0),
                working_dates: row.working_dates.map(|w| w.0).unwrap_or_default(),
                gap_minutes: row.gap_minutes.unwrap_or(crate::booking::DEFAULT_GAP_MINUTES),
            })
        } else {
            if row.role == "master" {
                tracing::warn!(user_id = row.id, "master role without profile row");
            }
            UserKind::Client
        };

        User {
            id: row.id,
            telegram_id: row.telegram_id,
            first_name: row.first_name,
            username: row.username,
            kind,
        }
    }
}

// ── Services ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LocationType {
    AtMaster,
    AtClient,
    Both,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    pub master_id: i64,
    pub title: String,
    pub price: i64,
    pub duration_min: i64,
    pub currency: String,
    pub is_active: bool,
    pub location_type: LocationType,
    pub image_url: Option<String>,
}

// ── Appointments ──

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Appointment {
    pub id: i64,
    pub master_id: i64,
    pub client_id: i64,
    pub service_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub client_comment: Option<String>,
    pub location_type: Option<LocationType>,
    pub address: Option<Json<Address>>,
    pub created_at: String,
}

/// An appointment as listed to one of its parties.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct AppointmentView {
    pub id: i64,
    pub master_id: i64,
    pub client_id: i64,
    pub service_id: Option<i64>,
    pub service_title: Option<String>,
    pub service_price: Option<i64>,
    pub currency: Option<String>,
    pub master_name: String,
    pub client_name: String,
    pub client_username: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: AppointmentStatus,
    pub client_comment: Option<String>,
    pub location_type: Option<LocationType>,
    pub address: Option<Json<Address>>,
    pub review_rating: Option<i64>,
}

// ── Reviews ──

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Review {
    pub id: i64,
    pub master_id: i64,
    pub client_id: i64,
    pub appointment_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct ReviewView {
    pub id: i64,
    pub appointment_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
    pub created_at: String,
    pub client_first_name: String,
    pub client_username: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RatingSummary {
    pub average: f64,
    pub count: i64,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub init_data: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub location: Option<MasterLocation>,
    pub gap_minutes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WorkingDatesRequest {
    pub working_dates: WorkingDates,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub title: String,
    pub price: i64,
    pub duration_min: i64,
    pub currency: Option<String>,
    pub location_type: Option<LocationType>,
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SlotsQuery {
    pub master_id: i64,
    pub date: String,
    pub service_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct CreateAppointmentRequest {
    pub master_id: i64,
    pub service_id: i64,
    pub date: String,
    pub time: String,
    pub comment: Option<String>,
    pub location_type: Option<LocationType>,
    pub address: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListRole {
    Master,
    Client,
}

#[derive(Debug, Deserialize)]
pub struct AppointmentsQuery {
    pub role: Option<ListRole>,
}

#[derive(Debug, Deserialize)]
pub struct CreateReviewRequest {
    pub appointment_id: i64,
    pub rating: i64,
    pub comment: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MasterReviews {
    pub reviews: Vec<ReviewView>,
    pub rating: RatingSummary,
}

#[derive(Debug, Serialize)]
pub struct CanLeaveReview {
    pub can_leave: bool,
}

#[derive(Debug, Serialize)]
pub struct PublicMaster {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub avatar_url: Option<String>,
    pub phone: Option<String>,
    pub location: Option<MasterLocation>,
    pub rating: RatingSummary,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Telegram auth ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}
