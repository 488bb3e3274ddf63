//! Reminders for confirmed appointments, 24 hours and 1 hour ahead.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use crate::notify::{self, BookingDetails, Notifier, DETAILS_SELECT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lead {
    Day,
    Hour,
}

impl Lead {
    pub const ALL: [Lead; 2] = [Lead::Day, Lead::Hour];

    pub fn hours(self) -> i64 {
        match self {
            Lead::Day => 24,
            Lead::Hour => 1,
        }
    }

    fn flag(self) -> &'static str {
        match self {
            Lead::Day => "reminded_24h",
            Lead::Hour => "reminded_1h",
        }
    }
}

/// Current time on the masters' wall clock, expressed in the same UTC-anchored
/// form appointment times are stored in.
pub fn wall_clock_now(offset_hours: i64) -> DateTime<Utc> {
    Utc::now() + Duration::hours(offset_hours)
}

/// Confirmed appointments starting within `lead` of `now` that have not had
/// this reminder yet.
pub async fn due(db: &SqlitePool, now: DateTime<Utc>, lead: Lead) -> Result<Vec<BookingDetails>, sqlx::Error> {
    let sql = format!(
        "{DETAILS_SELECT}
         WHERE a.status = 'confirmed'
           AND a.start_time > ? AND a.start_time <= ?
           AND a.{} = 0
         ORDER BY a.start_time ASC",
        lead.flag()
    );
    sqlx::query_as::<_, BookingDetails>(&sql)
        .bind(now)
        .bind(now + Duration::hours(lead.hours()))
        .fetch_all(db)
        .await
}

pub async fn mark_sent(db: &SqlitePool, appointment_id: i64, lead: Lead) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("UPDATE appointments SET {} = 1 WHERE id = ?", lead.flag()))
        .bind(appointment_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Send every due reminder. The flag is set only after a successful send, so
/// failures are retried on the next sweep. Returns how many were sent.
pub async fn sweep(db: &SqlitePool, now: DateTime<Utc>, notifier: &dyn Notifier) -> anyhow::Result<usize> {
    let mut sent = 0;
    for lead in Lead::ALL {
        for booking in due(db, now, lead).await? {
            let message = notify::reminder(&booking, lead.hours());
            match notifier.deliver(&message).await {
                Ok(()) => {
                    mark_sent(db, booking.appointment_id, lead).await?;
                    sent += 1;
                    tracing::info!(
                        appointment_id = booking.appointment_id,
                        hours_before = lead.hours(),
                        "reminder sent"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        appointment_id = booking.appointment_id,
                        hours_before = lead.hours(),
                        error = %e,
                        "reminder delivery failed"
                    );
                }
            }
        }
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{create_appointment, MasterLocks};
    use crate::db::test_pool;
    use crate::lifecycle::{apply, Action};
    use crate::models::{CreateAppointmentRequest, User};
    use crate::notify::Notification;
    use crate::schedule::{anchor, parse_date, TimeOfDay};
    use crate::testing::{client, master_working, service};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Recording {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn deliver(&self, n: &Notification) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("chat not found");
            }
            self.sent.lock().unwrap().push(n.text());
            Ok(())
        }
    }

    async fn book(db: &SqlitePool, m: &User, c: &User, time: &str) -> i64 {
        let s = service(db, m, 30).await;
        create_appointment(
            db,
            &MasterLocks::new(),
            c,
            CreateAppointmentRequest {
                master_id: m.id,
                service_id: s.id,
                date: "2025-06-10".into(),
                time: time.into(),
                comment: None,
                location_type: None,
                address: None,
            },
        )
        .await
        .unwrap()
        .appointment
        .id
    }

    fn at(time: &str) -> DateTime<Utc> {
        anchor(parse_date("2025-06-10").unwrap(), TimeOfDay::parse(time).unwrap())
    }

    #[tokio::test]
    async fn test_only_confirmed_appointments_are_due() {
        let db = test_pool().await;
        let m = master_working(&db, 1, "2025-06-10", "09:00", "18:00").await;
        let c = client(&db, 2).await;
        let confirmed = book(&db, &m, &c, "10:00").await;
        let _pending = book(&db, &m, &c, "12:00").await;
        apply(&db, &MasterLocks::new(), confirmed, &m, Action::Confirm).await.unwrap();

        let due_hour = due(&db, at("09:30"), Lead::Hour).await.unwrap();
        assert_eq!(due_hour.len(), 1);
        assert_eq!(due_hour[0].appointment_id, confirmed);

        // 10:00 is more than an hour after 08:30
        assert!(due(&db, at("08:30"), Lead::Hour).await.unwrap().is_empty());
        assert_eq!(due(&db, at("08:30"), Lead::Day).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_sends_once() {
        let db = test_pool().await;
        let m = master_working(&db, 1, "2025-06-10", "09:00", "18:00").await;
        let c = client(&db, 2).await;
        let id = book(&db, &m, &c, "10:00").await;
        apply(&db, &MasterLocks::new(), id, &m, Action::Confirm).await.unwrap();

        let notifier = Recording {
            sent: Mutex::new(Vec::new()),
            fail: false,
        };
        // both the 24h and the 1h reminder are due at 09:30
        assert_eq!(sweep(&db, at("09:30"), &notifier).await.unwrap(), 2);
        assert_eq!(sweep(&db, at("09:40"), &notifier).await.unwrap(), 0);
        assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_send_is_retried() {
        let db = test_pool().await;
        let m = master_working(&db, 1, "2025-06-10", "09:00", "18:00").await;
        let c = client(&db, 2).await;
        let id = book(&db, &m, &c, "10:00").await;
        apply(&db, &MasterLocks::new(), id, &m, Action::Confirm).await.unwrap();

        let failing = Recording {
            sent: Mutex::new(Vec::new()),
            fail: true,
        };
        assert_eq!(sweep(&db, at("09:30"), &failing).await.unwrap(), 0);
        assert_eq!(due(&db, at("09:30"), Lead::Hour).await.unwrap().len(), 1);
    }
}
