//! Fixtures shared by the database-backed tests.

use sqlx::SqlitePool;

use crate::catalog;
use crate::models::{CreateServiceRequest, Service, TelegramUser, User};
use crate::schedule::{parse_date, TimeOfDay, WorkWindow, WorkingDates};
use crate::users;

pub const TEST_BOT_TOKEN: &str = "123456:TEST-TOKEN";

pub fn telegram_user(tg_id: i64, name: &str) -> TelegramUser {
    TelegramUser {
        id: tg_id,
        first_name: name.into(),
        last_name: None,
        username: Some(format!("{}_tg", name.to_lowercase())),
    }
}

pub async fn client(db: &SqlitePool, tg_id: i64) -> User {
    users::login_or_register(db, &telegram_user(tg_id, "Client"))
        .await
        .unwrap()
}

/// A master working `start`..`end` on the single day `date`, gap 15.
pub async fn master_working(db: &SqlitePool, tg_id: i64, date: &str, start: &str, end: &str) -> User {
    let user = users::login_or_register(db, &telegram_user(tg_id, "Master"))
        .await
        .unwrap();
    let master = users::become_master(db, user.id, 15).await.unwrap();

    let mut dates = WorkingDates::new();
    dates.insert(
        parse_date(date).unwrap(),
        WorkWindow::new(TimeOfDay::parse(start).unwrap(), TimeOfDay::parse(end).unwrap()).unwrap(),
    );
    users::set_working_dates(db, &master, &dates).await.unwrap()
}

pub async fn service(db: &SqlitePool, master: &User, duration_min: i64) -> Service {
    catalog::create(
        db,
        master,
        CreateServiceRequest {
            title: "Manicure".into(),
            price: 1500,
            duration_min,
            currency: None,
            location_type: None,
            image_url: None,
        },
    )
    .await
    .unwrap()
}
