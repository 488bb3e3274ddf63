pub mod alert_layer;
pub mod auth;
pub mod booking;
pub mod catalog;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod lifecycle;
pub mod models;
pub mod notify;
pub mod rate_limit;
pub mod reminders;
pub mod reviews;
pub mod schedule;
pub mod telegram;
pub mod users;

#[cfg(test)]
mod testing;

use axum::{
    middleware::from_fn_with_state,
    routing::{delete, get, patch, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

use booking::MasterLocks;
use notify::NotificationQueue;
use rate_limit::{enforce, RateLimiter, Tier};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub bot_token: String,
    pub auth_max_age_secs: i64,
    pub default_gap_minutes: i64,
    pub started_at: Instant,
    pub locks: MasterLocks,
    pub notifications: NotificationQueue,
}

/// All API routes, grouped by rate limit tier.
pub fn router(state: Arc<AppState>, limiter: RateLimiter) -> Router {
    // 1. No limit: health checks
    let no_limit_routes = Router::new().route("/api/health", get(handlers::health::health));

    // 2. Public: read-only, no auth
    let public_routes = Router::new()
        .route("/api/slots", get(handlers::slots::available_slots))
        .route("/api/public/masters/{id}", get(handlers::public::master))
        .route("/api/public/services/{master_id}", get(handlers::public::services))
        .route("/api/reviews/master/{id}", get(handlers::reviews::for_master))
        .layer(from_fn_with_state((limiter.clone(), Tier::Public), enforce));

    // 3. Booking creation: strictest
    let booking_routes = Router::new()
        .route("/api/appointments", post(handlers::appointments::create))
        .layer(from_fn_with_state((limiter.clone(), Tier::Booking), enforce));

    // 4. Authenticated user endpoints
    let auth_routes = Router::new()
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/become-master", post(handlers::auth::become_master))
        .route("/api/appointments/my", get(handlers::appointments::list))
        .route(
            "/api/appointments/{id}/{action}",
            patch(handlers::appointments::transition),
        )
        .route("/api/reviews", post(handlers::reviews::create))
        .route(
            "/api/reviews/can-leave/{appointment_id}",
            get(handlers::reviews::can_leave),
        )
        .layer(from_fn_with_state((limiter.clone(), Tier::Auth), enforce));

    // 5. Master dashboard
    let master_routes = Router::new()
        .route(
            "/api/master/profile",
            get(handlers::master::get_profile).put(handlers::master::update_profile),
        )
        .route("/api/master/working-dates", put(handlers::master::set_working_dates))
        .route(
            "/api/master/services",
            get(handlers::master::list_services).post(handlers::master::create_service),
        )
        .route("/api/master/services/{id}", delete(handlers::master::delete_service))
        .layer(from_fn_with_state((limiter.clone(), Tier::Master), enforce));

    Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(auth_routes)
        .merge(master_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    use crate::notify::Notification;
    use crate::rate_limit::RateLimitConfig;
    use crate::testing::TEST_BOT_TOKEN;

    struct TestApp {
        router: Router,
        outbox: mpsc::Receiver<Notification>,
    }

    async fn app_with(limiter: RateLimiter) -> TestApp {
        let (notifications, outbox) = NotificationQueue::new(64);
        let state = Arc::new(AppState {
            db: db::test_pool().await,
            bot_token: TEST_BOT_TOKEN.into(),
            auth_max_age_secs: 86_400,
            default_gap_minutes: 15,
            started_at: Instant::now(),
            locks: MasterLocks::new(),
            notifications,
        });
        TestApp {
            router: router(state, limiter),
            outbox,
        }
    }

    async fn app() -> TestApp {
        app_with(RateLimiter::new()).await
    }

    fn tma(tg_id: i64, name: &str) -> String {
        let user = json!({ "id": tg_id, "first_name": name }).to_string();
        let signed = auth::sign_init_data(&user, chrono::Utc::now().timestamp(), TEST_BOT_TOKEN);
        format!("tma {signed}")
    }

    async fn call(app: &TestApp, method: &str, uri: &str, auth: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(auth) = auth {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let req = match body {
            Some(body) => req
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => req.body(Body::empty()).unwrap(),
        };

        let resp = app.router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    /// Master (tg 1) working 2025-06-10 09:00-12:00 with one 60-minute
    /// service, and a logged-in client (tg 2). Returns (master_id, service_id).
    async fn seed(app: &TestApp, master: &str, client: &str) -> (i64, i64) {
        let (status, body) = call(app, "POST", "/api/auth/login", Some(master), None).await;
        assert_eq!(status, StatusCode::OK);
        let master_id = body["data"]["id"].as_i64().unwrap();

        let (status, body) = call(app, "POST", "/api/auth/become-master", Some(master), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["role"], "master");

        let (status, _) = call(
            app,
            "PUT",
            "/api/master/working-dates",
            Some(master),
            Some(json!({ "working_dates": { "2025-06-10": { "start": "09:00", "end": "12:00" } } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            app,
            "POST",
            "/api/master/services",
            Some(master),
            Some(json!({ "title": "Manicure", "price": 1500, "duration_min": 60 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let service_id = body["data"]["id"].as_i64().unwrap();

        let (status, _) = call(app, "POST", "/api/auth/login", Some(client), None).await;
        assert_eq!(status, StatusCode::OK);

        (master_id, service_id)
    }

    fn booking(master_id: i64, service_id: i64, time: &str) -> Value {
        json!({
            "master_id": master_id,
            "service_id": service_id,
            "date": "2025-06-10",
            "time": time,
        })
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/api/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["db_ok"], true);
    }

    #[tokio::test]
    async fn test_requests_without_auth_are_rejected() {
        let app = app().await;
        let (status, body) = call(&app, "GET", "/api/appointments/my", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["ok"], false);

        let forged = tma(1, "Anna").replace("Anna", "Eve");
        let (status, _) = call(&app, "POST", "/api/auth/login", Some(&forged), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_unregistered_user_is_unauthorized() {
        let app = app().await;
        let (status, _) = call(&app, "GET", "/api/master/profile", Some(&tma(5, "Ghost")), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_booking_flow_over_http() {
        let mut app = app().await;
        let (master, client) = (tma(1, "Anna"), tma(2, "Olga"));
        let (master_id, service_id) = seed(&app, &master, &client).await;

        let slots_uri = format!("/api/slots?master_id={master_id}&date=2025-06-10&service_id={service_id}");
        let (status, body) = call(&app, "GET", &slots_uri, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 9);
        assert_eq!(body["data"][8], json!({ "time": "11:00", "available": true }));

        let (status, body) = call(
            &app,
            "POST",
            "/api/appointments",
            Some(&client),
            Some(booking(master_id, service_id, "09:00")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "pending");
        let id = body["data"]["id"].as_i64().unwrap();

        let new_booking = app.outbox.recv().await.unwrap();
        assert_eq!(new_booking.chat_id, "1");

        let (status, body) = call(
            &app,
            "POST",
            "/api/appointments",
            Some(&client),
            Some(booking(master_id, service_id, "09:30")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "slot already taken");

        let (_, body) = call(&app, "GET", &slots_uri, None, None).await;
        assert_eq!(body["data"][0]["available"], false);
        assert_eq!(body["data"][5], json!({ "time": "10:15", "available": true }));

        let confirm = format!("/api/appointments/{id}/confirm");
        let (status, _) = call(&app, "PATCH", &confirm, Some(&client), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = call(&app, "PATCH", &confirm, Some(&master), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "confirmed");

        let (status, body) = call(&app, "PATCH", &confirm, Some(&master), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "cannot confirm an appointment that is confirmed");

        let (status, body) = call(&app, "GET", "/api/appointments/my?role=client", Some(&client), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"][0]["status"], "confirmed");
        assert_eq!(body["data"][0]["master_name"], "Anna");
    }

    #[tokio::test]
    async fn test_full_lifecycle_and_review_over_http() {
        let app = app().await;
        let (master, client) = (tma(1, "Anna"), tma(2, "Olga"));
        let (master_id, service_id) = seed(&app, &master, &client).await;

        let (_, body) = call(
            &app,
            "POST",
            "/api/appointments",
            Some(&client),
            Some(booking(master_id, service_id, "10:00")),
        )
        .await;
        let id = body["data"]["id"].as_i64().unwrap();

        for (who, action, expected) in [
            (&master, "confirm", "confirmed"),
            (&master, "mark-complete", "awaiting_review"),
            (&client, "confirm-complete", "completed"),
        ] {
            let (status, body) = call(&app, "PATCH", &format!("/api/appointments/{id}/{action}"), Some(who.as_str()), None).await;
            assert_eq!(status, StatusCode::OK, "{action}");
            assert_eq!(body["data"]["status"], expected);
        }

        let (_, body) = call(&app, "GET", &format!("/api/reviews/can-leave/{id}"), Some(&client), None).await;
        assert_eq!(body["data"]["can_leave"], true);

        let (status, _) = call(
            &app,
            "POST",
            "/api/reviews",
            Some(&client),
            Some(json!({ "appointment_id": id, "rating": 5 })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app, "GET", &format!("/api/public/masters/{master_id}"), None, None).await;
        assert_eq!(body["data"]["rating"], json!({ "average": 5.0, "count": 1 }));
    }

    #[tokio::test]
    async fn test_unknown_action_and_appointment() {
        let app = app().await;
        let (master, client) = (tma(1, "Anna"), tma(2, "Olga"));
        seed(&app, &master, &client).await;

        let (status, _) = call(&app, "PATCH", "/api/appointments/1/approve", Some(&master), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = call(&app, "PATCH", "/api/appointments/99/confirm", Some(&master), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "appointment not found");
    }

    #[tokio::test]
    async fn test_invalid_working_window_is_a_validation_error() {
        let app = app().await;
        let master = tma(1, "Anna");
        call(&app, "POST", "/api/auth/login", Some(&master), None).await;
        call(&app, "POST", "/api/auth/become-master", Some(&master), None).await;

        let (status, body) = call(
            &app,
            "PUT",
            "/api/master/working-dates",
            Some(&master),
            Some(json!({ "working_dates": { "2025-06-10": { "start": "12:00", "end": "09:00" } } })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn test_slots_for_unknown_service_is_not_found() {
        let app = app().await;
        let (master, client) = (tma(1, "Anna"), tma(2, "Olga"));
        let (master_id, _) = seed(&app, &master, &client).await;

        let uri = format!("/api/slots?master_id={master_id}&date=2025-06-10&service_id=999");
        let (status, _) = call(&app, "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let uri = format!("/api/slots?master_id={master_id}&date=10.06.2025&service_id=1");
        let (status, _) = call(&app, "GET", &uri, None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_booking_tier_is_rate_limited() {
        let limiter = RateLimiter::new();
        limiter.add_tier(
            Tier::Booking,
            RateLimitConfig {
                max_requests: 1,
                window: std::time::Duration::from_secs(300),
            },
        );
        let app = app_with(limiter).await;
        let (master, client) = (tma(1, "Anna"), tma(2, "Olga"));
        let (master_id, service_id) = seed(&app, &master, &client).await;

        let body = booking(master_id, service_id, "09:00");
        let (status, _) = call(&app, "POST", "/api/appointments", Some(&client), Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);

        let req = Request::builder()
            .method("POST")
            .uri("/api/appointments")
            .header(header::AUTHORIZATION, &client)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(resp.headers().contains_key(header::RETRY_AFTER));
    }
}
