use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use masterbook_server::alert_layer::AlertLayer;
use masterbook_server::booking::MasterLocks;
use masterbook_server::config::Config;
use masterbook_server::notify::{self, NotificationQueue};
use masterbook_server::rate_limit::RateLimiter;
use masterbook_server::telegram::TelegramApi;
use masterbook_server::{db, router, AppState};

/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;
const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let telegram = TelegramApi::new(&config.bot_token);

    // ── Tracing: console + optional error alerts to an operator chat ──
    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    let fmt_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    match &config.alert_chat_id {
        Some(chat_id) => registry
            .with(AlertLayer::new(telegram.clone(), chat_id.clone()))
            .init(),
        None => registry.init(),
    }

    // ── Database ──
    let pool = db::connect(&config.database_url, config.database_max_connections).await?;
    db::run_migrations(&pool).await?;

    // ── Notifications ──
    let (notifications, outbox) = NotificationQueue::new(NOTIFICATION_QUEUE_CAPACITY);
    tokio::spawn(notify::run_dispatcher(outbox, Arc::new(telegram.clone())));

    let state = Arc::new(AppState {
        db: pool,
        bot_token: config.bot_token.clone(),
        auth_max_age_secs: config.auth_max_age_secs,
        default_gap_minutes: config.default_gap_minutes,
        started_at: Instant::now(),
        locks: MasterLocks::new(),
        notifications,
    });

    // ── Rate limiter ──
    let rate_limiter = RateLimiter::with_default_tiers();

    // ── Background task: cleanup stale rate limit entries ──
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    let app = router(state, rate_limiter).layer(cors_layer(&config.webapp_url));

    let addr = config.listen_addr();
    tracing::info!("masterbook server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

/// Whitelist WEBAPP_URL (plus the Vite dev server) when it parses as an
/// origin, otherwise allow any.
fn cors_layer(webapp_url: &str) -> CorsLayer {
    let origins: Vec<axum::http::HeaderValue> = [webapp_url, "http://localhost:5173"]
        .into_iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();

    if webapp_url == "https://example.com" || origins.len() < 2 {
        if webapp_url != "https://example.com" {
            tracing::warn!(webapp_url, "WEBAPP_URL is not a valid origin, allowing any");
        }
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}
