use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::AppError;

/// Rate limit groups, one per router group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Read-only public endpoints.
    Public,
    /// Authenticated user endpoints.
    Auth,
    /// Appointment creation.
    Booking,
    /// Master dashboard endpoints.
    Master,
}

impl Tier {
    pub fn default_config(self) -> RateLimitConfig {
        let (max_requests, secs) = match self {
            Tier::Public => (60, 60),
            Tier::Auth => (30, 60),
            Tier::Booking => (5, 300),
            Tier::Master => (120, 60),
        };
        RateLimitConfig {
            max_requests,
            window: Duration::from_secs(secs),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

type TierMap = DashMap<Tier, (RateLimitConfig, DashMap<IpAddr, Vec<Instant>>)>;

/// In-memory per-IP sliding window limiter.
#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    tiers: Arc<TierMap>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A limiter with every [`Tier`] at its default limits.
    pub fn with_default_tiers() -> Self {
        let limiter = Self::new();
        for tier in [Tier::Public, Tier::Auth, Tier::Booking, Tier::Master] {
            limiter.add_tier(tier, tier.default_config());
        }
        limiter
    }

    pub fn add_tier(&self, tier: Tier, config: RateLimitConfig) {
        self.tiers.insert(tier, (config, DashMap::new()));
    }

    /// `Err(retry_after_secs)` when `ip` is over the tier's limit. Tiers that
    /// were never configured are unlimited.
    pub fn check(&self, tier: Tier, ip: IpAddr) -> Result<(), u64> {
        let Some(tier_entry) = self.tiers.get(&tier) else {
            return Ok(());
        };
        let (config, ip_map) = tier_entry.value();
        let now = Instant::now();

        let mut hits = ip_map.entry(ip).or_default();
        hits.retain(|t| now.duration_since(*t) < config.window);

        if hits.len() >= config.max_requests as usize {
            let oldest = hits[0];
            let retry_after = (oldest + config.window)
                .saturating_duration_since(now)
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        hits.push(now);
        Ok(())
    }

    /// Drop entries older than twice their window.
    pub fn cleanup(&self) {
        let now = Instant::now();
        for tier_entry in self.tiers.iter() {
            let (config, ip_map) = tier_entry.value();
            let cutoff = config.window * 2;
            ip_map.retain(|_ip, hits| {
                hits.retain(|t| now.duration_since(*t) < cutoff);
                !hits.is_empty()
            });
        }
    }
}

/// Client IP from `X-Forwarded-For` (reverse proxy) or the socket address.
pub fn client_ip(req: &Request) -> IpAddr {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse::<IpAddr>().ok());

    forwarded
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ci| ci.0.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Middleware: `from_fn_with_state((limiter, tier), enforce)`.
pub async fn enforce(
    State((limiter, tier)): State<(RateLimiter, Tier)>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let ip = client_ip(&req);
    if let Err(retry_after) = limiter.check(tier, ip) {
        tracing::debug!(%ip, ?tier, retry_after, "rate limited");
        return Err(AppError::RateLimited { retry_after });
    }
    Ok(next.run(req).await)
}
