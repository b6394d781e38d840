//! Shared application state for the axum router (§6).
//!
//! Unlike the teacher's `AppState`, which type-erases every service behind
//! `Arc<dyn Trait>`, this state is built around concrete type aliases over
//! the `Pg*Repository` implementations: the engine, alert manager, and
//! providers are already generic over their repository traits (so tests
//! substitute fakes directly), and carrying that all the way up keeps one
//! consistent idiom end to end instead of mixing two.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::alerts::AlertManager;
use crate::api::auth::AuthVerifier;
use crate::db::repositories::{
    PgCharacteristicRepository, PgDataSourceRepository, PgSampleRepository, PgViolationRepository,
    PgWindowRepository,
};
use crate::engine::SpcEngine;
use crate::events::broadcaster::LiveBroadcaster;
use crate::providers::manual::ManualProvider;
use crate::telemetry::Metrics;

pub type Window = PgWindowRepository<PgSampleRepository, PgCharacteristicRepository>;
pub type Engine = SpcEngine<PgCharacteristicRepository, PgSampleRepository, PgViolationRepository, Window>;
pub type Alerts = AlertManager<PgViolationRepository>;
pub type Manual = ManualProvider<PgCharacteristicRepository, PgDataSourceRepository>;

/// Knobs for the HTTP surface itself, as opposed to [`crate::config::AppConfig`]
/// which covers the whole process (§6).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_body_size: usize,
    pub rate_limit_rpm: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            max_body_size: 2 * 1024 * 1024,
            rate_limit_rpm: 600,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub alerts: Arc<Alerts>,
    pub manual: Arc<Manual>,
    pub broadcaster: Arc<LiveBroadcaster>,
    pub auth: Arc<dyn AuthVerifier>,
    pub config: Arc<ServerConfig>,
    pub rate_limiter: Arc<RateLimiterState>,
    pub metrics: Arc<Metrics>,
}

struct RequestCount {
    count: u32,
    window_start: Instant,
}

/// Fixed-window, in-memory rate limiter keyed by API key or caller IP. Per-IP
/// counters are not shared across process instances; a deployment that needs
/// that shares a reverse proxy's rate limiting instead (§5 "Backpressure").
pub struct RateLimiterState {
    requests: RwLock<HashMap<String, RequestCount>>,
    requests_per_window: u32,
    window_duration: Duration,
}

pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_after_secs: u32 },
}

impl RateLimiterState {
    pub fn new(requests_per_window: u32, window_duration: Duration) -> Self {
        RateLimiterState {
            requests: RwLock::new(HashMap::new()),
            requests_per_window,
            window_duration,
        }
    }

    pub async fn check_and_increment(&self, key: &str) -> RateLimitResult {
        let mut requests = self.requests.write().await;
        let now = Instant::now();

        let entry = requests.entry(key.to_string()).or_insert(RequestCount {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) > self.window_duration {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        if entry.count > self.requests_per_window {
            let reset_at = entry.window_start + self.window_duration;
            RateLimitResult::Limited {
                retry_after_secs: reset_at.saturating_duration_since(now).as_secs() as u32,
            }
        } else {
            RateLimitResult::Allowed {
                remaining: self.requests_per_window - entry.count,
            }
        }
    }

    pub async fn cleanup(&self) {
        let mut requests = self.requests.write().await;
        let now = Instant::now();
        requests.retain(|_, v| now.duration_since(v.window_start) <= self.window_duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_requests_under_the_window_limit() {
        let limiter = RateLimiterState::new(2, Duration::from_secs(60));
        assert!(matches!(
            limiter.check_and_increment("key:a").await,
            RateLimitResult::Allowed { remaining: 1 }
        ));
        assert!(matches!(
            limiter.check_and_increment("key:a").await,
            RateLimitResult::Allowed { remaining: 0 }
        ));
    }

    #[tokio::test]
    async fn limits_requests_over_the_window() {
        let limiter = RateLimiterState::new(1, Duration::from_secs(60));
        limiter.check_and_increment("key:a").await;
        assert!(matches!(
            limiter.check_and_increment("key:a").await,
            RateLimitResult::Limited { .. }
        ));
    }

    #[tokio::test]
    async fn distinct_keys_have_independent_counters() {
        let limiter = RateLimiterState::new(1, Duration::from_secs(60));
        limiter.check_and_increment("key:a").await;
        assert!(matches!(
            limiter.check_and_increment("key:b").await,
            RateLimitResult::Allowed { .. }
        ));
    }
}
