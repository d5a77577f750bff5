use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::repository::{RateDecision, RateLimitStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Hold,
    QueueJoin,
}

impl RateLimitAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitAction::Hold => "hold",
            RateLimitAction::QueueJoin => "queue_join",
        }
    }
}

impl fmt::Display for RateLimitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitPolicy {
    pub limit: u64,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub hold: RateLimitPolicy,
    pub queue_join: RateLimitPolicy,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            hold: RateLimitPolicy {
                limit: 20,
                window_seconds: 60,
            },
            queue_join: RateLimitPolicy {
                limit: 10_000,
                window_seconds: 60,
            },
        }
    }
}

impl RateLimitSettings {
    pub fn policy(&self, action: RateLimitAction) -> RateLimitPolicy {
        match action {
            RateLimitAction::Hold => self.hold,
            RateLimitAction::QueueJoin => self.queue_join,
        }
    }
}

/// Sliding-window limiter keyed by (action, identifier).
///
/// Fails open: when the store cannot be reached the request is allowed.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>, settings: RateLimitSettings) -> Self {
        Self { store, clock, settings }
    }

    pub async fn check(&self, action: RateLimitAction, identifier: &str) -> RateDecision {
        let policy = self.settings.policy(action);
        let key = format!("ratelimit:{}:{}", action, identifier);
        let now = self.clock.now().timestamp_micros() as f64 / 1_000_000.0;
        let member = format!("{}:{}", now, Uuid::new_v4().simple());

        match self
            .store
            .record_hit(&key, policy.limit, policy.window_seconds, now, &member)
            .await
        {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        "Rate limit hit for {} ({}s until retry)",
                        action, decision.retry_after_seconds
                    );
                }
                decision
            }
            Err(e) => {
                warn!("Rate limit check for {} failed, allowing request: {}", action, e);
                RateDecision {
                    allowed: true,
                    remaining: 1,
                    retry_after_seconds: 0,
                }
            }
        }
    }
}
