use http::StatusCode;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    error::{RateLimitError, Result},
    metrics::Metrics,
    policy::{RateLimitPolicy, RequestContext, Role},
    store::{BackendKind, CounterStore},
    utils::{ceil_secs, retry_after_secs},
};

/// How the wrapped handler finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Statuses below 400 count as success
    pub fn from_status(status: StatusCode) -> Self {
        if status.as_u16() < 400 {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Quota state reported with every counted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub key: String,
    pub limit: u32,
    pub total_hits: u64,
    pub remaining: u64,
    pub reset: Duration,
}

impl RateLimitInfo {
    /// Seconds until the window resets, rounded up
    pub fn reset_secs(&self) -> u64 {
        ceil_secs(self.reset)
    }

    pub fn retry_after_secs(&self) -> u64 {
        retry_after_secs(self.reset)
    }
}

/// Result of running a policy against one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The skip predicate matched; no counter was touched
    Skipped,
    Allowed(RateLimitInfo),
    Denied(RateLimitInfo),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Denied(_))
    }

    pub fn info(&self) -> Option<&RateLimitInfo> {
        match self {
            Decision::Skipped => None,
            Decision::Allowed(info) | Decision::Denied(info) => Some(info),
        }
    }

    /// Turn a denial into [`RateLimitError::LimitExceeded`]
    pub fn into_result(self, message: &str) -> Result<Decision> {
        match self {
            Decision::Denied(info) => Err(RateLimitError::LimitExceeded {
                message: message.to_string(),
                retry_after_secs: info.retry_after_secs(),
            }),
            decision => Ok(decision),
        }
    }
}

/// Executes one policy against a counter store
pub struct RateLimiter {
    policy: Arc<RateLimitPolicy>,
    store: Arc<dyn CounterStore>,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(
        policy: RateLimitPolicy,
        store: Arc<dyn CounterStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            policy: Arc::new(policy),
            store,
            metrics,
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    pub fn backend(&self) -> BackendKind {
        self.store.backend()
    }

    /// Count the request and decide whether it may proceed
    pub async fn check(&self, ctx: &RequestContext) -> Decision {
        let scope = self.policy.scope();

        if self.policy.should_skip(ctx) {
            self.metrics.record_decision(scope, "skipped");
            return Decision::Skipped;
        }

        let key = self.policy.key_for(ctx);
        let hits = self.store.increment(&key, self.policy.window()).await;
        let limit = self.policy.max();

        let info = RateLimitInfo {
            key,
            limit,
            total_hits: hits.total_hits,
            remaining: u64::from(limit).saturating_sub(hits.total_hits),
            reset: hits.time_remaining,
        };

        if hits.total_hits > u64::from(limit) {
            self.metrics.record_decision(scope, "denied");
            warn!(
                "Rate limit exceeded for {} on {} {} ({} hits, limit {}, retry after {}s)",
                info.key,
                ctx.method,
                ctx.path,
                info.total_hits,
                limit,
                info.retry_after_secs()
            );
            Decision::Denied(info)
        } else {
            self.metrics.record_decision(scope, "allowed");
            debug!(
                "Allowed {} {} for {} ({}/{})",
                ctx.method, ctx.path, info.key, info.total_hits, limit
            );
            Decision::Allowed(info)
        }
    }

    /// Check and convert a denial into an error, for callers outside HTTP
    pub async fn acquire(&self, ctx: &RequestContext) -> Result<Decision> {
        self.check(ctx).await.into_result(self.policy.message())
    }

    /// Take back the hit counted by `decision` if the policy says this
    /// outcome should not count. Best effort: a failed decrement leaves the
    /// count one higher than it should be.
    pub async fn settle(&self, decision: &Decision, outcome: Outcome) {
        let Some(info) = decision.info() else {
            return;
        };

        let uncount = match outcome {
            Outcome::Success => self.policy.skip_successful(),
            Outcome::Failure => self.policy.skip_failed(),
        };
        if !uncount {
            return;
        }

        match self.store.decrement(&info.key).await {
            Ok(()) => {
                self.metrics.record_compensation(self.policy.scope(), "ok");
                debug!("Uncounted {:?} request for {}", outcome, info.key);
            }
            Err(e) => {
                self.metrics.record_compensation(self.policy.scope(), "error");
                debug!("Compensating decrement for {} failed: {}", info.key, e);
            }
        }
    }

    /// Clear the caller's current window, e.g. after a verified password reset
    pub async fn reset(&self, ctx: &RequestContext) -> Result<()> {
        self.store.reset(&self.policy.key_for(ctx)).await
    }
}

/// Picks the elevated limiter for privileged roles and the general one otherwise
pub struct RoleAwareLimiter {
    general: Arc<RateLimiter>,
    elevated: Arc<RateLimiter>,
    elevated_roles: Vec<Role>,
}

impl RoleAwareLimiter {
    pub fn new(
        general: Arc<RateLimiter>,
        elevated: Arc<RateLimiter>,
        elevated_roles: Vec<Role>,
    ) -> Self {
        Self {
            general,
            elevated,
            elevated_roles,
        }
    }

    pub fn select(&self, ctx: &RequestContext) -> &Arc<RateLimiter> {
        match ctx.role() {
            Some(role) if self.elevated_roles.contains(&role) => &self.elevated,
            _ => &self.general,
        }
    }

    pub fn general(&self) -> &Arc<RateLimiter> {
        &self.general
    }

    pub fn elevated(&self) -> &Arc<RateLimiter> {
        &self.elevated
    }
}
