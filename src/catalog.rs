use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::info;

use crate::{
    config::{LimitSettings, PolicySettings},
    error::{RateLimitError, Result},
    limiter::{RateLimiter, RoleAwareLimiter},
    metrics::Metrics,
    policy::{KeyGenerator, RateLimitPolicy, RateLimitPolicyBuilder},
    selector::StoreSelector,
};

pub const GENERAL_SCOPE: &str = "api";
pub const AUTH_SCOPE: &str = "auth";
pub const FETCH_SCOPE: &str = "fetch";
pub const SEARCH_SCOPE: &str = "search";
pub const USER_ACTION_SCOPE: &str = "user-action";
pub const ELEVATED_SCOPE: &str = "role";

/// Limit for a single endpoint, created through [`PolicyCatalog::endpoint`]
#[derive(Debug, Clone)]
pub struct EndpointLimit {
    pub name: String,
    pub window: Duration,
    pub max: u32,
    pub message: String,
    pub skip_successful: bool,
    pub skip_failed: bool,
}

impl EndpointLimit {
    pub fn new(name: impl Into<String>, window: Duration, max: u32) -> Self {
        Self {
            name: name.into(),
            window,
            max,
            message: "Too many requests to this endpoint, please try again later.".to_string(),
            skip_successful: false,
            skip_failed: false,
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful = skip;
        self
    }

    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed = skip;
        self
    }
}

/// The named, pre-configured limiters of the API
pub struct PolicyCatalog {
    general: Arc<RateLimiter>,
    auth: Arc<RateLimiter>,
    fetch: Arc<RateLimiter>,
    search: Arc<RateLimiter>,
    user_action: Arc<RateLimiter>,
    role_aware: Arc<RoleAwareLimiter>,
    selector: Arc<StoreSelector>,
    metrics: Arc<Metrics>,
    scopes: Mutex<HashSet<String>>,
}

impl PolicyCatalog {
    /// Build and validate every policy. Fails on the first misconfigured one.
    pub async fn build(
        settings: &PolicySettings,
        selector: Arc<StoreSelector>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let general_policy = policy(GENERAL_SCOPE, &settings.general, KeyGenerator::UserOrIp)
            .skip_paths(settings.general.skip_paths.clone())
            .build()?;

        let auth_policy = policy(AUTH_SCOPE, &settings.auth, KeyGenerator::CredentialOrIp)
            .skip_successful(true)
            .build()?;

        let fetch_policy = policy(FETCH_SCOPE, &settings.fetch, KeyGenerator::UserOrIp).build()?;
        let search_policy = policy(SEARCH_SCOPE, &settings.search, KeyGenerator::UserOrIp).build()?;
        let user_action_policy =
            policy(USER_ACTION_SCOPE, &settings.user_action, KeyGenerator::UserOrIp).build()?;

        if settings.elevated_multiplier == 0 {
            return Err(RateLimitError::Config(
                "elevated_multiplier must be at least 1".to_string(),
            ));
        }
        let elevated_max = settings
            .general
            .max
            .checked_mul(settings.elevated_multiplier)
            .ok_or_else(|| {
                RateLimitError::Config(format!(
                    "elevated quota overflows: {} x {}",
                    settings.general.max, settings.elevated_multiplier
                ))
            })?;
        let elevated_policy = RateLimitPolicy::builder(ELEVATED_SCOPE)
            .window(settings.general.window())
            .max(elevated_max)
            .key(KeyGenerator::UserOrIp)
            .message(settings.general.message.clone())
            .build()?;

        let mut scopes = HashSet::new();
        let mut register = |policy: RateLimitPolicy, store| -> Result<Arc<RateLimiter>> {
            if !scopes.insert(policy.scope().to_string()) {
                return Err(RateLimitError::Config(format!(
                    "duplicate rate limit scope '{}'",
                    policy.scope()
                )));
            }
            Ok(Arc::new(RateLimiter::new(policy, store, metrics.clone())))
        };

        let general = register(general_policy, selector.counter_store().await)?;
        let auth = register(auth_policy, selector.counter_store().await)?;
        let fetch = register(fetch_policy, selector.counter_store().await)?;
        let search = register(search_policy, selector.counter_store().await)?;
        let user_action = register(user_action_policy, selector.counter_store().await)?;
        let elevated = register(elevated_policy, selector.counter_store().await)?;

        let role_aware = Arc::new(RoleAwareLimiter::new(
            general.clone(),
            elevated,
            settings.elevated_roles.clone(),
        ));

        info!(
            "Rate limit catalog ready on the {} backend",
            general.backend()
        );

        Ok(Self {
            general,
            auth,
            fetch,
            search,
            user_action,
            role_aware,
            selector,
            metrics,
            scopes: Mutex::new(scopes),
        })
    }

    pub fn general(&self) -> &Arc<RateLimiter> {
        &self.general
    }

    pub fn auth(&self) -> &Arc<RateLimiter> {
        &self.auth
    }

    pub fn fetch(&self) -> &Arc<RateLimiter> {
        &self.fetch
    }

    pub fn search(&self) -> &Arc<RateLimiter> {
        &self.search
    }

    pub fn user_action(&self) -> &Arc<RateLimiter> {
        &self.user_action
    }

    pub fn elevated(&self) -> &Arc<RateLimiter> {
        self.role_aware.elevated()
    }

    pub fn role_aware(&self) -> &Arc<RoleAwareLimiter> {
        &self.role_aware
    }

    /// Every named limiter, for status reporting
    pub fn limiters(&self) -> Vec<&Arc<RateLimiter>> {
        vec![
            &self.general,
            &self.auth,
            &self.fetch,
            &self.search,
            &self.user_action,
            self.role_aware.elevated(),
        ]
    }

    /// Create a limiter scoped to one endpoint, keyed `<name>:<identity>`
    pub async fn endpoint(&self, limit: EndpointLimit) -> Result<Arc<RateLimiter>> {
        let policy = RateLimitPolicy::builder(limit.name.clone())
            .window(limit.window)
            .max(limit.max)
            .key(KeyGenerator::UserOrIp)
            .skip_successful(limit.skip_successful)
            .skip_failed(limit.skip_failed)
            .message(limit.message)
            .build()?;

        {
            let mut scopes = self
                .scopes
                .lock()
                .map_err(|_| RateLimitError::Config("scope registry poisoned".to_string()))?;
            if !scopes.insert(limit.name.clone()) {
                return Err(RateLimitError::Config(format!(
                    "duplicate rate limit scope '{}'",
                    limit.name
                )));
            }
        }

        let store = self.selector.counter_store().await;
        Ok(Arc::new(RateLimiter::new(policy, store, self.metrics.clone())))
    }
}

fn policy(
    scope: &str,
    settings: &LimitSettings,
    key: KeyGenerator,
) -> RateLimitPolicyBuilder {
    RateLimitPolicy::builder(scope)
        .window(settings.window())
        .max(settings.max)
        .key(key)
        .message(settings.message.clone())
}
