use http::Method;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    error::{RateLimitError, Result},
    utils::scoped_key,
};

/// Role of an authenticated caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Editor,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Editor => "editor",
            Role::Admin => "admin",
        }
    }
}

/// Identity attached to a request by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub user_id: String,
    pub role: Role,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// What the limiter knows about a request
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip: String,
    pub method: Method,
    pub path: String,
    pub caller: Option<CallerIdentity>,
    /// Login credential (email or username) supplied in the request body
    pub credential: Option<String>,
}

impl RequestContext {
    pub fn new(ip: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            method,
            path: path.into(),
            caller: None,
            credential: None,
        }
    }

    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    pub fn ip_identity(&self) -> String {
        format!("ip:{}", self.ip)
    }

    pub fn user_identity(&self) -> Option<String> {
        self.caller
            .as_ref()
            .map(|caller| format!("user:{}", caller.user_id))
    }

    pub fn credential_identity(&self) -> Option<String> {
        let credential = self.credential.as_deref()?.trim();
        if credential.is_empty() {
            return None;
        }
        let tag = if credential.contains('@') { "email" } else { "username" };
        Some(format!("{}:{}", tag, credential.to_lowercase()))
    }

    pub fn role(&self) -> Option<Role> {
        self.caller.as_ref().map(|caller| caller.role)
    }
}

pub type KeyFn = Arc<dyn Fn(&RequestContext) -> String + Send + Sync>;
pub type SkipFn = Arc<dyn Fn(&RequestContext) -> bool + Send + Sync>;

/// How a policy derives the caller identity part of its key
#[derive(Clone)]
pub enum KeyGenerator {
    /// Client IP
    Ip,
    /// Authenticated user id, client IP for anonymous callers
    UserOrIp,
    /// Login credential from the request body, client IP when absent
    CredentialOrIp,
    /// Caller-supplied identity function
    Custom(KeyFn),
}

impl KeyGenerator {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> String + Send + Sync + 'static,
    {
        KeyGenerator::Custom(Arc::new(f))
    }

    pub fn identity(&self, ctx: &RequestContext) -> String {
        match self {
            KeyGenerator::Ip => ctx.ip_identity(),
            KeyGenerator::UserOrIp => ctx.user_identity().unwrap_or_else(|| ctx.ip_identity()),
            KeyGenerator::CredentialOrIp => ctx
                .credential_identity()
                .unwrap_or_else(|| ctx.ip_identity()),
            KeyGenerator::Custom(f) => f(ctx),
        }
    }

    /// Whether the request body has to be inspected to build the key
    pub fn needs_credential(&self) -> bool {
        matches!(self, KeyGenerator::CredentialOrIp)
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyGenerator::Ip => f.write_str("Ip"),
            KeyGenerator::UserOrIp => f.write_str("UserOrIp"),
            KeyGenerator::CredentialOrIp => f.write_str("CredentialOrIp"),
            KeyGenerator::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Immutable description of one rate limit.
///
/// Built once through [`RateLimitPolicy::builder`] and shared behind an `Arc`.
#[derive(Clone)]
pub struct RateLimitPolicy {
    scope: String,
    window: Duration,
    max: u32,
    key: KeyGenerator,
    skip_successful: bool,
    skip_failed: bool,
    skip: Option<SkipFn>,
    message: String,
}

impl RateLimitPolicy {
    pub fn builder(scope: impl Into<String>) -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder {
            scope: scope.into(),
            window: Duration::from_secs(60),
            max: 0,
            key: KeyGenerator::Ip,
            skip_successful: false,
            skip_failed: false,
            skip: None,
            message: "Too many requests, please try again later.".to_string(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn key_generator(&self) -> &KeyGenerator {
        &self.key
    }

    pub fn skip_successful(&self) -> bool {
        self.skip_successful
    }

    pub fn skip_failed(&self) -> bool {
        self.skip_failed
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Counter key for this request: `<scope>:<identity>`
    pub fn key_for(&self, ctx: &RequestContext) -> String {
        scoped_key(&self.scope, &self.key.identity(ctx))
    }

    /// Whether the request bypasses this policy entirely
    pub fn should_skip(&self, ctx: &RequestContext) -> bool {
        self.skip.as_ref().is_some_and(|skip| skip(ctx))
    }
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("scope", &self.scope)
            .field("window", &self.window)
            .field("max", &self.max)
            .field("key", &self.key)
            .field("skip_successful", &self.skip_successful)
            .field("skip_failed", &self.skip_failed)
            .field("skip", &self.skip.is_some())
            .field("message", &self.message)
            .finish()
    }
}

pub struct RateLimitPolicyBuilder {
    scope: String,
    window: Duration,
    max: u32,
    key: KeyGenerator,
    skip_successful: bool,
    skip_failed: bool,
    skip: Option<SkipFn>,
    message: String,
}

impl RateLimitPolicyBuilder {
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn max(mut self, max: u32) -> Self {
        self.max = max;
        self
    }

    pub fn key(mut self, key: KeyGenerator) -> Self {
        self.key = key;
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

    pub fn skip_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&RequestContext) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// Bypass requests whose path starts with any of `prefixes`
    pub fn skip_paths(self, prefixes: Vec<String>) -> Self {
        if prefixes.is_empty() {
            return self;
        }
        self.skip_when(move |ctx| prefixes.iter().any(|p| ctx.path.starts_with(p.as_str())))
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn build(self) -> Result<RateLimitPolicy> {
        if self.scope.trim().is_empty() {
            return Err(RateLimitError::Config(
                "rate limit scope must not be empty".to_string(),
            ));
        }
        // keys are `<scope>:<identity>`, so a colon would let scopes collide
        if self.scope.contains(':') {
            return Err(RateLimitError::Config(format!(
                "rate limit scope '{}' must not contain ':'",
                self.scope
            )));
        }
        if self.max == 0 {
            return Err(RateLimitError::Config(format!(
                "policy '{}' must allow at least one request per window",
                self.scope
            )));
        }
        if self.window.is_zero() {
            return Err(RateLimitError::Config(format!(
                "policy '{}' must have a non-zero window",
                self.scope
            )));
        }

        Ok(RateLimitPolicy {
            scope: self.scope,
            window: self.window,
            max: self.max,
            key: self.key,
            skip_successful: self.skip_successful,
            skip_failed: self.skip_failed,
            skip: self.skip,
            message: self.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext::new("1.2.3.4", Method::POST, "/api/auth/login")
    }

    #[test]
    fn test_key_generators() {
        let anonymous = ctx();
        let member = ctx().with_caller(CallerIdentity::new("42", Role::User));
        let login = ctx().with_credential("  Reader@Example.com ");

        assert_eq!(KeyGenerator::Ip.identity(&member), "ip:1.2.3.4");
        assert_eq!(KeyGenerator::UserOrIp.identity(&member), "user:42");
        assert_eq!(KeyGenerator::UserOrIp.identity(&anonymous), "ip:1.2.3.4");
        assert_eq!(
            KeyGenerator::CredentialOrIp.identity(&login),
            "email:reader@example.com"
        );
        assert_eq!(
            KeyGenerator::CredentialOrIp.identity(&ctx().with_credential("Reader")),
            "username:reader"
        );
        assert_eq!(
            KeyGenerator::CredentialOrIp.identity(&ctx().with_credential("   ")),
            "ip:1.2.3.4"
        );
        assert_eq!(
            KeyGenerator::custom(|c| format!("route:{}", c.path)).identity(&anonymous),
            "route:/api/auth/login"
        );
    }

    #[test]
    fn test_key_is_scoped() {
        let policy = RateLimitPolicy::builder("search")
            .max(30)
            .key(KeyGenerator::UserOrIp)
            .build()
            .unwrap();

        assert_eq!(policy.key_for(&ctx()), "search:ip:1.2.3.4");
        assert_eq!(
            policy.key_for(&ctx().with_caller(CallerIdentity::new("7", Role::Admin))),
            "search:user:7"
        );
    }

    #[test]
    fn test_validation_rejects_bad_policies() {
        let zero_quota = RateLimitPolicy::builder("api").max(0).build();
        assert!(matches!(zero_quota, Err(RateLimitError::Config(_))));

        let zero_window = RateLimitPolicy::builder("api")
            .max(1)
            .window(Duration::ZERO)
            .build();
        assert!(matches!(zero_window, Err(RateLimitError::Config(_))));

        let no_scope = RateLimitPolicy::builder(" ").max(1).build();
        assert!(matches!(no_scope, Err(RateLimitError::Config(_))));

        // "auth:email" + "x" would share keys with "auth" + "email:x"
        let nested = RateLimitPolicy::builder("auth:email").max(1).build();
        assert!(matches!(nested, Err(RateLimitError::Config(_))));
    }

    #[test]
    fn test_skip_paths() {
        let policy = RateLimitPolicy::builder("api")
            .max(10)
            .skip_paths(vec!["/healthcheck".to_string()])
            .build()
            .unwrap();

        assert!(policy.should_skip(&RequestContext::new("1.1.1.1", Method::GET, "/healthcheck")));
        assert!(!policy.should_skip(&RequestContext::new("1.1.1.1", Method::GET, "/api/articles")));

        let unskipped = RateLimitPolicy::builder("api").max(10).build().unwrap();
        assert!(!unskipped.should_skip(&ctx()));
    }

    #[test]
    fn test_role_serde() {
        let roles: Vec<Role> = serde_json::from_str(r#"["admin","editor","user"]"#).unwrap();
        assert_eq!(roles, vec![Role::Admin, Role::Editor, Role::User]);
        assert_eq!(Role::Admin.as_str(), "admin");
    }
}
