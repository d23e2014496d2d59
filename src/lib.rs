//! News API Rate Limiting
//!
//! Fixed-window rate limiting for an HTTP API, backed by Redis so every
//! instance shares one quota, with in-process counters when Redis is
//! unreachable. Also provides a fail-open cache-aside service over the same
//! Redis connection.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod policy;
pub mod redis;
pub mod selector;
pub mod store;
pub mod utils;

// Re-export main types
pub use cache::CacheService;
pub use catalog::{EndpointLimit, PolicyCatalog};
pub use config::Settings;
pub use error::{RateLimitError, Result};
pub use limiter::{Decision, Outcome, RateLimitInfo, RateLimiter, RoleAwareLimiter};
pub use policy::{CallerIdentity, KeyGenerator, RateLimitPolicy, RequestContext, Role};
pub use selector::StoreSelector;
pub use store::{BackendKind, CounterStore, Hits};
