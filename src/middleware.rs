use axum::{
    body::{self, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tracing::debug;

use crate::{
    limiter::{Decision, Outcome, RateLimitInfo, RateLimiter, RoleAwareLimiter},
    policy::{CallerIdentity, RequestContext},
    utils::{client_ip, TrustedProxies},
};

/// Largest request body inspected for a login credential
pub const MAX_CREDENTIAL_BODY_BYTES: usize = 64 * 1024;

pub const RATE_LIMIT_CODE: &str = "RATE_LIMIT_EXCEEDED";

const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

#[derive(Debug, Serialize)]
struct Rejection {
    error: RejectionDetail,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RejectionDetail {
    message: String,
    code: &'static str,
    retry_after: u64,
}

/// Apply one limiter to every request passing through.
///
/// ```ignore
/// Router::new()
///     .route("/api/search", get(search))
///     .layer(middleware::from_fn_with_state(catalog.search().clone(), enforce));
/// ```
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let ctx = request_context(&req);
    guard(&limiter, ctx, req, next).await
}

/// Like [`enforce`], choosing the elevated limiter for privileged callers
pub async fn enforce_by_role(
    State(limiter): State<Arc<RoleAwareLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    let ctx = request_context(&req);
    let selected = limiter.select(&ctx).clone();
    guard(&selected, ctx, req, next).await
}

async fn guard(
    limiter: &RateLimiter,
    mut ctx: RequestContext,
    req: Request,
    next: Next,
) -> Response {
    let req = if limiter.policy().key_generator().needs_credential() {
        match buffer_credential(req).await {
            Ok((req, credential)) => {
                if let Some(credential) = credential {
                    ctx = ctx.with_credential(credential);
                }
                req
            }
            Err(response) => return response,
        }
    } else {
        req
    };

    let decision = limiter.check(&ctx).await;

    if let Decision::Denied(info) = &decision {
        limiter.settle(&decision, Outcome::Failure).await;
        return rejection(limiter.policy().message(), info);
    }

    let mut response = next.run(req).await;
    if let Some(info) = decision.info() {
        set_quota_headers(response.headers_mut(), info);
    }
    limiter
        .settle(&decision, Outcome::from_status(response.status()))
        .await;

    response
}

/// Everything the limiter needs from the request, minus the body.
///
/// Forwarding headers are honoured only as far as the [`TrustedProxies`]
/// extension allows; without it the socket address identifies the client.
pub fn request_context(req: &Request) -> RequestContext {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let proxies = req
        .extensions()
        .get::<TrustedProxies>()
        .copied()
        .unwrap_or_default();

    let ctx = RequestContext::new(
        client_ip(req.headers(), remote, proxies),
        req.method().clone(),
        req.uri().path(),
    );

    match req.extensions().get::<CallerIdentity>() {
        Some(caller) => ctx.with_caller(caller.clone()),
        None => ctx,
    }
}

/// Read the body to find the login credential, then put it back for the handler
async fn buffer_credential(req: Request) -> Result<(Request, Option<String>), Response> {
    let (parts, body) = req.into_parts();

    let declared = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > MAX_CREDENTIAL_BODY_BYTES) {
        return Err(payload_too_large());
    }

    let bytes = match body::to_bytes(body, MAX_CREDENTIAL_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            debug!("Could not buffer request body for credential lookup: {}", e);
            return Err(payload_too_large());
        }
    };

    let credential = credential_from_body(&bytes);
    Ok((Request::from_parts(parts, Body::from(bytes)), credential))
}

/// `email`, then `username`, from a JSON body
fn credential_from_body(bytes: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(bytes).ok()?;
    ["email", "username"].iter().find_map(|field| {
        value
            .get(field)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

fn set_quota_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(info.limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(info.remaining));
    headers.insert(RATELIMIT_RESET, HeaderValue::from(info.reset_secs()));
}

fn rejection(message: &str, info: &RateLimitInfo) -> Response {
    let retry_after = info.retry_after_secs();
    let body = Rejection {
        error: RejectionDetail {
            message: message.to_string(),
            code: RATE_LIMIT_CODE,
            retry_after,
        },
    };

    let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    let headers = response.headers_mut();
    set_quota_headers(headers, info);
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    response
}

fn payload_too_large() -> Response {
    (
        StatusCode::PAYLOAD_TOO_LARGE,
        Json(serde_json::json!({
            "error": {
                "message": "Request body too large",
                "code": "PAYLOAD_TOO_LARGE",
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metrics::Metrics,
        policy::{KeyGenerator, RateLimitPolicy, Role},
        store::{CounterStore, LocalStore},
    };
    use axum::{middleware, routing::{get, post}, Router};
    use std::time::Duration;
    use tower::ServiceExt;

    fn limiter(policy: RateLimitPolicy, store: Arc<dyn CounterStore>) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(policy, store, Arc::new(Metrics::default())))
    }

    fn articles_app(limiter: Arc<RateLimiter>) -> Router {
        Router::new()
            .route("/api/articles", get(|| async { "articles" }))
            .route("/api/missing", get(|| async { StatusCode::NOT_FOUND }))
            .layer(middleware::from_fn_with_state(limiter, enforce))
    }

    fn login_app(limiter: Arc<RateLimiter>) -> Router {
        async fn login(Json(body): Json<serde_json::Value>) -> StatusCode {
            if body["password"] == "correct horse" {
                StatusCode::OK
            } else {
                StatusCode::UNAUTHORIZED
            }
        }

        Router::new()
            .route("/api/auth/login", post(login))
            .layer(middleware::from_fn_with_state(limiter, enforce))
    }

    fn from_peer(mut req: Request, ip: &str) -> Request {
        let addr: SocketAddr = format!("{}:40000", ip).parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(addr));
        req
    }

    fn get_request(path: &str, ip: &str) -> Request {
        from_peer(http::Request::builder().uri(path).body(Body::empty()).unwrap(), ip)
    }

    fn login_request(ip: &str, email: &str, password: &str) -> Request {
        let body = serde_json::json!({ "email": email, "password": password });
        let req = http::Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        from_peer(req, ip)
    }

    fn header_u64(response: &Response, name: &str) -> u64 {
        response.headers()[name].to_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_allowed_responses_carry_quota_headers() {
        let policy = RateLimitPolicy::builder("api")
            .window(Duration::from_secs(60))
            .max(5)
            .build()
            .unwrap();
        let app = articles_app(limiter(policy, Arc::new(LocalStore::default())));

        let response = app.oneshot(get_request("/api/articles", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header_u64(&response, "ratelimit-limit"), 5);
        assert_eq!(header_u64(&response, "ratelimit-remaining"), 4);
        assert_eq!(header_u64(&response, "ratelimit-reset"), 60);
    }

    #[tokio::test]
    async fn test_denied_request_gets_429_body() {
        let policy = RateLimitPolicy::builder("api")
            .window(Duration::from_secs(60))
            .max(1)
            .message("Too many requests from this IP, please try again later.")
            .build()
            .unwrap();
        let app = articles_app(limiter(policy, Arc::new(LocalStore::default())));

        let first = app.clone().oneshot(get_request("/api/articles", "1.2.3.4")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let denied = app.clone().oneshot(get_request("/api/articles", "1.2.3.4")).await.unwrap();
        assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(header_u64(&denied, "retry-after"), 60);
        assert_eq!(header_u64(&denied, "ratelimit-remaining"), 0);

        let body = body::to_bytes(denied.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["code"], RATE_LIMIT_CODE);
        assert_eq!(body["error"]["retryAfter"], 60);
        assert_eq!(
            body["error"]["message"],
            "Too many requests from this IP, please try again later."
        );

        // another client is unaffected
        let other = app.oneshot(get_request("/api/articles", "5.6.7.8")).await.unwrap();
        assert_eq!(other.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_skip_failed_ignores_error_responses() {
        let policy = RateLimitPolicy::builder("fetch")
            .window(Duration::from_secs(60))
            .max(1)
            .skip_failed(true)
            .build()
            .unwrap();
        let app = articles_app(limiter(policy, Arc::new(LocalStore::default())));

        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(get_request("/api/missing", "1.2.3.4"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
        let response = app.oneshot(get_request("/api/articles", "1.2.3.4")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_is_keyed_by_credential() {
        let store = Arc::new(LocalStore::default());
        let policy = RateLimitPolicy::builder("auth")
            .window(Duration::from_secs(900))
            .max(2)
            .key(KeyGenerator::CredentialOrIp)
            .skip_successful(true)
            .build()
            .unwrap();
        let app = login_app(limiter(policy, store.clone()));

        // failures from different IPs share the credential's counter
        for ip in ["1.1.1.1", "2.2.2.2"] {
            let response = app
                .clone()
                .oneshot(login_request(ip, "Reader@Example.com", "wrong"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
        assert_eq!(store.get("auth:email:reader@example.com").await.unwrap().count, 2);

        let blocked = app
            .clone()
            .oneshot(login_request("3.3.3.3", "reader@example.com", "correct horse"))
            .await
            .unwrap();
        assert_eq!(blocked.status(), StatusCode::TOO_MANY_REQUESTS);

        // a different account is untouched
        let other = app
            .oneshot(login_request("1.1.1.1", "editor@example.com", "correct horse"))
            .await
            .unwrap();
        assert_eq!(other.status(), StatusCode::OK);
        assert!(store.get("auth:email:editor@example.com").await.map_or(true, |r| r.count == 0));
    }

    #[tokio::test]
    async fn test_oversized_login_body_is_rejected() {
        let policy = RateLimitPolicy::builder("auth")
            .max(5)
            .key(KeyGenerator::CredentialOrIp)
            .build()
            .unwrap();
        let app = login_app(limiter(policy, Arc::new(LocalStore::default())));

        let request = http::Request::builder()
            .method("POST")
            .uri("/api/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(vec![b' '; MAX_CREDENTIAL_BODY_BYTES + 1]))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_role_aware_middleware() {
        let store: Arc<dyn CounterStore> = Arc::new(LocalStore::default());
        let general = limiter(
            RateLimitPolicy::builder("api").max(1).key(KeyGenerator::UserOrIp).build().unwrap(),
            store.clone(),
        );
        let elevated = limiter(
            RateLimitPolicy::builder("role").max(5).key(KeyGenerator::UserOrIp).build().unwrap(),
            store,
        );
        let role_aware = Arc::new(RoleAwareLimiter::new(general, elevated, vec![Role::Admin]));
        let app = Router::new()
            .route("/api/articles", get(|| async { "articles" }))
            .layer(middleware::from_fn_with_state(role_aware, enforce_by_role));

        let as_caller = |role: Role| {
            let mut req = get_request("/api/articles", "1.2.3.4");
            req.extensions_mut().insert(CallerIdentity::new("7", role));
            req
        };

        let response = app.clone().oneshot(as_caller(Role::Admin)).await.unwrap();
        assert_eq!(header_u64(&response, "ratelimit-limit"), 5);

        let response = app.clone().oneshot(as_caller(Role::User)).await.unwrap();
        assert_eq!(header_u64(&response, "ratelimit-limit"), 1);
        let response = app.oneshot(as_caller(Role::User)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_rotating_forwarded_for_does_not_reset_the_count() {
        let policy = RateLimitPolicy::builder("api")
            .window(Duration::from_secs(60))
            .max(1)
            .build()
            .unwrap();
        let store: Arc<dyn CounterStore> = Arc::new(LocalStore::default());
        let direct = articles_app(limiter(policy, store.clone()));
        let proxied = articles_app(limiter(
            RateLimitPolicy::builder("proxied").max(1).build().unwrap(),
            store,
        ))
        .layer(axum::Extension(TrustedProxies(1)));

        let spoofed = |n: u32, peer: &str| {
            let mut req = get_request("/api/articles", peer);
            let forwarded = format!("6.6.6.{}, 10.0.0.1", n);
            req.headers_mut()
                .insert("x-forwarded-for", HeaderValue::from_str(&forwarded).unwrap());
            req
        };

        // exposed directly: the header is ignored, the socket address counts
        let mut allowed = 0;
        for n in 0..20 {
            let response = direct.clone().oneshot(spoofed(n, "203.0.113.7")).await.unwrap();
            if response.status() == StatusCode::OK {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);

        // behind one proxy: only the entry that proxy appended counts
        let mut allowed = 0;
        for n in 0..20 {
            let response = proxied.clone().oneshot(spoofed(n, "10.0.0.254")).await.unwrap();
            if response.status() == StatusCode::OK {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 1);
    }

    #[test]
    fn test_request_context_uses_trusted_hops() {
        let mut req = get_request("/api/articles", "10.0.0.254");
        req.headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static("6.6.6.6, 1.2.3.4"));
        assert_eq!(request_context(&req).ip, "10.0.0.254");

        req.extensions_mut().insert(TrustedProxies(1));
        assert_eq!(request_context(&req).ip, "1.2.3.4");
    }

    #[test]
    fn test_credential_from_body() {
        assert_eq!(
            credential_from_body(br#"{"email":"a@b.c","username":"abc"}"#),
            Some("a@b.c".to_string())
        );
        assert_eq!(credential_from_body(br#"{"username":"abc"}"#), Some("abc".to_string()));
        assert_eq!(credential_from_body(br#"{"email":"  "}"#), None);
        assert_eq!(credential_from_body(b"not json"), None);
    }
}
