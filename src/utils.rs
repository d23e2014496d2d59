use axum::http::HeaderMap;
use std::{net::SocketAddr, time::Duration};

/// Compose a rate limit key from a policy scope and a caller identity.
///
/// Identities already carry a type tag (`ip:`, `user:`, `email:`), so the
/// composed key is `<scope>:<tag>:<value>`.
pub fn scoped_key(scope: &str, identity: &str) -> String {
    format!("{}:{}", scope, identity)
}

/// Round a duration up to whole seconds
pub fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Seconds a rejected caller should wait; never zero so clients do not spin
pub fn retry_after_secs(time_remaining: Duration) -> u64 {
    ceil_secs(time_remaining).max(1)
}

/// Window length in milliseconds, as Redis `PEXPIRE` expects it
pub fn window_millis(window: Duration) -> u64 {
    (window.as_millis() as u64).max(1)
}

/// Number of reverse proxies in front of the service.
///
/// Forwarding headers are only believed up to this many hops; with none
/// configured the socket address is the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrustedProxies(pub usize);

/// Resolve the caller IP.
///
/// Each trusted proxy appends the peer it saw to `X-Forwarded-For`, so the
/// client is the entry `hops` places from the right. Anything further left
/// was supplied by the client and is ignored.
pub fn client_ip(
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
    proxies: TrustedProxies,
) -> String {
    let remote = remote.map(|addr| addr.ip().to_string());
    let hops = proxies.0;
    if hops == 0 {
        return remote.unwrap_or_else(|| "unknown".to_string());
    }

    let forwarded: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .collect();

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());

    forwarded
        .get(forwarded.len().saturating_sub(hops))
        .copied()
        .or(real_ip)
        .map(str::to_string)
        .or(remote)
        .unwrap_or_else(|| "unknown".to_string())
}
