//! WebSocket origin allowlist checks.
//!
//! Allowlist entries are matched before any upgrade work:
//! - exact entries compare against the full `Origin` value;
//! - `*` accepts every origin;
//! - `*.suffix.example` accepts any host whose name ends in
//!   `.suffix.example` (the scheme is ignored, the dot boundary is
//!   required, so `evil-example.com` never matches `*.example.com`).
//!
//! An absent `Origin` header (same-origin and non-browser clients) is
//! always accepted.  An empty allowlist is development mode: accept all;
//! the service logs a warning at startup.

/// Decide whether an upgrade with the given `Origin` header is admitted.
pub fn origin_allowed(allowlist: &[String], origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    if allowlist.is_empty() {
        return true;
    }
    allowlist.iter().any(|entry| entry_matches(entry, origin))
}

fn entry_matches(entry: &str, origin: &str) -> bool {
    if entry == "*" {
        return true;
    }
    if let Some(suffix) = entry.strip_prefix("*.") {
        let host = origin_host(origin);
        return host.ends_with(suffix)
            && host.len() > suffix.len()
            && host.as_bytes()[host.len() - suffix.len() - 1] == b'.';
    }
    entry == origin
}

/// The host portion of an origin: scheme and port stripped.
fn origin_host(origin: &str) -> &str {
    let without_scheme = origin
        .split_once("://")
        .map_or(origin, |(_, rest)| rest);
    without_scheme
        .split_once(':')
        .map_or(without_scheme, |(host, _)| host)
}
