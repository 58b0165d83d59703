//! Cache policy derived from HTTP response headers.
//!
//! # Freshness
//!
//! | Headers | `soft_ttl` | `ttl` |
//! |---------|------------|-------|
//! | `Cache-Control: no-store` / `no-cache` | not cached | not cached |
//! | `Cache-Control: max-age=N` | now + N | soft + `stale-while-revalidate` |
//! | `... must-revalidate` / `proxy-revalidate` | now + N | soft |
//! | `Expires` + `Date` (no `Cache-Control`) | now + (expires - date) | soft |
//! | none of the above | now + default TTL | soft |

use std::time::Duration;

use tracing::trace;

use super::{CacheEntry, from_millis, to_millis};
use crate::network::NetworkResponse;

/// Builds a cache entry for `response`, or `None` when the server forbids caching.
#[must_use]
pub fn parse_cache_headers(
    response: &NetworkResponse,
    now: u64,
    default_ttl: Duration,
) -> Option<CacheEntry> {
    let server_date = response.header("date").and_then(parse_http_date_millis);
    let last_modified = response
        .header("last-modified")
        .and_then(parse_http_date_millis);
    let etag = response.header("etag").map(str::to_string);

    let mut has_cache_control = false;
    let mut max_age: u64 = 0;
    let mut stale_while_revalidate: u64 = 0;
    let mut must_revalidate = false;

    if let Some(cache_control) = response.header("cache-control") {
        has_cache_control = true;
        for directive in cache_control.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-cache" || directive == "no-store" {
                trace!(%directive, "response not cacheable");
                return None;
            } else if let Some(value) = directive.strip_prefix("max-age=") {
                max_age = value.trim().parse().unwrap_or(0);
            } else if let Some(value) = directive.strip_prefix("stale-while-revalidate=") {
                stale_while_revalidate = value.trim().parse().unwrap_or(0);
            } else if directive == "must-revalidate" || directive == "proxy-revalidate" {
                must_revalidate = true;
            }
        }
    }

    let expires = response.header("expires").and_then(parse_http_date_millis);

    let (soft_ttl, ttl) = if has_cache_control {
        let soft = now.saturating_add(max_age.saturating_mul(1000));
        let hard = if must_revalidate {
            soft
        } else {
            soft.saturating_add(stale_while_revalidate.saturating_mul(1000))
        };
        (soft, hard)
    } else if let (Some(date), Some(expires)) = (server_date, expires) {
        let soft = now.saturating_add(expires.saturating_sub(date));
        (soft, soft)
    } else {
        let default = now.saturating_add(u64::try_from(default_ttl.as_millis()).unwrap_or(u64::MAX));
        (default, default)
    };

    Some(CacheEntry {
        data: response.data.clone(),
        etag,
        last_modified,
        server_date,
        ttl,
        soft_ttl,
        response_headers: response.headers.clone(),
    })
}

/// Conditional request headers for revalidating `entry`.
#[must_use]
pub fn conditional_headers(entry: &CacheEntry) -> Vec<(String, String)> {
    let mut headers = Vec::new();
    if let Some(etag) = &entry.etag {
        headers.push(("If-None-Match".to_string(), etag.clone()));
    }
    if let Some(last_modified) = entry.last_modified {
        headers.push((
            "If-Modified-Since".to_string(),
            httpdate::fmt_http_date(from_millis(last_modified)),
        ));
    }
    headers
}

fn parse_http_date_millis(value: &str) -> Option<u64> {
    httpdate::parse_http_date(value.trim()).ok().map(to_millis)
}
