//! Small helpers shared by the auth handlers.

use axum::{
    extract::ConnectInfo,
    http::{
        HeaderMap,
        header::{AUTHORIZATION, USER_AGENT},
    },
};
use regex::Regex;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

use crate::auth::{
    AuthError, AuthState, RequestContext,
    audit::{AuditEvent, AuditEventType},
    error::ErrorCode,
    rate_limit::RateLimitAction,
    session::AccessClaims,
};

const MAX_USER_AGENT_LEN: usize = 512;

/// Normalize an email for lookup/uniqueness checks.
pub(super) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(super) fn valid_email(email_normalized: &str) -> bool {
    email_normalized.len() <= 254
        && Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$")
            .is_ok_and(|regex| regex.is_match(email_normalized))
}

/// Socket peer, present when served through `into_make_service_with_connect_info`.
pub(crate) type Peer = Option<ConnectInfo<SocketAddr>>;

/// Client IP for rate limiting and session binding.
///
/// Without trusted proxies only the socket peer counts. Behind `trusted_proxies`
/// hops, the client is the entry that many places from the right of
/// `X-Forwarded-For`: everything left of it was supplied by the client.
pub(super) fn client_ip(
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
    trusted_proxies: usize,
) -> Option<String> {
    let peer_ip = peer.map(|addr| addr.ip().to_string());
    if trusted_proxies == 0 {
        return peer_ip;
    }

    let forwarded: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    let candidate = if forwarded.is_empty() {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    } else {
        forwarded
            .len()
            .checked_sub(trusted_proxies)
            .and_then(|index| forwarded.get(index).copied())
    };

    candidate
        .and_then(|value| value.parse::<IpAddr>().ok())
        .map(|ip| ip.to_string())
        .or(peer_ip)
}

/// Two-letter country code set by the edge proxy, if any.
pub(super) fn extract_country_code(headers: &HeaderMap) -> Option<String> {
    ["cf-ipcountry", "x-country-code"]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| value.len() == 2 && value.chars().all(|c| c.is_ascii_alphabetic()))
        .map(str::to_uppercase)
}

/// Client platform hint from `sec-ch-ua-platform`, quotes stripped.
pub(super) fn extract_device(headers: &HeaderMap) -> Option<String> {
    headers
        .get("sec-ch-ua-platform")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|value| !value.is_empty())
}

pub(super) fn request_context(
    auth_state: &AuthState,
    headers: &HeaderMap,
    peer: &Peer,
) -> RequestContext {
    let peer = peer.as_ref().map(|ConnectInfo(addr)| *addr);
    RequestContext {
        ip: client_ip(headers, peer, auth_state.config().trusted_proxies()),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.chars().take(MAX_USER_AGENT_LEN).collect()),
    }
}

pub(super) fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

/// Verify the bearer access token on a protected endpoint.
pub(super) fn authenticate(auth_state: &AuthState, headers: &HeaderMap) -> Result<AccessClaims, AuthError> {
    let token = extract_bearer_token(headers).ok_or(AuthError::Unauthorized)?;
    auth_state
        .sessions()
        .verify_access_token(&token)
        .map_err(|_| AuthError::Unauthorized)
}

/// Count one attempt against `action`'s limit, auditing the rejection.
pub(super) async fn enforce_rate_limit(
    auth_state: &AuthState,
    action: RateLimitAction,
    identifier: &str,
    ctx: &RequestContext,
) -> Result<(), AuthError> {
    let config = auth_state.rate_limit(action);
    match auth_state
        .rate_limiter()
        .check_rate_limit(identifier, &config)
        .await
    {
        Ok(()) => Ok(()),
        Err(limited) => {
            let event =
                AuditEvent::failure(AuditEventType::RateLimited, ctx).with_reason(action.key_prefix());
            Err(auth_state
                .reporter()
                .reject(ErrorCode::RateLimited.as_str(), limited.into(), event)
                .await)
        }
    }
}

/// Per-client bucket for `action`.
///
/// Skipped when the client address is unknown, so unrelated callers never
/// share one counter.
pub(super) async fn enforce_ip_rate_limit(
    auth_state: &AuthState,
    action: RateLimitAction,
    ctx: &RequestContext,
) -> Result<(), AuthError> {
    match ctx.ip.as_deref() {
        Some(ip) => enforce_rate_limit(auth_state, action, ip, ctx).await,
        None => {
            debug!(action = action.key_prefix(), "client address unknown, per-IP limit skipped");
            Ok(())
        }
    }
}
