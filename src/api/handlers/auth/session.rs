//! Session endpoints: refresh, logout, logout everywhere, suspicious sessions.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use std::sync::Arc;
use tracing::info;

use crate::auth::{
    AuthError, AuthState,
    audit::{AuditEvent, AuditEventType},
    rate_limit::RateLimitAction,
    session::{RefreshError, TOKEN_TYPE},
};

use super::types::{
    LogoutRequest, RefreshRequest, RefreshResponse, SessionSummary, SuspiciousSessionsResponse,
};
use super::utils::{Peer, authenticate, enforce_ip_rate_limit, request_context};

/// Exchange a refresh token for a new access token.
#[utoipa::path(
    post,
    path = "/auth/refresh",
    request_body = RefreshRequest,
    params(
        ("x-csrf-token" = String, Header, description = "Copy of the csrf_token cookie")
    ),
    responses(
        (status = 200, description = "New access token", body = RefreshResponse),
        (status = 400, description = "Malformed request", body = crate::auth::error::ErrorBody),
        (status = 401, description = "Session not usable", body = crate::auth::error::ErrorBody),
        (status = 429, description = "Rate limited", body = crate::auth::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn refresh(
    headers: HeaderMap,
    peer: Peer,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<RefreshRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let ctx = request_context(&auth_state, &headers, &peer);
    enforce_ip_rate_limit(&auth_state, RateLimitAction::Refresh, &ctx).await?;

    let Some(Json(request)) = payload else {
        return Err(AuthError::InvalidInput("Missing payload".to_string()));
    };
    let token = request.refresh_token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidInput("Missing refresh token".to_string()));
    }

    match auth_state
        .sessions()
        .refresh_access_token(token, &ctx)
        .await
    {
        Ok(issued) => {
            auth_state
                .reporter()
                .record(AuditEvent::success(AuditEventType::SessionRefreshed, &ctx))
                .await;
            Ok(Json(RefreshResponse {
                access_token: issued.access_token,
                token_type: TOKEN_TYPE.to_string(),
                expires_in: issued.expires_in,
            }))
        }
        Err(RefreshError::Store(err)) => {
            let event = AuditEvent::failure(AuditEventType::SessionRefreshFailure, &ctx);
            Err(auth_state.reporter().internal(&err, event).await)
        }
        Err(refresh_error) => {
            let mut event = AuditEvent::failure(AuditEventType::SessionRefreshFailure, &ctx)
                .with_reason(refresh_error.reason());
            if let Some(user_id) = refresh_error.user_id() {
                event = event.with_user(user_id);
            }
            if matches!(refresh_error, RefreshError::BindingMismatch { .. }) {
                event = event.with_metadata("suspicious_activity", true);
            }
            Err(auth_state
                .reporter()
                .reject("SESSION_INVALID", AuthError::Unauthorized, event)
                .await)
        }
    }
}

/// Revoke the session owning a refresh token. Unknown tokens are accepted silently.
#[utoipa::path(
    post,
    path = "/auth/logout",
    request_body = LogoutRequest,
    params(
        ("x-csrf-token" = String, Header, description = "Copy of the csrf_token cookie")
    ),
    responses(
        (status = 204, description = "Signed out"),
        (status = 400, description = "Malformed request", body = crate::auth::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn logout(
    headers: HeaderMap,
    peer: Peer,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LogoutRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::InvalidInput("Missing payload".to_string()));
    };
    let token = request.refresh_token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidInput("Missing refresh token".to_string()));
    }

    let ctx = request_context(&auth_state, &headers, &peer);
    match auth_state.sessions().revoke_refresh_token(token).await {
        Ok(Some(user_id)) => {
            auth_state
                .reporter()
                .record(AuditEvent::success(AuditEventType::SessionRevoked, &ctx).with_user(user_id))
                .await;
        }
        Ok(None) => {}
        Err(err) => {
            let event = AuditEvent::failure(AuditEventType::SessionRevoked, &ctx);
            return Err(auth_state.reporter().internal(&err, event).await);
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Revoke every session of the authenticated user.
#[utoipa::path(
    post,
    path = "/auth/logout-all",
    params(
        ("Authorization" = String, Header, description = "Bearer access token"),
        ("x-csrf-token" = String, Header, description = "Copy of the csrf_token cookie")
    ),
    responses(
        (status = 204, description = "All sessions revoked"),
        (status = 401, description = "Missing or invalid access token", body = crate::auth::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn logout_all(
    headers: HeaderMap,
    peer: Peer,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let ctx = request_context(&auth_state, &headers, &peer);
    let claims = authenticate(&auth_state, &headers)?;
    let failure = AuditEvent::failure(AuditEventType::AllSessionsRevoked, &ctx);
    let user_id = match claims.user_id() {
        Ok(user_id) => user_id,
        Err(err) => return Err(auth_state.reporter().internal(&err, failure).await),
    };

    match auth_state.sessions().revoke_all_sessions(user_id).await {
        Ok(revoked) => {
            info!(user_id = %user_id, revoked, "revoked all sessions");
            auth_state
                .reporter()
                .record(
                    AuditEvent::success(AuditEventType::AllSessionsRevoked, &ctx)
                        .with_user(user_id)
                        .with_metadata("revoked_sessions", revoked),
                )
                .await;
            Ok(StatusCode::NO_CONTENT)
        }
        Err(err) => Err(auth_state
            .reporter()
            .internal(&err, failure.with_user(user_id))
            .await),
    }
}

/// Recent sessions of the authenticated user, when they look suspicious.
#[utoipa::path(
    get,
    path = "/auth/sessions/suspicious",
    params(
        ("Authorization" = String, Header, description = "Bearer access token")
    ),
    responses(
        (status = 200, description = "Flagged sessions, empty when nothing looks off", body = SuspiciousSessionsResponse),
        (status = 401, description = "Missing or invalid access token", body = crate::auth::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn suspicious_sessions(
    headers: HeaderMap,
    peer: Peer,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let claims = authenticate(&auth_state, &headers)?;
    let ctx = request_context(&auth_state, &headers, &peer);
    let failure = AuditEvent::failure(AuditEventType::SessionRefreshFailure, &ctx)
        .with_reason("suspicious session lookup");
    let user_id = match claims.user_id() {
        Ok(user_id) => user_id,
        Err(err) => return Err(auth_state.reporter().internal(&err, failure).await),
    };

    match auth_state.sessions().get_suspicious_sessions(user_id).await {
        Ok(sessions) => Ok(Json(SuspiciousSessionsResponse {
            suspicious: !sessions.is_empty(),
            sessions: sessions.into_iter().map(SessionSummary::from).collect(),
        })),
        Err(err) => Err(auth_state
            .reporter()
            .internal(&err, failure.with_user(user_id))
            .await),
    }
}
