//! Forgot-password and reset-password endpoints.

use axum::{Json, extract::Extension, http::HeaderMap, response::IntoResponse};
use std::sync::Arc;

use crate::auth::{AuthError, AuthState, rate_limit::RateLimitAction};

use super::types::{ForgotPasswordRequest, MessageResponse, ResetPasswordRequest};
use super::utils::{
    Peer, enforce_ip_rate_limit, enforce_rate_limit, normalize_email, request_context, valid_email,
};

pub const FORGOT_PASSWORD_MESSAGE: &str =
    "If an account exists for that email, a password reset link has been sent.";
pub const RESET_PASSWORD_MESSAGE: &str = "Your password has been reset. Please sign in.";

/// Start a password reset. The response never reveals whether the account exists.
#[utoipa::path(
    post,
    path = "/auth/forgot-password",
    request_body = ForgotPasswordRequest,
    responses(
        (status = 200, description = "Reset requested", body = MessageResponse),
        (status = 400, description = "Malformed request", body = crate::auth::error::ErrorBody),
        (status = 403, description = "CSRF check failed", body = crate::auth::error::ErrorBody),
        (status = 429, description = "Rate limited", body = crate::auth::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn forgot_password(
    headers: HeaderMap,
    peer: Peer,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ForgotPasswordRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let ctx = request_context(&auth_state, &headers, &peer);

    // IP first so malformed floods are throttled too.
    enforce_ip_rate_limit(&auth_state, RateLimitAction::ForgotPassword, &ctx).await?;

    let Some(Json(request)) = payload else {
        return Err(AuthError::InvalidInput("Missing payload".to_string()));
    };
    let email = normalize_email(&request.email);
    if !valid_email(&email) {
        return Err(AuthError::InvalidInput("Invalid email".to_string()));
    }

    enforce_rate_limit(&auth_state, RateLimitAction::ForgotPassword, &email, &ctx).await?;

    auth_state.reset().request_reset(&email, &ctx).await?;
    Ok(Json(MessageResponse::ok(FORGOT_PASSWORD_MESSAGE)))
}

/// Set a new password with a single-use reset token.
#[utoipa::path(
    post,
    path = "/auth/reset-password",
    request_body = ResetPasswordRequest,
    params(
        ("x-csrf-token" = String, Header, description = "Copy of the csrf_token cookie")
    ),
    responses(
        (status = 200, description = "Password reset", body = MessageResponse),
        (status = 400, description = "Invalid token, weak password, or malformed request", body = crate::auth::error::ErrorBody),
        (status = 403, description = "CSRF check failed", body = crate::auth::error::ErrorBody),
        (status = 429, description = "Rate limited", body = crate::auth::error::ErrorBody),
        (status = 500, description = "Reset failed", body = crate::auth::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn reset_password(
    headers: HeaderMap,
    peer: Peer,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<ResetPasswordRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let ctx = request_context(&auth_state, &headers, &peer);

    enforce_ip_rate_limit(&auth_state, RateLimitAction::ResetPassword, &ctx).await?;

    let Some(Json(request)) = payload else {
        return Err(AuthError::InvalidInput("Missing payload".to_string()));
    };
    let token = request.token.trim();
    if token.is_empty() {
        return Err(AuthError::InvalidInput("Missing token".to_string()));
    }
    if request.password.is_empty() {
        return Err(AuthError::InvalidInput("Missing password".to_string()));
    }

    auth_state
        .reset()
        .consume_reset(token, &request.password, &ctx)
        .await?;
    Ok(Json(MessageResponse::ok(RESET_PASSWORD_MESSAGE)))
}
