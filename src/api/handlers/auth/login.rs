//! Password login.

use anyhow::Context;
use axum::{Json, extract::Extension, http::HeaderMap, response::IntoResponse};
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{
    AuthError, AuthState, RequestContext,
    audit::{AuditEvent, AuditEventType},
    crypto::{verify_dummy_password, verify_password},
    error::ErrorCode,
    rate_limit::RateLimitAction,
    session::TOKEN_TYPE,
};

use super::types::{LoginRequest, LoginResponse};
use super::utils::{
    Peer, extract_country_code, extract_device, normalize_email, request_context, valid_email,
};

/// Exchange email and password for an access/refresh token pair.
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    params(
        ("x-csrf-token" = String, Header, description = "Copy of the csrf_token cookie")
    ),
    responses(
        (status = 200, description = "Signed in", body = LoginResponse),
        (status = 400, description = "Invalid email or password", body = crate::auth::error::ErrorBody),
        (status = 403, description = "Email not verified or CSRF check failed", body = crate::auth::error::ErrorBody),
        (status = 429, description = "Too many failed attempts", body = crate::auth::error::ErrorBody),
        (status = 500, description = "Login failed", body = crate::auth::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn login(
    headers: HeaderMap,
    peer: Peer,
    auth_state: Extension<Arc<AuthState>>,
    payload: Option<Json<LoginRequest>>,
) -> Result<impl IntoResponse, AuthError> {
    let Some(Json(request)) = payload else {
        return Err(AuthError::InvalidInput("Missing payload".to_string()));
    };
    let email = normalize_email(&request.email);
    if !valid_email(&email) || request.password.is_empty() {
        return Err(AuthError::InvalidInput(
            "Email and password are required".to_string(),
        ));
    }

    let ctx = request_context(&auth_state, &headers, &peer);
    let limit = auth_state.rate_limit(RateLimitAction::Login);
    let buckets = login_buckets(&ctx, &email);
    for bucket in &buckets {
        if let Err(limited) = auth_state
            .rate_limiter()
            .check_rate_limit(bucket, &limit)
            .await
        {
            let event = AuditEvent::failure(AuditEventType::AccountLocked, &ctx)
                .with_email(&email)
                .with_reason("too many attempts");
            return Err(auth_state
                .reporter()
                .reject(
                    ErrorCode::AccountLocked.as_str(),
                    AuthError::AccountLocked {
                        retry_after_secs: limited.retry_after_secs(),
                    },
                    event,
                )
                .await);
        }
    }

    let failure = AuditEvent::failure(AuditEventType::LoginFailure, &ctx).with_email(&email);

    let account = match auth_state.accounts().find_account_by_email(&email).await {
        Ok(account) => account,
        Err(err) => return Err(auth_state.reporter().internal(&err, failure).await),
    };

    let Some(account) = account else {
        if let Err(err) = run_password_check(request.password, None).await {
            return Err(auth_state.reporter().internal(&err, failure).await);
        }
        return Err(auth_state
            .reporter()
            .reject_code(ErrorCode::AccountNotFound, failure.with_reason("not found"))
            .await);
    };
    let failure = failure.with_user(account.id);

    match run_password_check(request.password, Some(account.password_hash.clone())).await {
        Ok(true) => {}
        Ok(false) => {
            return Err(auth_state
                .reporter()
                .reject_code(
                    ErrorCode::InvalidCredentials,
                    failure.with_reason("wrong password"),
                )
                .await);
        }
        Err(err) => return Err(auth_state.reporter().internal(&err, failure).await),
    }

    if !account.email_verified {
        return Err(auth_state
            .reporter()
            .reject_code(
                ErrorCode::EmailNotVerified,
                failure.with_reason("email not verified"),
            )
            .await);
    }

    let issued = match auth_state
        .sessions()
        .create_session(
            account.id,
            &ctx,
            extract_device(&headers),
            extract_country_code(&headers),
        )
        .await
    {
        Ok(issued) => issued,
        Err(err) => return Err(auth_state.reporter().internal(&err, failure).await),
    };

    for bucket in &buckets {
        if let Err(err) = auth_state
            .rate_limiter()
            .clear_rate_limit(bucket, &limit)
            .await
        {
            warn!("Failed to clear login rate limit: {err:#}");
        }
    }

    record_success(&auth_state, &ctx, &email, account.id, issued.session_id).await;
    info!(user_id = %account.id, session_id = %issued.session_id, "user signed in");

    Ok(Json(LoginResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        token_type: TOKEN_TYPE.to_string(),
        expires_in: issued.expires_in,
    }))
}

/// The account is always counted so rotating client addresses cannot dodge the
/// lockout. The client/account pair is counted too when the address is known.
fn login_buckets(ctx: &RequestContext, email: &str) -> Vec<String> {
    let mut buckets = vec![format!("account:{email}")];
    if let Some(ip) = ctx.ip.as_deref() {
        buckets.push(format!("ip:{ip}:{email}"));
    }
    buckets
}

/// Argon2 off the async runtime. Without a hash the dummy check runs instead.
async fn run_password_check(password: String, hash: Option<String>) -> anyhow::Result<bool> {
    tokio::task::spawn_blocking(move || match hash {
        Some(hash) => verify_password(&password, &hash),
        None => {
            verify_dummy_password(&password);
            false
        }
    })
    .await
    .context("password verification task failed")
}

async fn record_success(
    auth_state: &AuthState,
    ctx: &RequestContext,
    email: &str,
    user_id: uuid::Uuid,
    session_id: uuid::Uuid,
) {
    let event = AuditEvent::success(AuditEventType::LoginSuccess, ctx)
        .with_user(user_id)
        .with_email(email)
        .with_metadata("session_id", session_id.to_string());
    auth_state.reporter().record(event).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_buckets_always_include_account() {
        let anonymous = RequestContext::default();
        assert_eq!(
            login_buckets(&anonymous, "alice@example.com"),
            vec!["account:alice@example.com".to_string()]
        );

        let known = RequestContext {
            ip: Some("203.0.113.5".to_string()),
            user_agent: None,
        };
        assert_eq!(
            login_buckets(&known, "alice@example.com"),
            vec![
                "account:alice@example.com".to_string(),
                "ip:203.0.113.5:alice@example.com".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn dummy_check_never_succeeds() -> anyhow::Result<()> {
        assert!(!run_password_check("anything".to_string(), None).await?);
        Ok(())
    }
}
