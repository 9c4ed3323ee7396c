//! CSRF token issuance and the middleware that enforces it.

use axum::{
    Json,
    extract::{Extension, Request},
    http::{HeaderMap, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::auth::{
    AuthError, AuthState,
    audit::{AuditEvent, AuditEventType},
};

use super::types::CsrfTokenResponse;
use super::utils::{Peer, request_context};

/// Issue a fresh CSRF token, set as cookies and echoed in the body.
#[utoipa::path(
    get,
    path = "/auth/csrf",
    responses(
        (status = 200, description = "CSRF token issued", body = CsrfTokenResponse),
        (status = 500, description = "Token generation failed", body = crate::auth::error::ErrorBody)
    ),
    tag = "auth"
)]
pub async fn csrf_token(
    headers: HeaderMap,
    peer: Peer,
    auth_state: Extension<Arc<AuthState>>,
) -> Result<impl IntoResponse, AuthError> {
    let ctx = request_context(&auth_state, &headers, &peer);
    let token = match auth_state.csrf().generate_token() {
        Ok(token) => token,
        Err(err) => {
            let event = AuditEvent::failure(AuditEventType::CsrfIssueFailure, &ctx);
            return Err(auth_state.reporter().internal(&err, event).await);
        }
    };

    let mut response_headers = HeaderMap::new();
    if let Err(err) = auth_state.csrf().set_token(&mut response_headers, &token) {
        let err = anyhow::Error::new(err).context("failed to build CSRF cookie");
        let event = AuditEvent::failure(AuditEventType::CsrfIssueFailure, &ctx);
        return Err(auth_state.reporter().internal(&err, event).await);
    }

    Ok((
        response_headers,
        Json(CsrfTokenResponse { csrf_token: token }),
    ))
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Double-submit check for every state-changing request.
///
/// Public paths never require a token; they get one issued when the caller
/// has none yet so the next request can carry it.
pub async fn csrf_protect(
    auth_state: Extension<Arc<AuthState>>,
    peer: Peer,
    request: Request,
    next: Next,
) -> Response {
    if is_safe_method(request.method()) {
        return next.run(request).await;
    }

    let guard = auth_state.csrf();
    if guard.is_public(request.uri().path()) {
        let needs_token = !guard.has_token(request.headers());
        let mut response = next.run(request).await;
        if needs_token {
            match guard.generate_token() {
                Ok(token) => {
                    if let Err(err) = guard.set_token(response.headers_mut(), &token) {
                        warn!("Failed to attach CSRF cookie: {err}");
                    }
                }
                Err(err) => warn!("Failed to generate CSRF token: {err:#}"),
            }
        }
        return response;
    }

    match guard.validate(request.headers()) {
        Ok(()) => next.run(request).await,
        Err(error) => {
            let ctx = request_context(&auth_state, request.headers(), &peer);
            debug!(path = request.uri().path(), "CSRF check failed");
            let event = AuditEvent::failure(AuditEventType::CsrfRejected, &ctx)
                .with_reason(request.uri().path().to_string());
            auth_state
                .reporter()
                .reject(error.code(), error, event)
                .await
                .into_response()
        }
    }
}
