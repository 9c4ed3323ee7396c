//! Client-safe error type for the auth surface.
//!
//! Variants carry only what may reach a client: a code, the fixed message for
//! that code, and lists that are safe to echo (input and policy errors).
//! Internal detail goes to the logs through [`super::report::SecurityReporter`].

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::rate_limit::RateLimited;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidCredentials,
    AccountNotFound,
    AccountLocked,
    EmailNotVerified,
    EmailExists,
    WeakPassword,
    InvalidToken,
    RateLimited,
    Generic,
}

impl ErrorCode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AccountNotFound => "ACCOUNT_NOT_FOUND",
            Self::AccountLocked => "ACCOUNT_LOCKED",
            Self::EmailNotVerified => "EMAIL_NOT_VERIFIED",
            Self::EmailExists => "EMAIL_EXISTS",
            Self::WeakPassword => "WEAK_PASSWORD",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::Generic => "GENERIC",
        }
    }

    /// Fixed client message. Identity-sensitive codes share wording.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::InvalidCredentials | Self::AccountNotFound => "Invalid email or password",
            Self::AccountLocked => "Too many failed attempts. Please try again later.",
            Self::EmailNotVerified => "Please verify your email address before signing in.",
            Self::EmailExists => "Unable to complete registration. Please try again.",
            Self::WeakPassword => "Password does not meet security requirements.",
            Self::InvalidToken => "This link is invalid or has expired.",
            Self::RateLimited => "Too many requests. Please try again later.",
            Self::Generic => "Something went wrong. Please try again later.",
        }
    }

    /// Code as shown to clients; an unknown account is reported as bad credentials.
    #[must_use]
    pub fn client_code(self) -> Self {
        match self {
            Self::AccountNotFound => Self::InvalidCredentials,
            other => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("csrf validation failed")]
    Forbidden,
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("account locked")]
    AccountLocked { retry_after_secs: u64 },
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("email not verified")]
    EmailNotVerified,
    #[error("invalid token")]
    InvalidToken,
    #[error("weak password")]
    WeakPassword(Vec<String>),
    #[error("unauthorized")]
    Unauthorized,
    #[error("internal error")]
    Internal,
}

impl From<RateLimited> for AuthError {
    fn from(limited: RateLimited) -> Self {
        Self::RateLimited {
            retry_after_secs: limited.retry_after_secs(),
        }
    }
}

impl AuthError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_)
            | Self::InvalidCredentials
            | Self::InvalidToken
            | Self::WeakPassword(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden | Self::EmailNotVerified => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } | Self::AccountLocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Forbidden => "CSRF_INVALID",
            Self::RateLimited { .. } => ErrorCode::RateLimited.as_str(),
            Self::AccountLocked { .. } => ErrorCode::AccountLocked.as_str(),
            Self::InvalidCredentials => ErrorCode::InvalidCredentials.as_str(),
            Self::EmailNotVerified => ErrorCode::EmailNotVerified.as_str(),
            Self::InvalidToken => ErrorCode::InvalidToken.as_str(),
            Self::WeakPassword(_) => ErrorCode::WeakPassword.as_str(),
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Internal => ErrorCode::Generic.as_str(),
        }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self {
            Self::InvalidInput(detail) => detail.clone(),
            Self::Forbidden => "Invalid or missing CSRF token".to_string(),
            Self::RateLimited { .. } => ErrorCode::RateLimited.message().to_string(),
            Self::AccountLocked { .. } => ErrorCode::AccountLocked.message().to_string(),
            Self::InvalidCredentials => ErrorCode::InvalidCredentials.message().to_string(),
            Self::EmailNotVerified => ErrorCode::EmailNotVerified.message().to_string(),
            Self::InvalidToken => ErrorCode::InvalidToken.message().to_string(),
            Self::WeakPassword(_) => ErrorCode::WeakPassword.message().to_string(),
            Self::Unauthorized => "Authentication required".to_string(),
            Self::Internal => ErrorCode::Generic.message().to_string(),
        }
    }

    fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } | Self::AccountLocked { retry_after_secs } => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }

    /// Build the client error for a facade code.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::InvalidCredentials | ErrorCode::AccountNotFound => Self::InvalidCredentials,
            ErrorCode::AccountLocked => Self::AccountLocked {
                retry_after_secs: 1,
            },
            ErrorCode::EmailNotVerified => Self::EmailNotVerified,
            ErrorCode::WeakPassword => Self::WeakPassword(Vec::new()),
            ErrorCode::InvalidToken => Self::InvalidToken,
            ErrorCode::RateLimited => Self::RateLimited {
                retry_after_secs: 1,
            },
            ErrorCode::EmailExists | ErrorCode::Generic => Self::Internal,
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct ErrorBody {
    pub success: bool,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
}

impl From<&AuthError> for ErrorBody {
    fn from(error: &AuthError) -> Self {
        let errors = match error {
            AuthError::WeakPassword(errors) if !errors.is_empty() => Some(errors.clone()),
            _ => None,
        };
        Self {
            success: false,
            code: error.code().to_string(),
            message: error.message(),
            errors,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after = self.retry_after_secs();
        let mut response = (status, Json(ErrorBody::from(&self))).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
