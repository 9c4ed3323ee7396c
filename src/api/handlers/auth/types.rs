//! Request/response types for auth endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::store::SessionRecord;

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64,
}

#[derive(ToSchema, Serialize, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    #[must_use]
    pub fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CsrfTokenResponse {
    pub csrf_token: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionSummary {
    pub id: Uuid,
    pub ip: String,
    pub user_agent: String,
    pub device: Option<String>,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked: bool,
}

impl From<SessionRecord> for SessionSummary {
    fn from(session: SessionRecord) -> Self {
        Self {
            id: session.id,
            ip: session.ip,
            user_agent: session.user_agent,
            device: session.device,
            country: session.country,
            created_at: session.created_at,
            last_used_at: session.last_used_at,
            revoked: session.revoked_at.is_some(),
        }
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SuspiciousSessionsResponse {
    pub suspicious: bool,
    pub sessions: Vec<SessionSummary>,
}
