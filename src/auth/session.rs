//! Refresh/access token sessions.
//!
//! Flow Overview:
//! 1) Login creates a session row holding the SHA-256 of a random refresh token
//!    and the client IP and user agent seen at creation.
//! 2) The raw refresh token and a short-lived HS256 access token are returned once.
//! 3) Refresh re-checks expiry, revocation, and the client binding; any mismatch
//!    revokes the session.
//! 4) Access tokens are verified statelessly from their signature and expiry.
//!
//! Refresh tokens are not rotated on use.

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::debug;
use uuid::Uuid;

use super::crypto::{generate_token, hash_token};
use super::report::RequestContext;
use super::store::{NewSession, SessionRecord, SessionStore};

pub const TOKEN_TYPE: &str = "Bearer";

/// Sessions inspected by the suspicious-activity heuristic.
const SUSPICIOUS_WINDOW: usize = 3;
const SUSPICIOUS_DISTINCT_THRESHOLD: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl AccessClaims {
    /// # Errors
    /// Returns an error if `sub` is not a UUID.
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).context("access token subject is not a uuid")
    }
}

/// Tokens handed to the client once, at login.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub access_token: String,
    pub expires_in: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("session not found")]
    NotFound,
    #[error("session expired")]
    Expired { user_id: Uuid },
    #[error("session revoked")]
    Revoked { user_id: Uuid },
    #[error("session used from a different client")]
    BindingMismatch { user_id: Uuid },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl RefreshError {
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Expired { .. } => "expired",
            Self::Revoked { .. } => "revoked",
            Self::BindingMismatch { .. } => "client mismatch",
            Self::Store(_) => "internal error",
        }
    }

    #[must_use]
    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Self::Expired { user_id }
            | Self::Revoked { user_id }
            | Self::BindingMismatch { user_id } => Some(*user_id),
            Self::NotFound | Self::Store(_) => None,
        }
    }
}

pub struct SessionService {
    sessions: Arc<dyn SessionStore>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: TimeDelta,
    refresh_ttl: TimeDelta,
}

impl std::fmt::Debug for SessionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionService")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}

impl SessionService {
    /// # Errors
    /// Returns an error if a lifetime does not fit in a timestamp offset.
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        jwt_secret: &SecretString,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self> {
        let secret = jwt_secret.expose_secret().as_bytes();
        Ok(Self {
            sessions,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            access_ttl: TimeDelta::from_std(access_ttl).context("access token ttl out of range")?,
            refresh_ttl: TimeDelta::from_std(refresh_ttl)
                .context("refresh token ttl out of range")?,
        })
    }

    #[must_use]
    pub fn access_ttl_seconds(&self) -> u64 {
        u64::try_from(self.access_ttl.num_seconds()).unwrap_or(0)
    }

    /// Start a session bound to the caller's IP and user agent.
    ///
    /// # Errors
    /// Returns an error if token generation, signing, or the store fails.
    pub async fn create_session(
        &self,
        user_id: Uuid,
        ctx: &RequestContext,
        device: Option<String>,
        country: Option<String>,
    ) -> Result<IssuedSession> {
        let now = Utc::now();
        let refresh_token = generate_token()?;
        let refresh_expires_at = now + self.refresh_ttl;
        let session_id = self
            .sessions
            .insert_session(NewSession {
                user_id,
                refresh_token_hash: hash_token(&refresh_token),
                ip: ctx.ip_or_unknown().to_string(),
                user_agent: ctx.user_agent_or_empty().to_string(),
                device,
                country,
                created_at: now,
                expires_at: refresh_expires_at,
            })
            .await?;
        let access_token = self.issue_access_token(user_id, session_id, now)?;
        Ok(IssuedSession {
            session_id,
            access_token,
            refresh_token,
            expires_in: self.access_ttl_seconds(),
            refresh_expires_at,
        })
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// # Errors
    /// Returns a `RefreshError` naming why the session cannot be used.
    pub async fn refresh_access_token(
        &self,
        refresh_token: &str,
        ctx: &RequestContext,
    ) -> Result<IssuedAccessToken, RefreshError> {
        let now = Utc::now();
        let token_hash = hash_token(refresh_token);
        let session = self
            .sessions
            .find_session_by_hash(&token_hash)
            .await?
            .ok_or(RefreshError::NotFound)?;
        let user_id = session.user_id;

        if session.revoked_at.is_some() {
            return Err(RefreshError::Revoked { user_id });
        }
        if now >= session.expires_at {
            self.sessions.revoke_session(session.id, now).await?;
            return Err(RefreshError::Expired { user_id });
        }
        if session.ip != ctx.ip_or_unknown() || session.user_agent != ctx.user_agent_or_empty() {
            debug!(session_id = %session.id, "refresh token presented from a different client");
            self.sessions.revoke_session(session.id, now).await?;
            return Err(RefreshError::BindingMismatch { user_id });
        }

        self.sessions.touch_session(session.id, now).await?;
        let access_token = self.issue_access_token(user_id, session.id, now)?;
        Ok(IssuedAccessToken {
            access_token,
            expires_in: self.access_ttl_seconds(),
        })
    }

    /// Revoke one session. Returns `false` when it was already revoked or unknown.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke_session(&self, session_id: Uuid) -> Result<bool> {
        self.sessions.revoke_session(session_id, Utc::now()).await
    }

    /// Revoke the session owning `refresh_token`, returning its user when one was found.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke_refresh_token(&self, refresh_token: &str) -> Result<Option<Uuid>> {
        let token_hash = hash_token(refresh_token);
        let Some(session) = self.sessions.find_session_by_hash(&token_hash).await? else {
            return Ok(None);
        };
        self.revoke_session(session.id).await?;
        Ok(Some(session.user_id))
    }

    /// # Errors
    /// Returns an error if the store fails.
    pub async fn revoke_all_sessions(&self, user_id: Uuid) -> Result<u64> {
        self.sessions.revoke_all_sessions(user_id, Utc::now()).await
    }

    /// Flag the most recent sessions when they span too many networks or countries.
    ///
    /// Advisory only; nothing is revoked.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn get_suspicious_sessions(&self, user_id: Uuid) -> Result<Vec<SessionRecord>> {
        let recent = self
            .sessions
            .recent_sessions(user_id, SUSPICIOUS_WINDOW)
            .await?;
        let distinct_ips: HashSet<&str> = recent.iter().map(|s| s.ip.as_str()).collect();
        let distinct_countries: HashSet<&str> =
            recent.iter().filter_map(|s| s.country.as_deref()).collect();
        if distinct_ips.len() > SUSPICIOUS_DISTINCT_THRESHOLD
            || distinct_countries.len() > SUSPICIOUS_DISTINCT_THRESHOLD
        {
            Ok(recent)
        } else {
            Ok(Vec::new())
        }
    }

    /// Check signature and expiry of an access token.
    ///
    /// # Errors
    /// Returns an error if the token is malformed, forged, or expired.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<AccessClaims>(token, &self.decoding_key, &validation)
            .context("invalid access token")?;
        Ok(data.claims)
    }

    fn issue_access_token(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let claims = AccessClaims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to sign access token")
    }
}
