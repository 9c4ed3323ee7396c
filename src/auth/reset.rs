//! Password-reset tokens.
//!
//! Flow Overview:
//! 1) `request_reset` looks up the account. Either way the call takes at least
//!    the configured floor so response timing does not reveal whether the
//!    email is registered.
//! 2) For a known account a 256-bit token is issued; only its SHA-256 digest is
//!    stored, with a fixed expiry. The raw token leaves only in the email link.
//! 3) `consume_reset` checks existence, expiry, prior use, and the password
//!    policy, in that order, then atomically marks the token used, stores the
//!    new password hash, and burns every other unused token of the account.

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, sleep};
use tracing::info;

use super::audit::{AuditEvent, AuditEventType};
use super::crypto::{generate_token, hash_password, hash_token};
use super::email::{self, EmailDispatchConfig, EmailMessage, EmailSender, build_reset_url};
use super::error::{AuthError, ErrorCode};
use super::password::validate_password_strength;
use super::report::{RequestContext, SecurityReporter};
use super::store::{Account, AccountStore, ConsumeOutcome, NewResetToken, ResetTokenStore};

pub struct ResetService {
    accounts: Arc<dyn AccountStore>,
    tokens: Arc<dyn ResetTokenStore>,
    reporter: SecurityReporter,
    email_sender: Arc<dyn EmailSender>,
    email_dispatch: EmailDispatchConfig,
    frontend_base_url: String,
    token_ttl: TimeDelta,
    response_floor: Duration,
}

impl std::fmt::Debug for ResetService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetService")
            .field("token_ttl", &self.token_ttl)
            .field("response_floor", &self.response_floor)
            .finish_non_exhaustive()
    }
}

pub struct ResetServiceParts {
    pub accounts: Arc<dyn AccountStore>,
    pub tokens: Arc<dyn ResetTokenStore>,
    pub reporter: SecurityReporter,
    pub email_sender: Arc<dyn EmailSender>,
    pub email_dispatch: EmailDispatchConfig,
    pub frontend_base_url: String,
    pub token_ttl: Duration,
    pub response_floor: Duration,
}

impl ResetService {
    /// # Errors
    /// Returns an error if the token lifetime does not fit in a timestamp offset.
    pub fn new(parts: ResetServiceParts) -> Result<Self> {
        Ok(Self {
            accounts: parts.accounts,
            tokens: parts.tokens,
            reporter: parts.reporter,
            email_sender: parts.email_sender,
            email_dispatch: parts.email_dispatch,
            frontend_base_url: parts.frontend_base_url,
            token_ttl: TimeDelta::from_std(parts.token_ttl)
                .context("reset token ttl out of range")?,
            response_floor: parts.response_floor,
        })
    }

    /// Start a reset for `email` (already normalized).
    ///
    /// Unknown accounts get the same `Ok(())` after the same minimum delay.
    ///
    /// # Errors
    /// Returns `AuthError::Internal` only when the datastore fails.
    pub async fn request_reset(&self, email: &str, ctx: &RequestContext) -> Result<(), AuthError> {
        let started = Instant::now();
        let result = self.request_reset_inner(email, ctx).await;
        let elapsed = started.elapsed();
        if elapsed < self.response_floor {
            sleep(self.response_floor - elapsed).await;
        }
        result
    }

    async fn request_reset_inner(&self, email: &str, ctx: &RequestContext) -> Result<(), AuthError> {
        let event = AuditEvent::success(AuditEventType::PasswordResetRequested, ctx).with_email(email);

        let account = match self.accounts.find_account_by_email(email).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.reporter
                    .record(
                        AuditEvent::failure(AuditEventType::PasswordResetRequested, ctx)
                            .with_email(email)
                            .with_reason("not found"),
                    )
                    .await;
                return Ok(());
            }
            Err(err) => return Err(self.reporter.internal(&err, event).await),
        };

        let token = match self.issue_token(&account).await {
            Ok(token) => token,
            Err(err) => {
                return Err(self
                    .reporter
                    .internal(&err, event.with_user(account.id))
                    .await);
            }
        };

        self.reporter.record(event.with_user(account.id)).await;

        let reset_url = build_reset_url(&self.frontend_base_url, &token);
        let message =
            EmailMessage::password_reset(&account.email, &reset_url, self.token_ttl.num_minutes());
        email::dispatch(self.email_sender.clone(), message, self.email_dispatch);
        Ok(())
    }

    /// Create and persist a reset token for `account`, returning the raw value.
    ///
    /// # Errors
    /// Returns an error if token generation or the store fails.
    pub async fn issue_token(&self, account: &Account) -> Result<String> {
        let token = generate_token()?;
        let now = Utc::now();
        self.tokens
            .insert_reset_token(NewResetToken {
                user_id: account.id,
                token_hash: hash_token(&token),
                created_at: now,
                expires_at: now + self.token_ttl,
            })
            .await?;
        Ok(token)
    }

    /// Set a new password using a reset token.
    ///
    /// # Errors
    /// `InvalidToken` for unknown, expired, or used tokens; `WeakPassword` with
    /// the policy errors; `Internal` when the datastore or hashing fails.
    pub async fn consume_reset(
        &self,
        token: &str,
        new_password: &str,
        ctx: &RequestContext,
    ) -> Result<(), AuthError> {
        let failure = AuditEvent::failure(AuditEventType::PasswordResetFailure, ctx);

        let record = match self.tokens.find_reset_token(&hash_token(token)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                return Err(self
                    .reporter
                    .reject_code(ErrorCode::InvalidToken, failure.with_reason("not found"))
                    .await);
            }
            Err(err) => return Err(self.reporter.internal(&err, failure).await),
        };
        let failure = failure.with_user(record.user_id).with_email(&record.email);

        if Utc::now() >= record.expires_at {
            return Err(self
                .reporter
                .reject_code(ErrorCode::InvalidToken, failure.with_reason("expired"))
                .await);
        }
        if record.used_at.is_some() {
            return Err(self.reject_reused(failure).await);
        }

        let validation = validate_password_strength(new_password, Some(&record.email));
        if !validation.valid {
            return Err(self
                .reporter
                .reject(
                    ErrorCode::WeakPassword.as_str(),
                    AuthError::WeakPassword(validation.errors),
                    failure.with_reason("weak password"),
                )
                .await);
        }

        let password = new_password.to_string();
        let password_hash = match tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .context("password hashing task failed")
            .and_then(|hashed| hashed)
        {
            Ok(hash) => hash,
            Err(err) => return Err(self.reporter.internal(&err, failure).await),
        };

        let outcome = self
            .tokens
            .consume_reset_token(record.id, record.user_id, &password_hash, Utc::now())
            .await;
        match outcome {
            Ok(ConsumeOutcome::Consumed { invalidated }) => {
                info!(user_id = %record.user_id, invalidated, "password reset completed");
                self.reporter
                    .record(
                        AuditEvent::success(AuditEventType::PasswordResetSuccess, ctx)
                            .with_user(record.user_id)
                            .with_email(&record.email)
                            .with_metadata("invalidated_tokens", invalidated),
                    )
                    .await;
                Ok(())
            }
            Ok(ConsumeOutcome::AlreadyUsed) => Err(self.reject_reused(failure).await),
            Err(err) => Err(self.reporter.internal(&err, failure).await),
        }
    }

    async fn reject_reused(&self, failure: AuditEvent) -> AuthError {
        self.reporter
            .reject_code(
                ErrorCode::InvalidToken,
                failure
                    .with_reason("already used")
                    .with_metadata("suspicious_activity", true),
            )
            .await
    }
}
