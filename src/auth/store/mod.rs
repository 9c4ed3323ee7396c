//! Datastore collaborators: accounts, password-reset tokens, and sessions.
//!
//! The schema itself belongs to the application that embeds this service;
//! these traits are the only surface the auth flows rely on. `PgStore` is the
//! production implementation and `MemoryStore` backs tests and single-node
//! development runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::{future::Future, pin::Pin};
use uuid::Uuid;

/// Boxed future returned by every store operation so the traits stay object safe.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

#[derive(Debug, Clone)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub email_verified: bool,
}

#[derive(Debug, Clone)]
pub struct NewResetToken {
    pub user_id: Uuid,
    pub token_hash: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A persisted reset token joined with the owning account's email.
#[derive(Debug, Clone)]
pub struct ResetTokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

/// Result of the atomic consume step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// This caller won; `invalidated` sibling tokens were also marked used.
    Consumed { invalidated: u64 },
    /// Another caller set `used_at` first.
    AlreadyUsed,
}

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub refresh_token_hash: Vec<u8>,
    pub ip: String,
    pub user_agent: String,
    pub device: Option<String>,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub refresh_token_hash: Vec<u8>,
    pub ip: String,
    pub user_agent: String,
    pub device: Option<String>,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
}

pub trait AccountStore: Send + Sync {
    fn find_account_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<Account>>;

    fn find_account_by_id(&self, user_id: Uuid) -> StoreFuture<'_, Option<Account>>;
}

pub trait ResetTokenStore: Send + Sync {
    fn insert_reset_token(&self, token: NewResetToken) -> StoreFuture<'_, Uuid>;

    fn find_reset_token<'a>(
        &'a self,
        token_hash: &'a [u8],
    ) -> StoreFuture<'a, Option<ResetTokenRecord>>;

    /// Mark `token_id` used, store the new password hash, and mark every other
    /// unused token of `user_id` used, as one atomic unit.
    ///
    /// Only the first caller for a given token gets `Consumed`; the password
    /// is left untouched for everyone else.
    fn consume_reset_token<'a>(
        &'a self,
        token_id: Uuid,
        user_id: Uuid,
        password_hash: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ConsumeOutcome>;
}

pub trait SessionStore: Send + Sync {
    fn insert_session(&self, session: NewSession) -> StoreFuture<'_, Uuid>;

    fn find_session_by_hash<'a>(
        &'a self,
        refresh_token_hash: &'a [u8],
    ) -> StoreFuture<'a, Option<SessionRecord>>;

    fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, ()>;

    /// Returns `true` when this call revoked the session.
    fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// Returns the number of sessions this call revoked.
    fn revoke_all_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Most recent sessions first, revoked ones included.
    fn recent_sessions(&self, user_id: Uuid, limit: usize)
    -> StoreFuture<'_, Vec<SessionRecord>>;
}
