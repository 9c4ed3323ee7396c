//! In-process datastore for tests and single-node development.
//!
//! A single mutex guards all tables, which makes the reset-token consume step
//! trivially atomic.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Account, AccountStore, ConsumeOutcome, NewResetToken, NewSession, ResetTokenRecord,
    ResetTokenStore, SessionRecord, SessionStore, StoreFuture,
};

#[derive(Debug, Clone)]
struct StoredResetToken {
    id: Uuid,
    user_id: Uuid,
    token_hash: Vec<u8>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Tables {
    accounts: HashMap<Uuid, Account>,
    reset_tokens: Vec<StoredResetToken>,
    sessions: HashMap<Uuid, SessionRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account; the email is stored lowercased.
    pub async fn insert_account(
        &self,
        email: &str,
        password_hash: String,
        email_verified: bool,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let mut tables = self.tables.lock().await;
        tables.accounts.insert(
            id,
            Account {
                id,
                email: email.trim().to_lowercase(),
                password_hash,
                email_verified,
            },
        );
        id
    }

    pub async fn password_hash(&self, user_id: Uuid) -> Option<String> {
        let tables = self.tables.lock().await;
        tables
            .accounts
            .get(&user_id)
            .map(|account| account.password_hash.clone())
    }

    /// Number of tokens for `user_id` that are still unused.
    pub async fn unused_reset_tokens(&self, user_id: Uuid) -> usize {
        let tables = self.tables.lock().await;
        tables
            .reset_tokens
            .iter()
            .filter(|token| token.user_id == user_id && token.used_at.is_none())
            .count()
    }

    pub async fn session(&self, session_id: Uuid) -> Option<SessionRecord> {
        let tables = self.tables.lock().await;
        tables.sessions.get(&session_id).cloned()
    }
}

impl AccountStore for MemoryStore {
    fn find_account_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<Account>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            Ok(tables
                .accounts
                .values()
                .find(|account| account.email == email)
                .cloned())
        })
    }

    fn find_account_by_id(&self, user_id: Uuid) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            Ok(tables.accounts.get(&user_id).cloned())
        })
    }
}

impl ResetTokenStore for MemoryStore {
    fn insert_reset_token(&self, token: NewResetToken) -> StoreFuture<'_, Uuid> {
        Box::pin(async move {
            let id = Uuid::new_v4();
            let mut tables = self.tables.lock().await;
            tables.reset_tokens.push(StoredResetToken {
                id,
                user_id: token.user_id,
                token_hash: token.token_hash,
                created_at: token.created_at,
                expires_at: token.expires_at,
                used_at: None,
            });
            Ok(id)
        })
    }

    fn find_reset_token<'a>(
        &'a self,
        token_hash: &'a [u8],
    ) -> StoreFuture<'a, Option<ResetTokenRecord>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let Some(token) = tables
                .reset_tokens
                .iter()
                .find(|token| token.token_hash == token_hash)
            else {
                return Ok(None);
            };
            let email = tables
                .accounts
                .get(&token.user_id)
                .map(|account| account.email.clone())
                .unwrap_or_default();
            Ok(Some(ResetTokenRecord {
                id: token.id,
                user_id: token.user_id,
                email,
                created_at: token.created_at,
                expires_at: token.expires_at,
                used_at: token.used_at,
            }))
        })
    }

    fn consume_reset_token<'a>(
        &'a self,
        token_id: Uuid,
        user_id: Uuid,
        password_hash: &'a str,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, ConsumeOutcome> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;

            let Some(token) = tables
                .reset_tokens
                .iter_mut()
                .find(|token| token.id == token_id && token.used_at.is_none())
            else {
                return Ok(ConsumeOutcome::AlreadyUsed);
            };
            token.used_at = Some(now);

            if let Some(account) = tables.accounts.get_mut(&user_id) {
                account.password_hash = password_hash.to_string();
            }

            let mut invalidated = 0;
            for sibling in tables
                .reset_tokens
                .iter_mut()
                .filter(|token| token.user_id == user_id && token.used_at.is_none())
            {
                sibling.used_at = Some(now);
                invalidated += 1;
            }

            Ok(ConsumeOutcome::Consumed { invalidated })
        })
    }
}

impl SessionStore for MemoryStore {
    fn insert_session(&self, session: NewSession) -> StoreFuture<'_, Uuid> {
        Box::pin(async move {
            let id = Uuid::new_v4();
            let mut tables = self.tables.lock().await;
            tables.sessions.insert(
                id,
                SessionRecord {
                    id,
                    user_id: session.user_id,
                    refresh_token_hash: session.refresh_token_hash,
                    ip: session.ip,
                    user_agent: session.user_agent,
                    device: session.device,
                    country: session.country,
                    created_at: session.created_at,
                    expires_at: session.expires_at,
                    last_used_at: None,
                    revoked_at: None,
                },
            );
            Ok(id)
        })
    }

    fn find_session_by_hash<'a>(
        &'a self,
        refresh_token_hash: &'a [u8],
    ) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            Ok(tables
                .sessions
                .values()
                .find(|session| session.refresh_token_hash == refresh_token_hash)
                .cloned())
        })
    }

    fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            if let Some(session) = tables.sessions.get_mut(&session_id) {
                session.last_used_at = Some(now);
            }
            Ok(())
        })
    }

    fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            match tables.sessions.get_mut(&session_id) {
                Some(session) if session.revoked_at.is_none() => {
                    session.revoked_at = Some(now);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn revoke_all_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut tables = self.tables.lock().await;
            let mut revoked = 0;
            for session in tables
                .sessions
                .values_mut()
                .filter(|session| session.user_id == user_id && session.revoked_at.is_none())
            {
                session.revoked_at = Some(now);
                revoked += 1;
            }
            Ok(revoked)
        })
    }

    fn recent_sessions(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreFuture<'_, Vec<SessionRecord>> {
        Box::pin(async move {
            let tables = self.tables.lock().await;
            let mut sessions: Vec<SessionRecord> = tables
                .sessions
                .values()
                .filter(|session| session.user_id == user_id)
                .cloned()
                .collect();
            sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            sessions.truncate(limit);
            Ok(sessions)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use chrono::Duration;

    fn new_token(user_id: Uuid, hash: &[u8]) -> NewResetToken {
        let now = Utc::now();
        NewResetToken {
            user_id,
            token_hash: hash.to_vec(),
            created_at: now,
            expires_at: now + Duration::minutes(15),
        }
    }

    #[tokio::test]
    async fn consume_marks_siblings_used() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = store
            .insert_account("alice@example.com", "old".to_string(), true)
            .await;
        let first = store.insert_reset_token(new_token(user_id, b"one")).await?;
        store.insert_reset_token(new_token(user_id, b"two")).await?;
        assert_eq!(store.unused_reset_tokens(user_id).await, 2);

        let outcome = store
            .consume_reset_token(first, user_id, "new", Utc::now())
            .await?;
        assert_eq!(outcome, ConsumeOutcome::Consumed { invalidated: 1 });
        assert_eq!(store.unused_reset_tokens(user_id).await, 0);
        assert_eq!(store.password_hash(user_id).await.as_deref(), Some("new"));
        Ok(())
    }

    #[tokio::test]
    async fn consume_twice_second_loses() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = store
            .insert_account("bob@example.com", "old".to_string(), true)
            .await;
        let token_id = store.insert_reset_token(new_token(user_id, b"x")).await?;

        let first = store
            .consume_reset_token(token_id, user_id, "first", Utc::now())
            .await?;
        let second = store
            .consume_reset_token(token_id, user_id, "second", Utc::now())
            .await?;
        assert!(matches!(first, ConsumeOutcome::Consumed { .. }));
        assert_eq!(second, ConsumeOutcome::AlreadyUsed);
        assert_eq!(store.password_hash(user_id).await.as_deref(), Some("first"));
        Ok(())
    }

    #[tokio::test]
    async fn recent_sessions_newest_first() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let base = Utc::now();
        for (offset, ip) in [(0, "10.0.0.1"), (1, "10.0.0.2"), (2, "10.0.0.3")] {
            store
                .insert_session(NewSession {
                    user_id,
                    refresh_token_hash: ip.as_bytes().to_vec(),
                    ip: ip.to_string(),
                    user_agent: "ua".to_string(),
                    device: None,
                    country: None,
                    created_at: base + Duration::seconds(offset),
                    expires_at: base + Duration::days(7),
                })
                .await?;
        }
        let recent = store.recent_sessions(user_id, 2).await?;
        let ips: Vec<&str> = recent.iter().map(|session| session.ip.as_str()).collect();
        assert_eq!(ips, vec!["10.0.0.3", "10.0.0.2"]);
        Ok(())
    }
}
