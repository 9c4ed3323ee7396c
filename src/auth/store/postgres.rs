//! Postgres-backed store (schema in `sql/schema.sql`).

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{Instrument, Span, info_span, warn};
use uuid::Uuid;

use crate::auth::audit::{AuditEvent, AuditSink};

use super::{
    Account, AccountStore, ConsumeOutcome, NewResetToken, NewSession, ResetTokenRecord,
    ResetTokenStore, SessionRecord, SessionStore, StoreFuture,
};

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn db_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn account_from_row(row: &PgRow) -> Account {
    Account {
        id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        email_verified: row
            .get::<Option<DateTime<Utc>>, _>("email_verified_at")
            .is_some(),
    }
}

fn session_from_row(row: &PgRow) -> SessionRecord {
    SessionRecord {
        id: row.get("id"),
        user_id: row.get("user_id"),
        refresh_token_hash: row.get("refresh_token_hash"),
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        device: row.get("device"),
        country: row.get("country"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        last_used_at: row.get("last_used_at"),
        revoked_at: row.get("revoked_at"),
    }
}

impl AccountStore for PgStore {
    fn find_account_by_email<'a>(&'a self, email: &'a str) -> StoreFuture<'a, Option<Account>> {
        Box::pin(async move {
            let query = r"
                SELECT id, email, password_hash, email_verified_at
                FROM users
                WHERE email = $1
                LIMIT 1
            ";
            let row = sqlx::query(query)
                .bind(email)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .context("failed to lookup account by email")?;
            Ok(row.as_ref().map(account_from_row))
        })
    }

    fn find_account_by_id(&self, user_id: Uuid) -> StoreFuture<'_, Option<Account>> {
        Box::pin(async move {
            let query = r"
                SELECT id, email, password_hash, email_verified_at
                FROM users
                WHERE id = $1
            ";
            let row = sqlx::query(query)
                .bind(user_id)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .context("failed to lookup account by id")?;
            Ok(row.as_ref().map(account_from_row))
        })
    }
}

impl ResetTokenStore for PgStore {
    fn insert_reset_token(&self, token: NewResetToken) -> StoreFuture<'_, Uuid> {
        Box::pin(async move {
            let query = r"
                INSERT INTO password_reset_tokens
                    (user_id, token_hash, created_at, expires_at)
                VALUES ($1, $2, $3, $4)
                RETURNING id
            ";
            let row = sqlx::query(query)
                .bind(token.user_id)
                .bind(token.token_hash)
                .bind(token.created_at)
                .bind(token.expires_at)
                .fetch_one(&self.pool)
                .instrument(db_span("INSERT", query))
                .await
                .context("failed to insert password reset token")?;
            Ok(row.get("id"))
        })
    }

    fn find_reset_token<'a>(
        &'a self,
        token_hash: &'a [u8],
    ) -> StoreFuture<'a, Option<ResetTokenRecord>> {
        Box::pin(async move {
            let query = r"
                SELECT t.id, t.user_id, u.email, t.created_at, t.expires_at, t.used_at
                FROM password_reset_tokens t
                JOIN users u ON u.id = t.user_id
                WHERE t.token_hash = $1
                LIMIT 1
            ";
            let row = sqlx::query(query)
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .context("failed to lookup password reset token")?;
            Ok(row.map(|row| ResetTokenRecord {
                id: row.get("id"),
                user_id: row.get("user_id"),
                email: row.get("email"),
                created_at: row.get("created_at"),
                expires_at: row.get("expires_at"),
                used_at: row.get("used_at"),
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
            let mut tx = self
                .pool
                .begin()
                .await
                .context("begin reset consume transaction")?;

            // The row lock taken here serializes concurrent submits of the same token.
            let query = r"
                UPDATE password_reset_tokens
                SET used_at = $2
                WHERE id = $1
                  AND used_at IS NULL
                RETURNING id
            ";
            let claimed = sqlx::query(query)
                .bind(token_id)
                .bind(now)
                .fetch_optional(&mut *tx)
                .instrument(db_span("UPDATE", query))
                .await
                .context("failed to mark reset token used")?;

            if claimed.is_none() {
                if let Err(err) = tx.rollback().await {
                    warn!("failed to roll back reset token claim: {err}");
                }
                return Ok(ConsumeOutcome::AlreadyUsed);
            }

            let query = r"
                UPDATE users
                SET password_hash = $2,
                    updated_at = $3
                WHERE id = $1
            ";
            sqlx::query(query)
                .bind(user_id)
                .bind(password_hash)
                .bind(now)
                .execute(&mut *tx)
                .instrument(db_span("UPDATE", query))
                .await
                .context("failed to update password hash")?;

            let query = r"
                UPDATE password_reset_tokens
                SET used_at = $2
                WHERE user_id = $1
                  AND used_at IS NULL
            ";
            let invalidated = sqlx::query(query)
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .instrument(db_span("UPDATE", query))
                .await
                .context("failed to invalidate sibling reset tokens")?
                .rows_affected();

            tx.commit()
                .await
                .context("commit reset consume transaction")?;

            Ok(ConsumeOutcome::Consumed { invalidated })
        })
    }
}

impl SessionStore for PgStore {
    fn insert_session(&self, session: NewSession) -> StoreFuture<'_, Uuid> {
        Box::pin(async move {
            let query = r"
                INSERT INTO user_sessions
                    (user_id, refresh_token_hash, ip, user_agent, device, country,
                     created_at, expires_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
            ";
            let row = sqlx::query(query)
                .bind(session.user_id)
                .bind(session.refresh_token_hash)
                .bind(session.ip)
                .bind(session.user_agent)
                .bind(session.device)
                .bind(session.country)
                .bind(session.created_at)
                .bind(session.expires_at)
                .fetch_one(&self.pool)
                .instrument(db_span("INSERT", query))
                .await
                .context("failed to insert session")?;
            Ok(row.get("id"))
        })
    }

    fn find_session_by_hash<'a>(
        &'a self,
        refresh_token_hash: &'a [u8],
    ) -> StoreFuture<'a, Option<SessionRecord>> {
        Box::pin(async move {
            let query = r"
                SELECT id, user_id, refresh_token_hash, ip, user_agent, device, country,
                       created_at, expires_at, last_used_at, revoked_at
                FROM user_sessions
                WHERE refresh_token_hash = $1
                LIMIT 1
            ";
            let row = sqlx::query(query)
                .bind(refresh_token_hash)
                .fetch_optional(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .context("failed to lookup session")?;
            Ok(row.as_ref().map(session_from_row))
        })
    }

    fn touch_session(&self, session_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let query = "UPDATE user_sessions SET last_used_at = $2 WHERE id = $1";
            sqlx::query(query)
                .bind(session_id)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await
                .context("failed to update session last_used_at")?;
            Ok(())
        })
    }

    fn revoke_session(&self, session_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let query = r"
                UPDATE user_sessions
                SET revoked_at = $2
                WHERE id = $1
                  AND revoked_at IS NULL
            ";
            let result = sqlx::query(query)
                .bind(session_id)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await
                .context("failed to revoke session")?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn revoke_all_sessions(&self, user_id: Uuid, now: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let query = r"
                UPDATE user_sessions
                SET revoked_at = $2
                WHERE user_id = $1
                  AND revoked_at IS NULL
            ";
            let result = sqlx::query(query)
                .bind(user_id)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span("UPDATE", query))
                .await
                .context("failed to revoke user sessions")?;
            Ok(result.rows_affected())
        })
    }

    fn recent_sessions(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> StoreFuture<'_, Vec<SessionRecord>> {
        Box::pin(async move {
            let query = r"
                SELECT id, user_id, refresh_token_hash, ip, user_agent, device, country,
                       created_at, expires_at, last_used_at, revoked_at
                FROM user_sessions
                WHERE user_id = $1
                ORDER BY created_at DESC
                LIMIT $2
            ";
            let rows = sqlx::query(query)
                .bind(user_id)
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch_all(&self.pool)
                .instrument(db_span("SELECT", query))
                .await
                .context("failed to list recent sessions")?;
            Ok(rows.iter().map(session_from_row).collect())
        })
    }
}

impl AuditSink for PgStore {
    fn record(&self, event: AuditEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let query = r"
                INSERT INTO audit_events
                    (event_type, user_id, email, ip, user_agent, success, reason, metadata,
                     created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ";
            sqlx::query(query)
                .bind(event.event_type.as_str())
                .bind(event.user_id)
                .bind(event.email)
                .bind(event.ip)
                .bind(event.user_agent)
                .bind(event.success)
                .bind(event.reason)
                .bind(sqlx::types::Json(serde_json::Value::Object(event.metadata)))
                .bind(event.created_at)
                .execute(&self.pool)
                .instrument(db_span("INSERT", query))
                .await
                .context("failed to insert audit event")?;
            Ok(())
        })
    }
}
