//! Append-only security audit events and the sinks that receive them.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use super::report::{RequestContext, mask_email};
use super::store::StoreFuture;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    LoginSuccess,
    LoginFailure,
    AccountLocked,
    PasswordResetRequested,
    PasswordResetSuccess,
    PasswordResetFailure,
    RateLimited,
    CsrfRejected,
    CsrfIssueFailure,
    SessionRefreshed,
    SessionRefreshFailure,
    SessionRevoked,
    AllSessionsRevoked,
}

impl AuditEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoginSuccess => "login_success",
            Self::LoginFailure => "login_failure",
            Self::AccountLocked => "account_locked",
            Self::PasswordResetRequested => "password_reset_requested",
            Self::PasswordResetSuccess => "password_reset_success",
            Self::PasswordResetFailure => "password_reset_failure",
            Self::RateLimited => "rate_limited",
            Self::CsrfRejected => "csrf_rejected",
            Self::CsrfIssueFailure => "csrf_issue_failure",
            Self::SessionRefreshed => "session_refreshed",
            Self::SessionRefreshFailure => "session_refresh_failure",
            Self::SessionRevoked => "session_revoked",
            Self::AllSessionsRevoked => "all_sessions_revoked",
        }
    }
}

/// One audit record. `email` is always stored masked.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub user_id: Option<Uuid>,
    pub email: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub reason: Option<String>,
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(event_type: AuditEventType, success: bool, ctx: &RequestContext) -> Self {
        Self {
            event_type,
            user_id: None,
            email: None,
            ip: ctx.ip.clone(),
            user_agent: ctx.user_agent.clone(),
            success,
            reason: None,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn success(event_type: AuditEventType, ctx: &RequestContext) -> Self {
        Self::new(event_type, true, ctx)
    }

    #[must_use]
    pub fn failure(event_type: AuditEventType, ctx: &RequestContext) -> Self {
        Self::new(event_type, false, ctx)
    }

    #[must_use]
    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(mask_email(email));
        self
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn is_suspicious(&self) -> bool {
        self.metadata
            .get("suspicious_activity")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent) -> StoreFuture<'_, ()>;
}

/// Emits events on the `audit` tracing target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let metadata = Value::Object(event.metadata.clone());
            info!(
                target: "audit",
                event_type = event.event_type.as_str(),
                success = event.success,
                user_id = ?event.user_id,
                email = event.email.as_deref().unwrap_or("-"),
                ip = event.ip.as_deref().unwrap_or("-"),
                user_agent = event.user_agent.as_deref().unwrap_or("-"),
                reason = event.reason.as_deref().unwrap_or("-"),
                metadata = %metadata,
                "audit event"
            );
            Ok(())
        })
    }
}

/// Collects events in memory; used by tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }

    pub async fn events_of(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .lock()
            .await
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.events.lock().await.push(event);
            Ok(())
        })
    }
}

/// Delivers each event to every inner sink; one failing sink does not stop the rest.
#[derive(Clone, Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn record(&self, event: AuditEvent) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut first_error: Option<anyhow::Error> = None;
            for sink in &self.sinks {
                if let Err(err) = sink.record(event.clone()).await {
                    error!("Audit sink failed: {err:#}");
                    first_error.get_or_insert(err);
                }
            }
            first_error.map_or(Ok(()), Err)
        })
    }
}

/// Drain helper used by callers that must not fail on audit errors.
pub(crate) async fn record_or_log(sink: &dyn AuditSink, event: AuditEvent) {
    let event_type = event.event_type;
    let result: Result<()> = sink.record(event).await;
    if let Err(err) = result {
        error!(
            event_type = event_type.as_str(),
            "Failed to record audit event: {err:#}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RequestContext {
        RequestContext {
            ip: Some("203.0.113.7".to_string()),
            user_agent: Some("test-agent".to_string()),
        }
    }

    #[test]
    fn event_masks_email_and_copies_context() {
        let event = AuditEvent::failure(AuditEventType::LoginFailure, &ctx())
            .with_email("alice.smith@example.com")
            .with_reason("bad password");
        assert!(!event.success);
        assert_eq!(event.email.as_deref(), Some("al*******th@example.com"));
        assert_eq!(event.ip.as_deref(), Some("203.0.113.7"));
        assert_eq!(event.reason.as_deref(), Some("bad password"));
    }

    #[test]
    fn suspicious_flag_reads_metadata() {
        let event = AuditEvent::failure(AuditEventType::PasswordResetFailure, &ctx())
            .with_metadata("suspicious_activity", true);
        assert!(event.is_suspicious());
        let plain = AuditEvent::success(AuditEventType::LoginSuccess, &ctx());
        assert!(!plain.is_suspicious());
    }

    #[tokio::test]
    async fn fanout_reaches_every_sink() -> anyhow::Result<()> {
        let first = Arc::new(MemoryAuditSink::new());
        let second = Arc::new(MemoryAuditSink::new());
        let fanout = FanoutAuditSink::new(vec![
            first.clone() as Arc<dyn AuditSink>,
            second.clone() as Arc<dyn AuditSink>,
            Arc::new(TracingAuditSink) as Arc<dyn AuditSink>,
        ]);
        fanout
            .record(AuditEvent::success(AuditEventType::LoginSuccess, &ctx()))
            .await?;
        assert_eq!(first.events().await.len(), 1);
        assert_eq!(second.events_of(AuditEventType::LoginSuccess).await.len(), 1);
        Ok(())
    }

    #[test]
    fn event_type_names_are_snake_case() -> anyhow::Result<()> {
        let value = serde_json::to_value(AuditEventType::PasswordResetRequested)?;
        assert_eq!(value, serde_json::json!("password_reset_requested"));
        assert_eq!(
            AuditEventType::PasswordResetRequested.as_str(),
            "password_reset_requested"
        );
        assert_eq!(
            serde_json::to_value(AuditEventType::CsrfIssueFailure)?,
            serde_json::json!(AuditEventType::CsrfIssueFailure.as_str())
        );
        Ok(())
    }
}
