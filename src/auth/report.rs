//! Secure error and audit facade.
//!
//! Every rejection goes through [`SecurityReporter`]: the operational log gets
//! the internal code with masked identifiers, the audit sink gets a failure
//! event, and the caller gets back an [`AuthError`] that only carries the
//! client-safe code and message.

use std::{net::Ipv4Addr, sync::Arc};
use tracing::{error, warn};

use super::audit::{AuditEvent, AuditSink, record_or_log};
use super::error::{AuthError, ErrorCode};

/// Client attributes captured once per request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    #[must_use]
    pub fn ip_or_unknown(&self) -> &str {
        self.ip.as_deref().unwrap_or("unknown")
    }

    #[must_use]
    pub fn user_agent_or_empty(&self) -> &str {
        self.user_agent.as_deref().unwrap_or_default()
    }
}

/// Keep the first and last two characters of the local part.
///
/// Local parts of four characters or fewer keep only the first character.
/// Input without `@` is fully masked.
#[must_use]
pub fn mask_email(email: &str) -> String {
    let Some((local, domain)) = email.rsplit_once('@') else {
        return "***".to_string();
    };
    let chars: Vec<char> = local.chars().collect();
    let masked_local = if chars.len() > 4 {
        let head: String = chars[..2].iter().collect();
        let tail: String = chars[chars.len() - 2..].iter().collect();
        format!("{head}{}{tail}", "*".repeat(chars.len() - 4))
    } else {
        let head: String = chars.iter().take(1).collect();
        format!("{head}{}", "*".repeat(chars.len().saturating_sub(1).max(1)))
    };
    format!("{masked_local}@{domain}")
}

/// Zero the last two octets of an IPv4 address; anything else is returned unchanged.
#[must_use]
pub fn mask_ip(ip: &str) -> String {
    match ip.parse::<Ipv4Addr>() {
        Ok(addr) => {
            let [a, b, _, _] = addr.octets();
            format!("{a}.{b}.0.0")
        }
        Err(_) => ip.to_string(),
    }
}

#[derive(Clone)]
pub struct SecurityReporter {
    sink: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for SecurityReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityReporter").finish_non_exhaustive()
    }
}

impl SecurityReporter {
    #[must_use]
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Record an event that does not change the response.
    pub async fn record(&self, event: AuditEvent) {
        record_or_log(self.sink.as_ref(), event).await;
    }

    /// Log, audit, and convert a rejection into its client error.
    ///
    /// `code` is the internal cause and may be more specific than what the client sees.
    pub async fn reject(&self, code: &'static str, error: AuthError, event: AuditEvent) -> AuthError {
        warn!(
            code,
            event_type = event.event_type.as_str(),
            user_id = ?event.user_id,
            email = event.email.as_deref().unwrap_or("-"),
            ip = %event.ip.as_deref().map(mask_ip).unwrap_or_default(),
            reason = event.reason.as_deref().unwrap_or("-"),
            "auth request rejected"
        );
        let event = AuditEvent {
            success: false,
            ..event
        };
        record_or_log(self.sink.as_ref(), event).await;
        error
    }

    /// Shorthand for codes whose client error needs no extra payload.
    pub async fn reject_code(&self, code: ErrorCode, event: AuditEvent) -> AuthError {
        self.reject(code.as_str(), AuthError::from_code(code), event)
            .await
    }

    /// Log full detail for an unexpected failure and return the generic error.
    pub async fn internal(&self, err: &anyhow::Error, event: AuditEvent) -> AuthError {
        error!(
            event_type = event.event_type.as_str(),
            ip = %event.ip.as_deref().map(mask_ip).unwrap_or_default(),
            "auth request failed: {err:#}"
        );
        let event = AuditEvent {
            success: false,
            ..event
        }
        .with_reason("internal error");
        record_or_log(self.sink.as_ref(), event).await;
        AuthError::Internal
    }
}
