//! Out-of-band delivery of password-reset emails.
//!
//! Delivery is an external collaborator behind [`EmailSender`]. Messages are
//! handed to a background task so the request path never waits on, or fails
//! because of, the provider. Failed sends are retried with exponential backoff
//! and jitter, then dropped with an error log.
//!
//! The default sender is `LogEmailSender`, which logs and returns `Ok(())`.

use anyhow::Result;
use rand::Rng;
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{error, info, warn};

use super::report::mask_email;

pub const RESET_PASSWORD_TEMPLATE: &str = "password_reset";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

impl EmailMessage {
    /// Reset email carrying the single-use link.
    #[must_use]
    pub fn password_reset(to_email: &str, reset_url: &str, expires_minutes: i64) -> Self {
        let payload = serde_json::json!({
            "reset_url": reset_url,
            "expires_minutes": expires_minutes,
        });
        Self {
            to_email: to_email.to_string(),
            template: RESET_PASSWORD_TEMPLATE.to_string(),
            payload_json: payload.to_string(),
        }
    }
}

pub trait EmailSender: Send + Sync {
    /// Deliver a message or return an error so the dispatcher can retry.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Local dev sender that logs instead of sending real email. The link is not logged.
#[derive(Clone, Debug)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to_email = %mask_email(&message.to_email),
            template = %message.template,
            "email send stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct EmailDispatchConfig {
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl EmailDispatchConfig {
    /// 3 attempts with 1s->30s exponential backoff and jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for EmailDispatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Send `message` on a background task, retrying failures.
pub fn dispatch(
    sender: Arc<dyn EmailSender>,
    message: EmailMessage,
    config: EmailDispatchConfig,
) -> tokio::task::JoinHandle<bool> {
    tokio::spawn(async move { deliver(sender.as_ref(), &message, &config).await })
}

async fn deliver(sender: &dyn EmailSender, message: &EmailMessage, config: &EmailDispatchConfig) -> bool {
    let masked = mask_email(&message.to_email);
    for attempt in 1..=config.max_attempts {
        match sender.send(message) {
            Ok(()) => return true,
            Err(err) if attempt < config.max_attempts => {
                let delay = backoff_delay(attempt, config.backoff_base, config.backoff_max);
                warn!(
                    to_email = %masked,
                    attempt,
                    "email send failed, retrying in {delay:?}: {err}"
                );
                sleep(delay).await;
            }
            Err(err) => {
                error!(to_email = %masked, attempt, "email send failed: {err}");
            }
        }
    }
    false
}

/// Frontend link for the reset form. The token rides in the fragment so it is
/// never sent to servers in a `Referer` or access log.
#[must_use]
pub fn build_reset_url(frontend_base_url: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    format!("{base}/reset-password#token={token}")
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}
