//! Fixed-window attempt counter with lockout, keyed by `"{key_prefix}:{identifier}"`.
//!
//! Flow Overview:
//! 1) Read the entry for the key.
//! 2) An active lockout rejects immediately with the remaining lockout time.
//! 3) An elapsed window (or an expired lockout) restarts the count at 1;
//!    otherwise the count is incremented.
//! 4) Exceeding `max_attempts` starts a lockout and rejects.
//! 5) The new entry is written with compare-and-swap, retrying on contention,
//!    so two concurrent attempts can never both slip under the limit.
//!
//! Store failures fail closed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error};

use super::store::StoreFuture;

const MAX_CAS_RETRIES: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RateLimitAction {
    Login,
    Register,
    ForgotPassword,
    ResetPassword,
    Refresh,
}

impl RateLimitAction {
    pub const ALL: [Self; 5] = [
        Self::Login,
        Self::Register,
        Self::ForgotPassword,
        Self::ResetPassword,
        Self::Refresh,
    ];

    #[must_use]
    pub fn key_prefix(self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Register => "register",
            Self::ForgotPassword => "forgot-password",
            Self::ResetPassword => "reset-password",
            Self::Refresh => "refresh",
        }
    }

    #[must_use]
    pub fn default_config(self) -> RateLimitConfig {
        let (max_attempts, window_ms, lockout_ms) = match self {
            Self::Login => (5, 900_000, 900_000),
            Self::Register => (3, 3_600_000, 3_600_000),
            Self::ForgotPassword | Self::ResetPassword => (10, 3_600_000, 900_000),
            Self::Refresh => (30, 60_000, 300_000),
        };
        RateLimitConfig {
            max_attempts,
            window: Duration::from_millis(window_ms),
            lockout: Duration::from_millis(lockout_ms),
            key_prefix: self.key_prefix(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_attempts: u32,
    pub window: Duration,
    pub lockout: Duration,
    pub key_prefix: &'static str,
}

impl RateLimitConfig {
    #[must_use]
    pub fn key(&self, identifier: &str) -> String {
        format!("{}:{identifier}", self.key_prefix)
    }
}

/// Per-action limits, built once at startup.
#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    configs: HashMap<RateLimitAction, RateLimitConfig>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            configs: RateLimitAction::ALL
                .into_iter()
                .map(|action| (action, action.default_config()))
                .collect(),
        }
    }
}

impl RateLimitSettings {
    #[must_use]
    pub fn config(&self, action: RateLimitAction) -> RateLimitConfig {
        self.configs
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_config())
    }

    /// Replace the limits for `action`; the key prefix stays tied to the action.
    #[must_use]
    pub fn with_override(
        mut self,
        action: RateLimitAction,
        max_attempts: u32,
        window: Duration,
        lockout: Duration,
    ) -> Self {
        self.configs.insert(
            action,
            RateLimitConfig {
                max_attempts,
                window,
                lockout,
                key_prefix: action.key_prefix(),
            },
        );
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub lockout_until: Option<DateTime<Utc>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("rate limited, retry after {retry_after:?}")]
pub struct RateLimited {
    pub retry_after: Duration,
}

impl RateLimited {
    /// Whole seconds for the `Retry-After` header, rounded up and never zero.
    #[must_use]
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs() + u64::from(self.retry_after.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// Backing storage for rate-limit entries.
///
/// Implementations must make `compare_and_swap` atomic per key: the write only
/// happens when the stored value still equals `expected`.
pub trait RateLimitStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<RateLimitEntry>>;

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected: Option<RateLimitEntry>,
        new: RateLimitEntry,
    ) -> StoreFuture<'a, bool>;

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;
}

#[derive(Debug, Default)]
pub struct MemoryRateLimitStore {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl MemoryRateLimitStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop entries that are neither locked out nor inside `idle` of their window start.
    pub async fn purge_stale(&self, now: DateTime<Utc>, idle: Duration) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            entry.lockout_until.is_some_and(|until| until > now)
                || elapsed(entry.window_start, now) < idle
        });
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<RateLimitEntry>> {
        Box::pin(async move { Ok(self.entries.lock().await.get(key).copied()) })
    }

    fn compare_and_swap<'a>(
        &'a self,
        key: &'a str,
        expected: Option<RateLimitEntry>,
        new: RateLimitEntry,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            if entries.get(key).copied() != expected {
                return Ok(false);
            }
            entries.insert(key.to_string(), new);
            Ok(true)
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter {
    #[must_use]
    pub fn new(store: Arc<dyn RateLimitStore>) -> Self {
        Self { store }
    }

    /// Count one attempt for `identifier`.
    ///
    /// # Errors
    /// Returns `RateLimited` while locked out or once the attempt exceeds the limit.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> Result<(), RateLimited> {
        self.check_rate_limit_at(identifier, config, Utc::now())
            .await
    }

    /// Same as [`Self::check_rate_limit`] with an explicit clock.
    ///
    /// # Errors
    /// Returns `RateLimited` while locked out or once the attempt exceeds the limit.
    pub async fn check_rate_limit_at(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimited> {
        let key = config.key(identifier);
        for _ in 0..MAX_CAS_RETRIES {
            let current = match self.store.get(&key).await {
                Ok(current) => current,
                Err(err) => {
                    error!("Failed to read rate limit entry: {err}");
                    return Err(fail_closed(config));
                }
            };

            let (next, outcome) = match next_entry(current, config, now) {
                Step::Locked(limited) => return Err(limited),
                Step::Write(next, outcome) => (next, outcome),
            };

            match self.store.compare_and_swap(&key, current, next).await {
                Ok(true) => {
                    if outcome.is_err() {
                        debug!(key = %key, count = next.count, "rate limit exceeded");
                    }
                    return outcome;
                }
                Ok(false) => {}
                Err(err) => {
                    error!("Failed to write rate limit entry: {err}");
                    return Err(fail_closed(config));
                }
            }
        }
        error!(key = %key, "rate limit entry contended past retry budget");
        Err(fail_closed(config))
    }

    /// Forget all attempts for `identifier`.
    ///
    /// # Errors
    /// Returns an error if the store fails.
    pub async fn clear_rate_limit(&self, identifier: &str, config: &RateLimitConfig) -> Result<()> {
        self.store.remove(&config.key(identifier)).await
    }
}

enum Step {
    Locked(RateLimited),
    Write(RateLimitEntry, Result<(), RateLimited>),
}

fn next_entry(
    current: Option<RateLimitEntry>,
    config: &RateLimitConfig,
    now: DateTime<Utc>,
) -> Step {
    if let Some(until) = current.and_then(|entry| entry.lockout_until)
        && now < until
    {
        return Step::Locked(RateLimited {
            retry_after: elapsed(now, until),
        });
    }

    let mut entry = match current {
        Some(entry)
            if entry.lockout_until.is_none() && elapsed(entry.window_start, now) < config.window =>
        {
            RateLimitEntry {
                count: entry.count.saturating_add(1),
                ..entry
            }
        }
        _ => RateLimitEntry {
            count: 1,
            window_start: now,
            lockout_until: None,
        },
    };

    if entry.count > config.max_attempts {
        entry.lockout_until = Some(add(now, config.lockout));
        return Step::Write(
            entry,
            Err(RateLimited {
                retry_after: config.lockout,
            }),
        );
    }
    Step::Write(entry, Ok(()))
}

fn fail_closed(config: &RateLimitConfig) -> RateLimited {
    RateLimited {
        retry_after: config.lockout,
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or_default()
}

fn add(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
