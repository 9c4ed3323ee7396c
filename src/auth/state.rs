//! Shared auth state handed to every handler.

use anyhow::{Context, Result};
use std::sync::Arc;

use super::audit::AuditSink;
use super::config::AuthConfig;
use super::csrf::CsrfGuard;
use super::email::EmailSender;
use super::rate_limit::{RateLimitAction, RateLimitConfig, RateLimitStore, RateLimiter};
use super::report::SecurityReporter;
use super::reset::{ResetService, ResetServiceParts};
use super::session::SessionService;
use super::store::{AccountStore, ResetTokenStore, SessionStore};

/// Injected collaborators.
#[derive(Clone)]
pub struct AuthBackends {
    pub accounts: Arc<dyn AccountStore>,
    pub reset_tokens: Arc<dyn ResetTokenStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub rate_limits: Arc<dyn RateLimitStore>,
    pub audit: Arc<dyn AuditSink>,
    pub email_sender: Arc<dyn EmailSender>,
}

pub struct AuthState {
    config: AuthConfig,
    accounts: Arc<dyn AccountStore>,
    rate_limiter: RateLimiter,
    csrf: CsrfGuard,
    reporter: SecurityReporter,
    reset: ResetService,
    sessions: SessionService,
}

impl std::fmt::Debug for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthState")
            .field("config", &self.config)
            .field("csrf", &self.csrf)
            .finish_non_exhaustive()
    }
}

impl AuthState {
    /// # Errors
    /// Returns an error if the configuration does not validate or a configured
    /// lifetime cannot be represented.
    pub fn new(config: AuthConfig, backends: AuthBackends) -> Result<Self> {
        config.validate().context("Invalid auth configuration")?;
        let reporter = SecurityReporter::new(backends.audit);
        let reset = ResetService::new(ResetServiceParts {
            accounts: backends.accounts.clone(),
            tokens: backends.reset_tokens,
            reporter: reporter.clone(),
            email_sender: backends.email_sender,
            email_dispatch: config.email_dispatch(),
            frontend_base_url: config.frontend_base_url().to_string(),
            token_ttl: config.reset_token_ttl(),
            response_floor: config.forgot_password_floor(),
        })?;
        let sessions = SessionService::new(
            backends.sessions,
            config.jwt_secret(),
            config.access_token_ttl(),
            config.refresh_token_ttl(),
        )?;
        let csrf = CsrfGuard::new(config.secure_cookies(), config.csrf_public_paths().to_vec());
        Ok(Self {
            accounts: backends.accounts,
            rate_limiter: RateLimiter::new(backends.rate_limits),
            csrf,
            reporter,
            reset,
            sessions,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    #[must_use]
    pub fn accounts(&self) -> &dyn AccountStore {
        self.accounts.as_ref()
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    #[must_use]
    pub fn rate_limit(&self, action: RateLimitAction) -> RateLimitConfig {
        self.config.rate_limits().config(action)
    }

    #[must_use]
    pub fn csrf(&self) -> &CsrfGuard {
        &self.csrf
    }

    #[must_use]
    pub fn reporter(&self) -> &SecurityReporter {
        &self.reporter
    }

    #[must_use]
    pub fn reset(&self) -> &ResetService {
        &self.reset
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionService {
        &self.sessions
    }
}
