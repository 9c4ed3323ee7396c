//! Auth configuration, built once at startup and validated before serving.

use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use super::csrf::DEFAULT_PUBLIC_PATHS;
use super::email::EmailDispatchConfig;
use super::rate_limit::RateLimitSettings;

const DEFAULT_RESET_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_ACCESS_TOKEN_TTL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_REFRESH_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_FORGOT_PASSWORD_FLOOR: Duration = Duration::from_millis(150);

/// Forgot-password responses are never faster than this.
pub const MIN_FORGOT_PASSWORD_FLOOR: Duration = Duration::from_millis(150);

pub const MIN_JWT_SECRET_BYTES: usize = 32;

// Values that show up in sample env files and tutorials.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "change-me",
    "change_me",
    "secret",
    "your-secret-key",
    "your_secret_key",
    "your-256-bit-secret",
    "jwt-secret",
    "dev-secret",
    "development-secret",
    "replace-me",
    "insecure",
];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("JWT signing secret is not set")]
    MissingSecret,
    #[error("JWT signing secret must be at least {MIN_JWT_SECRET_BYTES} bytes, got {0}")]
    SecretTooShort(usize),
    #[error("JWT signing secret is a known placeholder")]
    PlaceholderSecret,
    #[error("{0} must be greater than zero")]
    ZeroDuration(&'static str),
    #[error("forgot-password floor must be at least {min} ms, got {0} ms", min = MIN_FORGOT_PASSWORD_FLOOR.as_millis())]
    FloorTooShort(u128),
}

#[derive(Debug)]
pub struct AuthConfig {
    frontend_base_url: String,
    production: bool,
    jwt_secret: SecretString,
    reset_token_ttl: Duration,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
    forgot_password_floor: Duration,
    trusted_proxies: usize,
    rate_limits: RateLimitSettings,
    csrf_public_paths: Vec<String>,
    email_dispatch: EmailDispatchConfig,
}

impl AuthConfig {
    #[must_use]
    pub fn new(frontend_base_url: String, jwt_secret: SecretString) -> Self {
        Self {
            frontend_base_url,
            production: false,
            jwt_secret,
            reset_token_ttl: DEFAULT_RESET_TOKEN_TTL,
            access_token_ttl: DEFAULT_ACCESS_TOKEN_TTL,
            refresh_token_ttl: DEFAULT_REFRESH_TOKEN_TTL,
            forgot_password_floor: DEFAULT_FORGOT_PASSWORD_FLOOR,
            trusted_proxies: 0,
            rate_limits: RateLimitSettings::default(),
            csrf_public_paths: DEFAULT_PUBLIC_PATHS.iter().map(ToString::to_string).collect(),
            email_dispatch: EmailDispatchConfig::default(),
        }
    }

    #[must_use]
    pub fn with_production(mut self, production: bool) -> Self {
        self.production = production;
        self
    }

    #[must_use]
    pub fn with_reset_token_ttl(mut self, ttl: Duration) -> Self {
        self.reset_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl(mut self, ttl: Duration) -> Self {
        self.access_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_forgot_password_floor(mut self, floor: Duration) -> Self {
        self.forgot_password_floor = floor;
        self
    }

    /// Number of reverse proxies in front of the service that append to
    /// `X-Forwarded-For`. With zero, forwarding headers are ignored.
    #[must_use]
    pub fn with_trusted_proxies(mut self, hops: usize) -> Self {
        self.trusted_proxies = hops;
        self
    }

    #[must_use]
    pub fn with_rate_limits(mut self, rate_limits: RateLimitSettings) -> Self {
        self.rate_limits = rate_limits;
        self
    }

    #[must_use]
    pub fn with_csrf_public_paths(mut self, paths: Vec<String>) -> Self {
        self.csrf_public_paths = paths;
        self
    }

    #[must_use]
    pub fn with_email_dispatch(mut self, email_dispatch: EmailDispatchConfig) -> Self {
        self.email_dispatch = email_dispatch;
        self
    }

    /// Reject configurations the service must not start with.
    ///
    /// # Errors
    /// Returns the first problem found with the signing secret or token lifetimes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let secret = self.jwt_secret.expose_secret();
        if secret.trim().is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if secret.len() < MIN_JWT_SECRET_BYTES {
            return Err(ConfigError::SecretTooShort(secret.len()));
        }
        if self.production && is_placeholder(secret) {
            return Err(ConfigError::PlaceholderSecret);
        }
        for (name, value) in [
            ("reset token ttl", self.reset_token_ttl),
            ("access token ttl", self.access_token_ttl),
            ("refresh token ttl", self.refresh_token_ttl),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration(name));
            }
        }
        if self.forgot_password_floor < MIN_FORGOT_PASSWORD_FLOOR {
            return Err(ConfigError::FloorTooShort(
                self.forgot_password_floor.as_millis(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    #[must_use]
    pub fn production(&self) -> bool {
        self.production
    }

    /// Cookies carry `Secure` only in production.
    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.production
    }

    pub(crate) fn jwt_secret(&self) -> &SecretString {
        &self.jwt_secret
    }

    #[must_use]
    pub fn reset_token_ttl(&self) -> Duration {
        self.reset_token_ttl
    }

    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    #[must_use]
    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }

    #[must_use]
    pub fn forgot_password_floor(&self) -> Duration {
        self.forgot_password_floor
    }

    #[must_use]
    pub fn trusted_proxies(&self) -> usize {
        self.trusted_proxies
    }

    #[must_use]
    pub fn rate_limits(&self) -> &RateLimitSettings {
        &self.rate_limits
    }

    #[must_use]
    pub fn csrf_public_paths(&self) -> &[String] {
        &self.csrf_public_paths
    }

    #[must_use]
    pub fn email_dispatch(&self) -> EmailDispatchConfig {
        self.email_dispatch
    }
}

// A placeholder may be padded to reach the length floor, so match on the prefix too.
fn is_placeholder(secret: &str) -> bool {
    let lowered = secret.trim().to_lowercase();
    PLACEHOLDER_SECRETS
        .iter()
        .any(|placeholder| lowered == *placeholder || lowered.starts_with(placeholder))
}
