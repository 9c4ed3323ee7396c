use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command, builder::ValueParser};
use secrecy::SecretString;

use crate::auth::rate_limit::RateLimitAction;

pub const ARG_FRONTEND_BASE_URL: &str = "frontend-base-url";
pub const ARG_PRODUCTION: &str = "production";
pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_RESET_TOKEN_TTL: &str = "reset-token-ttl-seconds";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl-seconds";
pub const ARG_FORGOT_PASSWORD_FLOOR: &str = "forgot-password-floor-ms";
pub const ARG_CSRF_PUBLIC_PATHS: &str = "csrf-public-paths";
pub const ARG_TRUSTED_PROXIES: &str = "trusted-proxies";
pub const ARG_EMAIL_MAX_ATTEMPTS: &str = "email-max-attempts";
pub const ARG_EMAIL_BACKOFF_BASE: &str = "email-backoff-base-seconds";
pub const ARG_EMAIL_BACKOFF_MAX: &str = "email-backoff-max-seconds";

/// `max/window_ms/lockout_ms` as given on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitOverride {
    pub max_attempts: u32,
    pub window_ms: u64,
    pub lockout_ms: u64,
}

#[must_use]
pub fn validator_rate_limit() -> ValueParser {
    ValueParser::from(
        move |value: &str| -> std::result::Result<RateLimitOverride, String> {
            let parts: Vec<&str> = value.split('/').map(str::trim).collect();
            let [max, window, lockout] = parts.as_slice() else {
                return Err("expected max/window_ms/lockout_ms".to_string());
            };
            let max_attempts = max
                .parse::<u32>()
                .map_err(|_| format!("invalid max attempts: {max}"))?;
            let window_ms = window
                .parse::<u64>()
                .map_err(|_| format!("invalid window: {window}"))?;
            let lockout_ms = lockout
                .parse::<u64>()
                .map_err(|_| format!("invalid lockout: {lockout}"))?;
            if max_attempts == 0 || window_ms == 0 || lockout_ms == 0 {
                return Err("max, window and lockout must be greater than zero".to_string());
            }
            Ok(RateLimitOverride {
                max_attempts,
                window_ms,
                lockout_ms,
            })
        },
    )
}

/// CLI argument id for an action's rate-limit override.
#[must_use]
pub fn rate_limit_arg(action: RateLimitAction) -> &'static str {
    match action {
        RateLimitAction::Login => "rate-limit-login",
        RateLimitAction::Register => "rate-limit-register",
        RateLimitAction::ForgotPassword => "rate-limit-forgot-password",
        RateLimitAction::ResetPassword => "rate-limit-reset-password",
        RateLimitAction::Refresh => "rate-limit-refresh",
    }
}

fn rate_limit_env(action: RateLimitAction) -> &'static str {
    match action {
        RateLimitAction::Login => "CUSTODIA_RATE_LIMIT_LOGIN",
        RateLimitAction::Register => "CUSTODIA_RATE_LIMIT_REGISTER",
        RateLimitAction::ForgotPassword => "CUSTODIA_RATE_LIMIT_FORGOT_PASSWORD",
        RateLimitAction::ResetPassword => "CUSTODIA_RATE_LIMIT_RESET_PASSWORD",
        RateLimitAction::Refresh => "CUSTODIA_RATE_LIMIT_REFRESH",
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_abuse_args(command);
    with_email_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_FRONTEND_BASE_URL)
                .long(ARG_FRONTEND_BASE_URL)
                .help("Frontend base URL used for reset links and CORS")
                .env("CUSTODIA_FRONTEND_BASE_URL")
                .default_value("http://localhost:5173"),
        )
        .arg(
            Arg::new(ARG_PRODUCTION)
                .long(ARG_PRODUCTION)
                .help("Production mode: Secure cookies and strict secret checks")
                .env("CUSTODIA_PRODUCTION")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("HS256 signing secret for access tokens (at least 32 bytes)")
                .env("CUSTODIA_JWT_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_RESET_TOKEN_TTL)
                .long(ARG_RESET_TOKEN_TTL)
                .help("Password reset token lifetime in seconds")
                .env("CUSTODIA_RESET_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token lifetime in seconds")
                .env("CUSTODIA_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token (session) lifetime in seconds")
                .env("CUSTODIA_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_abuse_args(command: Command) -> Command {
    let command = command
        .arg(
            Arg::new(ARG_FORGOT_PASSWORD_FLOOR)
                .long(ARG_FORGOT_PASSWORD_FLOOR)
                .help("Minimum forgot-password response time in milliseconds")
                .env("CUSTODIA_FORGOT_PASSWORD_FLOOR_MS")
                .default_value("150")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_CSRF_PUBLIC_PATHS)
                .long(ARG_CSRF_PUBLIC_PATHS)
                .help("Comma separated paths that never require a CSRF token")
                .env("CUSTODIA_CSRF_PUBLIC_PATHS")
                .value_delimiter(',')
                .default_value("/auth/register,/auth/forgot-password"),
        )
        .arg(
            Arg::new(ARG_TRUSTED_PROXIES)
                .long(ARG_TRUSTED_PROXIES)
                .help("Reverse proxies in front of the service; 0 ignores X-Forwarded-For")
                .env("CUSTODIA_TRUSTED_PROXIES")
                .default_value("0")
                .value_parser(clap::value_parser!(usize)),
        );

    RateLimitAction::ALL.iter().fold(command, |command, action| {
        command.arg(
            Arg::new(rate_limit_arg(*action))
                .long(rate_limit_arg(*action))
                .help(format!(
                    "Override {} limit as max/window_ms/lockout_ms",
                    action.key_prefix()
                ))
                .env(rate_limit_env(*action))
                .value_parser(validator_rate_limit()),
        )
    })
}

fn with_email_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_EMAIL_MAX_ATTEMPTS)
                .long(ARG_EMAIL_MAX_ATTEMPTS)
                .help("Delivery attempts per reset email")
                .env("CUSTODIA_EMAIL_MAX_ATTEMPTS")
                .default_value("3")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new(ARG_EMAIL_BACKOFF_BASE)
                .long(ARG_EMAIL_BACKOFF_BASE)
                .help("Initial retry delay for reset emails in seconds")
                .env("CUSTODIA_EMAIL_BACKOFF_BASE_SECONDS")
                .default_value("1")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_EMAIL_BACKOFF_MAX)
                .long(ARG_EMAIL_BACKOFF_MAX)
                .help("Maximum retry delay for reset emails in seconds")
                .env("CUSTODIA_EMAIL_BACKOFF_MAX_SECONDS")
                .default_value("30")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub frontend_base_url: String,
    pub production: bool,
    pub jwt_secret: SecretString,
    pub reset_token_ttl_seconds: u64,
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_seconds: u64,
    pub forgot_password_floor_ms: u64,
    pub csrf_public_paths: Vec<String>,
    pub trusted_proxies: usize,
    pub rate_limits: Vec<(RateLimitAction, RateLimitOverride)>,
    pub email_max_attempts: u32,
    pub email_backoff_base_seconds: u64,
    pub email_backoff_max_seconds: u64,
}

impl Options {
    /// # Errors
    /// Returns an error if an argument with a default value is missing.
    pub fn parse(matches: &clap::ArgMatches) -> Result<Self> {
        let u64_arg = |id: &str| -> Result<u64> {
            matches
                .get_one::<u64>(id)
                .copied()
                .with_context(|| format!("missing required argument: --{id}"))
        };

        Ok(Self {
            frontend_base_url: matches
                .get_one::<String>(ARG_FRONTEND_BASE_URL)
                .cloned()
                .context("missing required argument: --frontend-base-url")?,
            production: matches.get_flag(ARG_PRODUCTION),
            // Empty when unset; startup validation rejects it.
            jwt_secret: SecretString::from(
                matches
                    .get_one::<String>(ARG_JWT_SECRET)
                    .cloned()
                    .unwrap_or_default(),
            ),
            reset_token_ttl_seconds: u64_arg(ARG_RESET_TOKEN_TTL)?,
            access_token_ttl_seconds: u64_arg(ARG_ACCESS_TOKEN_TTL)?,
            refresh_token_ttl_seconds: u64_arg(ARG_REFRESH_TOKEN_TTL)?,
            forgot_password_floor_ms: u64_arg(ARG_FORGOT_PASSWORD_FLOOR)?,
            csrf_public_paths: matches
                .get_many::<String>(ARG_CSRF_PUBLIC_PATHS)
                .map(|paths| {
                    paths
                        .map(|path| path.trim().to_string())
                        .filter(|path| !path.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            trusted_proxies: matches
                .get_one::<usize>(ARG_TRUSTED_PROXIES)
                .copied()
                .context("missing required argument: --trusted-proxies")?,
            rate_limits: RateLimitAction::ALL
                .iter()
                .filter_map(|action| {
                    matches
                        .get_one::<RateLimitOverride>(rate_limit_arg(*action))
                        .map(|limit| (*action, *limit))
                })
                .collect(),
            email_max_attempts: matches
                .get_one::<u32>(ARG_EMAIL_MAX_ATTEMPTS)
                .copied()
                .context("missing required argument: --email-max-attempts")?,
            email_backoff_base_seconds: u64_arg(ARG_EMAIL_BACKOFF_BASE)?,
            email_backoff_max_seconds: u64_arg(ARG_EMAIL_BACKOFF_MAX)?,
        })
    }
}
