use crate::{
    api,
    auth::{AuthConfig, email::EmailDispatchConfig, rate_limit::RateLimitSettings},
    cli::commands::auth::Options,
};
use anyhow::Result;
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub auth: Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if the auth configuration is invalid or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    api::new(args.port, args.dsn, auth_config(args.auth)).await
}

/// Turn parsed CLI options into the auth configuration.
#[must_use]
pub fn auth_config(options: Options) -> AuthConfig {
    let rate_limits = options
        .rate_limits
        .iter()
        .fold(RateLimitSettings::default(), |settings, (action, limit)| {
            settings.with_override(
                *action,
                limit.max_attempts,
                Duration::from_millis(limit.window_ms),
                Duration::from_millis(limit.lockout_ms),
            )
        });

    let email_dispatch = EmailDispatchConfig::new()
        .with_max_attempts(options.email_max_attempts)
        .with_backoff(
            Duration::from_secs(options.email_backoff_base_seconds),
            Duration::from_secs(options.email_backoff_max_seconds),
        );

    let config = AuthConfig::new(options.frontend_base_url, options.jwt_secret)
        .with_production(options.production)
        .with_reset_token_ttl(Duration::from_secs(options.reset_token_ttl_seconds))
        .with_access_token_ttl(Duration::from_secs(options.access_token_ttl_seconds))
        .with_refresh_token_ttl(Duration::from_secs(options.refresh_token_ttl_seconds))
        .with_forgot_password_floor(Duration::from_millis(options.forgot_password_floor_ms))
        .with_trusted_proxies(options.trusted_proxies)
        .with_rate_limits(rate_limits)
        .with_email_dispatch(email_dispatch);

    if options.csrf_public_paths.is_empty() {
        config
    } else {
        config.with_csrf_public_paths(options.csrf_public_paths)
    }
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("dsn", redact_dsn(&args.dsn)),
        ("frontend_base_url", args.auth.frontend_base_url.clone()),
        ("production", args.auth.production.to_string()),
        (
            "access_token_ttl",
            format!("{}s", args.auth.access_token_ttl_seconds),
        ),
        (
            "refresh_token_ttl",
            format!("{}s", args.auth.refresh_token_ttl_seconds),
        ),
        (
            "reset_token_ttl",
            format!("{}s", args.auth.reset_token_ttl_seconds),
        ),
        (
            "rate_limit_overrides",
            args.auth.rate_limits.len().to_string(),
        ),
        ("csrf_public_paths", args.auth.csrf_public_paths.join(",")),
        ("trusted_proxies", args.auth.trusted_proxies.to_string()),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "custodia {} - {}\n\n{title}:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> String {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed).to_string()
}
