use crate::{
    api::handlers::auth::csrf_protect,
    auth::{
        AuthBackends, AuthConfig, AuthState,
        audit::{AuditSink, FanoutAuditSink, TracingAuditSink},
        csrf::CSRF_HEADER_NAME,
        email::LogEmailSender,
        rate_limit::{MemoryRateLimitStore, RateLimitAction},
        store::PgStore,
    },
};
use anyhow::{Context, Result, anyhow};
use axum::{
    Extension, Router,
    body::Body,
    extract::MatchedPath,
    http::{
        HeaderName, HeaderValue, Method, Request,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware,
};
use chrono::Utc;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{Span, debug, info, info_span};
use ulid::Ulid;
use url::Url;
use utoipa_axum::router::OpenApiRouter;
use utoipa_swagger_ui::SwaggerUi;

pub mod handlers;
mod openapi;

pub use openapi::openapi;

const RATE_LIMIT_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Build the API router with all documented routes registered.
#[must_use]
pub fn router() -> OpenApiRouter {
    openapi::api_router()
}

/// Full application: documented routes, Swagger UI, CSRF middleware and shared state.
///
/// # Errors
/// Returns an error if the frontend base URL cannot be turned into a CORS origin.
pub fn app(auth_state: Arc<AuthState>, pool: PgPool) -> Result<Router> {
    let frontend_origin = frontend_origin(auth_state.config().frontend_base_url())?;
    let cors = CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static(CSRF_HEADER_NAME),
        ])
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(AllowOrigin::exact(frontend_origin))
        .allow_credentials(true);

    let (router, openapi) = router().split_for_parts();
    let app = router
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(auth_state))
                .layer(middleware::from_fn(csrf_protect))
                .layer(Extension(pool)),
        );
    Ok(app)
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, dsn: String, auth_config: AuthConfig) -> Result<()> {
    auth_config
        .validate()
        .context("Invalid auth configuration")?;

    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&dsn)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let rate_limits = Arc::new(MemoryRateLimitStore::new());
    let audit = FanoutAuditSink::new(vec![
        Arc::new(TracingAuditSink) as Arc<dyn AuditSink>,
        store.clone() as Arc<dyn AuditSink>,
    ]);

    spawn_rate_limit_purge(rate_limits.clone(), longest_window(&auth_config));

    let auth_state = Arc::new(AuthState::new(
        auth_config,
        AuthBackends {
            accounts: store.clone(),
            reset_tokens: store.clone(),
            sessions: store,
            rate_limits,
            audit: Arc::new(audit),
            email_sender: Arc::new(LogEmailSender),
        },
    )?);

    let app = app(auth_state, pool)?;

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {err}");
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

/// Entries idle longer than every window and lockout can no longer affect a decision.
fn longest_window(config: &AuthConfig) -> Duration {
    RateLimitAction::ALL
        .iter()
        .map(|action| {
            let limit = config.rate_limits().config(*action);
            limit.window.max(limit.lockout)
        })
        .max()
        .unwrap_or(RATE_LIMIT_PURGE_INTERVAL)
}

fn spawn_rate_limit_purge(store: Arc<MemoryRateLimitStore>, idle: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RATE_LIMIT_PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let purged = store.purge_stale(Utc::now(), idle).await;
            if purged > 0 {
                debug!(purged, "purged idle rate limit entries");
            }
        }
    });
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn frontend_origin(frontend_base_url: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(frontend_base_url)
        .with_context(|| format!("Invalid frontend base URL: {frontend_base_url}"))?;
    let host = parsed.host_str().ok_or_else(|| {
        anyhow!("Frontend base URL must include a valid host: {frontend_base_url}")
    })?;
    let port = parsed
        .port()
        .map_or_else(String::new, |port| format!(":{port}"));
    let origin = format!("{}://{}{}", parsed.scheme(), host, port);
    HeaderValue::from_str(&origin).context("Failed to build frontend origin header")
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    #[test]
    fn frontend_origin_strips_path() -> Result<()> {
        let origin = frontend_origin("https://shop.example.com/account/reset")?;
        assert_eq!(origin, "https://shop.example.com");
        let origin = frontend_origin("http://localhost:5173")?;
        assert_eq!(origin, "http://localhost:5173");
        Ok(())
    }

    #[test]
    fn frontend_origin_requires_host() {
        assert!(frontend_origin("not a url").is_err());
        assert!(frontend_origin("data:text/plain,hello").is_err());
    }

    #[test]
    fn longest_window_covers_lockouts() {
        let config = AuthConfig::new(
            "https://shop.example.com".to_string(),
            SecretString::from("0123456789abcdef0123456789abcdef".to_string()),
        );
        // register: one hour window and lockout
        assert_eq!(longest_window(&config), Duration::from_secs(3600));
    }
}
