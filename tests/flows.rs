//! End-to-end flows through the axum router, backed by the in-memory store.

use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{
        HeaderMap, Request, StatusCode,
        header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, RETRY_AFTER, SET_COOKIE, USER_AGENT},
    },
};
use custodia::{
    api,
    auth::{
        AuthBackends, AuthConfig, AuthState,
        audit::{AuditEventType, AuditSink, MemoryAuditSink},
        crypto::hash_password,
        email::{EmailMessage, EmailSender},
        rate_limit::{MemoryRateLimitStore, RateLimitAction, RateLimitSettings},
        store::MemoryStore,
    },
};
use secrecy::SecretString;
use serde_json::{Value, json};
use sqlx::postgres::PgPoolOptions;
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tower::ServiceExt;
use uuid::Uuid;

const SECRET: &str = "0123456789abcdef0123456789abcdef";
const PASSWORD: &str = "Correct-Horse-Battery-9";
const NEW_PASSWORD: &str = "Lantern!Orchard-Quartz7";
const CLIENT_UA: &str = "flows-test/1.0";

#[derive(Default)]
struct RecordingSender {
    sent: Mutex<Vec<EmailMessage>>,
}

impl RecordingSender {
    fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

impl EmailSender for RecordingSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("sender poisoned"))?
            .push(message.clone());
        Ok(())
    }
}

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    audit: Arc<MemoryAuditSink>,
    mail: Arc<RecordingSender>,
}

impl Harness {
    fn new() -> Result<Self> {
        Self::with_config(config())
    }

    fn with_config(config: AuthConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let mail = Arc::new(RecordingSender::default());
        let state = AuthState::new(
            config,
            AuthBackends {
                accounts: store.clone(),
                reset_tokens: store.clone(),
                sessions: store.clone(),
                rate_limits: Arc::new(MemoryRateLimitStore::new()),
                audit: audit.clone() as Arc<dyn AuditSink>,
                email_sender: mail.clone() as Arc<dyn EmailSender>,
            },
        )?;
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgres://custodia@127.0.0.1:1/custodia")?;
        let app = api::app(Arc::new(state), pool)?;
        Ok(Self {
            app,
            store,
            audit,
            mail,
        })
    }

    async fn seed_account(&self, email: &str, verified: bool) -> Result<Uuid> {
        let hash = hash_password(PASSWORD)?;
        Ok(self.store.insert_account(email, hash, verified).await)
    }

    async fn send(&self, request: Request<Body>) -> Result<(StatusCode, HeaderMap, Value)> {
        self.send_from(Some(client_peer()), request).await
    }

    /// Dispatch as if the connection came from `peer`; `None` leaves the peer unknown.
    async fn send_from(
        &self,
        peer: Option<SocketAddr>,
        mut request: Request<Body>,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        if let Some(peer) = peer {
            request.extensions_mut().insert(ConnectInfo(peer));
        }
        let response = self.app.clone().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        Ok((status, headers, body))
    }

    async fn csrf_token(&self) -> Result<String> {
        self.csrf_token_from(Some(client_peer())).await
    }

    async fn csrf_token_from(&self, peer: Option<SocketAddr>) -> Result<String> {
        let (status, _, body) = self
            .send_from(peer, get("/auth/csrf").body(Body::empty())?)
            .await?;
        assert_eq!(status, StatusCode::OK);
        body["csrf_token"]
            .as_str()
            .map(str::to_string)
            .context("missing csrf_token")
    }

    async fn post_json(
        &self,
        path: &str,
        payload: &Value,
        csrf: Option<&str>,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        self.post_json_from(Some(client_peer()), path, payload, csrf)
            .await
    }

    async fn post_json_from(
        &self,
        peer: Option<SocketAddr>,
        path: &str,
        payload: &Value,
        csrf: Option<&str>,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        let mut builder = post(path).header(CONTENT_TYPE, "application/json");
        if let Some(token) = csrf {
            builder = builder
                .header(COOKIE, format!("csrf_token={token}"))
                .header("x-csrf-token", token);
        }
        self.send_from(peer, builder.body(Body::from(payload.to_string()))?)
            .await
    }

    /// Reset link tokens delivered so far, oldest first.
    async fn wait_for_reset_tokens(&self, count: usize) -> Result<Vec<String>> {
        for _ in 0..100 {
            let sent = self.mail.sent();
            if sent.len() >= count {
                return sent
                    .iter()
                    .map(|message| {
                        let payload: Value = serde_json::from_str(&message.payload_json)?;
                        payload["reset_url"]
                            .as_str()
                            .and_then(|url| url.split_once("#token="))
                            .map(|(_, token)| token.to_string())
                            .context("reset url without token")
                    })
                    .collect();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("expected {count} reset emails, got {}", self.mail.sent().len())
    }

    async fn login(&self, email: &str, password: &str) -> Result<(StatusCode, HeaderMap, Value)> {
        self.login_from(Some(client_peer()), email, password).await
    }

    async fn login_from(
        &self,
        peer: Option<SocketAddr>,
        email: &str,
        password: &str,
    ) -> Result<(StatusCode, HeaderMap, Value)> {
        let csrf = self.csrf_token_from(peer).await?;
        self.post_json_from(
            peer,
            "/auth/login",
            &json!({"email": email, "password": password}),
            Some(&csrf),
        )
        .await
    }
}

fn config() -> AuthConfig {
    AuthConfig::new(
        "https://shop.example.com".to_string(),
        SecretString::from(SECRET.to_string()),
    )
}

fn client_peer() -> SocketAddr {
    SocketAddr::from(([203, 0, 113, 10], 40_000))
}

fn get(path: &str) -> axum::http::request::Builder {
    Request::get(path).header(USER_AGENT, CLIENT_UA)
}

fn post(path: &str) -> axum::http::request::Builder {
    Request::post(path).header(USER_AGENT, CLIENT_UA)
}

#[tokio::test]
async fn csrf_endpoint_sets_both_cookies() -> Result<()> {
    let harness = Harness::new()?;
    let (status, headers, body) = harness.send(get("/auth/csrf").body(Body::empty())?).await?;
    assert_eq!(status, StatusCode::OK);
    let token = body["csrf_token"].as_str().context("missing token")?;
    assert_eq!(token.len(), 64);

    let cookies: Vec<&str> = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    assert_eq!(cookies.len(), 2);
    assert!(cookies.iter().any(|c| c.starts_with(&format!("csrf_token={token}")) && c.contains("HttpOnly")));
    assert!(cookies.iter().any(|c| c.starts_with(&format!("csrf_token_client={token}"))));
    Ok(())
}

#[tokio::test]
async fn state_changing_requests_require_csrf() -> Result<()> {
    let harness = Harness::new()?;
    let (status, _, body) = harness
        .post_json(
            "/auth/reset-password",
            &json!({"token": "abc", "password": NEW_PASSWORD}),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "CSRF_INVALID");
    assert_eq!(body["success"], false);

    // Header present but one character off.
    let token = harness.csrf_token().await?;
    let mut tampered = token.clone();
    tampered.replace_range(0..1, if token.starts_with('a') { "b" } else { "a" });
    let request = post("/auth/logout")
        .header(CONTENT_TYPE, "application/json")
        .header(COOKIE, format!("csrf_token={token}"))
        .header("x-csrf-token", tampered)
        .body(Body::from(json!({"refresh_token": "x"}).to_string()))?;
    let (status, _, _) = harness.send(request).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert_eq!(
        harness.audit.events_of(AuditEventType::CsrfRejected).await.len(),
        2
    );
    Ok(())
}

#[tokio::test]
async fn forgot_password_is_public_and_issues_csrf_cookie() -> Result<()> {
    let harness = Harness::new()?;
    let (status, headers, body) = harness
        .post_json(
            "/auth/forgot-password",
            &json!({"email": "nobody@example.com"}),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(
        headers
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|cookie| cookie.starts_with("csrf_token="))
    );
    Ok(())
}

#[tokio::test]
async fn forgot_password_does_not_reveal_accounts() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("alice@example.com", true).await?;

    let started = Instant::now();
    let known = harness
        .post_json(
            "/auth/forgot-password",
            &json!({"email": "Alice@Example.com"}),
            None,
        )
        .await?;
    let known_elapsed = started.elapsed();

    let started = Instant::now();
    let unknown = harness
        .post_json(
            "/auth/forgot-password",
            &json!({"email": "mallory@example.com"}),
            None,
        )
        .await?;
    let unknown_elapsed = started.elapsed();

    assert_eq!(known.0, StatusCode::OK);
    assert_eq!(unknown.0, StatusCode::OK);
    assert_eq!(known.2, unknown.2);
    assert!(known_elapsed >= Duration::from_millis(150));
    assert!(unknown_elapsed >= Duration::from_millis(150));

    assert_eq!(harness.wait_for_reset_tokens(1).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn forgot_password_rejects_malformed_input() -> Result<()> {
    let harness = Harness::new()?;
    let (status, _, body) = harness
        .post_json("/auth/forgot-password", &json!({"email": "not-an-email"}), None)
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");

    let request = post("/auth/forgot-password").body(Body::from("{}"))?;
    let (status, _, _) = harness.send(request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn forgot_password_is_rate_limited() -> Result<()> {
    let config = config()
        .with_rate_limits(RateLimitSettings::default().with_override(
            RateLimitAction::ForgotPassword,
            2,
            Duration::from_secs(3600),
            Duration::from_secs(900),
        ));
    let harness = Harness::with_config(config)?;

    for _ in 0..2 {
        let (status, _, _) = harness
            .post_json("/auth/forgot-password", &json!({"email": "a@example.com"}), None)
            .await?;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, body) = harness
        .post_json("/auth/forgot-password", &json!({"email": "a@example.com"}), None)
        .await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "RATE_LIMITED");
    assert_eq!(
        headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
        Some("900")
    );
    assert_eq!(
        harness.audit.events_of(AuditEventType::RateLimited).await.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn forgot_password_without_peer_does_not_pool_clients() -> Result<()> {
    let config = config().with_rate_limits(RateLimitSettings::default().with_override(
        RateLimitAction::ForgotPassword,
        2,
        Duration::from_secs(3600),
        Duration::from_secs(900),
    ));
    let harness = Harness::with_config(config)?;

    for i in 0..10 {
        let (status, _, _) = harness
            .post_json_from(
                None,
                "/auth/forgot-password",
                &json!({"email": format!("attacker{i}@example.com")}),
                None,
            )
            .await?;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _, _) = harness
        .post_json_from(
            None,
            "/auth/forgot-password",
            &json!({"email": "innocent@example.com"}),
            None,
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(
        harness
            .audit
            .events_of(AuditEventType::RateLimited)
            .await
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn trusted_proxy_forwarded_for_identifies_client() -> Result<()> {
    let config = config()
        .with_trusted_proxies(1)
        .with_rate_limits(RateLimitSettings::default().with_override(
            RateLimitAction::ForgotPassword,
            2,
            Duration::from_secs(3600),
            Duration::from_secs(900),
        ));
    let harness = Harness::with_config(config)?;

    let forgot = |client: &'static str, email: String| {
        post("/auth/forgot-password")
            .header(CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", format!("6.6.6.6, {client}"))
            .body(Body::from(json!({"email": email}).to_string()))
    };

    for i in 0..2 {
        let (status, _, _) = harness
            .send(forgot("198.51.100.1", format!("user{i}@example.com"))?)
            .await?;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _, _) = harness
        .send(forgot("198.51.100.1", "user2@example.com".to_string())?)
        .await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    let (status, _, _) = harness
        .send(forgot("198.51.100.2", "user3@example.com".to_string())?)
        .await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn forgot_password_floor_below_minimum_is_refused() {
    assert!(Harness::with_config(config().with_forgot_password_floor(Duration::ZERO)).is_err());
    assert!(
        Harness::with_config(config().with_forgot_password_floor(Duration::from_millis(149)))
            .is_err()
    );
    assert!(
        Harness::with_config(config().with_forgot_password_floor(Duration::from_millis(150)))
            .is_ok()
    );
}

#[tokio::test]
async fn reset_password_round_trip_and_single_use() -> Result<()> {
    let harness = Harness::new()?;
    let user_id = harness.seed_account("bob@example.com", true).await?;

    harness
        .post_json("/auth/forgot-password", &json!({"email": "bob@example.com"}), None)
        .await?;
    let tokens = harness.wait_for_reset_tokens(1).await?;
    let reset_token = tokens.first().context("no token")?.clone();

    let csrf = harness.csrf_token().await?;
    let (status, _, body) = harness
        .post_json(
            "/auth/reset-password",
            &json!({"token": reset_token, "password": NEW_PASSWORD}),
            Some(&csrf),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(harness.store.unused_reset_tokens(user_id).await, 0);

    let (status, _, body) = harness
        .post_json(
            "/auth/reset-password",
            &json!({"token": reset_token, "password": NEW_PASSWORD}),
            Some(&csrf),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_TOKEN");

    let (status, _, _) = harness.login("bob@example.com", NEW_PASSWORD).await?;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn reset_password_reports_policy_errors() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("carol@example.com", true).await?;
    harness
        .post_json("/auth/forgot-password", &json!({"email": "carol@example.com"}), None)
        .await?;
    let tokens = harness.wait_for_reset_tokens(1).await?;

    let csrf = harness.csrf_token().await?;
    let (status, _, body) = harness
        .post_json(
            "/auth/reset-password",
            &json!({"token": tokens[0], "password": "short"}),
            Some(&csrf),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "WEAK_PASSWORD");
    let errors = body["errors"].as_array().context("missing errors")?;
    assert!(
        errors
            .iter()
            .any(|error| error == "Password must be at least 12 characters long")
    );
    Ok(())
}

#[tokio::test]
async fn login_errors_do_not_reveal_accounts() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("dave@example.com", true).await?;

    let wrong_password = harness.login("dave@example.com", "Not-The-Password-1").await?;
    let unknown = harness.login("erin@example.com", "Not-The-Password-1").await?;
    assert_eq!(wrong_password.0, StatusCode::BAD_REQUEST);
    assert_eq!(unknown.0, StatusCode::BAD_REQUEST);
    assert_eq!(wrong_password.2, unknown.2);
    assert_eq!(unknown.2["code"], "INVALID_CREDENTIALS");
    Ok(())
}

#[tokio::test]
async fn login_requires_verified_email() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("frank@example.com", false).await?;
    let (status, _, body) = harness.login("frank@example.com", PASSWORD).await?;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "EMAIL_NOT_VERIFIED");
    Ok(())
}

#[tokio::test]
async fn login_locks_out_after_repeated_failures() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("grace@example.com", true).await?;

    for _ in 0..5 {
        let (status, _, _) = harness.login("grace@example.com", "Wrong-Password-123").await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    let (status, headers, body) = harness.login("grace@example.com", PASSWORD).await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "ACCOUNT_LOCKED");
    assert_eq!(
        headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok()),
        Some("900")
    );
    assert_eq!(
        harness.audit.events_of(AuditEventType::AccountLocked).await.len(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn login_lockout_ignores_rotating_forwarded_for() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("kim@example.com", true).await?;

    let mut statuses = Vec::new();
    for i in 0..12 {
        let csrf = harness.csrf_token().await?;
        let request = post("/auth/login")
            .header(CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", format!("198.51.100.{i}"))
            .header(COOKIE, format!("csrf_token={csrf}"))
            .header("x-csrf-token", &csrf)
            .body(Body::from(
                json!({"email": "kim@example.com", "password": "Wrong-Password-123"}).to_string(),
            ))?;
        let (status, _, _) = harness.send(request).await?;
        statuses.push(status);
    }
    assert!(statuses[..5].iter().all(|s| *s == StatusCode::BAD_REQUEST));
    assert!(statuses[5..].iter().all(|s| *s == StatusCode::TOO_MANY_REQUESTS));
    Ok(())
}

#[tokio::test]
async fn login_lockout_survives_rotating_peers() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("lena@example.com", true).await?;

    for i in 0..5u8 {
        let peer = SocketAddr::from(([198, 51, 100, i], 50_000));
        let (status, _, _) = harness
            .login_from(Some(peer), "lena@example.com", "Wrong-Password-123")
            .await?;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
    let fresh_peer = SocketAddr::from(([192, 0, 2, 200], 50_000));
    let (status, _, body) = harness
        .login_from(Some(fresh_peer), "lena@example.com", PASSWORD)
        .await?;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "ACCOUNT_LOCKED");
    Ok(())
}

#[tokio::test]
async fn session_lifecycle() -> Result<()> {
    let harness = Harness::new()?;
    let user_id = harness.seed_account("heidi@example.com", true).await?;

    let (status, _, body) = harness.login("heidi@example.com", PASSWORD).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 900);
    let access = body["access_token"].as_str().context("access")?.to_string();
    let refresh = body["refresh_token"].as_str().context("refresh")?.to_string();

    let csrf = harness.csrf_token().await?;
    let (status, _, body) = harness
        .post_json("/auth/refresh", &json!({"refresh_token": refresh}), Some(&csrf))
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert!(body["access_token"].as_str().is_some_and(|t| !t.is_empty()));

    let request = get("/auth/sessions/suspicious")
        .header(AUTHORIZATION, format!("Bearer {access}"))
        .body(Body::empty())?;
    let (status, _, body) = harness.send(request).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["suspicious"], false);

    let request = post("/auth/logout-all")
        .header(AUTHORIZATION, format!("Bearer {access}"))
        .header(COOKIE, format!("csrf_token={csrf}"))
        .header("x-csrf-token", &csrf)
        .body(Body::empty())?;
    let (status, _, _) = harness.send(request).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(
        harness.audit.events_of(AuditEventType::AllSessionsRevoked).await[0].user_id,
        Some(user_id)
    );

    let (status, _, body) = harness
        .post_json("/auth/refresh", &json!({"refresh_token": refresh}), Some(&csrf))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
    Ok(())
}

#[tokio::test]
async fn refresh_from_another_client_revokes_session() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("ivan@example.com", true).await?;
    let (_, _, body) = harness.login("ivan@example.com", PASSWORD).await?;
    let refresh = body["refresh_token"].as_str().context("refresh")?.to_string();

    let csrf = harness.csrf_token().await?;
    let request = Request::post("/auth/refresh")
        .header(USER_AGENT, "some-other-browser/2.0")
        .header(CONTENT_TYPE, "application/json")
        .header(COOKIE, format!("csrf_token={csrf}"))
        .header("x-csrf-token", &csrf)
        .body(Body::from(json!({"refresh_token": refresh}).to_string()))?;
    let (status, _, _) = harness.send(request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Even the original client is locked out now.
    let (status, _, _) = harness
        .post_json("/auth/refresh", &json!({"refresh_token": refresh}), Some(&csrf))
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let failures = harness
        .audit
        .events_of(AuditEventType::SessionRefreshFailure)
        .await;
    assert_eq!(failures[0].reason.as_deref(), Some("client mismatch"));
    assert_eq!(failures[1].reason.as_deref(), Some("revoked"));
    Ok(())
}

#[tokio::test]
async fn logout_is_idempotent() -> Result<()> {
    let harness = Harness::new()?;
    harness.seed_account("judy@example.com", true).await?;
    let (_, _, body) = harness.login("judy@example.com", PASSWORD).await?;
    let refresh = body["refresh_token"].as_str().context("refresh")?.to_string();

    let csrf = harness.csrf_token().await?;
    for _ in 0..2 {
        let (status, _, _) = harness
            .post_json("/auth/logout", &json!({"refresh_token": refresh}), Some(&csrf))
            .await?;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (status, _, _) = harness
        .post_json("/auth/logout", &json!({"refresh_token": "unknown"}), Some(&csrf))
        .await?;
    assert_eq!(status, StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn protected_endpoints_require_bearer_token() -> Result<()> {
    let harness = Harness::new()?;
    let (status, _, body) = harness
        .send(get("/auth/sessions/suspicious").body(Body::empty())?)
        .await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let request = get("/auth/sessions/suspicious")
        .header(AUTHORIZATION, "Bearer not-a-jwt")
        .body(Body::empty())?;
    let (status, _, _) = harness.send(request).await?;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn health_reports_database_down() -> Result<()> {
    let harness = Harness::new()?;
    let (status, headers, body) = harness.send(get("/health").body(Body::empty())?).await?;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["database"], "error");
    assert!(headers.contains_key("x-app"));
    assert!(headers.contains_key("x-request-id"));
    Ok(())
}

#[test]
fn schema_declares_every_table() {
    let schema = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));
    for table in ["users", "password_reset_tokens", "user_sessions", "audit_events"] {
        assert!(
            schema.contains(&format!("CREATE TABLE IF NOT EXISTS {table} (")),
            "missing {table}"
        );
    }
}
