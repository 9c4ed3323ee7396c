//! Double-submit-cookie CSRF protection.
//!
//! The server sets a strict `HttpOnly` cookie plus a readable copy the frontend
//! echoes in `x-csrf-token`. A state-changing request is accepted only when the
//! header matches the strict cookie byte for byte.

use anyhow::Result;
use axum::http::{
    HeaderMap, HeaderValue,
    header::{COOKIE, InvalidHeaderValue, SET_COOKIE},
};

use super::crypto::{constant_time_eq, generate_token};
use super::error::AuthError;

pub const CSRF_COOKIE_NAME: &str = "csrf_token";
pub const CSRF_CLIENT_COOKIE_NAME: &str = "csrf_token_client";
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

const CSRF_COOKIE_MAX_AGE_SECONDS: u64 = 60 * 60;
const CSRF_CLIENT_COOKIE_MAX_AGE_SECONDS: u64 = 24 * 60 * 60;

pub const DEFAULT_PUBLIC_PATHS: [&str; 2] = ["/auth/register", "/auth/forgot-password"];

#[derive(Clone, Debug)]
pub struct CsrfGuard {
    secure: bool,
    public_paths: Vec<String>,
}

impl CsrfGuard {
    #[must_use]
    pub fn new(secure: bool, public_paths: Vec<String>) -> Self {
        Self {
            secure,
            public_paths,
        }
    }

    /// 256-bit random token, hex encoded.
    ///
    /// # Errors
    /// Returns an error if the OS random source fails.
    pub fn generate_token(&self) -> Result<String> {
        generate_token()
    }

    #[must_use]
    pub fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|public| public == path)
    }

    /// Append both CSRF cookies to `headers`.
    ///
    /// # Errors
    /// Returns an error if the token contains bytes not allowed in a header.
    pub fn set_token(&self, headers: &mut HeaderMap, token: &str) -> Result<(), InvalidHeaderValue> {
        headers.append(SET_COOKIE, self.cookie(token)?);
        headers.append(SET_COOKIE, self.client_cookie(token)?);
        Ok(())
    }

    fn cookie(&self, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie = format!(
            "{CSRF_COOKIE_NAME}={token}; Path=/; HttpOnly; SameSite=Strict; Max-Age={CSRF_COOKIE_MAX_AGE_SECONDS}"
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }

    // Readable by frontend scripts so they can echo it in the header.
    fn client_cookie(&self, token: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut cookie = format!(
            "{CSRF_CLIENT_COOKIE_NAME}={token}; Path=/; SameSite=Strict; Max-Age={CSRF_CLIENT_COOKIE_MAX_AGE_SECONDS}"
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        HeaderValue::from_str(&cookie)
    }

    /// # Errors
    /// Returns `AuthError::Forbidden` unless cookie and header are both present and equal.
    pub fn validate(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let cookie = cookie_value(headers, CSRF_COOKIE_NAME).ok_or(AuthError::Forbidden)?;
        let header = headers
            .get(CSRF_HEADER_NAME)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .ok_or(AuthError::Forbidden)?;
        if constant_time_eq(cookie.as_bytes(), header.as_bytes()) {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }

    #[must_use]
    pub fn has_token(&self, headers: &HeaderMap) -> bool {
        cookie_value(headers, CSRF_COOKIE_NAME).is_some()
    }
}

/// Read a cookie by name across every `Cookie` header.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
