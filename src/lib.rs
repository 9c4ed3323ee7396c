//! # Custodia
//!
//! Credential lifecycle and abuse resistance for a password-based web
//! application: password reset with single-use tokens, login with lockout,
//! refresh-token sessions bound to the client, CSRF double-submit protection
//! and a rate limiter shared by every flow.
//!
//! ## Error surface
//!
//! Clients only ever see a code and a fixed message. Unknown accounts and
//! wrong passwords share `INVALID_CREDENTIALS`, and forgot-password answers
//! the same way (after the same minimum delay) whether or not the account
//! exists. Full context is written to the logs with masked identifiers and
//! to the audit sink.
//!
//! ## Storage
//!
//! Reset tokens and refresh tokens are stored as SHA-256 hashes only. See
//! `sql/schema.sql` for the expected Postgres layout.

pub mod api;
pub mod auth;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
