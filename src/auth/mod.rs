//! Credential lifecycle and abuse resistance.
//!
//! Request path: CSRF guard, then rate limiter, then the flow itself (reset
//! tokens, sessions, password policy). Every rejection is routed through the
//! [`report::SecurityReporter`] so clients only ever see a code and a fixed
//! message while full context lands in the logs and the audit sink.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod csrf;
pub mod email;
pub mod error;
pub mod password;
pub mod rate_limit;
pub mod report;
pub mod reset;
pub mod session;
pub mod state;
pub mod store;

pub use config::AuthConfig;
pub use error::{AuthError, ErrorCode};
pub use report::RequestContext;
pub use state::{AuthBackends, AuthState};
