//! Auth endpoints.
//!
//! Every state-changing route sits behind [`csrf::csrf_protect`]. Handlers
//! apply their rate limit before touching the datastore and return
//! [`crate::auth::AuthError`], which renders as `{success, code, message, errors?}`.
//!
//! ## Rate limit keys
//!
//! - `forgot-password`: client IP, then normalized email.
//! - `reset-password`, `refresh`: client IP.
//! - `login`: `{ip}:{email}`; cleared on success, lockout answered as `ACCOUNT_LOCKED`.

pub(crate) mod csrf;
pub(crate) mod login;
pub(crate) mod password_reset;
pub(crate) mod session;
pub(crate) mod types;
mod utils;

pub use csrf::csrf_protect;
