//! Password strength policy.
//!
//! Every check runs independently so the caller gets the full list of problems
//! in one round trip. Strength is advisory and never gates validity.

use rand::{Rng, rngs::OsRng};
use serde::Serialize;
use utoipa::ToSchema;

pub const MIN_PASSWORD_LENGTH: usize = 12;
pub const MAX_PASSWORD_LENGTH: usize = 256;
pub const TEMPORARY_PASSWORD_LENGTH: usize = 16;

const SYMBOLS: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?`~";

const TEMPORARY_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*-_=+?";

// Matched case-insensitively against the whole candidate.
const COMMON_PASSWORDS: &[&str] = &[
    "123456789012",
    "1234567890123",
    "12345678901234",
    "123456123456",
    "111111111111",
    "000000000000",
    "password1234",
    "password12345",
    "password123456",
    "password123!",
    "password1234!",
    "passw0rd1234",
    "p@ssw0rd1234",
    "p@ssword1234",
    "qwertyuiop12",
    "qwertyuiop123",
    "qwerty123456",
    "qwertyqwerty",
    "1q2w3e4r5t6y",
    "1qaz2wsx3edc",
    "zaq12wsxcde3",
    "asdfghjkl123",
    "iloveyou1234",
    "letmein12345",
    "welcome12345",
    "welcome123456",
    "administrator",
    "administrator1",
    "changeme1234",
    "trustno1trustno1",
    "football1234",
    "baseball1234",
    "sunshine1234",
    "princess1234",
    "dragon123456",
    "monkey123456",
    "master123456",
    "superman1234",
    "starwars1234",
    "abc123456789",
    "abcdefghijkl",
    "abcd1234abcd",
    "correcthorsebatterystaple",
    "welcome2024!",
    "welcome2025!",
    "summer2024!!",
    "winter2024!!",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum PasswordStrength {
    Weak,
    Fair,
    Good,
    Strong,
}

impl PasswordStrength {
    fn from_score(score: u8) -> Self {
        match score {
            0..=2 => Self::Weak,
            3..=4 => Self::Fair,
            5..=6 => Self::Good,
            _ => Self::Strong,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct PasswordValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub strength: PasswordStrength,
}

#[must_use]
pub fn validate_password_strength(password: &str, email: Option<&str>) -> PasswordValidation {
    let length = password.chars().count();
    let has_upper = password.chars().any(char::is_uppercase);
    let has_lower = password.chars().any(char::is_lowercase);
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| SYMBOLS.contains(c));

    let mut errors = Vec::new();
    if length < MIN_PASSWORD_LENGTH {
        errors.push(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters long"
        ));
    }
    if length > MAX_PASSWORD_LENGTH {
        errors.push(format!(
            "Password must be at most {MAX_PASSWORD_LENGTH} characters long"
        ));
    }
    if !has_upper {
        errors.push("Password must contain at least one uppercase letter".to_string());
    }
    if !has_lower {
        errors.push("Password must contain at least one lowercase letter".to_string());
    }
    if !has_digit {
        errors.push("Password must contain at least one number".to_string());
    }
    if !has_symbol {
        errors.push("Password must contain at least one special character".to_string());
    }
    if is_common_password(password) {
        errors.push("Password is too common".to_string());
    }
    if email.is_some_and(|email| overlaps_email(password, email)) {
        errors.push("Password must not contain your email address".to_string());
    }

    let score = [
        length >= 12,
        length >= 16,
        length >= 20,
        has_upper,
        has_lower,
        has_digit,
        has_symbol,
    ]
    .into_iter()
    .map(u8::from)
    .sum();

    PasswordValidation {
        valid: errors.is_empty(),
        errors,
        strength: PasswordStrength::from_score(score),
    }
}

fn is_common_password(password: &str) -> bool {
    COMMON_PASSWORDS
        .iter()
        .any(|common| common.eq_ignore_ascii_case(password))
}

fn overlaps_email(password: &str, email: &str) -> bool {
    let local = email
        .split('@')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase();
    if local.is_empty() {
        return false;
    }
    let password = password.to_lowercase();
    password.contains(&local) || local.contains(&password)
}

/// A random password that satisfies the character-class rules.
#[must_use]
pub fn generate_temporary_password() -> String {
    loop {
        let candidate: String = (0..TEMPORARY_PASSWORD_LENGTH)
            .map(|_| char::from(TEMPORARY_ALPHABET[OsRng.gen_range(0..TEMPORARY_ALPHABET.len())]))
            .collect();
        if validate_password_strength(&candidate, None).valid {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_password_is_invalid() {
        let result = validate_password_strength("Ab1!", None);
        assert!(!result.valid);
        assert!(
            result
                .errors
                .iter()
                .any(|error| error.contains("at least 12"))
        );
    }

    #[test]
    fn overlong_password_is_invalid() {
        let password = format!("Aa1!{}", "x".repeat(MAX_PASSWORD_LENGTH));
        let result = validate_password_strength(&password, None);
        assert!(!result.valid);
        assert!(result.errors.iter().any(|error| error.contains("at most")));
    }

    #[test]
    fn email_local_part_is_rejected() {
        let result = validate_password_strength("Xalice-Strong-99!", Some("alice@example.com"));
        assert!(!result.valid);
        assert!(
            result
                .errors
                .contains(&"Password must not contain your email address".to_string())
        );

        let unrelated = validate_password_strength("Xbob-Strong-99!!", Some("alice@example.com"));
        assert!(unrelated.valid);
    }

    #[test]
    fn password_inside_local_part_is_rejected() {
        let result =
            validate_password_strength("Longname1!ab", Some("xxlongname1!abyy@example.com"));
        assert!(!result.valid);
    }

    #[test]
    fn common_password_is_rejected_case_insensitively() {
        let result = validate_password_strength("PASSWORD123!", None);
        assert!(result.errors.contains(&"Password is too common".to_string()));
    }

    #[test]
    fn errors_accumulate() {
        let result = validate_password_strength("short", None);
        // length, uppercase, digit, symbol
        assert_eq!(result.errors.len(), 4);
        assert_eq!(result.strength, PasswordStrength::Weak);
    }

    #[test]
    fn strength_scores() {
        assert_eq!(
            validate_password_strength("abcdefghijkl", None).strength,
            PasswordStrength::Weak
        );
        assert_eq!(
            validate_password_strength("Abcdefghijk1", None).strength,
            PasswordStrength::Fair
        );
        assert_eq!(
            validate_password_strength("Abcdefghij1!", None).strength,
            PasswordStrength::Good
        );
        assert_eq!(
            validate_password_strength("Abcdefghijklmnopqr1!", None).strength,
            PasswordStrength::Strong
        );
    }

    #[test]
    fn strength_does_not_gate_validity() {
        let result = validate_password_strength("Abcdefghij1!", None);
        assert!(result.valid);
        assert_eq!(result.strength, PasswordStrength::Good);
    }

    #[test]
    fn strength_serializes_lowercase() -> anyhow::Result<()> {
        let value = serde_json::to_value(PasswordStrength::Strong)?;
        assert_eq!(value, serde_json::json!("strong"));
        Ok(())
    }

    #[test]
    fn temporary_password_passes_policy() {
        for _ in 0..20 {
            let password = generate_temporary_password();
            assert_eq!(password.chars().count(), TEMPORARY_PASSWORD_LENGTH);
            assert!(validate_password_strength(&password, None).valid);
        }
    }
}
