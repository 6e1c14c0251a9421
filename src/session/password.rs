//! Password strength rules applied before any credential leaves the client.
//!
//! Rules run in a fixed order and short-circuit on the first failure, so a
//! caller always gets the single most actionable reason.

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

pub const MIN_LENGTH: usize = 8;

const PUNCTUATION: &str = "!@#$%^&*()_+-=[]{};':\",.<>/?\\|`~";

/// Passwords rejected regardless of composition, compared case-insensitively.
const COMMON_PASSWORDS: &[&str] = &[
    "password",
    "password1",
    "password1!",
    "p@ssw0rd",
    "p@ssword1",
    "12345678",
    "123456789",
    "qwerty123",
    "qwerty123!",
    "11111111",
    "sunshine",
    "princess",
    "football",
    "baseball",
    "welcome1",
    "welcome1!",
    "abc12345",
    "trustno1",
    "letmein1!",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PasswordIssue {
    #[error("must be at least {MIN_LENGTH} characters long")]
    TooShort,
    #[error("must contain an uppercase letter")]
    MissingUppercase,
    #[error("must contain a lowercase letter")]
    MissingLowercase,
    #[error("must contain a digit")]
    MissingDigit,
    #[error("must contain a punctuation character")]
    MissingPunctuation,
    #[error("is too easy to guess")]
    CommonPassword,
}

/// Validate `secret` against the policy. Pure; no I/O.
///
/// # Errors
/// Returns the first failing rule, in documented order: length, uppercase,
/// lowercase, digit, punctuation, denylist.
pub fn validate(secret: &SecretString) -> Result<(), PasswordIssue> {
    let password = secret.expose_secret();

    if password.chars().count() < MIN_LENGTH {
        return Err(PasswordIssue::TooShort);
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(PasswordIssue::MissingUppercase);
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        return Err(PasswordIssue::MissingLowercase);
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(PasswordIssue::MissingDigit);
    }
    if !password.chars().any(|c| PUNCTUATION.contains(c)) {
        return Err(PasswordIssue::MissingPunctuation);
    }
    if COMMON_PASSWORDS
        .iter()
        .any(|common| common.eq_ignore_ascii_case(password))
    {
        return Err(PasswordIssue::CommonPassword);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(password: &str) -> Result<(), PasswordIssue> {
        validate(&SecretString::from(password.to_string()))
    }

    #[test]
    fn accepts_conforming_password() {
        assert_eq!(check("Abc123!@"), Ok(()));
        assert_eq!(check("Str0ng-enough"), Ok(()));
    }

    #[test]
    fn rejects_with_first_failing_rule() {
        let table: &[(&str, PasswordIssue)] = &[
            ("Ab1!", PasswordIssue::TooShort),
            ("abcdef1!", PasswordIssue::MissingUppercase),
            ("ABCDEF1!", PasswordIssue::MissingLowercase),
            ("Abcdefg!", PasswordIssue::MissingDigit),
            ("Abcdefg1", PasswordIssue::MissingPunctuation),
        ];
        for (password, expected) in table {
            assert_eq!(check(password), Err(*expected), "password {password:?}");
        }
    }

    #[test]
    fn short_password_fails_on_length_before_anything_else() {
        // Missing every other rule too; length must win.
        assert_eq!(check("a"), Err(PasswordIssue::TooShort));
    }

    #[test]
    fn denylist_is_case_insensitive_and_runs_last() {
        assert_eq!(check("Password1!"), Err(PasswordIssue::CommonPassword));
        assert_eq!(check("WELCOME1!"), Err(PasswordIssue::MissingLowercase));
        assert_eq!(check("LetMeIn1!"), Err(PasswordIssue::CommonPassword));
    }
}
