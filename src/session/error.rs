//! User-facing error taxonomy for the session operations.

use thiserror::Error;

use super::password::PasswordIssue;
use crate::provider::ProviderError;

/// Every public session operation resolves its failures into one of these
/// kinds before returning; raw provider errors never reach the caller.
/// `Display` carries the message the UI renders.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("this account's email address has not been confirmed yet")]
    UnconfirmedIdentity,
    #[error("too many attempts, please try again later")]
    RateLimited,
    #[error("password {0}")]
    WeakPassword(PasswordIssue),
    #[error("administrative accounts are managed out of band")]
    AdminRestricted,
    #[error("the service is temporarily unavailable, please try again")]
    ServiceUnavailable,
    #[error("you need to be signed in to do that")]
    Unauthenticated,
    #[error("{0}")]
    Unknown(String),
}

impl From<ProviderError> for AuthError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCredentials => Self::InvalidCredentials,
            ProviderError::UnconfirmedIdentity => Self::UnconfirmedIdentity,
            ProviderError::RateLimited => Self::RateLimited,
            ProviderError::Unavailable => Self::ServiceUnavailable,
            // Transient errors are absorbed by the retry wrapper; one that
            // survives exhausted retries surfaces with its original message.
            ProviderError::Transient(message) | ProviderError::Other(message) => {
                Self::Unknown(message)
            }
        }
    }
}

impl From<PasswordIssue> for AuthError {
    fn from(issue: PasswordIssue) -> Self {
        Self::WeakPassword(issue)
    }
}
