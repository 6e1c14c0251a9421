//! Contracts for the remote collaborators the session core depends on.
//!
//! The core never talks HTTP itself; it sees the identity provider and the
//! profile store through these traits. The `http` module carries the
//! production adapters; tests substitute in-process fakes.

pub mod http;

use async_trait::async_trait;
use secrecy::SecretString;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::record::{ProfilePatch, UserProfile};

pub use http::{HttpIdentityProvider, HttpProfileStore};

/// A verified identity-provider session: who the credential belongs to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderSession {
    pub user_id: Uuid,
    pub email: String,
}

/// State-change notifications from the identity provider.
///
/// Delivery is at-least-once; ordering across kinds is not guaranteed and
/// consumers must not assume it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthNotification {
    SignedIn { user_id: Uuid, email: String },
    SignedOut,
    TokenRefreshed,
    UserUpdated,
    /// Notification kinds this build does not know about; logged and ignored.
    Other(String),
}

/// Typed surface of everything that can go wrong at the provider boundary.
///
/// Adapters classify raw responses into these kinds; message inspection
/// never happens past this boundary.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("identity not confirmed")]
    UnconfirmedIdentity,
    #[error("too many requests")]
    RateLimited,
    #[error("service unavailable")]
    Unavailable,
    /// The brief post-handshake window where a fresh credential is not yet
    /// visible to dependent reads. Recoverable by refresh-and-retry; the
    /// original message is kept so exhausted retries surface it unchanged.
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// External service performing credential verification and issuing,
/// refreshing, and revoking session credentials.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(
        &self,
        identity: &str,
        secret: &SecretString,
    ) -> Result<ProviderSession, ProviderError>;

    /// An existing external session, if the provider still holds one
    /// (e.g. after a reset link or a previous run left a valid credential).
    async fn ambient_session(&self) -> Result<Option<ProviderSession>, ProviderError>;

    async fn refresh_credential(&self) -> Result<(), ProviderError>;

    async fn sign_out(&self) -> Result<(), ProviderError>;

    async fn update_credential(&self, new_secret: &SecretString) -> Result<(), ProviderError>;

    async fn request_password_reset(
        &self,
        identity: &str,
        return_target: &str,
    ) -> Result<(), ProviderError>;

    /// Resolve a recovery token from a reset link into a session.
    async fn exchange_recovery_token(&self, token: &str)
        -> Result<ProviderSession, ProviderError>;

    /// Subscribe to state-change notifications. Every call returns a fresh
    /// receiver; the session core subscribes exactly once.
    fn subscribe(&self) -> broadcast::Receiver<AuthNotification>;
}

/// Remote store of user-facing attributes, keyed by the identity
/// provider's user id.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn read_profile(&self, user_id: Uuid) -> Result<UserProfile, ProviderError>;

    async fn write_profile(
        &self,
        user_id: Uuid,
        patch: &ProfilePatch,
    ) -> Result<(), ProviderError>;
}
