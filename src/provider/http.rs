//! HTTP adapters for the identity provider and the profile store.
//!
//! This is the only place raw provider responses are inspected; everything
//! past this file sees the typed `ProviderError` kinds. The transient
//! signature (a not-found-shaped read immediately after a fresh credential
//! exchange) is classified here from a small fixed token set.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info_span, Instrument};
use url::Url;
use uuid::Uuid;

use super::{AuthNotification, IdentityProvider, ProfileStore, ProviderError, ProviderSession};
use crate::session::record::{ProfilePatch, UserProfile};

static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Notification fan-out capacity; consumers are fast, this only buffers
/// bursts.
const NOTIFICATION_CAPACITY: usize = 32;

/// Message fragments marking the post-handshake window where a fresh
/// credential is not yet visible to dependent reads.
const TRANSIENT_TOKENS: &[&str] = &["404", "not found", "no rows", "jwt expired", "jwserror"];

/// Normalize `base` and join `path`, defaulting the port from the scheme.
///
/// # Errors
/// Fails on an unparsable URL, a missing host, or an unsupported scheme.
pub fn endpoint_url(base: &str, path: &str) -> Result<String, ProviderError> {
    let url = Url::parse(base).map_err(|err| ProviderError::Other(err.to_string()))?;

    let scheme = url.scheme();
    let host = url
        .host()
        .ok_or_else(|| ProviderError::Other("no host in backend URL".to_string()))?
        .to_owned();
    let port = match url.port() {
        Some(p) => p,
        None => match scheme {
            "http" => 80,
            "https" => 443,
            _ => {
                return Err(ProviderError::Other(format!(
                    "unsupported scheme {scheme}"
                )))
            }
        },
    };

    Ok(format!("{scheme}://{host}:{port}{path}"))
}

fn build_client() -> Result<Client, ProviderError> {
    Client::builder()
        .user_agent(APP_USER_AGENT)
        .build()
        .map_err(|err| ProviderError::Other(err.to_string()))
}

/// Pull the human-readable message out of the provider's varied error
/// body shapes.
fn error_message(body: &Value) -> &str {
    body.get("error_description")
        .and_then(Value::as_str)
        .or_else(|| body.get("msg").and_then(Value::as_str))
        .or_else(|| body.get("message").and_then(Value::as_str))
        .or_else(|| body.get("error").and_then(Value::as_str))
        .unwrap_or("")
}

/// Classify an auth-endpoint failure into the typed taxonomy.
fn classify_auth_failure(status: StatusCode, message: &str) -> ProviderError {
    let lowered = message.to_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS || lowered.contains("rate limit") {
        return ProviderError::RateLimited;
    }
    if status.is_server_error() {
        return ProviderError::Unavailable;
    }
    if lowered.contains("invalid login credentials") || lowered.contains("invalid grant") {
        return ProviderError::InvalidCredentials;
    }
    if lowered.contains("not confirmed") {
        return ProviderError::UnconfirmedIdentity;
    }
    ProviderError::Other(message.to_string())
}

/// Classify a read failure, watching for the transient post-handshake
/// signature first.
fn classify_read_failure(status: StatusCode, message: &str) -> ProviderError {
    let lowered = message.to_lowercase();
    if status == StatusCode::NOT_FOUND
        || status == StatusCode::NOT_ACCEPTABLE
        || TRANSIENT_TOKENS.iter().any(|token| lowered.contains(token))
    {
        let detail = if message.is_empty() {
            format!("{status}")
        } else {
            message.to_string()
        };
        return ProviderError::Transient(detail);
    }
    classify_auth_failure(status, message)
}

fn transport_error(err: &reqwest::Error) -> ProviderError {
    if err.is_connect() || err.is_timeout() {
        ProviderError::Unavailable
    } else {
        ProviderError::Other(err.to_string())
    }
}

fn parse_session(body: &Value) -> Result<ProviderSession, ProviderError> {
    let user = body.get("user").unwrap_or(body);
    let id = user
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Other("no user id in session payload".to_string()))?;
    let user_id =
        Uuid::parse_str(id).map_err(|err| ProviderError::Other(format!("bad user id: {err}")))?;
    let email = user
        .get("email")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Other("no email in session payload".to_string()))?
        .to_string();

    Ok(ProviderSession { user_id, email })
}

/// Identity-provider adapter over the backend's auth REST surface.
///
/// Holds the current access/refresh credential pair and fans state-change
/// notifications out to subscribers.
pub struct HttpIdentityProvider {
    base_url: String,
    api_key: SecretString,
    client: Client,
    access_token: RwLock<Option<SecretString>>,
    refresh_token: RwLock<Option<SecretString>>,
    events: broadcast::Sender<AuthNotification>,
}

impl HttpIdentityProvider {
    /// # Errors
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(base_url: impl Into<String>, api_key: SecretString) -> anyhow::Result<Self> {
        let (events, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            client: build_client().map_err(|err| anyhow::anyhow!("{err}"))?,
            access_token: RwLock::new(None),
            refresh_token: RwLock::new(None),
            events,
        })
    }

    fn endpoint(&self, path: &str) -> Result<String, ProviderError> {
        endpoint_url(&self.base_url, path)
    }

    /// Current access credential, if a session is held.
    pub(crate) fn bearer(&self) -> Option<SecretString> {
        self.access_token
            .read()
            .expect("credential lock poisoned")
            .clone()
    }

    fn store_tokens(&self, body: &Value) {
        let access = body.get("access_token").and_then(Value::as_str);
        let refresh = body.get("refresh_token").and_then(Value::as_str);
        if let Some(token) = access {
            *self.access_token.write().expect("credential lock poisoned") =
                Some(SecretString::from(token.to_string()));
        }
        if let Some(token) = refresh {
            *self.refresh_token.write().expect("credential lock poisoned") =
                Some(SecretString::from(token.to_string()));
        }
    }

    fn drop_tokens(&self) {
        *self.access_token.write().expect("credential lock poisoned") = None;
        *self.refresh_token.write().expect("credential lock poisoned") = None;
    }

    fn notify(&self, notification: AuthNotification) {
        // No subscribers is fine; the send only fails then.
        let _ = self.events.send(notification);
    }

    /// POST to the token endpoint and absorb the returned credential pair.
    async fn token_exchange(
        &self,
        grant_type: &str,
        payload: Value,
    ) -> Result<ProviderSession, ProviderError> {
        let url = self.endpoint(&format!("/auth/v1/token?grant_type={grant_type}"))?;

        let span = info_span!("auth.token", http.method = "POST", url = %url);
        let response = self
            .client
            .post(&url)
            .header("apikey", self.api_key.expose_secret())
            .json(&payload)
            .send()
            .instrument(span)
            .await
            .map_err(|err| transport_error(&err))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_auth_failure(status, error_message(&body)));
        }

        self.store_tokens(&body);
        parse_session(&body)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn authenticate(
        &self,
        identity: &str,
        secret: &SecretString,
    ) -> Result<ProviderSession, ProviderError> {
        let session = self
            .token_exchange(
                "password",
                json!({ "email": identity, "password": secret.expose_secret() }),
            )
            .await?;
        self.notify(AuthNotification::SignedIn {
            user_id: session.user_id,
            email: session.email.clone(),
        });
        Ok(session)
    }

    async fn ambient_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
        let Some(bearer) = self.bearer() else {
            return Ok(None);
        };
        let url = self.endpoint("/auth/v1/user")?;

        let span = info_span!("auth.user", http.method = "GET", url = %url);
        let response = self
            .client
            .get(&url)
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(bearer.expose_secret())
            .send()
            .instrument(span)
            .await
            .map_err(|err| transport_error(&err))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Ok(None);
        }
        let body: Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_auth_failure(status, error_message(&body)));
        }

        parse_session(&body).map(Some)
    }

    async fn refresh_credential(&self) -> Result<(), ProviderError> {
        let refresh = self
            .refresh_token
            .read()
            .expect("credential lock poisoned")
            .clone()
            .ok_or_else(|| ProviderError::Other("no refresh credential held".to_string()))?;

        self.token_exchange(
            "refresh_token",
            json!({ "refresh_token": refresh.expose_secret() }),
        )
        .await?;
        self.notify(AuthNotification::TokenRefreshed);
        Ok(())
    }

    async fn sign_out(&self) -> Result<(), ProviderError> {
        let bearer = self.bearer();
        // The local credential is dropped no matter what the backend says.
        self.drop_tokens();
        self.notify(AuthNotification::SignedOut);

        let Some(bearer) = bearer else {
            return Ok(());
        };
        let url = self.endpoint("/auth/v1/logout")?;

        let span = info_span!("auth.logout", http.method = "POST", url = %url);
        let response = self
            .client
            .post(&url)
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(bearer.expose_secret())
            .send()
            .instrument(span)
            .await
            .map_err(|err| transport_error(&err))?;

        if !response.status().is_success() {
            debug!("provider logout returned {}", response.status());
        }
        Ok(())
    }

    async fn update_credential(&self, new_secret: &SecretString) -> Result<(), ProviderError> {
        let bearer = self
            .bearer()
            .ok_or_else(|| ProviderError::Other("no credential held".to_string()))?;
        let url = self.endpoint("/auth/v1/user")?;

        let span = info_span!("auth.update_user", http.method = "PUT", url = %url);
        let response = self
            .client
            .put(&url)
            .header("apikey", self.api_key.expose_secret())
            .bearer_auth(bearer.expose_secret())
            .json(&json!({ "password": new_secret.expose_secret() }))
            .send()
            .instrument(span)
            .await
            .map_err(|err| transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or_default();
            return Err(classify_auth_failure(status, error_message(&body)));
        }
        self.notify(AuthNotification::UserUpdated);
        Ok(())
    }

    async fn request_password_reset(
        &self,
        identity: &str,
        return_target: &str,
    ) -> Result<(), ProviderError> {
        let url = self.endpoint("/auth/v1/recover")?;

        let span = info_span!("auth.recover", http.method = "POST", url = %url);
        let response = self
            .client
            .post(&url)
            .header("apikey", self.api_key.expose_secret())
            .json(&json!({ "email": identity, "redirect_to": return_target }))
            .send()
            .instrument(span)
            .await
            .map_err(|err| transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or_default();
            return Err(classify_auth_failure(status, error_message(&body)));
        }
        Ok(())
    }

    async fn exchange_recovery_token(
        &self,
        token: &str,
    ) -> Result<ProviderSession, ProviderError> {
        let url = self.endpoint("/auth/v1/verify")?;

        let span = info_span!("auth.verify", http.method = "POST", url = %url);
        let response = self
            .client
            .post(&url)
            .header("apikey", self.api_key.expose_secret())
            .json(&json!({ "type": "recovery", "token": token }))
            .send()
            .instrument(span)
            .await
            .map_err(|err| transport_error(&err))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_auth_failure(status, error_message(&body)));
        }

        self.store_tokens(&body);
        parse_session(&body)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthNotification> {
        self.events.subscribe()
    }
}

/// Profile-store adapter over the backend's row REST surface.
pub struct HttpProfileStore {
    base_url: String,
    api_key: SecretString,
    client: Client,
    credentials: Arc<HttpIdentityProvider>,
}

impl HttpProfileStore {
    /// # Errors
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(
        base_url: impl Into<String>,
        api_key: SecretString,
        credentials: Arc<HttpIdentityProvider>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            base_url: base_url.into(),
            api_key,
            client: build_client().map_err(|err| anyhow::anyhow!("{err}"))?,
            credentials,
        })
    }

    fn row_url(&self, user_id: Uuid) -> Result<String, ProviderError> {
        endpoint_url(&self.base_url, &format!("/rest/v1/profiles?id=eq.{user_id}"))
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("apikey", self.api_key.expose_secret());
        match self.credentials.bearer() {
            Some(bearer) => request.bearer_auth(bearer.expose_secret()),
            None => request,
        }
    }
}

#[async_trait]
impl ProfileStore for HttpProfileStore {
    async fn read_profile(&self, user_id: Uuid) -> Result<UserProfile, ProviderError> {
        let url = self.row_url(user_id)?;

        let span = info_span!("profiles.read", http.method = "GET", url = %url);
        let response = self
            .authed(self.client.get(&url))
            // Single-object response; no rows comes back as an error body.
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .instrument(span)
            .await
            .map_err(|err| transport_error(&err))?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_read_failure(status, error_message(&body)));
        }

        serde_json::from_value(body)
            .map_err(|err| ProviderError::Other(format!("bad profile row: {err}")))
    }

    async fn write_profile(
        &self,
        user_id: Uuid,
        patch: &ProfilePatch,
    ) -> Result<(), ProviderError> {
        let url = self.row_url(user_id)?;

        let span = info_span!("profiles.write", http.method = "PATCH", url = %url);
        let response = self
            .authed(self.client.patch(&url))
            .json(patch)
            .send()
            .instrument(span)
            .await
            .map_err(|err| transport_error(&err))?;

        let status = response.status();
        if !status.is_success() {
            let body: Value = response.json().await.unwrap_or_default();
            return Err(classify_read_failure(status, error_message(&body)));
        }
        Ok(())
    }
}
