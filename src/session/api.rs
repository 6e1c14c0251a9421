//! Public surface of the session core: the operations the dashboard calls
//! and the read model it renders from.

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::SecretString;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::AuthError;
use super::events::{self, ManualLogoutFlag, ProcessGuards};
use super::password;
use super::rate_limit::{RateLimitQuota, SlidingWindowLimiter};
use super::record::{ProfilePatch, SessionRecord, UserProfile};
use super::refresh::{self, EnvSignal, RefreshConfig};
use super::retry::{retry_with_refresh, RetryPlan};
use super::store::SessionStore;
use crate::provider::{IdentityProvider, ProfileStore, ProviderError};
use crate::storage::KeyValueStore;

const IDENTITY_HINT_KEY: &str = "hint:identity";
const LOGIN_OP: &str = "login";
const FORGOT_PASSWORD_OP: &str = "forgot_password";

const RESET_ACK: &str =
    "If an account exists for that address, a password reset link has been sent.";

/// Navigable surfaces the session core needs to tell apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    Login,
    Dashboard,
    Other,
}

/// Navigation collaborator. The terminal session phase is the contract the
/// UI must check before painting protected views; the hard redirect on top
/// of it closes the window where a stale frame could still be visible.
pub trait Navigator: Send + Sync {
    fn current_surface(&self) -> Surface;
    fn hard_redirect(&self, surface: Surface);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionPhase {
    Starting,
    Ready,
    /// A user-initiated sign-out has begun. Terminal: no protected view
    /// may render once this is observed.
    Terminated,
}

/// The read model published to the dashboard on every state change.
#[derive(Clone, Debug)]
pub struct SessionSnapshot {
    pub user: Option<UserProfile>,
    pub phase: SessionPhase,
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub is_data_loading: bool,
    pub is_data_stale: bool,
    pub error: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            user: None,
            phase: SessionPhase::Starting,
            is_authenticated: false,
            is_loading: true,
            is_data_loading: false,
            is_data_stale: false,
            error: None,
        }
    }
}

const DEFAULT_ADMIN_IDENTITIES: &str = r"(?i)^admin@pumpguard\.com$|@pumpguard\.internal$";

/// Tunables for the session core, with production defaults.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub login_quota: RateLimitQuota,
    pub forgot_quota: RateLimitQuota,
    pub retry: RetryPlan,
    pub refresh: RefreshConfig,
    /// Identities whose credentials are managed out of band.
    pub admin_identities: Regex,
    /// Where the provider's reset email should send the user back to.
    pub reset_return_target: String,
    /// How long the "session expired" notice gets to render before the
    /// redirect to the login surface.
    pub expired_notice_delay: Duration,
    /// How long a manual sign-out suppresses provider notifications.
    pub logout_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_quota: RateLimitQuota::default(),
            forgot_quota: RateLimitQuota::default(),
            retry: RetryPlan::default(),
            refresh: RefreshConfig::default(),
            admin_identities: Regex::new(DEFAULT_ADMIN_IDENTITIES)
                .expect("default admin pattern is valid"),
            reset_return_target: "https://app.pumpguard.com/reset-password".to_string(),
            expired_notice_delay: Duration::from_millis(250),
            logout_grace: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn with_login_quota(mut self, quota: RateLimitQuota) -> Self {
        self.login_quota = quota;
        self
    }

    #[must_use]
    pub fn with_forgot_quota(mut self, quota: RateLimitQuota) -> Self {
        self.forgot_quota = quota;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, plan: RetryPlan) -> Self {
        self.retry = plan;
        self
    }

    #[must_use]
    pub fn with_refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    #[must_use]
    pub fn with_admin_identities(mut self, pattern: Regex) -> Self {
        self.admin_identities = pattern;
        self
    }

    #[must_use]
    pub fn with_reset_return_target(mut self, target: String) -> Self {
        self.reset_return_target = target;
        self
    }

    #[must_use]
    pub fn with_expired_notice_delay(mut self, delay: Duration) -> Self {
        self.expired_notice_delay = delay;
        self
    }

    #[must_use]
    pub fn with_logout_grace(mut self, grace: Duration) -> Self {
        self.logout_grace = grace;
        self
    }

    pub(crate) fn is_admin_identity(&self, identity: &str) -> bool {
        self.admin_identities.is_match(identity)
    }
}

/// Shared state behind the service handle; the bootstrap and notification
/// code in `events` drives the same struct.
pub(crate) struct SessionInner {
    pub(crate) provider: Arc<dyn IdentityProvider>,
    pub(crate) profiles: Arc<dyn ProfileStore>,
    pub(crate) store: SessionStore,
    pub(crate) durable: Arc<dyn KeyValueStore>,
    pub(crate) limiter: SlidingWindowLimiter,
    pub(crate) navigator: Arc<dyn Navigator>,
    pub(crate) env_signals: broadcast::Sender<EnvSignal>,
    pub(crate) config: SessionConfig,
    pub(crate) guards: ProcessGuards,
    pub(crate) logout_flag: ManualLogoutFlag,
    pub(crate) snapshot: watch::Sender<SessionSnapshot>,
    pub(crate) data_refresh_inflight: AtomicBool,
    pub(crate) last_token_refresh: Mutex<Option<DateTime<Utc>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionInner {
    pub(crate) fn publish(&self, f: impl FnOnce(&mut SessionSnapshot)) {
        self.snapshot.send_modify(f);
    }

    /// Publish `Ready` with (or without) an authenticated user.
    pub(crate) fn publish_record(&self, record: Option<&SessionRecord>) {
        self.publish(|s| {
            s.user = record.map(|r| r.user.clone());
            s.is_authenticated = record.is_some();
            s.is_loading = false;
            s.phase = SessionPhase::Ready;
        });
    }

    pub(crate) fn cache_identity_hint(&self, identity: &str) {
        if let Err(err) = self.durable.put(IDENTITY_HINT_KEY, identity) {
            warn!("cannot cache identity hint: {err}");
        }
    }

    pub(crate) fn clear_identity_hint(&self) {
        if let Err(err) = self.durable.remove(IDENTITY_HINT_KEY) {
            warn!("cannot clear identity hint: {err}");
        }
    }

    /// Profile read wrapped in the refresh-and-retry shim for the
    /// post-handshake visibility window.
    pub(crate) async fn fetch_profile(&self, user_id: Uuid) -> Result<UserProfile, ProviderError> {
        retry_with_refresh(
            &self.config.retry,
            || self.profiles.read_profile(user_id),
            || self.provider.refresh_credential(),
        )
        .await
    }

    /// Sign out at the provider while the manual-logout marker suppresses
    /// the notification this will echo back; the marker is released after
    /// the grace window.
    pub(crate) async fn sign_out_suppressed(&self) {
        self.logout_flag.set();
        if let Err(err) = self.provider.sign_out().await {
            // Best effort: a failed provider sign-out never blocks the
            // local teardown.
            warn!("provider sign-out failed: {err}");
        }
        let flag = self.logout_flag.clone();
        let grace = self.config.logout_grace;
        tokio::spawn(async move {
            sleep(grace).await;
            flag.clear();
        });
    }
}

/// The session lifecycle service. Constructed once by the composition
/// root; cloning the handle shares the same underlying state.
#[derive(Clone)]
pub struct SessionService {
    inner: Arc<SessionInner>,
}

impl SessionService {
    #[must_use]
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        profiles: Arc<dyn ProfileStore>,
        scoped: Arc<dyn KeyValueStore>,
        durable: Arc<dyn KeyValueStore>,
        navigator: Arc<dyn Navigator>,
        env_signals: broadcast::Sender<EnvSignal>,
        config: SessionConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let logout_flag = ManualLogoutFlag::new(Arc::clone(&durable), config.logout_grace);
        let limiter = SlidingWindowLimiter::new(Arc::clone(&durable));
        let store = SessionStore::new(scoped);

        Self {
            inner: Arc::new(SessionInner {
                provider,
                profiles,
                store,
                durable,
                limiter,
                navigator,
                env_signals,
                config,
                guards: ProcessGuards::default(),
                logout_flag,
                snapshot,
                data_refresh_inflight: AtomicBool::new(false),
                last_token_refresh: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Idempotent startup. The first call reconciles the session sources
    /// and installs the notification consumer and the refresh scheduler;
    /// every later call only clears the loading flag.
    pub async fn ensure_started(&self) {
        let inner = &self.inner;

        if inner.guards.begin_init() {
            // A marker left over from a previous process must not eat the
            // first real notification of this one.
            inner.logout_flag.clear();
            events::bootstrap(inner).await;
        } else {
            inner.publish(|s| s.is_loading = false);
        }

        if inner.guards.begin_listener() {
            let notifications = inner.provider.subscribe();
            let handle = tokio::spawn(events::watch_notifications(
                Arc::clone(inner),
                notifications,
            ));
            self.track(handle);
        }

        if inner.guards.begin_refresh_install() {
            let handle = refresh::install(
                Arc::clone(&inner.provider),
                inner.env_signals.subscribe(),
                inner.config.refresh,
            );
            self.track(handle);
        }
    }

    /// Tear down background tasks. Process teardown only.
    pub fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().expect("task list lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.inner
            .tasks
            .lock()
            .expect("task list lock poisoned")
            .push(handle);
    }

    /// Authenticate and establish the local session.
    ///
    /// # Errors
    /// `RateLimited` when the attempt window is exhausted (checked before
    /// the secret is even looked at), `InvalidCredentials` /
    /// `UnconfirmedIdentity` mapped from the provider, `Unknown` otherwise.
    /// On any failure the cached session is left untouched.
    #[instrument(skip_all)]
    pub async fn login(
        &self,
        identity: &str,
        secret: &SecretString,
    ) -> Result<SessionRecord, AuthError> {
        let inner = &self.inner;
        let identity = sanitize_identity(identity);

        if !valid_identity(&identity) {
            return Err(AuthError::InvalidCredentials);
        }
        if !inner
            .limiter
            .check(LOGIN_OP, &identity, &inner.config.login_quota)
        {
            return Err(AuthError::RateLimited);
        }

        let session = inner.provider.authenticate(&identity, secret).await?;
        let profile = inner.fetch_profile(session.user_id).await?;

        let record = SessionRecord::new(profile);
        inner.store.set(Some(record.clone()));
        inner.cache_identity_hint(&identity);
        inner.limiter.clear(LOGIN_OP, &identity);
        inner.publish_record(Some(&record));

        info!("session established for {}", record.session_id);
        Ok(record)
    }

    /// Tear down the session. Infallible by design: every step is best
    /// effort, and the terminal phase is entered before any I/O so no
    /// authenticated view can paint after the intent is expressed.
    #[instrument(skip_all)]
    pub async fn logout(&self) {
        let inner = &self.inner;

        // The marker goes first: it closes the race against the
        // notification loop before anything observable changes.
        inner.logout_flag.set();
        inner.publish(|s| {
            s.phase = SessionPhase::Terminated;
            s.user = None;
            s.is_authenticated = false;
            s.error = None;
        });

        let identity = inner.store.get().map(|r| sanitize_identity(&r.user.email));
        inner.store.set(None);
        inner.clear_identity_hint();
        if let Some(identity) = identity {
            inner.limiter.clear(LOGIN_OP, &identity);
            inner.limiter.clear(FORGOT_PASSWORD_OP, &identity);
        }

        inner.sign_out_suppressed().await;
        inner.navigator.hard_redirect(Surface::Login);
    }

    /// Request a password reset email.
    ///
    /// Administrative identities get the same acknowledgement without any
    /// provider call: their credentials are reset out of band, and the
    /// response must not disclose whether the account exists.
    ///
    /// # Errors
    /// `RateLimited`, or the mapped provider error for non-admin identities.
    #[instrument(skip_all)]
    pub async fn forgot_password(&self, identity: &str) -> Result<String, AuthError> {
        let inner = &self.inner;
        let identity = sanitize_identity(identity);

        if !inner
            .limiter
            .check(FORGOT_PASSWORD_OP, &identity, &inner.config.forgot_quota)
        {
            return Err(AuthError::RateLimited);
        }

        if inner.config.is_admin_identity(&identity) {
            info!("reset request for administrative identity answered locally");
            return Ok(RESET_ACK.to_string());
        }

        inner
            .provider
            .request_password_reset(&identity, &inner.config.reset_return_target)
            .await?;
        Ok(RESET_ACK.to_string())
    }

    /// Set a new password from a recovery token, or from the ambient
    /// session a reset link established when no token is supplied.
    ///
    /// # Errors
    /// `WeakPassword`, `Unauthenticated` when no identity can be resolved,
    /// `AdminRestricted` for administrative identities, or the mapped
    /// provider error.
    #[instrument(skip_all)]
    pub async fn reset_password(
        &self,
        recovery_token: Option<&str>,
        new_secret: &SecretString,
    ) -> Result<(), AuthError> {
        let inner = &self.inner;

        password::validate(new_secret)?;

        let session = match recovery_token {
            Some(token) => inner.provider.exchange_recovery_token(token).await?,
            None => inner
                .provider
                .ambient_session()
                .await?
                .ok_or(AuthError::Unauthenticated)?,
        };

        if inner.config.is_admin_identity(&sanitize_identity(&session.email)) {
            return Err(AuthError::AdminRestricted);
        }

        inner.provider.update_credential(new_secret).await?;

        let patch = ProfilePatch {
            password_changed_at: Some(Utc::now()),
            ..ProfilePatch::default()
        };
        if let Err(err) = inner.profiles.write_profile(session.user_id, &patch).await {
            warn!("could not stamp password change: {err}");
        }

        // Force a clean slate so the next login runs on the new secret.
        inner.sign_out_suppressed().await;
        inner.store.set(None);
        inner.publish_record(None);
        Ok(())
    }

    /// Change the password of the signed-in user, verifying the current
    /// secret by re-authenticating first.
    ///
    /// # Errors
    /// `Unauthenticated` without a session, `WeakPassword`,
    /// `InvalidCredentials` when the current secret does not match, or the
    /// mapped provider error.
    #[instrument(skip_all)]
    pub async fn change_password(
        &self,
        current: &SecretString,
        new_secret: &SecretString,
    ) -> Result<(), AuthError> {
        let inner = &self.inner;
        let record = inner
            .store
            .get()
            .filter(|r| r.is_authenticated)
            .ok_or(AuthError::Unauthenticated)?;

        password::validate(new_secret)?;

        inner
            .provider
            .authenticate(&record.user.email, current)
            .await
            .map_err(|err| match err {
                ProviderError::InvalidCredentials => AuthError::InvalidCredentials,
                other => AuthError::from(other),
            })?;

        inner.provider.update_credential(new_secret).await?;

        let stamped_at = Utc::now();
        let patch = ProfilePatch {
            password_changed_at: Some(stamped_at),
            ..ProfilePatch::default()
        };
        inner
            .profiles
            .write_profile(record.user.id, &patch)
            .await?;

        inner.store.update(|current| {
            current.map(|mut r| {
                let mut user = r.user.clone();
                user.password_changed_at = Some(stamped_at);
                r.user = user;
                r.touch();
                r
            })
        });
        let refreshed = inner.store.get();
        inner.publish_record(refreshed.as_ref());
        Ok(())
    }

    /// Write the supplied profile fields, then refresh the cached copy.
    ///
    /// # Errors
    /// `Unauthenticated` without a session, `Unknown` with a field-level
    /// message for malformed input, or the mapped provider error.
    #[instrument(skip_all)]
    pub async fn update_profile(&self, patch: ProfilePatch) -> Result<(), AuthError> {
        let inner = &self.inner;
        let record = inner
            .store
            .get()
            .filter(|r| r.is_authenticated)
            .ok_or(AuthError::Unauthenticated)?;

        if let Some(name) = &patch.full_name {
            if name.trim().chars().count() < 2 {
                return Err(AuthError::Unknown(
                    "full name must be at least 2 characters".to_string(),
                ));
            }
        }
        if let Some(phone) = &patch.phone {
            if !valid_phone(phone) {
                return Err(AuthError::Unknown(
                    "phone number does not look valid".to_string(),
                ));
            }
        }
        if patch.is_empty() {
            return Ok(());
        }

        inner
            .profiles
            .write_profile(record.user.id, &patch)
            .await?;
        self.refresh_data().await
    }

    /// Re-fetch the profile for the current user. Replaces the record only
    /// when the fetched data differs from the cached copy; otherwise only
    /// advances `last_active_at`. Single-flight: an overlapping call
    /// returns immediately without a second fetch.
    ///
    /// # Errors
    /// `Unauthenticated` without a session. Fetch failures are absorbed:
    /// they mark the data stale and resolve on the next trigger.
    #[instrument(skip_all)]
    pub async fn refresh_data(&self) -> Result<(), AuthError> {
        let inner = &self.inner;
        let record = inner
            .store
            .get()
            .filter(|r| r.is_authenticated)
            .ok_or(AuthError::Unauthenticated)?;

        if inner
            .data_refresh_inflight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("profile refresh already in flight");
            return Ok(());
        }

        inner.publish(|s| s.is_data_loading = true);

        match inner.fetch_profile(record.user.id).await {
            Ok(profile) => {
                inner.store.update(|current| {
                    current.map(|mut r| {
                        if r.user != profile {
                            r.user = profile;
                        }
                        r.touch();
                        r
                    })
                });
                let current = inner.store.get();
                inner.publish(|s| {
                    s.user = current.as_ref().map(|r| r.user.clone());
                    s.is_data_loading = false;
                    s.is_data_stale = false;
                });
            }
            Err(err) => {
                warn!("profile refresh failed: {err}");
                inner.publish(|s| {
                    s.is_data_loading = false;
                    s.is_data_stale = true;
                });
            }
        }

        inner.data_refresh_inflight.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Current read model; see `watch` for a subscription.
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn clear_error(&self) {
        self.inner.publish(|s| s.error = None);
    }

    /// When the provider last reported a credential refresh, if ever.
    #[must_use]
    pub fn last_token_refresh(&self) -> Option<DateTime<Utc>> {
        *self
            .inner
            .last_token_refresh
            .lock()
            .expect("refresh stamp lock poisoned")
    }
}

/// Normalize an identity for lookups and rate-limit keying.
pub(crate) fn sanitize_identity(identity: &str) -> String {
    identity.trim().to_lowercase()
}

/// Basic email shape check on already-normalized input.
fn valid_identity(identity: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|re| re.is_match(identity))
}

/// Loose international phone shape: optional leading +, then digits with
/// common separators.
fn valid_phone(phone: &str) -> bool {
    Regex::new(r"^\+?[0-9(][0-9 ().-]{4,18}[0-9]$").is_ok_and(|re| re.is_match(phone.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_trims_and_lowercases() {
        assert_eq!(sanitize_identity("  Ops@Station.Example "), "ops@station.example");
    }

    #[test]
    fn identity_shape_check() {
        assert!(valid_identity("user@x.com"));
        assert!(!valid_identity("not-an-email"));
        assert!(!valid_identity("two@at@signs.com"));
        assert!(!valid_identity("user@nodot"));
    }

    #[test]
    fn phone_shape_check() {
        assert!(valid_phone("+34 600 123 456"));
        assert!(valid_phone("600123456"));
        assert!(valid_phone("(555) 010-9999"));
        assert!(!valid_phone("call me"));
        assert!(!valid_phone("12"));
    }

    #[test]
    fn default_admin_pattern_matches_the_carved_out_accounts() {
        let config = SessionConfig::default();
        assert!(config.is_admin_identity("admin@pumpguard.com"));
        assert!(config.is_admin_identity("oncall@pumpguard.internal"));
        assert!(!config.is_admin_identity("ops@station.example"));
        assert!(!config.is_admin_identity("admin@pumpguard.com.evil.example"));
    }

    #[test]
    fn config_builders_override_defaults() {
        let config = SessionConfig::default()
            .with_reset_return_target("https://test.example/reset".to_string())
            .with_logout_grace(Duration::from_millis(5));
        assert_eq!(config.reset_return_target, "https://test.example/reset");
        assert_eq!(config.logout_grace, Duration::from_millis(5));
    }

    #[test]
    fn default_snapshot_is_loading_and_unauthenticated() {
        let snapshot = SessionSnapshot::default();
        assert!(snapshot.is_loading);
        assert!(!snapshot.is_authenticated);
        assert_eq!(snapshot.phase, SessionPhase::Starting);
        assert!(snapshot.user.is_none());
    }
}
