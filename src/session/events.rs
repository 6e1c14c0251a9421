//! One-time session bootstrap and the identity-provider notification loop.
//!
//! The owning dashboard surface can be constructed any number of times
//! (route changes, hot reload, parallel instances); the guards here make
//! sure setup work and the notification subscription happen exactly once
//! per process.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::api::{sanitize_identity, SessionInner, SessionPhase, Surface};
use super::record::SessionRecord;
use crate::provider::AuthNotification;
use crate::storage::KeyValueStore;

pub(crate) const SESSION_EXPIRED_NOTICE: &str =
    "Your session has expired. Please sign in again.";

const MANUAL_LOGOUT_KEY: &str = "logout:manual";

/// One-shot setup guards. Each transitions false -> true exactly once per
/// service lifetime and is never reset outside test teardown.
#[derive(Debug, Default)]
pub(crate) struct ProcessGuards {
    initialized: AtomicBool,
    listener_active: AtomicBool,
    refresh_installed: AtomicBool,
}

impl ProcessGuards {
    fn acquire(flag: &AtomicBool) -> bool {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// True exactly once: the caller owns initialization.
    pub(crate) fn begin_init(&self) -> bool {
        Self::acquire(&self.initialized)
    }

    /// True exactly once: the caller owns the notification subscription.
    pub(crate) fn begin_listener(&self) -> bool {
        Self::acquire(&self.listener_active)
    }

    /// True exactly once: the caller owns the refresh scheduler.
    pub(crate) fn begin_refresh_install(&self) -> bool {
        Self::acquire(&self.refresh_installed)
    }

    #[cfg(test)]
    pub(crate) fn reset_for_tests(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        self.listener_active.store(false, Ordering::SeqCst);
        self.refresh_installed.store(false, Ordering::SeqCst);
    }
}

/// Durable marker letting the notification loop tell a sign-out we caused
/// apart from an out-of-band session termination. Honored for a short
/// grace window, then cleared; also cleared unconditionally at startup.
#[derive(Clone)]
pub(crate) struct ManualLogoutFlag {
    durable: Arc<dyn KeyValueStore>,
    grace: Duration,
}

impl ManualLogoutFlag {
    pub(crate) fn new(durable: Arc<dyn KeyValueStore>, grace: Duration) -> Self {
        Self { durable, grace }
    }

    pub(crate) fn set(&self) {
        let stamp = Utc::now().timestamp_millis().to_string();
        if let Err(err) = self.durable.put(MANUAL_LOGOUT_KEY, &stamp) {
            warn!("cannot persist manual sign-out marker: {err}");
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        match self.durable.get(MANUAL_LOGOUT_KEY) {
            Ok(Some(raw)) => raw
                .parse::<i64>()
                .map(|stamp| {
                    let age = Utc::now().timestamp_millis().saturating_sub(stamp);
                    age >= 0 && age < grace_millis(self.grace)
                })
                .unwrap_or(false),
            Ok(None) => false,
            Err(err) => {
                warn!("cannot read manual sign-out marker: {err}");
                false
            }
        }
    }

    pub(crate) fn clear(&self) {
        if let Err(err) = self.durable.remove(MANUAL_LOGOUT_KEY) {
            warn!("cannot clear manual sign-out marker: {err}");
        }
    }
}

fn grace_millis(grace: Duration) -> i64 {
    i64::try_from(grace.as_millis()).unwrap_or(i64::MAX)
}

/// First-run session reconciliation across the three sources of truth:
/// cached record, external identity-provider session, remote profile.
///
/// Whatever happens, this ends in `Ready` with the loading flag cleared;
/// a transient fetch failure must never strand the UI in a loading state.
pub(crate) async fn bootstrap(inner: &Arc<SessionInner>) {
    inner.publish(|s| {
        s.is_loading = true;
        s.phase = SessionPhase::Starting;
    });

    // Cached record wins without a network round trip.
    if let Some(record) = inner.store.get() {
        debug!("resuming cached session {}", record.session_id);
        inner.publish_record(Some(&record));
        return;
    }

    match inner.provider.ambient_session().await {
        Ok(Some(session)) => match inner.fetch_profile(session.user_id).await {
            Ok(profile) => {
                let record = SessionRecord::new(profile);
                inner.store.set(Some(record.clone()));
                inner.cache_identity_hint(&sanitize_identity(&session.email));
                inner.publish_record(Some(&record));
            }
            Err(err) => {
                warn!("could not reconcile external session: {err}");
                inner.store.set(None);
                inner.publish_record(None);
            }
        },
        Ok(None) => {
            inner.store.set(None);
            inner.publish_record(None);
        }
        Err(err) => {
            warn!("external session lookup failed: {err}");
            inner.store.set(None);
            inner.publish_record(None);
        }
    }
}

/// The process-wide notification consumer. Runs until the provider closes
/// its stream or the service shuts down.
pub(crate) async fn watch_notifications(
    inner: Arc<SessionInner>,
    mut notifications: broadcast::Receiver<AuthNotification>,
) {
    loop {
        match notifications.recv().await {
            Ok(notification) => handle_notification(&inner, notification).await,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("auth notification stream lagged by {missed}");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn handle_notification(inner: &Arc<SessionInner>, notification: AuthNotification) {
    // A manual sign-out owns the terminal state for its whole grace
    // window; every notification kind is discarded while it holds,
    // including a racing sign-in.
    if inner.logout_flag.is_active() {
        debug!("discarding {notification:?} during manual sign-out");
        return;
    }

    match notification {
        AuthNotification::SignedOut => {
            if inner.navigator.current_surface() == Surface::Login {
                return;
            }
            inner.store.set(None);
            inner.clear_identity_hint();
            inner.publish(|s| {
                s.user = None;
                s.is_authenticated = false;
                s.is_loading = false;
                s.phase = SessionPhase::Ready;
                s.error = Some(SESSION_EXPIRED_NOTICE.to_string());
            });
            // Give the notice a beat to render before leaving the surface.
            sleep(inner.config.expired_notice_delay).await;
            inner.navigator.hard_redirect(Surface::Login);
        }
        AuthNotification::SignedIn { user_id, email } => {
            match inner.fetch_profile(user_id).await {
                Ok(profile) => {
                    let record = SessionRecord::new(profile);
                    inner.store.set(Some(record.clone()));
                    inner.cache_identity_hint(&sanitize_identity(&email));
                    inner.publish_record(Some(&record));
                }
                Err(err) => warn!("could not load profile after sign-in: {err}"),
            }
        }
        AuthNotification::TokenRefreshed => {
            *inner
                .last_token_refresh
                .lock()
                .expect("refresh stamp lock poisoned") = Some(Utc::now());
        }
        AuthNotification::UserUpdated => {}
        AuthNotification::Other(kind) => {
            debug!("ignoring unrecognized auth notification kind {kind:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[test]
    fn guards_acquire_exactly_once() {
        let guards = ProcessGuards::default();

        assert!(guards.begin_init());
        assert!(!guards.begin_init());

        assert!(guards.begin_listener());
        assert!(!guards.begin_listener());

        assert!(guards.begin_refresh_install());
        assert!(!guards.begin_refresh_install());

        guards.reset_for_tests();
        assert!(guards.begin_init());
    }

    #[test]
    fn manual_logout_flag_holds_for_the_grace_window() {
        let flag = ManualLogoutFlag::new(Arc::new(MemoryStore::new()), Duration::from_secs(1));

        assert!(!flag.is_active());
        flag.set();
        assert!(flag.is_active());
        flag.clear();
        assert!(!flag.is_active());
    }

    #[test]
    fn manual_logout_flag_lapses_after_the_grace_window() {
        let flag = ManualLogoutFlag::new(Arc::new(MemoryStore::new()), Duration::from_millis(20));

        flag.set();
        assert!(flag.is_active());
        std::thread::sleep(Duration::from_millis(40));
        assert!(!flag.is_active());
    }

    #[test]
    fn garbage_marker_reads_as_inactive() {
        let durable: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        durable.put(MANUAL_LOGOUT_KEY, "not-a-stamp").unwrap();

        let flag = ManualLogoutFlag::new(durable, Duration::from_secs(1));
        assert!(!flag.is_active());
    }
}
