//! Background credential keep-alive, decoupled from the session record.
//!
//! The scheduler only talks to the identity provider; it never touches the
//! session store. Its job is to keep the underlying credential alive while
//! the operator has the dashboard open but idle.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::provider::IdentityProvider;

/// Ambient environment transitions that warrant an early refresh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvSignal {
    /// The dashboard tab became visible after being hidden.
    TabVisible,
    /// The network came back after an offline spell.
    BackOnline,
}

#[derive(Clone, Copy, Debug)]
pub struct RefreshConfig {
    /// Base period between proactive refreshes; jittered downward at
    /// install time. Sized to stay well under a 60-minute credential
    /// lifetime.
    pub period: Duration,
    /// Minimum spacing between refresh executions, whatever triggered
    /// them. Visibility and online transitions can fire in the same
    /// moment and must not double-refresh.
    pub debounce: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(22 * 60),
            debounce: Duration::from_secs(60),
        }
    }
}

/// Spawn the keep-alive task: one refresh right away, then on every
/// period tick and on every environment signal, all funneled through the
/// debounce window.
pub(crate) fn install(
    provider: Arc<dyn IdentityProvider>,
    mut signals: broadcast::Receiver<EnvSignal>,
    config: RefreshConfig,
) -> JoinHandle<()> {
    let jittered = jittered_period(config.period);

    tokio::spawn(async move {
        let mut last_attempt: Option<Instant> = None;
        // The first tick completes immediately: the install-time refresh.
        let mut tick = interval(jittered);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    attempt_refresh(provider.as_ref(), &mut last_attempt, config.debounce).await;
                }
                signal = signals.recv() => match signal {
                    Ok(EnvSignal::TabVisible | EnvSignal::BackOnline) => {
                        attempt_refresh(provider.as_ref(), &mut last_attempt, config.debounce)
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("environment signal stream lagged by {missed}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

async fn attempt_refresh(
    provider: &dyn IdentityProvider,
    last_attempt: &mut Option<Instant>,
    debounce: Duration,
) {
    if last_attempt.is_some_and(|at| at.elapsed() < debounce) {
        debug!("skipping credential refresh inside debounce window");
        return;
    }
    // Stamp before the outcome is known so a failing backend is not hammered.
    *last_attempt = Some(Instant::now());

    match provider.refresh_credential().await {
        Ok(()) => debug!("credential refreshed"),
        Err(err) => warn!("background credential refresh failed: {err}"),
    }
}

fn jittered_period(period: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    period.mul_f64(rng.gen_range(0.9..1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AuthNotification, ProviderError, ProviderSession};
    use async_trait::async_trait;
    use secrecy::SecretString;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingProvider {
        refreshes: AtomicUsize,
    }

    #[async_trait]
    impl IdentityProvider for CountingProvider {
        async fn authenticate(
            &self,
            _identity: &str,
            _secret: &SecretString,
        ) -> Result<ProviderSession, ProviderError> {
            unreachable!("not exercised by the scheduler")
        }

        async fn ambient_session(&self) -> Result<Option<ProviderSession>, ProviderError> {
            unreachable!("not exercised by the scheduler")
        }

        async fn refresh_credential(&self) -> Result<(), ProviderError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn sign_out(&self) -> Result<(), ProviderError> {
            unreachable!("not exercised by the scheduler")
        }

        async fn update_credential(
            &self,
            _new_secret: &SecretString,
        ) -> Result<(), ProviderError> {
            unreachable!("not exercised by the scheduler")
        }

        async fn request_password_reset(
            &self,
            _identity: &str,
            _return_target: &str,
        ) -> Result<(), ProviderError> {
            unreachable!("not exercised by the scheduler")
        }

        async fn exchange_recovery_token(
            &self,
            _token: &str,
        ) -> Result<ProviderSession, ProviderError> {
            unreachable!("not exercised by the scheduler")
        }

        fn subscribe(&self) -> broadcast::Receiver<AuthNotification> {
            unreachable!("not exercised by the scheduler")
        }
    }

    #[tokio::test]
    async fn refreshes_once_at_install_and_debounces_signals() {
        let provider = Arc::new(CountingProvider::default());
        let (tx, rx) = broadcast::channel(8);

        let config = RefreshConfig {
            period: Duration::from_secs(3600),
            debounce: Duration::from_secs(3600),
        };
        let handle = install(Arc::clone(&provider) as Arc<dyn IdentityProvider>, rx, config);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);

        // Both signals land inside the debounce window; neither refreshes.
        tx.send(EnvSignal::TabVisible).unwrap();
        tx.send(EnvSignal::BackOnline).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn signals_refresh_outside_the_debounce_window() {
        let provider = Arc::new(CountingProvider::default());
        let (tx, rx) = broadcast::channel(8);

        let config = RefreshConfig {
            period: Duration::from_secs(3600),
            debounce: Duration::from_millis(0),
        };
        let handle = install(Arc::clone(&provider) as Arc<dyn IdentityProvider>, rx, config);

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(EnvSignal::TabVisible).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(EnvSignal::BackOnline).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 3);

        handle.abort();
    }

    #[tokio::test]
    async fn task_exits_when_the_signal_channel_closes() {
        let provider = Arc::new(CountingProvider::default());
        let (tx, rx) = broadcast::channel(8);

        let handle = install(
            Arc::clone(&provider) as Arc<dyn IdentityProvider>,
            rx,
            RefreshConfig {
                period: Duration::from_secs(3600),
                debounce: Duration::from_secs(3600),
            },
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler should exit on channel close")
            .expect("scheduler task should not panic");
    }
}
