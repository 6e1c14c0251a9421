//! Composition root: wire the adapters, start the session service, and
//! run until interrupted.

use crate::cli::{actions::Action, globals::GlobalArgs};
use crate::provider::{HttpIdentityProvider, HttpProfileStore};
use crate::session::{
    EnvSignal, Navigator, SessionConfig, SessionService, Surface,
};
use crate::storage::{FileStore, KeyValueStore, MemoryStore};
use anyhow::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::info;

/// Navigator for the headless binary: remembers the surface it was sent
/// to and logs redirects. A windowed frontend supplies its own.
struct HeadlessNavigator {
    surface: Mutex<Surface>,
}

impl Default for HeadlessNavigator {
    fn default() -> Self {
        Self {
            surface: Mutex::new(Surface::Other),
        }
    }
}

impl Navigator for HeadlessNavigator {
    fn current_surface(&self) -> Surface {
        *self.surface.lock().expect("surface lock poisoned")
    }

    fn hard_redirect(&self, surface: Surface) {
        info!("redirecting to {surface:?}");
        *self.surface.lock().expect("surface lock poisoned") = surface;
    }
}

/// Handle the run action
pub async fn handle(action: Action) -> Result<()> {
    let Action::Run {
        backend_url,
        api_key,
        state_dir,
        reset_target,
    } = action;
    let globals = GlobalArgs::new(backend_url, api_key, state_dir, reset_target);

    let durable: Arc<dyn KeyValueStore> =
        Arc::new(FileStore::open(globals.state_dir.join("state.json"))?);
    let scoped: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());

    let identity = Arc::new(HttpIdentityProvider::new(
        globals.backend_url.clone(),
        globals.api_key.clone(),
    )?);
    let profiles = Arc::new(HttpProfileStore::new(
        globals.backend_url.clone(),
        globals.api_key.clone(),
        Arc::clone(&identity),
    )?);

    // Environment transitions (tab visibility, connectivity) come from the
    // embedding shell; the headless binary only keeps the channel open.
    let (env_signals, _keep_alive) = broadcast::channel::<EnvSignal>(16);

    let config = SessionConfig::default().with_reset_return_target(globals.reset_target.clone());
    let service = SessionService::new(
        identity,
        profiles,
        scoped,
        durable,
        Arc::new(HeadlessNavigator::default()),
        env_signals.clone(),
        config,
    );

    service.ensure_started().await;

    let snapshot = service.snapshot();
    if let Some(user) = &snapshot.user {
        info!("resumed session for {}", user.email);
    } else {
        info!("no existing session; waiting for sign-in");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    service.shutdown();

    Ok(())
}
