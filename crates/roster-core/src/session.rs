//! Roster: a sync session tying the state container to the engine.
//!
//! Owns the local state, fires a push after every accepted mutation and
//! keeps a poller running for as long as connection settings are present.

use crate::container::StateContainer;
use crate::events::EventBus;
use crate::model::{ApplicationState, ConnectionSettings};
use crate::remote::RemoteStore;
use crate::store::LocalStore;
use crate::sync_engine::{PullMode, PullOutcome, PushOutcome, SyncEngine, SyncStatus};

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub poll_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// What happened to a call to [`Roster::update_state`].
#[derive(Debug)]
pub enum Mutation {
    /// Not signed in; nothing changed.
    Rejected,
    /// Saved locally; sync is not configured.
    Local,
    /// Saved locally and a push is on its way.
    Pushing(JoinHandle<PushOutcome>),
}

struct Poller {
    settings: ConnectionSettings,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PollerState {
    started: bool,
    active: Option<Poller>,
}

pub struct Roster<L: LocalStore + 'static, R: RemoteStore + 'static> {
    container: Mutex<StateContainer<L>>,
    engine: SyncEngine<R>,
    options: SyncOptions,
    poller: Mutex<PollerState>,
    me: Weak<Self>,
}

impl<L: LocalStore + 'static, R: RemoteStore + 'static> Roster<L, R> {
    /// Restore the session from `local`. Nothing touches the network until
    /// [`Roster::start`], [`Roster::refresh`] or a mutation.
    pub fn new(local: L, remote: R, options: SyncOptions) -> Arc<Self> {
        let container = StateContainer::load(local);
        Arc::new_cyclic(|me| Self {
            container: Mutex::new(container),
            engine: SyncEngine::new(remote),
            options,
            poller: Mutex::new(PollerState::default()),
            me: me.clone(),
        })
    }

    fn container(&self) -> MutexGuard<'_, StateContainer<L>> {
        self.container.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn poller(&self) -> MutexGuard<'_, PollerState> {
        self.poller.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> ApplicationState {
        self.container().state().clone()
    }

    pub fn connection(&self) -> Option<ConnectionSettings> {
        self.container().connection().cloned()
    }

    pub fn status(&self) -> SyncStatus {
        self.engine.status()
    }

    pub fn token(&self) -> Option<String> {
        self.engine.token()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        self.engine.events()
    }

    pub fn remote(&self) -> &R {
        self.engine.remote()
    }

    pub fn is_authorized(&self) -> bool {
        self.container().is_authorized()
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.container().set_authorized(authorized);
    }

    /// Apply `transform` through the mutation gate.
    ///
    /// The new state is on disk before this returns. When sync is configured
    /// a push of that exact state is spawned and its handle returned.
    pub fn update_state<F>(&self, transform: F) -> Mutation
    where
        F: FnOnce(ApplicationState) -> ApplicationState,
    {
        let edit = |state: &mut ApplicationState| {
            *state = transform(std::mem::take(state));
            Ok::<(), Infallible>(())
        };
        match self.try_update_state(edit) {
            Ok(mutation) => mutation,
            Err(never) => match never {},
        }
    }

    /// Like [`Roster::update_state`], for edits that can fail.
    ///
    /// `edit` works on a draft. An error leaves the stored state untouched
    /// and starts no push.
    pub fn try_update_state<F, E>(&self, edit: F) -> Result<Mutation, E>
    where
        F: FnOnce(&mut ApplicationState) -> Result<(), E>,
    {
        // Reserve the push first so no pull can land between commit and push.
        let ticket = self.engine.begin_push();
        let (previous, snapshot) = {
            let mut container = self.container();
            if !container.is_authorized() {
                debug!("Ignoring mutation: not authorized");
                return Ok(Mutation::Rejected);
            }
            let mut draft = container.state().clone();
            edit(&mut draft)?;
            let previous = container.connection().cloned();
            match container.mutate(|_| draft) {
                Some(state) => (previous, state.clone()),
                None => return Ok(Mutation::Rejected),
            }
        };

        // The last token belongs to the old document
        if snapshot.connection() != previous.as_ref() {
            self.engine.forget_token();
        }
        self.sync_poller();

        if snapshot.connection().is_none() {
            return Ok(Mutation::Local);
        }
        let Some(this) = self.me.upgrade() else {
            return Ok(Mutation::Local);
        };
        debug!("Spawning push after local mutation");
        Ok(Mutation::Pushing(tokio::spawn(async move {
            this.engine.push_with(ticket, &snapshot).await
        })))
    }

    /// Push the current state as-is.
    pub async fn push(&self) -> PushOutcome {
        let snapshot = self.state();
        self.engine.push(&snapshot).await
    }

    /// Pull once, showing any failure.
    pub async fn refresh(&self) -> PullOutcome {
        match self.connection() {
            Some(settings) => self.pull(&settings, PullMode::Foreground).await,
            None => PullOutcome::NotConfigured,
        }
    }

    async fn pull(&self, settings: &ConnectionSettings, mode: PullMode) -> PullOutcome {
        self.engine
            .pull(settings, mode, |incoming| self.container().merge_remote(incoming))
            .await
    }

    /// Begin polling. Later settings changes restart or stop the poller.
    pub fn start(&self) {
        self.poller().started = true;
        self.sync_poller();
    }

    /// Stop polling. In-flight pushes run to completion.
    pub fn shutdown(&self) {
        let mut poller = self.poller();
        poller.started = false;
        if let Some(active) = poller.active.take() {
            active.handle.abort();
            debug!("Poller stopped");
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poller().active.is_some()
    }

    /// Bring the poller in line with the current connection settings.
    fn sync_poller(&self) {
        let settings = self.connection();
        let mut poller = self.poller();

        match settings {
            None => {
                if let Some(active) = poller.active.take() {
                    active.handle.abort();
                    info!("Sync settings removed, polling stopped");
                }
                drop(poller);
                self.engine.reset_local_only();
            }
            Some(settings) => {
                if !poller.started {
                    return;
                }
                if poller
                    .active
                    .as_ref()
                    .is_some_and(|active| active.settings == settings)
                {
                    return;
                }
                if let Some(active) = poller.active.take() {
                    active.handle.abort();
                    info!("Sync settings changed, restarting poller");
                }
                let handle = tokio::spawn(poll_loop(
                    self.me.clone(),
                    settings.clone(),
                    self.options.poll_interval,
                ));
                poller.active = Some(Poller { settings, handle });
            }
        }
    }
}

impl<L: LocalStore + 'static, R: RemoteStore + 'static> Drop for Roster<L, R> {
    fn drop(&mut self) {
        let poller = self.poller.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(active) = poller.active.take() {
            active.handle.abort();
        }
    }
}

/// Immediate foreground pull, then background ticks until aborted or the
/// session is gone.
async fn poll_loop<L, R>(roster: Weak<Roster<L, R>>, settings: ConnectionSettings, period: Duration)
where
    L: LocalStore + 'static,
    R: RemoteStore + 'static,
{
    info!("Polling {}:{} every {:?}", settings.repo, settings.path, period);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut mode = PullMode::Foreground;

    loop {
        ticker.tick().await;
        let Some(roster) = roster.upgrade() else {
            break;
        };
        // Stay in the foreground until one pull actually runs
        if roster.pull(&settings, mode).await != PullOutcome::Suppressed {
            mode = PullMode::Background;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SyncEvent;
    use crate::remote::MemoryRemote;
    use crate::store::{MemoryStore, SESSION_KEY, STATE_KEY};

    const FAST: SyncOptions = SyncOptions {
        poll_interval: Duration::from_millis(20),
    };

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            repo: "district42/roster".into(),
            branch: "main".into(),
            token: "secret".into(),
            path: "data.json".into(),
        }
    }

    /// A signed-in device with sync configured.
    fn configured_store() -> MemoryStore {
        let store = MemoryStore::new();
        let state = ApplicationState {
            github: Some(settings()),
            ..ApplicationState::default()
        };
        store
            .set(STATE_KEY, &serde_json::to_string(&state).unwrap())
            .unwrap();
        store.set(SESSION_KEY, "true").unwrap();
        store
    }

    fn remote_state(district: &str) -> ApplicationState {
        ApplicationState {
            district: district.into(),
            github: None,
            ..ApplicationState::default()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_unconfigured_session_stays_local() {
        let store = MemoryStore::new();
        store.set(SESSION_KEY, "true").unwrap();
        let roster = Roster::new(store.clone(), MemoryRemote::new(), FAST);

        roster.start();
        assert!(!roster.is_polling());

        let mutation = roster.update_state(|mut s| {
            s.district = "7".into();
            s
        });
        assert!(matches!(mutation, Mutation::Local));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(roster.remote().fetch_count(), 0);
        assert_eq!(roster.remote().write_count(), 0);
        assert_eq!(roster.status(), SyncStatus::LocalOnly);
        assert!(store.get(STATE_KEY).unwrap().unwrap().contains("\"7\""));
    }

    #[tokio::test]
    async fn test_signed_out_mutation_is_rejected() {
        let roster = Roster::new(MemoryStore::new(), MemoryRemote::new(), FAST);
        let mutation = roster.update_state(|mut s| {
            s.district = "7".into();
            s
        });
        assert!(matches!(mutation, Mutation::Rejected));
        assert_eq!(roster.state().district, "42");
    }

    #[tokio::test]
    async fn test_start_pulls_and_keeps_local_settings() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        let roster = Roster::new(configured_store(), remote, FAST);

        roster.start();
        wait_until(|| roster.token().is_some()).await;

        let state = roster.state();
        assert_eq!(state.district, "11");
        assert_eq!(state.github, Some(settings()));
        assert_eq!(roster.status(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_poller_picks_up_remote_changes() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        let roster = Roster::new(configured_store(), remote, FAST);
        roster.start();
        wait_until(|| roster.token().as_deref() == Some("abc123")).await;

        roster.remote().put_document(&remote_state("12"), "def456");
        wait_until(|| roster.state().district == "12").await;
        assert_eq!(roster.token().as_deref(), Some("def456"));
    }

    #[tokio::test]
    async fn test_quiet_polls_are_conditional() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        let roster = Roster::new(configured_store(), remote, FAST);
        roster.start();

        wait_until(|| roster.remote().conditional_fetch_count() >= 3).await;
        assert_eq!(roster.state().district, "11");
        assert_eq!(roster.status(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_mutation_pushes_snapshot() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        remote.queue_tokens(["def456"]);
        let roster = Roster::new(configured_store(), remote, SyncOptions::default());

        let Mutation::Pushing(push) = roster.update_state(|mut s| {
            s.district = "21".into();
            s
        }) else {
            panic!("expected a push");
        };

        assert_eq!(push.await.unwrap(), PushOutcome::Committed { token: "def456".into() });
        let remote_doc = roster.remote().document().unwrap();
        assert_eq!(remote_doc.district, "21");
        assert_eq!(remote_doc.github, Some(settings()));
        assert_eq!(roster.token().as_deref(), Some("def456"));
    }

    #[tokio::test]
    async fn test_push_in_flight_suppresses_pull() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        let roster = Roster::new(configured_store(), remote, SyncOptions::default());
        let hold = roster.remote().hold_next_write();

        let Mutation::Pushing(push) = roster.update_state(|mut s| {
            s.district = "21".into();
            s
        }) else {
            panic!("expected a push");
        };
        hold.entered().await;

        roster.remote().put_document(&remote_state("99"), "zzz999");
        assert_eq!(roster.refresh().await, PullOutcome::Suppressed);
        assert_eq!(roster.state().district, "21");

        hold.release();
        assert!(matches!(push.await.unwrap(), PushOutcome::Failed { .. }));
        // Rejected writes are not rolled back
        assert_eq!(roster.state().district, "21");
        assert_eq!(roster.status(), SyncStatus::Error);
    }

    #[tokio::test]
    async fn test_offline_edits_survive_restart() {
        let store = configured_store();
        let remote = MemoryRemote::new();
        remote.set_unreachable(true);

        {
            let roster = Roster::new(store.clone(), remote, SyncOptions::default());
            let Mutation::Pushing(push) = roster.update_state(|mut s| {
                s.district = "31".into();
                s
            }) else {
                panic!("expected a push");
            };
            assert!(matches!(push.await.unwrap(), PushOutcome::Failed { .. }));
            assert_eq!(roster.status(), SyncStatus::Error);
        }

        let restarted = Roster::new(store, MemoryRemote::new(), SyncOptions::default());
        assert_eq!(restarted.state().district, "31");
        assert_eq!(restarted.connection(), Some(settings()));
    }

    #[tokio::test]
    async fn test_settings_change_restarts_and_removal_stops_poller() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        let roster = Roster::new(configured_store(), remote, FAST);
        roster.start();
        wait_until(|| roster.token().is_some()).await;

        let Mutation::Pushing(push) = roster.update_state(|mut s| {
            if let Some(github) = s.github.as_mut() {
                github.path = "other.json".into();
            }
            s
        }) else {
            panic!("expected a push");
        };
        push.await.unwrap();
        assert!(roster.is_polling());

        let mutation = roster.update_state(|mut s| {
            s.github = None;
            s
        });
        assert!(matches!(mutation, Mutation::Local));
        assert!(!roster.is_polling());
        assert_eq!(roster.status(), SyncStatus::LocalOnly);

        let fetches = roster.remote().fetch_count();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(roster.remote().fetch_count(), fetches);
    }

    #[tokio::test]
    async fn test_settings_change_makes_failures_visible() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        let roster = Roster::new(configured_store(), remote, FAST);
        roster.start();
        wait_until(|| roster.token().is_some()).await;

        let failures = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let failures = Arc::clone(&failures);
            roster.events().subscribe(move |event| {
                if let SyncEvent::PullFailed { silent, .. } = event {
                    failures.lock().unwrap().push(silent);
                }
            })
        };

        let Mutation::Pushing(push) = roster.update_state(|mut s| {
            if let Some(github) = s.github.as_mut() {
                github.path = "moved.json".into();
            }
            s
        }) else {
            panic!("expected a push");
        };
        roster.remote().set_unreachable(true);
        assert_eq!(roster.token(), None);
        assert!(matches!(push.await.unwrap(), PushOutcome::Failed { .. }));

        wait_until(|| !failures.lock().unwrap().is_empty()).await;
        assert!(!failures.lock().unwrap()[0]);
        assert_eq!(roster.status(), SyncStatus::Error);
    }

    #[tokio::test]
    async fn test_failed_edit_changes_nothing() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        let roster = Roster::new(configured_store(), remote, SyncOptions::default());

        let result = roster.try_update_state(|state| {
            state.district = "77".into();
            Err("rejected")
        });
        assert_eq!(result.err(), Some("rejected"));
        assert_eq!(roster.state().district, "42");
        assert!(!roster.engine.push_in_flight());

        let Ok(Mutation::Pushing(push)) = roster.try_update_state(|state| {
            state.district = "78".into();
            Ok::<(), &str>(())
        }) else {
            panic!("expected a push");
        };
        push.await.unwrap();
        assert_eq!(roster.remote().write_count(), 1);
        assert_eq!(roster.remote().document().unwrap().district, "78");
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let remote = MemoryRemote::with_document(&remote_state("11"), "abc123");
        let roster = Roster::new(configured_store(), remote, FAST);
        roster.start();
        wait_until(|| roster.token().is_some()).await;

        roster.shutdown();
        assert!(!roster.is_polling());
        let fetches = roster.remote().fetch_count();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(roster.remote().fetch_count(), fetches);
    }
}
