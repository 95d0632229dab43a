//! SyncEngine: reconciles the local document with the remote copy.
//!
//! The protocol works as follows:
//!
//! 1. A pull sends the last-known version token as a conditional read. An
//!    "unchanged" answer (or the same token coming back) ends the pull with
//!    no merge.
//! 2. A changed document is decoded and handed to the caller's merge function,
//!    and its token becomes the last-known token.
//! 3. A push re-reads the current token, then writes the whole document with
//!    that token as the precondition. The store rejects the write if another
//!    writer got in first; nothing is retried or rolled back.
//! 4. While any push is in flight, pulls are dropped. Right before a pulled
//!    document is applied the check is repeated under the same lock that push
//!    start-up takes, together with the push epoch: a pull whose fetch was
//!    outstanding while any push started is dropped even if that push has
//!    already finished, since its document predates the push.

use crate::codec::{self, CodecError};
use crate::events::{EventBus, SyncEvent, now_millis};
use crate::model::{ApplicationState, ConnectionSettings};
use crate::remote::{Fetched, RemoteError, RemoteStore};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// What the view shows next to the district name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncStatus {
    /// No connection settings; everything stays on this device.
    LocalOnly,
    Syncing,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SyncStatus::LocalOnly => "Local Only",
            SyncStatus::Syncing => "Syncing...",
            SyncStatus::Synced => "Cloud Synced",
            SyncStatus::Error => "Sync Error",
        }
    }
}

/// Who asked for a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Initial load or a manual refresh: failures are shown.
    Foreground,
    /// Poll tick: failures stay quiet once a pull has succeeded.
    Background,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    NotConfigured,
    /// Dropped because a push was in flight.
    Suppressed,
    Unchanged,
    /// No document at the configured path yet.
    Missing,
    Applied { token: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    NotConfigured,
    Committed { token: String },
    Failed { reason: String },
}

struct EngineState {
    token: Option<String>,
    pushes_in_flight: usize,
    /// Bumped by every push start.
    push_epoch: u64,
    status: SyncStatus,
}

/// Marks a push as in flight for as long as it is alive.
///
/// Taken before the local mutation is committed so that no pull can apply
/// between the mutation and its push. Dropping the ticket (after the write,
/// or when the push task is aborted) clears the mark.
pub struct PushTicket {
    state: Arc<Mutex<EngineState>>,
}

impl Drop for PushTicket {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.pushes_in_flight = state.pushes_in_flight.saturating_sub(1);
    }
}

fn lock(state: &Mutex<EngineState>) -> MutexGuard<'_, EngineState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SyncEngine<R: RemoteStore> {
    remote: R,
    state: Arc<Mutex<EngineState>>,
    events: Arc<EventBus>,
}

impl<R: RemoteStore> SyncEngine<R> {
    pub fn new(remote: R) -> Self {
        Self {
            remote,
            state: Arc::new(Mutex::new(EngineState {
                token: None,
                pushes_in_flight: 0,
                push_epoch: 0,
                status: SyncStatus::LocalOnly,
            })),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn status(&self) -> SyncStatus {
        lock(&self.state).status
    }

    /// Last version token observed from the store.
    pub fn token(&self) -> Option<String> {
        lock(&self.state).token.clone()
    }

    pub fn push_in_flight(&self) -> bool {
        lock(&self.state).pushes_in_flight > 0
    }

    /// Mark a push as in flight ahead of [`SyncEngine::push_with`].
    pub fn begin_push(&self) -> PushTicket {
        let mut state = lock(&self.state);
        state.pushes_in_flight += 1;
        state.push_epoch += 1;
        drop(state);
        PushTicket {
            state: Arc::clone(&self.state),
        }
    }

    /// The remote target changed: the known token belongs to another document.
    pub fn forget_token(&self) {
        lock(&self.state).token = None;
    }

    /// Sync settings were removed: forget the remote and show local-only.
    pub fn reset_local_only(&self) {
        self.forget_token();
        self.set_status(SyncStatus::LocalOnly);
    }

    fn set_status(&self, status: SyncStatus) {
        let changed = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut state.status, status) != status
        };
        if changed {
            self.events.emit(SyncEvent::StatusChanged {
                status,
                timestamp: now_millis(),
            });
        }
    }

    /// Pull the remote document and hand it to `apply` if it changed.
    ///
    /// `apply` runs at most once, only when no push is in flight, and
    /// while the engine lock is held; it must not call back into the engine.
    pub async fn pull<F>(&self, settings: &ConnectionSettings, mode: PullMode, apply: F) -> PullOutcome
    where
        F: FnOnce(ApplicationState),
    {
        if !settings.is_configured() {
            return PullOutcome::NotConfigured;
        }
        let (last_token, epoch, pushing) = {
            let state = lock(&self.state);
            (state.token.clone(), state.push_epoch, state.pushes_in_flight > 0)
        };
        if pushing {
            debug!("Pull suppressed: push in flight");
            self.events.emit(SyncEvent::PullSuppressed {
                timestamp: now_millis(),
            });
            return PullOutcome::Suppressed;
        }

        if mode == PullMode::Foreground {
            self.set_status(SyncStatus::Syncing);
        }

        debug!("Pulling {}:{} ({:?})", settings.repo, settings.path, mode);
        let fetched = match self.remote.fetch(settings, last_token.as_deref()).await {
            Ok(fetched) => fetched,
            Err(e) => return self.pull_failed(mode, e.into()),
        };

        match fetched {
            Fetched::Document { token, .. } if last_token.as_deref() == Some(token.as_str()) => {
                self.pull_unchanged(epoch)
            }
            Fetched::Unchanged => self.pull_unchanged(epoch),
            Fetched::Missing => {
                if !self.commit_pull(epoch, None, None, apply) {
                    return self.pull_suppressed();
                }
                info!("No remote document at {}; next push will create it", settings.path);
                self.set_status(SyncStatus::Synced);
                PullOutcome::Missing
            }
            Fetched::Document { content, token } => {
                let incoming = match codec::decode(content.as_bytes()) {
                    Ok(incoming) => incoming,
                    Err(e) => return self.pull_failed(mode, e.into()),
                };
                if !self.commit_pull(epoch, Some(token.clone()), Some(incoming), apply) {
                    return self.pull_suppressed();
                }
                info!("Applied remote document (token {})", token);
                self.set_status(SyncStatus::Synced);
                self.events.emit(SyncEvent::PullApplied {
                    token: token.clone(),
                    timestamp: now_millis(),
                });
                PullOutcome::Applied { token }
            }
        }
    }

    /// Apply the pull result unless a push started since `epoch` was read.
    fn commit_pull<F>(
        &self,
        epoch: u64,
        token: Option<String>,
        incoming: Option<ApplicationState>,
        apply: F,
    ) -> bool
    where
        F: FnOnce(ApplicationState),
    {
        let mut state = lock(&self.state);
        if state.pushes_in_flight > 0 || state.push_epoch != epoch {
            return false;
        }
        if let Some(incoming) = incoming {
            apply(incoming);
        }
        state.token = token;
        true
    }

    fn pull_unchanged(&self, epoch: u64) -> PullOutcome {
        // A push that started meanwhile owns the status now
        if lock(&self.state).push_epoch != epoch {
            return self.pull_suppressed();
        }
        debug!("Remote document unchanged");
        self.set_status(SyncStatus::Synced);
        self.events.emit(SyncEvent::PullUnchanged {
            timestamp: now_millis(),
        });
        PullOutcome::Unchanged
    }

    fn pull_suppressed(&self) -> PullOutcome {
        debug!("Dropping pull result: a push started while it was outstanding");
        self.events.emit(SyncEvent::PullSuppressed {
            timestamp: now_millis(),
        });
        PullOutcome::Suppressed
    }

    fn pull_failed(&self, mode: PullMode, error: SyncError) -> PullOutcome {
        let silent = mode == PullMode::Background && self.token().is_some();
        if silent {
            debug!("Background pull failed: {}", error);
        } else {
            warn!("Pull failed: {}", error);
            self.set_status(SyncStatus::Error);
        }
        self.events.emit(SyncEvent::PullFailed {
            error: error.to_string(),
            silent,
            timestamp: now_millis(),
        });
        PullOutcome::Failed {
            reason: error.to_string(),
        }
    }

    /// Write `state` to the remote store.
    ///
    /// Failures leave local state and the last-known token as they were.
    pub async fn push(&self, state: &ApplicationState) -> PushOutcome {
        let ticket = self.begin_push();
        self.push_with(ticket, state).await
    }

    /// Like [`SyncEngine::push`], under a ticket taken earlier.
    pub async fn push_with(&self, ticket: PushTicket, state: &ApplicationState) -> PushOutcome {
        let _ticket = ticket;
        let Some(settings) = state.connection() else {
            return PushOutcome::NotConfigured;
        };

        self.set_status(SyncStatus::Syncing);

        match self.write_document(settings, state).await {
            Ok(token) => {
                lock(&self.state).token = Some(token.clone());
                info!("Pushed document (token {})", token);
                self.set_status(SyncStatus::Synced);
                self.events.emit(SyncEvent::PushCommitted {
                    token: token.clone(),
                    timestamp: now_millis(),
                });
                PushOutcome::Committed { token }
            }
            Err(e) => {
                warn!("Push failed: {}", e);
                self.set_status(SyncStatus::Error);
                self.events.emit(SyncEvent::PushFailed {
                    error: e.to_string(),
                    timestamp: now_millis(),
                });
                PushOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn write_document(&self, settings: &ConnectionSettings, state: &ApplicationState) -> Result<String> {
        // Narrow the conflict window by basing the write on the newest token.
        let expected = match self.remote.fetch(settings, None).await {
            Ok(Fetched::Document { token, .. }) => Some(token),
            Ok(Fetched::Missing) => None,
            Ok(Fetched::Unchanged) => self.token(),
            Err(e) => {
                warn!("Token refresh failed, using last known token: {}", e);
                self.token()
            }
        };

        let content = codec::encode(state)?;
        let message = format!(
            "Update schedule: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let token = self
            .remote
            .write(settings, &content, expected.as_deref(), &message)
            .await?;
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            repo: "district42/roster".into(),
            branch: "main".into(),
            token: "secret".into(),
            path: "data.json".into(),
        }
    }

    fn local_state() -> ApplicationState {
        ApplicationState {
            github: Some(settings()),
            ..ApplicationState::default()
        }
    }

    fn remote_state(district: &str) -> ApplicationState {
        ApplicationState {
            district: district.into(),
            github: None,
            ..ApplicationState::default()
        }
    }

    #[tokio::test]
    async fn test_pull_applies_then_is_idempotent() {
        let engine = SyncEngine::new(MemoryRemote::with_document(&remote_state("11"), "abc123"));
        let mut applied = Vec::new();

        let first = engine
            .pull(&settings(), PullMode::Foreground, |doc| applied.push(doc))
            .await;
        assert_eq!(first, PullOutcome::Applied { token: "abc123".into() });

        let second = engine
            .pull(&settings(), PullMode::Background, |doc| applied.push(doc))
            .await;
        assert_eq!(second, PullOutcome::Unchanged);

        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].district, "11");
        assert_eq!(engine.token().as_deref(), Some("abc123"));
        assert_eq!(engine.status(), SyncStatus::Synced);
        assert_eq!(engine.remote().conditional_fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_pull_unconfigured_is_inert() {
        let engine = SyncEngine::new(MemoryRemote::new());
        let outcome = engine
            .pull(&ConnectionSettings::default(), PullMode::Foreground, |_| {
                panic!("nothing to apply")
            })
            .await;
        assert_eq!(outcome, PullOutcome::NotConfigured);
        assert_eq!(engine.remote().fetch_count(), 0);
        assert_eq!(engine.status(), SyncStatus::LocalOnly);
    }

    #[tokio::test]
    async fn test_pull_missing_document() {
        let engine = SyncEngine::new(MemoryRemote::new());
        let outcome = engine
            .pull(&settings(), PullMode::Foreground, |_| panic!("nothing to apply"))
            .await;
        assert_eq!(outcome, PullOutcome::Missing);
        assert_eq!(engine.status(), SyncStatus::Synced);
        assert!(engine.token().is_none());
    }

    #[tokio::test]
    async fn test_foreground_failure_is_visible() {
        let remote = MemoryRemote::with_document(&remote_state("1"), "abc123");
        remote.set_unreachable(true);
        let engine = SyncEngine::new(remote);

        let outcome = engine.pull(&settings(), PullMode::Foreground, |_| {}).await;
        assert!(matches!(outcome, PullOutcome::Failed { .. }));
        assert_eq!(engine.status(), SyncStatus::Error);
    }

    #[tokio::test]
    async fn test_background_failure_after_success_is_silent() {
        let engine = SyncEngine::new(MemoryRemote::with_document(&remote_state("1"), "abc123"));
        engine.pull(&settings(), PullMode::Foreground, |_| {}).await;

        engine.remote().fail_fetches(1);
        let outcome = engine.pull(&settings(), PullMode::Background, |_| {}).await;
        assert!(matches!(outcome, PullOutcome::Failed { .. }));
        assert_eq!(engine.status(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_background_failure_without_token_is_visible() {
        let remote = MemoryRemote::new();
        remote.fail_fetches(1);
        let engine = SyncEngine::new(remote);

        engine.pull(&settings(), PullMode::Background, |_| {}).await;
        assert_eq!(engine.status(), SyncStatus::Error);
    }

    #[tokio::test]
    async fn test_malformed_document_is_a_pull_failure() {
        let engine = SyncEngine::new(MemoryRemote::new());
        engine
            .remote()
            .put_document(&remote_state("1"), "abc123");
        // Another client writes something that is not base64
        engine
            .remote()
            .write(&settings(), "%%%", Some("abc123"), "corrupt")
            .await
            .unwrap();

        let outcome = engine.pull(&settings(), PullMode::Foreground, |_| panic!("must not apply")).await;
        assert!(matches!(outcome, PullOutcome::Failed { .. }));
        assert!(engine.token().is_none());
    }

    #[tokio::test]
    async fn test_push_updates_token() {
        let remote = MemoryRemote::with_document(&remote_state("1"), "abc123");
        remote.queue_tokens(["def456"]);
        let engine = SyncEngine::new(remote);

        let outcome = engine.push(&local_state()).await;
        assert_eq!(outcome, PushOutcome::Committed { token: "def456".into() });
        assert_eq!(engine.token().as_deref(), Some("def456"));
        assert_eq!(engine.status(), SyncStatus::Synced);
        assert!(!engine.push_in_flight());

        let message = engine.remote().last_message().unwrap();
        assert!(message.starts_with("Update schedule: "));
    }

    #[tokio::test]
    async fn test_back_to_back_pushes_keep_last_token() {
        let remote = MemoryRemote::with_document(&remote_state("1"), "abc123");
        remote.queue_tokens(["t1", "t2"]);
        let engine = Arc::new(SyncEngine::new(remote));

        let mut first = local_state();
        first.district = "first".into();
        let mut second = local_state();
        second.district = "second".into();

        // Both pushes are in flight before either one runs
        let first_ticket = engine.begin_push();
        let second_ticket = engine.begin_push();
        let first_push = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.push_with(first_ticket, &first).await })
        };
        let second_push = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.push_with(second_ticket, &second).await })
        };
        assert!(engine.push_in_flight());

        let (first_outcome, second_outcome) = tokio::join!(first_push, second_push);
        assert_eq!(first_outcome.unwrap(), PushOutcome::Committed { token: "t1".into() });
        assert_eq!(second_outcome.unwrap(), PushOutcome::Committed { token: "t2".into() });

        assert_eq!(engine.token().as_deref(), Some("t2"));
        assert_eq!(engine.remote().document().unwrap().district, "second");
        assert_eq!(engine.status(), SyncStatus::Synced);
        assert!(!engine.push_in_flight());
    }

    #[tokio::test]
    async fn test_pull_outstanding_across_a_push_is_dropped() {
        let remote = MemoryRemote::with_document(&remote_state("old"), "abc123");
        remote.queue_tokens(["def456"]);
        let engine = Arc::new(SyncEngine::new(remote));
        let applied = Arc::new(Mutex::new(Vec::new()));

        // The pull reads the pre-push document, then stalls
        let hold = engine.remote().hold_next_fetch();
        let puller = {
            let engine = Arc::clone(&engine);
            let applied = Arc::clone(&applied);
            tokio::spawn(async move {
                engine
                    .pull(&settings(), PullMode::Background, move |doc| {
                        applied.lock().unwrap().push(doc.district)
                    })
                    .await
            })
        };
        hold.entered().await;

        let mut mine = local_state();
        mine.district = "mine".into();
        assert_eq!(engine.push(&mine).await, PushOutcome::Committed { token: "def456".into() });
        assert!(!engine.push_in_flight());

        hold.release();
        assert_eq!(puller.await.unwrap(), PullOutcome::Suppressed);
        assert!(applied.lock().unwrap().is_empty());
        assert_eq!(engine.token().as_deref(), Some("def456"));
        assert_eq!(engine.status(), SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_push_creates_missing_document() {
        let engine = SyncEngine::new(MemoryRemote::new());
        let outcome = engine.push(&local_state()).await;
        assert!(matches!(outcome, PushOutcome::Committed { .. }));
        assert_eq!(engine.remote().document().unwrap().district, "42");
    }

    #[tokio::test]
    async fn test_push_conflict_keeps_token() {
        let remote = MemoryRemote::with_document(&remote_state("1"), "abc123");
        let engine = SyncEngine::new(remote);
        engine.pull(&settings(), PullMode::Foreground, |_| {}).await;

        engine.remote().race_next_write();
        let outcome = engine.push(&local_state()).await;

        assert!(matches!(outcome, PushOutcome::Failed { .. }));
        assert_eq!(engine.token().as_deref(), Some("abc123"));
        assert_eq!(engine.status(), SyncStatus::Error);
        assert!(!engine.push_in_flight(), "failed push must clear the in-flight mark");
    }

    #[tokio::test]
    async fn test_push_unconfigured() {
        let engine = SyncEngine::new(MemoryRemote::new());
        let outcome = engine.push(&ApplicationState::default()).await;
        assert_eq!(outcome, PushOutcome::NotConfigured);
        assert_eq!(engine.remote().write_count(), 0);
    }

    #[tokio::test]
    async fn test_push_falls_back_to_known_token_when_refresh_fails() {
        let remote = MemoryRemote::with_document(&remote_state("1"), "abc123");
        let engine = SyncEngine::new(remote);
        engine.pull(&settings(), PullMode::Foreground, |_| {}).await;

        engine.remote().fail_fetches(1);
        let outcome = engine.push(&local_state()).await;
        assert!(matches!(outcome, PushOutcome::Committed { .. }));
    }

    #[tokio::test]
    async fn test_pull_suppressed_while_push_in_flight() {
        let remote = MemoryRemote::with_document(&remote_state("1"), "abc123");
        remote.queue_tokens(["def456"]);
        let engine = Arc::new(SyncEngine::new(remote));
        let hold = engine.remote().hold_next_write();

        let pusher = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.push(&local_state()).await })
        };
        hold.entered().await;
        assert!(engine.push_in_flight());

        // Someone else changes the remote while our push is parked
        engine.remote().put_document(&remote_state("99"), "zzz999");
        let fetches_before = engine.remote().fetch_count();
        let outcome = engine
            .pull(&settings(), PullMode::Foreground, |_| panic!("must not apply"))
            .await;

        assert_eq!(outcome, PullOutcome::Suppressed);
        assert_eq!(engine.remote().fetch_count(), fetches_before);
        assert!(engine.token().is_none());

        hold.release();
        let pushed = pusher.await.unwrap();
        // The parked write was based on abc123, which another writer replaced
        assert!(matches!(pushed, PushOutcome::Failed { .. }));
        assert!(!engine.push_in_flight());
    }

    #[tokio::test]
    async fn test_status_events() {
        let engine = SyncEngine::new(MemoryRemote::with_document(&remote_state("1"), "abc123"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = engine.events().subscribe(move |event| {
            if let SyncEvent::StatusChanged { status, .. } = event {
                seen_clone.lock().unwrap().push(status);
            }
        });

        engine.pull(&settings(), PullMode::Foreground, |_| {}).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![SyncStatus::Syncing, SyncStatus::Synced]
        );
    }
}
