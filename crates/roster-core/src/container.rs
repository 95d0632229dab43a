//! StateContainer: the single owner of the application state.
//!
//! All changes go through [`StateContainer::mutate`] (user edits) or
//! [`StateContainer::merge_remote`] (pulled documents). Both persist the result
//! to the local store before returning, independent of any network activity.

use crate::model::{ApplicationState, ConnectionSettings};
use crate::store::{LocalStore, SESSION_KEY, STATE_KEY};
use tracing::{debug, warn};

pub struct StateContainer<L: LocalStore> {
    state: ApplicationState,
    local: L,
    authorized: bool,
}

impl<L: LocalStore> StateContainer<L> {
    /// Restore from the local store, falling back to the default document
    /// when nothing usable is cached.
    pub fn load(local: L) -> Self {
        let state = match local.get(STATE_KEY) {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(state) => state,
                Err(e) => {
                    warn!("Cached state is unreadable, starting from defaults: {}", e);
                    ApplicationState::default()
                }
            },
            Ok(None) => ApplicationState::default(),
            Err(e) => {
                warn!("Failed to read cached state, starting from defaults: {}", e);
                ApplicationState::default()
            }
        };
        let authorized = matches!(local.get(SESSION_KEY), Ok(Some(flag)) if flag == "true");

        Self {
            state,
            local,
            authorized,
        }
    }

    pub fn state(&self) -> &ApplicationState {
        &self.state
    }

    /// Connection settings, only when configured for sync.
    pub fn connection(&self) -> Option<&ConnectionSettings> {
        self.state.connection()
    }

    pub fn is_authorized(&self) -> bool {
        self.authorized
    }

    /// Sign in or out. The flag survives restarts.
    pub fn set_authorized(&mut self, authorized: bool) {
        self.authorized = authorized;
        let result = if authorized {
            self.local.set(SESSION_KEY, "true")
        } else {
            self.local.remove(SESSION_KEY)
        };
        if let Err(e) = result {
            warn!("Failed to persist session flag: {}", e);
        }
    }

    /// The mutation gate.
    ///
    /// Returns `None` without touching anything when the caller is not
    /// authorized; otherwise commits `transform`'s result and returns it.
    pub fn mutate<F>(&mut self, transform: F) -> Option<&ApplicationState>
    where
        F: FnOnce(ApplicationState) -> ApplicationState,
    {
        if !self.authorized {
            debug!("Ignoring mutation: not authorized");
            return None;
        }
        self.commit(transform);
        Some(&self.state)
    }

    /// Merge a pulled document (full overwrite, local connection settings kept).
    pub fn merge_remote(&mut self, incoming: ApplicationState) {
        self.commit(|local| local.merged_with_remote(incoming));
    }

    fn commit<F>(&mut self, transform: F)
    where
        F: FnOnce(ApplicationState) -> ApplicationState,
    {
        let current = std::mem::take(&mut self.state);
        self.state = transform(current);
        self.persist();
    }

    fn persist(&self) {
        match serde_json::to_string(&self.state) {
            Ok(json) => {
                if let Err(e) = self.local.set(STATE_KEY, &json) {
                    warn!("Failed to persist state locally: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize state: {}", e),
        }
    }
}
