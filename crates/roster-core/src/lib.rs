//! roster-core: District roster state and its sync with a versioned remote document.
//!
//! This crate provides the core functionality for:
//! - The application state model (stores, employees, rotations, overrides, log)
//! - Schedule arithmetic for the two-week rotation
//! - Document codec for the remote store (pretty JSON in base64)
//! - LocalStore and RemoteStore trait abstractions with in-memory doubles
//! - The sync engine (conditional pulls, optimistic-concurrency pushes)
//! - `Roster`, a session that owns state, pushes on change and polls

pub mod codec;
pub mod container;
pub mod events;
pub mod model;
pub mod remote;
pub mod roster;
pub mod schedule;
pub mod session;
pub mod store;
pub mod sync_engine;

pub use container::StateContainer;
pub use events::{EventBus, Subscription, SyncEvent};
pub use model::{
    Announcement, ApplicationState, ChangeLog, ConnectionSettings, DayStatus, DriveTimeLabel,
    Employee, Rotation, RotationDay, ScheduleEntry, ShiftType, Store,
};
pub use remote::{Fetched, MemoryRemote, RemoteError, RemoteStore};
pub use roster::{EntryEdit, RosterError};
pub use session::{Mutation, Roster, SyncOptions};
pub use store::{LocalStore, MemoryStore, StoreError};
pub use sync_engine::{PullMode, PullOutcome, PushOutcome, SyncEngine, SyncError, SyncStatus};
