//! roster-daemon library: Exposes the native collaborators for testing.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod contents;
pub mod file_store;

// Re-export key types for convenience
pub use config::Config;
pub use contents::ContentsClient;
pub use file_store::FileStore;
