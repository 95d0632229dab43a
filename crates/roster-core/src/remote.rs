//! RemoteStore trait for the versioned document host.
//!
//! Implementations:
//! - `MemoryRemote` - For testing (token sequencing, failure injection, request holds)
//! - `ContentsClient` (in roster-daemon) - Repository contents HTTP API

use crate::codec;
use crate::model::{ApplicationState, ConnectionSettings};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Version conflict (expected {expected:?})")]
    Conflict { expected: Option<String> },

    #[error("Malformed response: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// Result of a (possibly conditional) read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched {
    /// The document still matches the token supplied as `if_none_match`.
    Unchanged,
    /// No document exists at the configured path.
    Missing,
    /// Current base64 content and its version token.
    Document { content: String, token: String },
}

/// Versioned blob store addressed by repository, branch and path.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the document. With `if_none_match`, the store may answer
    /// [`Fetched::Unchanged`] instead of transferring content.
    async fn fetch(&self, settings: &ConnectionSettings, if_none_match: Option<&str>) -> Result<Fetched>;

    /// Replace the document with base64 `content`.
    ///
    /// `expected` is the version token the write is based on (`None` to create).
    /// Fails with [`RemoteError::Conflict`] if it no longer matches. Returns the
    /// new token.
    async fn write(
        &self,
        settings: &ConnectionSettings,
        content: &str,
        expected: Option<&str>,
        message: &str,
    ) -> Result<String>;
}

/// A pause point for the next request to a [`MemoryRemote`].
///
/// A held write parks after it has been received and before it is applied.
/// A held fetch reads the document first and parks before answering, like a
/// slow response. Either lets a test act while the request is outstanding.
#[derive(Default)]
pub struct RemoteHold {
    entered: Notify,
    released: Notify,
}

impl RemoteHold {
    /// Wait until the held request has reached the store.
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the held request proceed.
    pub fn release(&self) {
        self.released.notify_one();
    }
}

#[derive(Default)]
struct RemoteDoc {
    content: Option<String>,
    token: Option<String>,
    revision: u64,
    next_tokens: VecDeque<String>,
    unreachable: bool,
    failing_fetches: usize,
    race_next_write: bool,
    last_message: Option<String>,
}

impl RemoteDoc {
    fn next_token(&mut self) -> String {
        self.revision += 1;
        self.next_tokens
            .pop_front()
            .unwrap_or_else(|| format!("rev-{}", self.revision))
    }
}

/// In-memory document host for testing.
#[derive(Default)]
pub struct MemoryRemote {
    doc: Mutex<RemoteDoc>,
    write_hold: Mutex<Option<Arc<RemoteHold>>>,
    fetch_hold: Mutex<Option<Arc<RemoteHold>>>,
    fetches: AtomicUsize,
    conditional_fetches: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryRemote {
    /// An empty store: fetches report [`Fetched::Missing`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A store already holding `state` at version `token`.
    pub fn with_document(state: &ApplicationState, token: &str) -> Self {
        let remote = Self::new();
        remote.put_document(state, token);
        remote
    }

    fn doc(&self) -> std::sync::MutexGuard<'_, RemoteDoc> {
        self.doc.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the document out of band, as another client would.
    pub fn put_document(&self, state: &ApplicationState, token: &str) {
        let content = codec::encode(state).unwrap_or_default();
        let mut doc = self.doc();
        doc.content = Some(content);
        doc.token = Some(token.to_string());
    }

    /// Tokens to hand out for the next successful writes, in order.
    pub fn queue_tokens<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.doc().next_tokens.extend(tokens.into_iter().map(Into::into));
    }

    /// Make every request fail with a transport error until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.doc().unreachable = unreachable;
    }

    /// Make the next `count` fetches fail with a server error.
    pub fn fail_fetches(&self, count: usize) {
        self.doc().failing_fetches = count;
    }

    /// Have another writer land between the next write's token refresh and its PUT.
    pub fn race_next_write(&self) {
        self.doc().race_next_write = true;
    }

    /// Park the next write until the returned hold is released.
    pub fn hold_next_write(&self) -> Arc<RemoteHold> {
        let hold = Arc::new(RemoteHold::default());
        *self.write_hold.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&hold));
        hold
    }

    /// Answer the next fetch with the document as it is now, but only once
    /// the returned hold is released.
    pub fn hold_next_fetch(&self) -> Arc<RemoteHold> {
        let hold = Arc::new(RemoteHold::default());
        *self.fetch_hold.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&hold));
        hold
    }

    fn read(&self, if_none_match: Option<&str>) -> Result<Fetched> {
        let mut doc = self.doc();
        if doc.unreachable {
            return Err(RemoteError::Transport("store unreachable".into()));
        }
        if doc.failing_fetches > 0 {
            doc.failing_fetches -= 1;
            return Err(RemoteError::Status {
                status: 500,
                message: "injected failure".into(),
            });
        }

        match (&doc.content, &doc.token) {
            (Some(_), Some(token)) if if_none_match == Some(token.as_str()) => {
                Ok(Fetched::Unchanged)
            }
            (Some(content), Some(token)) => Ok(Fetched::Document {
                content: content.clone(),
                token: token.clone(),
            }),
            _ => Ok(Fetched::Missing),
        }
    }

    pub fn current_token(&self) -> Option<String> {
        self.doc().token.clone()
    }

    /// The stored document, decoded.
    pub fn document(&self) -> Option<ApplicationState> {
        let content = self.doc().content.clone()?;
        codec::decode(content.as_bytes()).ok()
    }

    pub fn last_message(&self) -> Option<String> {
        self.doc().last_message.clone()
    }

    /// All reads, conditional or not.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Reads that carried an `if_none_match` token.
    pub fn conditional_fetch_count(&self) -> usize {
        self.conditional_fetches.load(Ordering::SeqCst)
    }

    /// Writes that reached the store (including rejected ones).
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch(&self, _settings: &ConnectionSettings, if_none_match: Option<&str>) -> Result<Fetched> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if if_none_match.is_some() {
            self.conditional_fetches.fetch_add(1, Ordering::SeqCst);
        }

        let answer = self.read(if_none_match);

        let hold = self.fetch_hold.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.released.notified().await;
        }
        answer
    }

    async fn write(
        &self,
        _settings: &ConnectionSettings,
        content: &str,
        expected: Option<&str>,
        message: &str,
    ) -> Result<String> {
        self.writes.fetch_add(1, Ordering::SeqCst);

        let hold = self.write_hold.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(hold) = hold {
            hold.entered.notify_one();
            hold.released.notified().await;
        }

        let mut doc = self.doc();
        if doc.unreachable {
            return Err(RemoteError::Transport("store unreachable".into()));
        }
        if std::mem::take(&mut doc.race_next_write) {
            let token = doc.next_token();
            doc.token = Some(token);
        }
        if doc.token.as_deref() != expected {
            return Err(RemoteError::Conflict {
                expected: expected.map(str::to_string),
            });
        }

        let token = doc.next_token();
        doc.content = Some(content.to_string());
        doc.token = Some(token.clone());
        doc.last_message = Some(message.to_string());
        Ok(token)
    }
}
