//! Persistence collaborators for engine sessions: the latest vision snapshot
//! per session and an append-only story log per session.

use async_trait::async_trait;
use companion_engine_abi::StoryEvent;
use serde_json::Value as JsonValue;
use std::io;
use thiserror::Error;

mod file;
mod memory;

pub use file::{FileStoryStore, FileVisionStore};
pub use memory::{InMemoryStoryStore, InMemoryVisionStore};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store document version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u64, found: u64 },
    #[error("store io failed: {0}")]
    Io(String),
    #[error("store serde failed: {0}")]
    Serde(String),
}

impl From<io::Error> for StoreError {
    fn from(error: io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serde(error.to_string())
    }
}

/// Latest-snapshot store. `save` is an upsert; the last write wins.
#[async_trait]
pub trait VisionStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<JsonValue>, StoreError>;

    async fn save(&self, session_id: &str, snapshot: &JsonValue, tick: u64)
        -> Result<(), StoreError>;
}

/// Append-only story log.
///
/// Event ids are not checked for uniqueness: appending an id that is already
/// in the log stores a second entry, and both come back from `load_history`.
#[async_trait]
pub trait StoryStore: Send + Sync {
    /// At most `limit` events, most recent first.
    async fn load_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoryEvent>, StoreError>;

    async fn append(&self, session_id: &str, event: &StoryEvent) -> Result<(), StoreError>;
}

/// Orders events most-recent-first and keeps the first `limit`. Events with
/// equal timestamps keep the later-appended one first.
pub(crate) fn most_recent_first(mut events: Vec<StoryEvent>, limit: usize) -> Vec<StoryEvent> {
    events.reverse();
    events.sort_by(|left, right| right.timestamp.cmp(&left.timestamp));
    events.truncate(limit);
    events
}
