use async_trait::async_trait;
use companion_engine_abi::StoryEvent;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{most_recent_first, StoreError, StoryStore, VisionStore};

#[derive(Debug, Clone, PartialEq)]
struct StoredSnapshot {
    snapshot: JsonValue,
    tick: u64,
}

/// Process-local vision store. Clones share the same backing map, so a clone
/// handed to a second manager behaves like a reopened store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryVisionStore {
    snapshots: Arc<RwLock<BTreeMap<String, StoredSnapshot>>>,
}

impl InMemoryVisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tick_of(&self, session_id: &str) -> Option<u64> {
        self.snapshots
            .read()
            .await
            .get(session_id)
            .map(|stored| stored.tick)
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl VisionStore for InMemoryVisionStore {
    async fn load(&self, session_id: &str) -> Result<Option<JsonValue>, StoreError> {
        Ok(self
            .snapshots
            .read()
            .await
            .get(session_id)
            .map(|stored| stored.snapshot.clone()))
    }

    async fn save(
        &self,
        session_id: &str,
        snapshot: &JsonValue,
        tick: u64,
    ) -> Result<(), StoreError> {
        self.snapshots.write().await.insert(
            session_id.to_string(),
            StoredSnapshot {
                snapshot: snapshot.clone(),
                tick,
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryStoryStore {
    logs: Arc<RwLock<BTreeMap<String, Vec<StoryEvent>>>>,
}

impl InMemoryStoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of events ever appended for `session_id`.
    pub async fn event_count(&self, session_id: &str) -> usize {
        self.logs
            .read()
            .await
            .get(session_id)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl StoryStore for InMemoryStoryStore {
    async fn load_history(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoryEvent>, StoreError> {
        let events = self
            .logs
            .read()
            .await
            .get(session_id)
            .cloned()
            .unwrap_or_default();
        Ok(most_recent_first(events, limit))
    }

    async fn append(&self, session_id: &str, event: &StoryEvent) -> Result<(), StoreError> {
        self.logs
            .write()
            .await
            .entry(session_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn vision_round_trip_and_supersede() {
        let store = InMemoryVisionStore::new();
        assert_eq!(store.load("s").await.unwrap(), None);

        let first = json!({"entities": {"player": {"x": 100}}});
        let second = json!({"entities": {"player": {"x": 200}}});
        store.save("s", &first, 1000).await.unwrap();
        assert_eq!(store.load("s").await.unwrap(), Some(first));

        store.save("s", &second, 2000).await.unwrap();
        assert_eq!(store.load("s").await.unwrap(), Some(second));
        assert_eq!(store.tick_of("s").await, Some(2000));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn clones_share_backing_data() {
        let store = InMemoryVisionStore::new();
        let reopened = store.clone();
        store.save("s", &json!({"a": 1}), 1).await.unwrap();
        assert_eq!(reopened.load("s").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn story_history_is_bounded_and_most_recent_first() {
        let store = InMemoryStoryStore::new();
        for index in 0..5 {
            let event = StoryEvent::new(
                format!("evt_{index}"),
                1000 + index * 100,
                "observation",
                format!("event {index}"),
            );
            store.append("s", &event).await.unwrap();
        }

        let history = store.load_history("s", 3).await.unwrap();
        let ids: Vec<&str> = history.iter().map(|event| event.id.as_str()).collect();
        assert_eq!(ids, vec!["evt_4", "evt_3", "evt_2"]);
        assert_eq!(store.event_count("s").await, 5);
    }

    #[tokio::test]
    async fn story_history_is_scoped_per_session() {
        let store = InMemoryStoryStore::new();
        store
            .append("a", &StoryEvent::new("1", 1, "observation", "x"))
            .await
            .unwrap();
        assert!(store.load_history("b", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn story_log_keeps_repeated_ids() {
        let store = InMemoryStoryStore::new();
        store
            .append("s", &StoryEvent::new("evt", 1000, "observation", "first"))
            .await
            .unwrap();
        store
            .append("s", &StoryEvent::new("evt", 2000, "observation", "second"))
            .await
            .unwrap();

        let history = store.load_history("s", 10).await.unwrap();
        let summaries: Vec<&str> = history.iter().map(|event| event.summary.as_str()).collect();
        assert_eq!(summaries, vec!["second", "first"]);
        assert!(history.iter().all(|event| event.id == "evt"));
    }
}
