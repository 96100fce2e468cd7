use companion_engine_abi::{EngineRuntime, OutputEvent, ERROR_SESSION_NOT_FOUND};
use companion_engine_store::{StoryStore, VisionStore};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::DEFAULT_HISTORY_LIMIT;
use crate::session::{EngineSession, SessionState};
use crate::SessionError;

pub type SharedSession = Arc<Mutex<EngineSession>>;

/// Registry of live sessions keyed by session id.
///
/// The registry lock is never held while waiting on a session lock.
pub struct EngineSessionManager {
    runtime: Arc<dyn EngineRuntime>,
    vision_store: Arc<dyn VisionStore>,
    story_store: Arc<dyn StoryStore>,
    history_limit: usize,
    sessions: Mutex<BTreeMap<String, SharedSession>>,
}

impl EngineSessionManager {
    pub fn new(
        runtime: Arc<dyn EngineRuntime>,
        vision_store: Arc<dyn VisionStore>,
        story_store: Arc<dyn StoryStore>,
    ) -> Self {
        Self {
            runtime,
            vision_store,
            story_store,
            history_limit: DEFAULT_HISTORY_LIMIT,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    /// Returns the ready session for `session_id`, creating and initializing
    /// one when none is registered. Concurrent callers with the same id share
    /// a single initialization; the `init` outputs stay available through
    /// [`EngineSession::ready_events`].
    pub async fn get_or_create(
        &self,
        session_id: &str,
        character_id: &str,
        character_card: &JsonValue,
        config: &JsonValue,
    ) -> Result<SharedSession, SessionError> {
        loop {
            let shared = {
                let mut sessions = self.sessions.lock().await;
                Arc::clone(sessions.entry(session_id.to_string()).or_insert_with(|| {
                    Arc::new(Mutex::new(
                        EngineSession::new(session_id, character_id)
                            .with_history_limit(self.history_limit),
                    ))
                }))
            };

            let mut session = shared.lock().await;
            if !self.is_registered(session_id, &shared).await {
                continue;
            }
            match session.state() {
                SessionState::Ready if session.is_ready() => {
                    session.touch();
                    drop(session);
                    return Ok(shared);
                }
                SessionState::Closed => {
                    drop(session);
                    self.unregister(session_id, &shared).await;
                    continue;
                }
                _ => {}
            }

            let initialized = session
                .initialize(
                    self.runtime.as_ref(),
                    self.vision_store.as_ref(),
                    self.story_store.as_ref(),
                    character_card,
                    config,
                )
                .await;
            drop(session);
            return match initialized {
                Ok(_) => Ok(shared),
                Err(err) => {
                    self.unregister(session_id, &shared).await;
                    Err(err)
                }
            };
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<SharedSession> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Routes a world delta to a registered session. An unknown id yields a
    /// single `session_not_found` error event.
    pub async fn on_world_diff(
        &self,
        session_id: &str,
        diff: &JsonValue,
    ) -> Result<Vec<OutputEvent>, SessionError> {
        let Some(shared) = self.get(session_id).await else {
            return Ok(session_not_found(session_id));
        };
        let mut session = shared.lock().await;
        session
            .on_world_diff(self.vision_store.as_ref(), self.story_store.as_ref(), diff)
            .await
    }

    pub async fn on_player_message(
        &self,
        session_id: &str,
        player_id: &str,
        text: &str,
    ) -> Vec<OutputEvent> {
        let Some(shared) = self.get(session_id).await else {
            return session_not_found(session_id);
        };
        let mut session = shared.lock().await;
        session.on_player_message(player_id, text).await
    }

    pub async fn on_tick(&self, session_id: &str, elapsed_ms: u64) -> Vec<OutputEvent> {
        let Some(shared) = self.get(session_id).await else {
            return session_not_found(session_id);
        };
        let mut session = shared.lock().await;
        session.on_tick(elapsed_ms).await
    }

    /// Unregisters and closes one session. Returns false for an unknown id.
    pub async fn close(&self, session_id: &str) -> Result<bool, SessionError> {
        let removed = self.sessions.lock().await.remove(session_id);
        let Some(shared) = removed else {
            return Ok(false);
        };
        shared.lock().await.close()?;
        Ok(true)
    }

    /// Closes sessions idle for longer than `idle_timeout` and returns how
    /// many were removed. Sessions busy with a call are skipped and get
    /// another chance on the next sweep.
    pub async fn cleanup_idle(&self, idle_timeout: Duration) -> usize {
        let Some(cutoff) = Instant::now().checked_sub(idle_timeout) else {
            return 0;
        };
        let candidates = self.collect_stale(cutoff).await;
        if candidates.is_empty() {
            return 0;
        }
        let evicted = self.evict_stale(candidates, cutoff).await;

        let closed = evicted.len();
        for (session_id, mut session) in evicted {
            if let Err(err) = session.close() {
                tracing::warn!(session_id = %session_id, error = %err, "closing idle session failed");
            }
        }
        if closed > 0 {
            tracing::info!(closed, "idle engine sessions cleaned up");
        }
        closed
    }

    async fn collect_stale(&self, cutoff: Instant) -> Vec<(String, SharedSession)> {
        let snapshot: Vec<(String, SharedSession)> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(id, shared)| (id.clone(), Arc::clone(shared)))
            .collect();
        snapshot
            .into_iter()
            .filter(|(_, shared)| is_stale(shared, cutoff))
            .collect()
    }

    /// Re-checks each candidate under the registry lock and unregisters the
    /// ones still stale. The session guard is held until the caller closes
    /// it, so no request can touch a session between the check and close.
    async fn evict_stale(
        &self,
        candidates: Vec<(String, SharedSession)>,
        cutoff: Instant,
    ) -> Vec<(String, OwnedMutexGuard<EngineSession>)> {
        let mut sessions = self.sessions.lock().await;
        let mut evicted = Vec::new();
        for (session_id, shared) in candidates {
            let still_registered = sessions
                .get(&session_id)
                .is_some_and(|current| Arc::ptr_eq(current, &shared));
            if !still_registered {
                continue;
            }
            let Ok(session) = shared.try_lock_owned() else {
                continue;
            };
            if session.last_active() < cutoff {
                sessions.remove(&session_id);
                evicted.push((session_id, session));
            }
        }
        evicted
    }

    /// Closes every session and empties the registry.
    pub async fn close_all(&self) -> usize {
        let drained = std::mem::take(&mut *self.sessions.lock().await);
        let count = drained.len();
        for (session_id, shared) in drained {
            if let Err(err) = shared.lock().await.close() {
                tracing::warn!(session_id = %session_id, error = %err, "closing session failed");
            }
        }
        if count > 0 {
            tracing::info!(count, "all engine sessions closed");
        }
        count
    }

    async fn is_registered(&self, session_id: &str, shared: &SharedSession) -> bool {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
    }

    async fn unregister(&self, session_id: &str, shared: &SharedSession) {
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
        {
            sessions.remove(session_id);
        }
    }
}

/// A session is stale when it is idle past `cutoff` and nobody holds it.
fn is_stale(shared: &SharedSession, cutoff: Instant) -> bool {
    shared
        .try_lock()
        .map(|session| session.last_active() < cutoff)
        .unwrap_or(false)
}

fn session_not_found(session_id: &str) -> Vec<OutputEvent> {
    vec![OutputEvent::error(
        ERROR_SESSION_NOT_FOUND,
        format!("no session registered for {session_id}"),
    )]
}
