//! Conversation session store.
//!
//! Maps a conversation ID to its ordered turn history and ephemeral
//! metadata. Each session sits behind its own async mutex: holding the
//! guard is what makes a flow the single writer for that conversation,
//! while other conversations proceed in parallel.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gemcord_config::AppConfig;
use gemcord_core::event::{DomainEvent, EventBus};
use gemcord_core::message::{ConversationId, Turn};
use gemcord_core::provider::HarmBlockThreshold;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Settings fixed when a conversation is created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionMetadata {
    /// Who may reset this conversation; `None` lets anyone
    pub owner_id: Option<String>,

    /// Replaces the configured system prompt for this conversation
    pub system_prompt_override: Option<String>,

    pub safety_threshold: HarmBlockThreshold,

    /// Replaces the configured model for this conversation
    pub model_override: Option<String>,

    /// Send requests without tool definitions
    pub tools_disabled: bool,
}

impl SessionMetadata {
    /// Defaults for new conversations, taken from the configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            owner_id: config.owner_id.clone(),
            safety_threshold: config.harm_block_threshold,
            ..Self::default()
        }
    }
}

/// One conversation's state.
#[derive(Debug)]
pub struct Session {
    pub id: ConversationId,
    turns: Vec<Turn>,
    /// Media references currently being resolved for the in-flight turn
    pub pending_uploads: usize,
    pub created_at: DateTime<Utc>,
    last_activity: Instant,
}

impl Session {
    fn new(id: ConversationId) -> Self {
        Self {
            id,
            turns: Vec::new(),
            pending_uploads: 0,
            created_at: Utc::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Append turns in order, then trim to `max_turns`.
    pub fn append(&mut self, turns: impl IntoIterator<Item = Turn>, max_turns: usize) {
        self.turns.extend(turns);
        self.trim(max_turns);
        self.touch();
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.pending_uploads = 0;
        self.touch();
    }

    /// Drop whole exchanges from the front until the history fits.
    ///
    /// An exchange is a user turn plus every model and tool-result turn up
    /// to the next user turn, so no tool result is ever left without the
    /// call that produced it. The most recent exchange is always kept.
    fn trim(&mut self, max_turns: usize) {
        while self.turns.len() > max_turns {
            let next_exchange = self
                .turns
                .iter()
                .skip(1)
                .position(Turn::is_user)
                .map(|i| i + 1);
            match next_exchange {
                Some(idx) => {
                    self.turns.drain(..idx);
                }
                None => break,
            }
        }
    }
}

/// Cancellation handle for the turn currently running in a conversation.
///
/// Dropping it unregisters the turn, so a later stop command finds nothing
/// to cancel.
pub struct ActiveTurn<'a> {
    store: &'a SessionStore,
    id: ConversationId,
    seq: u64,
    token: CancellationToken,
}

impl ActiveTurn<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for ActiveTurn<'_> {
    fn drop(&mut self) {
        self.store
            .active
            .remove_if(&self.id, |_, (seq, _)| *seq == self.seq);
    }
}

/// Process-wide session store.
pub struct SessionStore {
    sessions: DashMap<ConversationId, Arc<Mutex<Session>>>,
    /// Kept outside the session lock so it can be read while a turn runs
    metadata: DashMap<ConversationId, SessionMetadata>,
    active: DashMap<ConversationId, (u64, CancellationToken)>,
    /// Total token count of each conversation's latest model response
    usage: DashMap<ConversationId, u32>,
    next_seq: AtomicU64,
    root: CancellationToken,
    max_turns: usize,
    defaults: SessionMetadata,
}

impl SessionStore {
    pub fn new(max_turns: usize, defaults: SessionMetadata) -> Self {
        Self {
            sessions: DashMap::new(),
            metadata: DashMap::new(),
            active: DashMap::new(),
            usage: DashMap::new(),
            next_seq: AtomicU64::new(0),
            root: CancellationToken::new(),
            max_turns,
            defaults,
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    /// Get the session for `id`, creating an empty one if needed.
    pub fn get_or_create(&self, id: &ConversationId) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(conversation_id = %id, "Creating session");
                Arc::new(Mutex::new(Session::new(id.clone())))
            })
            .clone()
    }

    /// Acquire exclusive access to a conversation, waiting for any turn in progress.
    pub async fn lock(&self, id: &ConversationId) -> OwnedMutexGuard<Session> {
        self.get_or_create(id).lock_owned().await
    }

    /// Append one turn to a conversation.
    pub async fn append_turn(&self, id: &ConversationId, turn: Turn) {
        let mut session = self.lock(id).await;
        session.append([turn], self.max_turns);
    }

    /// Snapshot of a conversation's history.
    pub async fn history(&self, id: &ConversationId) -> Vec<Turn> {
        match self.sessions.get(id).map(|s| s.clone()) {
            Some(session) => session.lock().await.turns.clone(),
            None => Vec::new(),
        }
    }

    /// Metadata for `id`, falling back to the store defaults.
    pub fn metadata(&self, id: &ConversationId) -> SessionMetadata {
        self.metadata
            .get(id)
            .map(|m| m.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Replace a conversation's metadata.
    pub fn configure(&self, id: &ConversationId, metadata: SessionMetadata) {
        self.get_or_create(id);
        self.metadata.insert(id.clone(), metadata);
    }

    /// Apply `update` to a conversation's metadata and store the result.
    pub fn update_metadata(
        &self,
        id: &ConversationId,
        update: impl FnOnce(&mut SessionMetadata),
    ) -> SessionMetadata {
        let mut metadata = self.metadata(id);
        update(&mut metadata);
        self.configure(id, metadata.clone());
        metadata
    }

    pub fn record_usage(&self, id: &ConversationId, total_tokens: u32) {
        self.usage.insert(id.clone(), total_tokens);
    }

    /// Token count reported for the conversation's latest model response.
    pub fn last_token_count(&self, id: &ConversationId) -> Option<u32> {
        self.usage.get(id).map(|n| *n)
    }

    pub fn contains(&self, id: &ConversationId) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Register a new turn for `id` and get its cancellation handle.
    pub fn begin_turn(&self, id: &ConversationId) -> ActiveTurn<'_> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let token = self.root.child_token();
        self.active.insert(id.clone(), (seq, token.clone()));
        ActiveTurn {
            store: self,
            id: id.clone(),
            seq,
            token,
        }
    }

    /// Cancel the turn in progress for `id`. Returns whether one was running.
    pub fn cancel(&self, id: &ConversationId) -> bool {
        match self.active.get(id) {
            Some(entry) => {
                entry.1.cancel();
                info!(conversation_id = %id, "Cancelled in-flight turn");
                true
            }
            None => false,
        }
    }

    /// Cancel any turn in progress, then clear the history.
    pub async fn reset(&self, id: &ConversationId) {
        self.cancel(id);
        self.lock(id).await.clear();
        info!(conversation_id = %id, "Session reset");
    }

    /// Drop sessions idle for longer than `older_than`.
    ///
    /// Sessions that are locked or referenced by a running flow are skipped.
    pub fn evict_idle(&self, older_than: Duration) -> Vec<(ConversationId, Duration)> {
        let candidates: Vec<ConversationId> = self
            .sessions
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .is_ok_and(|s| s.idle_for() > older_than)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for id in candidates {
            let mut idle = Duration::ZERO;
            let removed = self.sessions.remove_if(&id, |_, session| {
                // Only the map holds it, so nobody can be about to lock it.
                Arc::strong_count(session) == 1
                    && session.try_lock().is_ok_and(|s| {
                        idle = s.idle_for();
                        idle > older_than
                    })
            });
            if removed.is_some() {
                self.metadata.remove(&id);
                self.usage.remove(&id);
                debug!(conversation_id = %id, idle_secs = idle.as_secs(), "Evicted idle session");
                evicted.push((id, idle));
            }
        }
        evicted
    }

    /// Periodically evict idle sessions until `shutdown` fires.
    pub fn spawn_eviction(
        self: &Arc<Self>,
        idle_timeout: Duration,
        interval: Duration,
        events: Arc<EventBus>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for (id, idle) in store.evict_idle(idle_timeout) {
                            events.publish(DomainEvent::SessionEvicted {
                                conversation_id: id.to_string(),
                                idle_secs: idle.as_secs(),
                                timestamp: Utc::now(),
                            });
                        }
                    }
                }
            }
            debug!("Session eviction task stopped");
        })
    }

    /// Cancel every in-flight turn.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gemcord_core::message::{ModelTurn, ToolResultTurn, UserTurn};
    use gemcord_core::tool::{ToolCall, ToolOutcome};

    fn user(text: &str) -> Turn {
        Turn::User(UserTurn::new("u1", text))
    }

    fn answer(text: &str) -> Turn {
        Turn::Model(ModelTurn::answer(text, vec![]))
    }

    fn tool_exchange(n: usize) -> Vec<Turn> {
        let call = ToolCall {
            id: format!("c{n}"),
            name: "symbolic_math".into(),
            arguments: serde_json::json!({"expression": "1+1"}),
        };
        vec![
            user(&format!("q{n}")),
            Turn::Model(ModelTurn::with_calls("", vec![call.clone()])),
            Turn::ToolResult(ToolResultTurn::new(&call, ToolOutcome::Success(serde_json::json!(2)))),
            answer(&format!("a{n}")),
        ]
    }

    fn texts(turns: &[Turn]) -> Vec<String> {
        turns
            .iter()
            .map(|t| match t {
                Turn::User(u) => u.text.clone(),
                Turn::Model(m) => m.text.clone(),
                Turn::ToolResult(r) => r.tool_name.clone(),
            })
            .collect()
    }

    #[tokio::test]
    async fn get_or_create_returns_same_session() {
        let store = SessionStore::new(10, SessionMetadata::default());
        let id = ConversationId::from("c1");
        let a = store.get_or_create(&id);
        let b = store.get_or_create(&id);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let store = SessionStore::new(10, SessionMetadata::default());
        let id = ConversationId::from("c1");
        store.append_turn(&id, user("hi")).await;
        store.append_turn(&id, answer("hello")).await;
        assert_eq!(texts(&store.history(&id).await), vec!["hi", "hello"]);
    }

    #[tokio::test]
    async fn trimming_drops_whole_exchanges() {
        let store = SessionStore::new(6, SessionMetadata::default());
        let id = ConversationId::from("c1");
        {
            let mut session = store.lock(&id).await;
            session.append(tool_exchange(1), store.max_turns());
            session.append(tool_exchange(2), store.max_turns());
        }
        let history = store.history(&id).await;
        // First exchange (4 turns) dropped as a unit; no orphaned tool result.
        assert_eq!(history.len(), 4);
        assert!(history[0].is_user());
        assert_eq!(texts(&history), vec!["q2", "", "symbolic_math", "a2"]);
    }

    #[tokio::test]
    async fn latest_exchange_survives_even_when_oversized() {
        let store = SessionStore::new(2, SessionMetadata::default());
        let id = ConversationId::from("c1");
        store.lock(&id).await.append(tool_exchange(1), 2);
        assert_eq!(store.history(&id).await.len(), 4);
    }

    #[tokio::test]
    async fn lock_serializes_same_conversation() {
        let store = Arc::new(SessionStore::new(10, SessionMetadata::default()));
        let id = ConversationId::from("c1");

        let guard = store.lock(&id).await;
        let store2 = store.clone();
        let id2 = id.clone();
        let waiter = tokio::spawn(async move {
            store2.append_turn(&id2, user("second")).await;
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(store.history(&id).await.len(), 1);
    }

    #[tokio::test]
    async fn different_conversations_do_not_block() {
        let store = SessionStore::new(10, SessionMetadata::default());
        let _held = store.lock(&ConversationId::from("a")).await;
        let other = tokio::time::timeout(
            Duration::from_millis(100),
            store.append_turn(&ConversationId::from("b"), user("x")),
        )
        .await;
        assert!(other.is_ok());
    }

    #[tokio::test]
    async fn cancel_targets_active_turn_only() {
        let store = SessionStore::new(10, SessionMetadata::default());
        let id = ConversationId::from("c1");
        assert!(!store.cancel(&id));

        let turn = store.begin_turn(&id);
        assert!(store.cancel(&id));
        assert!(turn.token().is_cancelled());
        drop(turn);

        assert!(!store.cancel(&id));
        let next = store.begin_turn(&id);
        assert!(!next.token().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_cancels_all_turns() {
        let store = SessionStore::new(10, SessionMetadata::default());
        let a = store.begin_turn(&ConversationId::from("a"));
        let b = store.begin_turn(&ConversationId::from("b"));
        store.shutdown();
        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }

    #[tokio::test]
    async fn reset_clears_history() {
        let store = SessionStore::new(10, SessionMetadata::default());
        let id = ConversationId::from("c1");
        store.append_turn(&id, user("hi")).await;
        store.reset(&id).await;
        assert!(store.history(&id).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn evict_idle_removes_only_stale_unlocked_sessions() {
        let store = SessionStore::new(10, SessionMetadata::default());
        let stale = ConversationId::from("stale");
        let busy = ConversationId::from("busy");
        store.append_turn(&stale, user("old")).await;
        store.append_turn(&busy, user("old")).await;

        tokio::time::advance(Duration::from_secs(120)).await;
        let fresh = ConversationId::from("fresh");
        store.append_turn(&fresh, user("new")).await;

        let _guard = store.lock(&busy).await;
        let evicted = store.evict_idle(Duration::from_secs(60));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, stale);
        assert!(!store.contains(&stale));
        assert!(store.contains(&busy));
        assert!(store.contains(&fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_task_publishes_events() {
        let store = Arc::new(SessionStore::new(10, SessionMetadata::default()));
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let shutdown = CancellationToken::new();

        store.append_turn(&ConversationId::from("c1"), user("hi")).await;
        let handle = store.spawn_eviction(
            Duration::from_secs(10),
            Duration::from_secs(5),
            events.clone(),
            shutdown.clone(),
        );

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.as_ref(), DomainEvent::SessionEvicted { conversation_id, .. } if conversation_id == "c1"));
        assert!(store.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn new_sessions_use_default_metadata() {
        let defaults = SessionMetadata {
            owner_id: Some("owner".into()),
            safety_threshold: HarmBlockThreshold::BlockNone,
            ..SessionMetadata::default()
        };
        let store = SessionStore::new(10, defaults.clone());
        let id = ConversationId::from("c1");
        assert_eq!(store.metadata(&id), defaults);

        let custom = SessionMetadata {
            safety_threshold: HarmBlockThreshold::BlockLowAndAbove,
            ..defaults.clone()
        };
        store.configure(&id, custom.clone());
        assert_eq!(store.metadata(&id), custom);

        // Readable while a turn holds the session.
        let _guard = store.lock(&id).await;
        assert_eq!(store.metadata(&id).safety_threshold, HarmBlockThreshold::BlockLowAndAbove);
        assert_eq!(store.metadata(&ConversationId::from("other")), defaults);
    }

    #[tokio::test]
    async fn update_metadata_keeps_other_fields() {
        let defaults = SessionMetadata {
            owner_id: Some("owner".into()),
            ..SessionMetadata::default()
        };
        let store = SessionStore::new(10, defaults);
        let id = ConversationId::from("c1");
        let updated = store.update_metadata(&id, |m| m.model_override = Some("gemini-pro".into()));
        assert_eq!(updated.owner_id.as_deref(), Some("owner"));
        assert_eq!(store.metadata(&id).model_override.as_deref(), Some("gemini-pro"));
        assert!(!store.metadata(&id).tools_disabled);
    }

    #[test]
    fn usage_tracks_latest_response() {
        let store = SessionStore::new(10, SessionMetadata::default());
        let id = ConversationId::from("c1");
        assert_eq!(store.last_token_count(&id), None);
        store.record_usage(&id, 120);
        store.record_usage(&id, 45);
        assert_eq!(store.last_token_count(&id), Some(45));
    }
}
