//! The per-stream [`Session`] record and the store that serializes access
//! to it across the main dialogue loop and the background schedulers.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use kfc_core::{StreamId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::instrument;

use crate::mental_log::{MentalLog, MentalLogEntry};
use crate::models::{EventKind, WaitingConfig};

/// State for one conversation stream: the mental log, current waiting
/// state, and bookkeeping used by the proactive scheduler.
#[derive(Debug, Clone)]
pub struct Session {
    pub stream_id: StreamId,
    pub mental_log: MentalLog,
    pub waiting_config: WaitingConfig,
    pub consecutive_timeout_count: u32,
    pub created_at: f64,
    pub last_activity_at: f64,
    pub last_user_message_at: Option<f64>,
    pub last_proactive_at: Option<f64>,
    pub total_interactions: u64,
}

impl Session {
    pub fn new(stream_id: StreamId, max_log_entries: usize) -> Self {
        Self {
            stream_id,
            mental_log: MentalLog::new(max_log_entries),
            waiting_config: WaitingConfig::default(),
            consecutive_timeout_count: 0,
            created_at: 0.0,
            last_activity_at: 0.0,
            last_user_message_at: None,
            last_proactive_at: None,
            total_interactions: 0,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_config.is_active()
    }

    /// Appends a `UserMessage` entry. Per the incoming-message invariant,
    /// this always resets `consecutive_timeout_count` to 0 and, if the
    /// session was waiting, annotates the entry with `reply_status` before
    /// the caller separately records `ReplyInTime`/`ReplyLate` and clears
    /// the wait.
    pub fn add_user_message(&mut self, now: f64, user_name: &str, user_id: &UserId, content: &str) {
        let mut entry = MentalLogEntry::new(EventKind::UserMessage, now);
        entry.user_name = user_name.to_string();
        entry.user_id = user_id.clone();
        entry.content = content.to_string();
        if self.is_waiting() {
            let elapsed = self.waiting_config.elapsed_seconds(now);
            let reply_status = if elapsed <= self.waiting_config.max_wait_seconds { "in_time" } else { "late" };
            entry.metadata.insert("reply_status".to_string(), serde_json::Value::String(reply_status.to_string()));
            entry
                .metadata
                .insert("elapsed_seconds".to_string(), serde_json::json!(elapsed));
            entry
                .metadata
                .insert("max_wait_seconds".to_string(), serde_json::json!(self.waiting_config.max_wait_seconds));
        }
        self.mental_log.add(entry);
        self.consecutive_timeout_count = 0;
        self.last_user_message_at = Some(now);
        self.last_activity_at = now;
        self.total_interactions += 1;
    }

    pub fn add_bot_planning(
        &mut self,
        now: f64,
        thought: &str,
        actions: Vec<crate::models::ActionRecord>,
        expected_reaction: &str,
        max_wait_seconds: f64,
    ) {
        let mut entry = MentalLogEntry::new(EventKind::BotPlanning, now);
        entry.thought = thought.to_string();
        entry.actions = actions;
        entry.expected_reaction = expected_reaction.to_string();
        entry.max_wait_seconds = max_wait_seconds;
        self.mental_log.add(entry);
        self.last_activity_at = now;
    }

    /// Records a continuous-thinking update. Deliberately does NOT bump
    /// `last_activity_at` — an internal thought is not external activity,
    /// and must not reset the proactive-trigger silence timer.
    pub fn add_waiting_update(&mut self, now: f64, thought: &str) {
        let mut entry = MentalLogEntry::new(EventKind::WaitingUpdate, now);
        entry.waiting_thought = thought.to_string();
        self.mental_log.add(entry);
        self.waiting_config.pending_thoughts.push(thought.to_string());
    }

    pub fn record_reply_timing(&mut self, now: f64, expected_reaction: &str) {
        let elapsed = self.waiting_config.elapsed_seconds(now);
        let kind = if elapsed <= self.waiting_config.max_wait_seconds {
            EventKind::ReplyInTime
        } else {
            EventKind::ReplyLate
        };
        let mut entry = MentalLogEntry::new(kind, now);
        entry.elapsed_seconds = elapsed;
        entry.expected_reaction = expected_reaction.to_string();
        self.mental_log.add(entry);
    }

    /// Installs a new wait. `max_wait_seconds <= 0` means "don't wait" and
    /// behaves exactly like `clear_waiting` instead of installing an
    /// already-expired wait.
    pub fn set_waiting(
        &mut self,
        now: f64,
        expected_reaction: &str,
        max_wait_seconds: f64,
        followup_count: u32,
    ) {
        if max_wait_seconds <= 0.0 {
            self.clear_waiting(now);
            return;
        }
        self.waiting_config = WaitingConfig {
            expected_reaction: expected_reaction.to_string(),
            max_wait_seconds,
            started_at: now,
            last_thinking_at: 0.0,
            thinking_count: 0,
            followup_count,
            pending_thoughts: Vec::new(),
        };
        let mut entry = MentalLogEntry::new(EventKind::WaitingStart, now);
        entry.max_wait_seconds = max_wait_seconds;
        entry.expected_reaction = expected_reaction.to_string();
        self.mental_log.add(entry);
    }

    /// Ends the current wait and bumps `last_activity_at` — unlike
    /// `add_waiting_update`, clearing a wait always represents externally
    /// observable progress (a reply arrived, or the bot gave up).
    pub fn clear_waiting(&mut self, now: f64) {
        self.waiting_config.reset();
        self.last_activity_at = now;
    }

    pub fn record_timeout(&mut self, now: f64) -> Vec<String> {
        self.consecutive_timeout_count += 1;
        let elapsed = self.waiting_config.elapsed_seconds(now);
        let mut entry = MentalLogEntry::new(EventKind::WaitTimeout, now);
        entry.elapsed_seconds = elapsed;
        self.mental_log.add(entry);
        let pending = self.waiting_config.pending_thoughts.clone();
        self.clear_waiting(now);
        pending
    }

    pub fn reset_timeout_streak(&mut self) {
        self.consecutive_timeout_count = 0;
    }

    /// Records that a proactive-conversation trigger fired for this stream.
    /// Does not touch `last_activity_at` — the trigger is the bot speaking
    /// first, not the counterpart replying.
    pub fn mark_proactive(&mut self, now: f64) {
        self.mental_log.add(MentalLogEntry::new(EventKind::ProactiveTrigger, now));
        self.last_proactive_at = Some(now);
    }
}

/// Persisted shape of a [`Session`], used by [`SessionBackingStore`]
/// implementations that serialize to JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub stream_id: String,
    pub mental_log: Vec<MentalLogEntry>,
    pub waiting_config: WaitingConfig,
    pub consecutive_timeout_count: u32,
    pub created_at: f64,
    pub last_activity_at: f64,
    pub last_user_message_at: Option<f64>,
    pub last_proactive_at: Option<f64>,
    pub total_interactions: u64,
}

impl SessionSnapshot {
    pub fn from_session(session: &Session) -> Self {
        Self {
            stream_id: session.stream_id.as_str().to_string(),
            mental_log: session.mental_log.to_list(),
            waiting_config: session.waiting_config.clone(),
            consecutive_timeout_count: session.consecutive_timeout_count,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            last_user_message_at: session.last_user_message_at,
            last_proactive_at: session.last_proactive_at,
            total_interactions: session.total_interactions,
        }
    }

    pub fn into_session(self, max_log_entries: usize) -> Session {
        Session {
            stream_id: StreamId(self.stream_id),
            mental_log: MentalLog::from_list(self.mental_log, max_log_entries),
            waiting_config: self.waiting_config,
            consecutive_timeout_count: self.consecutive_timeout_count,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            last_user_message_at: self.last_user_message_at,
            last_proactive_at: self.last_proactive_at,
            total_interactions: self.total_interactions,
        }
    }
}

/// Host-supplied durable storage for sessions. The in-process cache in
/// [`SessionStore`] is the source of truth for a live stream; this trait is
/// only consulted on cold start and after each save.
#[async_trait]
pub trait SessionBackingStore: Send + Sync {
    async fn load(&self, stream_id: &StreamId) -> kfc_core::Result<Option<SessionSnapshot>>;
    async fn save(&self, snapshot: &SessionSnapshot) -> kfc_core::Result<()>;
}

/// A backing store that keeps nothing — every stream starts fresh. Useful
/// for hosts that don't need durability across restarts, and for tests.
#[derive(Debug, Default)]
pub struct NullBackingStore;

#[async_trait]
impl SessionBackingStore for NullBackingStore {
    async fn load(&self, _stream_id: &StreamId) -> kfc_core::Result<Option<SessionSnapshot>> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &SessionSnapshot) -> kfc_core::Result<()> {
        Ok(())
    }
}

/// Owns the live session cache and one `tokio::Mutex` per stream, so the
/// main dialogue loop and a background scheduler tick can never mutate the
/// same stream's session concurrently. The map itself uses `dashmap` so
/// lazily creating a per-stream lock doesn't require a global lock.
pub struct SessionStore {
    sessions: DashMap<String, Arc<Mutex<Session>>>,
    backing: Arc<dyn SessionBackingStore>,
    max_log_entries: usize,
}

impl SessionStore {
    pub fn new(backing: Arc<dyn SessionBackingStore>, max_log_entries: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            backing,
            max_log_entries,
        }
    }

    fn cell(&self, stream_id: &StreamId) -> Arc<Mutex<Session>> {
        self.sessions
            .entry(stream_id.as_str().to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(stream_id.clone(), self.max_log_entries))))
            .clone()
    }

    /// Acquire the per-stream lock, loading from the backing store on first
    /// touch. The caller is expected to hold the guard across an entire
    /// decide/wait/timeout cycle. The guard is `'static` (owns its `Arc`)
    /// so it can be held across `.await` points without borrowing `self`.
    #[instrument(skip(self), fields(stream_id = %stream_id.as_str()))]
    pub async fn lock(&self, stream_id: &StreamId) -> kfc_core::Result<OwnedMutexGuard<Session>> {
        let is_new = !self.sessions.contains_key(stream_id.as_str());
        let cell = self.cell(stream_id);
        if is_new {
            if let Some(snapshot) = self.backing.load(stream_id).await? {
                let mut guard = cell.lock().await;
                *guard = snapshot.into_session(self.max_log_entries);
            }
        }
        Ok(cell.lock_owned().await)
    }

    /// Persists to the backing store. A transient IO failure is logged and
    /// swallowed, not propagated — the in-process cache is still
    /// authoritative for the live stream, so callers must not abort a tick
    /// over a failed write.
    pub async fn save(&self, session: &Session) -> kfc_core::Result<()> {
        let snapshot = SessionSnapshot::from_session(session);
        if let Err(e) = self.backing.save(&snapshot).await {
            tracing::warn!(stream_id = %session.stream_id.as_str(), error = %e, "session backing-store save failed, continuing with cached value");
        }
        Ok(())
    }

    pub fn all_stream_ids(&self) -> Vec<StreamId> {
        self.sessions.iter().map(|e| StreamId(e.key().clone())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_waiting_update_does_not_bump_activity() {
        let mut session = Session::new(StreamId::from("s1"), 50);
        session.last_activity_at = 10.0;
        session.add_waiting_update(20.0, "仍在等待");
        assert_eq!(session.last_activity_at, 10.0);
        assert_eq!(session.waiting_config.pending_thoughts, vec!["仍在等待".to_string()]);
    }

    #[test]
    fn clear_waiting_bumps_activity() {
        let mut session = Session::new(StreamId::from("s1"), 50);
        session.set_waiting(10.0, "回复我", 60.0, 0);
        session.clear_waiting(30.0);
        assert_eq!(session.last_activity_at, 30.0);
        assert!(!session.is_waiting());
    }

    #[test]
    fn set_waiting_with_nonpositive_duration_behaves_like_clear() {
        let mut session = Session::new(StreamId::from("s1"), 50);
        session.last_activity_at = 10.0;
        session.set_waiting(20.0, "回复我", 0.0, 0);
        assert!(!session.is_waiting());
        assert_eq!(session.last_activity_at, 20.0);
        assert!(session.mental_log.entries().iter().all(|e| e.kind() != EventKind::WaitingStart));
    }

    #[test]
    fn record_reply_timing_treats_exact_deadline_as_in_time() {
        let mut session = Session::new(StreamId::from("s1"), 50);
        session.set_waiting(0.0, "回复我", 10.0, 0);
        session.record_reply_timing(10.0, "回复我");
        assert_eq!(session.mental_log.entries().last().unwrap().kind(), EventKind::ReplyInTime);
    }

    #[test]
    fn record_reply_timing_past_deadline_is_late() {
        let mut session = Session::new(StreamId::from("s1"), 50);
        session.set_waiting(0.0, "回复我", 10.0, 0);
        session.record_reply_timing(10.5, "回复我");
        assert_eq!(session.mental_log.entries().last().unwrap().kind(), EventKind::ReplyLate);
    }

    #[test]
    fn record_timeout_increments_streak_and_drains_pending_thoughts() {
        let mut session = Session::new(StreamId::from("s1"), 50);
        session.set_waiting(0.0, "回复我", 10.0, 0);
        session.add_waiting_update(5.0, "还没回复");
        let pending = session.record_timeout(11.0);
        assert_eq!(session.consecutive_timeout_count, 1);
        assert_eq!(pending, vec!["还没回复".to_string()]);
        assert!(!session.is_waiting());
    }

    #[tokio::test]
    async fn store_loads_from_backing_store_once_then_caches() {
        struct CountingStore {
            loads: std::sync::atomic::AtomicUsize,
        }
        #[async_trait]
        impl SessionBackingStore for CountingStore {
            async fn load(&self, _stream_id: &StreamId) -> kfc_core::Result<Option<SessionSnapshot>> {
                self.loads.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(None)
            }
            async fn save(&self, _snapshot: &SessionSnapshot) -> kfc_core::Result<()> {
                Ok(())
            }
        }
        let backing = Arc::new(CountingStore { loads: std::sync::atomic::AtomicUsize::new(0) });
        let store = SessionStore::new(backing.clone(), 50);
        let stream_id = StreamId::from("s1");
        {
            let _guard = store.lock(&stream_id).await.unwrap();
        }
        {
            let _guard = store.lock(&stream_id).await.unwrap();
        }
        assert_eq!(backing.loads.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
