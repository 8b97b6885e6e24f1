//! Shared data types: event kinds, the waiting config, and the structured
//! result of a single LLM turn.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Canonical action-type strings recognized by the core. Anything else is a
/// third-party tool name forwarded to the host tool registry.
pub const KFC_REPLY: &str = "kfc_reply";
pub const KFC_REPLY_ALIAS: &str = "respond";
pub const DO_NOTHING: &str = "do_nothing";

/// Tags the kind of event recorded in a [`crate::mental_log::MentalLog`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    UserMessage,
    BotPlanning,
    WaitingStart,
    WaitingUpdate,
    ReplyInTime,
    ReplyLate,
    WaitTimeout,
    ProactiveTrigger,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::UserMessage => "user_message",
            EventKind::BotPlanning => "bot_planning",
            EventKind::WaitingStart => "waiting_start",
            EventKind::WaitingUpdate => "waiting_update",
            EventKind::ReplyInTime => "reply_in_time",
            EventKind::ReplyLate => "reply_late",
            EventKind::WaitTimeout => "wait_timeout",
            EventKind::ProactiveTrigger => "proactive_trigger",
        }
    }

    /// Deserializing an unknown tag coerces to `UserMessage` rather than
    /// failing the whole document — a single corrupt entry shouldn't lose
    /// the rest of the mental log.
    pub fn from_str_lenient(s: &str) -> Self {
        match s {
            "user_message" => EventKind::UserMessage,
            "bot_planning" => EventKind::BotPlanning,
            "waiting_start" => EventKind::WaitingStart,
            "waiting_update" => EventKind::WaitingUpdate,
            "reply_in_time" => EventKind::ReplyInTime,
            "reply_late" => EventKind::ReplyLate,
            "wait_timeout" => EventKind::WaitTimeout,
            "proactive_trigger" => EventKind::ProactiveTrigger,
            _ => EventKind::UserMessage,
        }
    }
}

/// One entry of a `BotPlanning` event's action list. `kind` is always
/// present; everything else is a free-form argument bag so third-party
/// tool calls round-trip without the core needing to know their shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub args: HashMap<String, serde_json::Value>,
}

impl ActionRecord {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            args: HashMap::new(),
        }
    }

    pub fn reply(content: impl Into<String>) -> Self {
        let mut rec = Self::new(KFC_REPLY);
        rec.args.insert("content".to_string(), serde_json::Value::String(content.into()));
        rec
    }

    pub fn do_nothing() -> Self {
        Self::new(DO_NOTHING)
    }

    pub fn is_reply(&self) -> bool {
        self.kind == KFC_REPLY || self.kind == KFC_REPLY_ALIAS
    }

    pub fn is_do_nothing(&self) -> bool {
        self.kind == DO_NOTHING
    }

    pub fn content(&self) -> Option<&str> {
        self.args.get("content").and_then(|v| v.as_str())
    }
}

/// Waiting state attached to a [`crate::session::Session`] while the bot is
/// attending for a reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitingConfig {
    #[serde(default)]
    pub expected_reaction: String,
    #[serde(default)]
    pub max_wait_seconds: f64,
    #[serde(default)]
    pub started_at: f64,
    #[serde(default)]
    pub last_thinking_at: f64,
    #[serde(default)]
    pub thinking_count: u32,
    #[serde(default)]
    pub followup_count: u32,
    /// Inner-monologue thoughts generated by the wait-progress checker
    /// during this wait, surfaced to the caller when the wait ends.
    #[serde(default)]
    pub pending_thoughts: Vec<String>,
}

impl WaitingConfig {
    /// Active iff a wait was actually started with a positive duration.
    pub fn is_active(&self) -> bool {
        self.max_wait_seconds > 0.0 && self.started_at > 0.0
    }

    /// Seconds elapsed since `started_at`, or 0 when not active.
    pub fn elapsed_seconds(&self, now: f64) -> f64 {
        if !self.is_active() {
            return 0.0;
        }
        now - self.started_at
    }

    pub fn is_timeout(&self, now: f64) -> bool {
        if !self.is_active() {
            return false;
        }
        self.elapsed_seconds(now) >= self.max_wait_seconds
    }

    /// Progress through the wait window, clamped to `[0, 1]`.
    pub fn progress(&self, now: f64) -> f64 {
        if !self.is_active() || self.max_wait_seconds <= 0.0 {
            return 0.0;
        }
        (self.elapsed_seconds(now) / self.max_wait_seconds).min(1.0)
    }

    /// Resets every field, including `followup_count` — used by
    /// `clear_waiting`, not by the "carry `followup_count` forward into a
    /// new wait" path in the dialogue loop.
    pub fn reset(&mut self) {
        *self = WaitingConfig::default();
    }
}

/// Structured outcome of one [turn protocol](crate) pass over an LLM
/// response: the extracted metadata plus the dispatched action list.
#[derive(Debug, Clone, Default)]
pub struct ToolCallResult {
    pub thought: String,
    pub actions: Vec<ActionRecord>,
    pub expected_reaction: String,
    pub max_wait_seconds: f64,
    pub mood: String,
    pub has_reply: bool,
    pub has_do_nothing: bool,
    pub has_third_party: bool,
}

impl ToolCallResult {
    pub fn create_error(error_message: &str) -> Self {
        Self {
            thought: format!("出现了问题：{error_message}"),
            actions: vec![ActionRecord::do_nothing()],
            has_do_nothing: true,
            ..Default::default()
        }
    }

    /// `has_reply ∨ has_do_nothing ∨ has_third_party` — a turn that
    /// produced nothing recognizable at all.
    pub fn has_meaningful_action(&self) -> bool {
        self.has_reply || self.has_do_nothing || self.has_third_party
    }

    pub fn reply_content(&self) -> Option<&str> {
        self.actions.iter().find(|a| a.is_reply()).and_then(|a| a.content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waiting_config_inactive_by_default() {
        let wc = WaitingConfig::default();
        assert!(!wc.is_active());
        assert_eq!(wc.elapsed_seconds(1000.0), 0.0);
        assert!(!wc.is_timeout(1000.0));
        assert_eq!(wc.progress(1000.0), 0.0);
    }

    #[test]
    fn waiting_config_progress_clamps_to_one() {
        let wc = WaitingConfig {
            max_wait_seconds: 100.0,
            started_at: 0.0,
            ..Default::default()
        };
        // started_at == 0.0 means "not active" per the is_active() formula —
        // use a nonzero epoch so the active checks below are meaningful.
        let wc = WaitingConfig {
            started_at: 1.0,
            ..wc
        };
        assert!(wc.is_active());
        assert_eq!(wc.progress(1.0), 0.0);
        assert_eq!(wc.progress(51.0), 0.5);
        assert_eq!(wc.progress(1000.0), 1.0);
        assert!(wc.is_timeout(101.0));
        assert!(wc.is_timeout(100.0));
        assert!(!wc.is_timeout(99.0));
    }

    #[test]
    fn event_kind_unknown_tag_coerces_to_user_message() {
        assert_eq!(EventKind::from_str_lenient("not_a_real_kind"), EventKind::UserMessage);
    }

    #[test]
    fn has_meaningful_action_covers_third_party_only_turns() {
        let result = ToolCallResult {
            has_third_party: true,
            ..Default::default()
        };
        assert!(result.has_meaningful_action());
    }
}
