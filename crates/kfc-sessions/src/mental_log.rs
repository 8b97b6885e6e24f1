//! The bounded, append-only "mental log" — an interleaved timeline of
//! observed messages and the bot's own prior thoughts, rendered either as a
//! full narrative (for fused-history prompt context) or a short summary
//! (for compact injection).

use chrono::{Local, TimeZone};
use kfc_core::UserId;
use serde::{Deserialize, Serialize};

use crate::models::{ActionRecord, EventKind};

const DEFAULT_MAX_ENTRIES: usize = 50;
const EMPTY_NARRATIVE: &str = "（暂无活动记录）";

/// One event node in a [`MentalLog`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MentalLogEntry {
    pub event_type: String,
    pub timestamp: f64,

    #[serde(default)]
    pub content: String,

    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub user_id: UserId,

    #[serde(default)]
    pub thought: String,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
    #[serde(default)]
    pub expected_reaction: String,
    #[serde(default)]
    pub max_wait_seconds: f64,

    #[serde(default)]
    pub elapsed_seconds: f64,
    #[serde(default)]
    pub waiting_thought: String,
    #[serde(default)]
    pub mood: String,

    #[serde(default)]
    pub metadata: std::collections::HashMap<String, serde_json::Value>,
}

impl MentalLogEntry {
    pub fn new(kind: EventKind, timestamp: f64) -> Self {
        Self {
            event_type: kind.as_str().to_string(),
            timestamp,
            ..Default::default()
        }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_str_lenient(&self.event_type)
    }

    /// Local wall-clock time rendered `HH:MM`, matching the narrative format.
    pub fn time_str(&self) -> String {
        self.time_str_fmt("%H:%M")
    }

    pub fn time_str_fmt(&self, fmt: &str) -> String {
        let secs = self.timestamp.floor() as i64;
        Local
            .timestamp_opt(secs, 0)
            .single()
            .map(|dt| dt.format(fmt).to_string())
            .unwrap_or_else(|| self.timestamp.to_string())
    }
}

/// Bounded, FIFO-evicting, append-only sequence of [`MentalLogEntry`].
#[derive(Debug, Clone)]
pub struct MentalLog {
    entries: Vec<MentalLogEntry>,
    max_entries: usize,
}

impl Default for MentalLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl MentalLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Vec::new(),
            max_entries,
        }
    }

    pub fn entries(&self) -> &[MentalLogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append, then drop the oldest entries so `len() <= max_entries`.
    pub fn add(&mut self, entry: MentalLogEntry) {
        self.entries.push(entry);
        if self.entries.len() > self.max_entries {
            let overflow = self.entries.len() - self.max_entries;
            self.entries.drain(0..overflow);
        }
    }

    pub fn recent(&self, n: usize) -> &[MentalLogEntry] {
        let len = self.entries.len();
        &self.entries[len.saturating_sub(n)..]
    }

    pub fn last_of_kind(&self, kind: EventKind) -> Option<&MentalLogEntry> {
        self.entries.iter().rev().find(|e| e.kind() == kind)
    }

    /// First non-empty `content` of any `kfc_reply`/`respond` action inside
    /// the most recent `BotPlanning` entries, scanning newest-to-oldest.
    pub fn last_bot_reply_content(&self) -> String {
        for entry in self.entries.iter().rev() {
            if entry.kind() != EventKind::BotPlanning {
                continue;
            }
            for action in &entry.actions {
                if action.is_reply() {
                    if let Some(content) = action.content() {
                        if !content.is_empty() {
                            return content.to_string();
                        }
                    }
                }
            }
        }
        String::new()
    }

    /// One line per entry, insertion order, formatted per the literal
    /// per-kind templates. Empty log renders a sentinel placeholder rather
    /// than an empty string.
    pub fn format_narrative(&self) -> String {
        if self.entries.is_empty() {
            return EMPTY_NARRATIVE.to_string();
        }
        self.entries
            .iter()
            .map(Self::format_entry_narrative)
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn format_entry_narrative(entry: &MentalLogEntry) -> String {
        let t = entry.time_str();
        match entry.kind() {
            EventKind::UserMessage => {
                let name = if entry.user_name.is_empty() { "用户" } else { &entry.user_name };
                format!("[{t}] {name} 说：{}", entry.content)
            }
            EventKind::BotPlanning => {
                let mut lines = vec![format!("[{t}] 你的内心想法：{}", entry.thought)];
                if !entry.actions.is_empty() {
                    let joined = entry
                        .actions
                        .iter()
                        .map(|a| a.kind.as_str())
                        .collect::<Vec<_>>()
                        .join(", ");
                    lines.push(format!("  执行动作：{joined}"));
                }
                if !entry.expected_reaction.is_empty() {
                    lines.push(format!("  期望对方回应：{}", entry.expected_reaction));
                }
                lines.join("\n")
            }
            EventKind::WaitingUpdate => {
                format!("[{t}] (等待中的内心活动) {}", entry.waiting_thought)
            }
            EventKind::WaitTimeout => {
                format!("[{t}] 等待超时，已等待 {:.0} 秒", entry.elapsed_seconds)
            }
            EventKind::ReplyInTime => format!("[{t}] 在预期时间内收到了对方回复"),
            EventKind::ReplyLate => {
                format!("[{t}] 对方回复较晚（已等待 {:.0} 秒）", entry.elapsed_seconds)
            }
            EventKind::ProactiveTrigger => format!("[{t}] (主动发起) {}", entry.content),
            EventKind::WaitingStart => {
                format!("[{t}] 开始等待对方回复（最多 {:.0} 秒）", entry.max_wait_seconds)
            }
        }
    }

    /// Last `max_entries`, each rendered as a 60-char-truncated one-liner.
    /// Returns an empty string (not the narrative sentinel) when empty,
    /// since this form is meant for optional prompt injection.
    pub fn format_summary(&self, max_entries: usize) -> String {
        let recent = self.recent(max_entries);
        if recent.is_empty() {
            return String::new();
        }
        recent
            .iter()
            .map(|e| format!("[{}] {}", e.time_str(), Self::entry_summary(e)))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn entry_summary(entry: &MentalLogEntry) -> String {
        match entry.kind() {
            EventKind::UserMessage => {
                let name = if entry.user_name.is_empty() { "用户" } else { &entry.user_name };
                format!("{name}: {}", truncate_chars(&entry.content, 60))
            }
            EventKind::BotPlanning => {
                if entry.thought.is_empty() {
                    "(无想法)".to_string()
                } else {
                    truncate_chars(&entry.thought, 60)
                }
            }
            EventKind::WaitingUpdate => {
                if entry.waiting_thought.is_empty() {
                    "(思考中)".to_string()
                } else {
                    truncate_chars(&entry.waiting_thought, 60)
                }
            }
            EventKind::WaitTimeout => format!("等待超时 ({:.0}s)", entry.elapsed_seconds),
            EventKind::ReplyInTime => "及时收到回复".to_string(),
            EventKind::ReplyLate => format!("延迟回复 ({:.0}s)", entry.elapsed_seconds),
            EventKind::ProactiveTrigger => {
                if entry.content.is_empty() {
                    "主动发起".to_string()
                } else {
                    truncate_chars(&entry.content, 60)
                }
            }
            EventKind::WaitingStart => truncate_chars(&entry.content, 60),
        }
    }

    pub fn to_list(&self) -> Vec<MentalLogEntry> {
        self.entries.clone()
    }

    /// Round-trips from a persisted record list, re-truncating to
    /// `max_entries` regardless of how many were stored.
    pub fn from_list(entries: Vec<MentalLogEntry>, max_entries: usize) -> Self {
        let mut log = Self::new(max_entries);
        log.entries = entries;
        if log.entries.len() > max_entries {
            let overflow = log.entries.len() - max_entries;
            log.entries.drain(0..overflow);
        }
        log
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Truncates to at most `n` `char`s, respecting UTF-8 boundaries (the
/// source truncates by code point, which for CJK text is close enough to
/// "character" for a log preview).
fn truncate_chars(s: &str, n: usize) -> String {
    s.chars().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: EventKind, ts: f64) -> MentalLogEntry {
        MentalLogEntry::new(kind, ts)
    }

    #[test]
    fn add_evicts_oldest_on_overflow() {
        let mut log = MentalLog::new(2);
        log.add(entry(EventKind::UserMessage, 1.0));
        log.add(entry(EventKind::UserMessage, 2.0));
        log.add(entry(EventKind::UserMessage, 3.0));
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].timestamp, 2.0);
        assert_eq!(log.entries()[1].timestamp, 3.0);
    }

    #[test]
    fn empty_log_narrative_is_sentinel_but_summary_is_empty() {
        let log = MentalLog::default();
        assert_eq!(log.format_narrative(), "（暂无活动记录）");
        assert_eq!(log.format_summary(10), "");
    }

    #[test]
    fn last_bot_reply_content_scans_newest_first() {
        let mut log = MentalLog::default();
        let mut e1 = entry(EventKind::BotPlanning, 1.0);
        e1.actions.push(ActionRecord::reply("first"));
        log.add(e1);
        let mut e2 = entry(EventKind::BotPlanning, 2.0);
        e2.actions.push(ActionRecord::reply("second"));
        log.add(e2);
        assert_eq!(log.last_bot_reply_content(), "second");
    }

    #[test]
    fn round_trip_to_list_from_list() {
        let mut log = MentalLog::new(50);
        log.add(entry(EventKind::UserMessage, 1.0));
        log.add(entry(EventKind::WaitTimeout, 2.0));
        let list = log.to_list();
        let restored = MentalLog::from_list(list, 50);
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.entries()[1].kind(), EventKind::WaitTimeout);
    }

    #[test]
    fn unknown_event_type_coerces_on_deserialize() {
        let json = r#"{"event_type":"totally_unknown","timestamp":5.0}"#;
        let e: MentalLogEntry = serde_json::from_str(json).unwrap();
        assert_eq!(e.kind(), EventKind::UserMessage);
    }

    #[test]
    fn bot_planning_narrative_omits_empty_optional_lines() {
        let mut e = entry(EventKind::BotPlanning, 0.0);
        e.thought = "在想事情".to_string();
        let line = MentalLog::format_entry_narrative(&e);
        assert!(line.contains("你的内心想法：在想事情"));
        assert!(!line.contains("执行动作"));
        assert!(!line.contains("期望对方回应"));
    }
}
