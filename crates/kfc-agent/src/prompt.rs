//! Stateless prompt rendering: the system prompt template, user payload
//! shaping, the timeout notification payload, and the fused narrative that
//! interleaves chat history with the bot's own prior thoughts.

use chrono::{Local, TimeZone};
use kfc_sessions::{EventKind, MentalLog};

use crate::traits::{ChatType, ContentPart, HistoryMessage, MediaItem, MediaType, StreamInfo, ToolSchema};

/// Personality content the host supplies — out of this crate's scope to
/// generate, only to weave into the template.
#[derive(Debug, Clone, Default)]
pub struct PersonaProfile {
    pub nickname: String,
    pub aliases: Vec<String>,
    pub persona_core: String,
    pub background: String,
    pub reply_style: String,
    pub safety_guidelines: String,
}

const RESPONSE_SHAPE: &str = r#"请始终以如下 JSON 结构作答（可以用 ```json 包裹，也可以直接使用工具调用）：
{
  "thought": "你的内心想法（必填）",
  "actions": [ {"type": "kfc_reply", "content": "..."} | {"type": "do_nothing"} | {"type": "其他工具名", ...} ],
  "expected_user_reaction": "对方可能的反应（可选）",
  "max_wait_seconds": 数字（必填）,
  "mood": "当前心情（可选）"
}"#;

pub struct PromptBuilder;

impl PromptBuilder {
    /// Renders the single system-prompt template: persona fields, current
    /// time, platform/chat-type/bot-id, a theme guide selected by chat
    /// type, a mental-log hint, and the dynamically generated
    /// extra-action-types block.
    pub fn build_system_prompt(
        persona: &PersonaProfile,
        stream_info: &StreamInfo,
        tool_schemas: &[ToolSchema],
        now_epoch: f64,
    ) -> String {
        let now = epoch_to_local(now_epoch);
        let mut out = String::new();

        out.push_str(&format!("你是 {}", persona.nickname));
        if !persona.aliases.is_empty() {
            out.push_str(&format!("（也被称为 {}）", persona.aliases.join("、")));
        }
        out.push('\n');
        if !persona.persona_core.is_empty() {
            out.push_str(&persona.persona_core);
            out.push('\n');
        }
        if !persona.background.is_empty() {
            out.push_str(&format!("背景：{}\n", persona.background));
        }
        if !persona.reply_style.is_empty() {
            out.push_str(&format!("回复风格：{}\n", persona.reply_style));
        }
        if !persona.safety_guidelines.is_empty() {
            out.push_str(&format!("安全准则：{}\n", persona.safety_guidelines));
        }

        out.push_str(&format!(
            "\n当前时间：{}\n平台：{} | 会话类型：{:?} | 你的 ID：{}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            stream_info.platform,
            stream_info.chat_type,
            stream_info.bot_id,
        ));

        let theme_guide = Self::theme_guide(stream_info.chat_type);
        if !theme_guide.is_empty() {
            out.push_str(theme_guide);
            out.push('\n');
        }

        out.push_str("\n你有一份内心活动记录（mental log），其中混合了对方的发言和你自己过去的想法，用于帮助你保持对话的连贯性。\n");

        if !tool_schemas.is_empty() {
            out.push_str("\n## 可用的额外动作\n");
            for schema in tool_schemas {
                out.push_str(&Self::render_tool_schema(schema));
                out.push('\n');
            }
        }

        out.push('\n');
        out.push_str(RESPONSE_SHAPE);
        out
    }

    fn theme_guide(chat_type: ChatType) -> &'static str {
        match chat_type {
            ChatType::Private => "这是一场私聊，语气可以更亲近自然，但仍需注意边界感。",
            ChatType::Group => "这是一个群聊，注意分辨消息是否是在对你说话，避免抢话或过度插嘴。",
            ChatType::Other => "",
        }
    }

    fn render_tool_schema(schema: &ToolSchema) -> String {
        let params: Vec<String> = schema
            .params
            .iter()
            .filter(|(name, ..)| name != "reason")
            .map(|(name, ty, required, desc)| {
                if *required {
                    format!("{name}({ty}): {desc}")
                } else {
                    format!("{name}({ty}，可选): {desc}")
                }
            })
            .collect();
        if params.is_empty() {
            format!("- {} — {}。", schema.name, schema.description)
        } else {
            format!("- {} — {}。参数: {}", schema.name, schema.description, params.join("; "))
        }
    }

    /// One user-role payload: text body, optionally followed by media
    /// content parts up to whatever budget the caller already applied.
    pub fn build_user_payload(formatted_unreads: &str, media_items: &[MediaItem], pending_thoughts: &[String]) -> Vec<ContentPart> {
        let mut body = format!("[新消息]\n{formatted_unreads}");
        if !pending_thoughts.is_empty() {
            body.push_str("\n\n等待期间你曾经想到：\n");
            for thought in pending_thoughts {
                body.push_str(&format!("- {thought}\n"));
            }
        }
        if media_items.is_empty() {
            return vec![ContentPart::Text(body)];
        }
        let mut parts = vec![ContentPart::Text(body)];
        for item in media_items {
            if item.media_type == MediaType::Emoji {
                parts.push(ContentPart::Text("[表情包]".to_string()));
            }
            parts.push(ContentPart::Image { base64_data: item.base64_data.clone() });
        }
        parts
    }

    /// Timeout-notification user payload with a graduated follow-up
    /// warning keyed by `followup_count = max(0, consecutive_timeouts - 1)`.
    pub fn build_timeout_payload(
        elapsed: f64,
        expected_reaction: &str,
        consecutive_timeouts: u32,
        last_bot_message: &str,
        pending_thoughts: &[String],
    ) -> String {
        let mut out = String::new();
        out.push_str("等待超时通知\n");
        out.push_str(&format!("已等待 {:.0} 秒（约 {:.1} 分钟），对方还没有回复。\n", elapsed, elapsed / 60.0));

        if !expected_reaction.is_empty() {
            out.push_str(&format!("你之前预期对方会：{expected_reaction}\n"));
        }
        if !last_bot_message.is_empty() {
            out.push_str(&format!("你上一次说的是：{last_bot_message}\n"));
        }

        let followup_count = consecutive_timeouts.saturating_sub(1);
        out.push_str(match followup_count {
            0 => "这是第一次超时，可以自然地决定是否要追问一句，或者安静地继续等待。\n",
            1 => "已经追问过一次了，如果对方依然沉默，可以考虑放弃这个话题。\n",
            _ => "已经多次超时，强烈建议不要再追问了，直接选择 do_nothing 并将 max_wait_seconds 设为 0。\n",
        });

        if !pending_thoughts.is_empty() {
            out.push_str("\n等待期间你曾经想到：\n");
            for thought in pending_thoughts.iter().rev().take(3).collect::<Vec<_>>().into_iter().rev() {
                out.push_str(&format!("- {thought}\n"));
            }
        }

        out.push('\n');
        out.push_str(RESPONSE_SHAPE);
        out
    }

    /// Lightweight prompt for the `sub_actor` continuous-thinking task: no
    /// JSON response shape, just a one-line inner monologue.
    pub fn build_continuous_thinking_context(
        elapsed: f64,
        progress: f64,
        expected_reaction: &str,
        last_bot_message: &str,
    ) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "你已经等待对方回复 {:.0} 秒了（进度 {:.0}%），对方依然没有说话。\n",
            elapsed,
            progress * 100.0
        ));
        if !last_bot_message.is_empty() {
            out.push_str(&format!("你刚才说的是：{last_bot_message}\n"));
        }
        if !expected_reaction.is_empty() {
            out.push_str(&format!("你原本以为对方会：{expected_reaction}\n"));
        }
        out.push_str("用一句话写出你此刻脑子里冒出的真实想法，不超过 50 字，不要输出其它任何内容。");
        out
    }

    /// Interleaves chat history and the bot's own prior `BotPlanning`
    /// thoughts, sorted by timestamp. Thoughts older than the cutoff (the
    /// 7th-most-recent history message's timestamp, or 0 if fewer than 7
    /// history messages exist) are omitted — only recent inner monologue
    /// is worth re-surfacing alongside fresh history.
    pub fn build_fused_narrative(history: &[HistoryMessage], mental_log: &MentalLog, bot_id: &str) -> String {
        let mut timeline: Vec<(f64, String)> = Vec::new();

        for msg in history {
            if !msg.time.is_finite() || msg.text.is_empty() {
                continue;
            }
            let t = epoch_to_local(msg.time).format("%H:%M:%S");
            let line = if msg.sender_id == bot_id {
                format!("[{t}] 你回复：{}", msg.text)
            } else {
                format!("[{t}] {}说：{}", msg.sender_name, msg.text)
            };
            timeline.push((msg.time, line));
        }

        let cutoff_ts = if history.len() >= 7 {
            let mut times: Vec<f64> = history.iter().map(|m| m.time).collect();
            times.sort_by(|a, b| b.partial_cmp(a).unwrap());
            times[6]
        } else {
            0.0
        };

        for entry in mental_log.entries() {
            if entry.kind() != EventKind::BotPlanning || entry.thought.is_empty() {
                continue;
            }
            if entry.timestamp < cutoff_ts {
                continue;
            }
            let t = epoch_to_local(entry.timestamp).format("%H:%M:%S");
            timeline.push((entry.timestamp, format!("[{t}] （你的内心：{}）", entry.thought)));
        }

        if timeline.is_empty() {
            return String::new();
        }

        timeline.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());

        let mut out = String::from("以下是最近的对话与你内心活动的交织时间线：\n");
        for (_, line) in timeline {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

fn epoch_to_local(epoch: f64) -> chrono::DateTime<Local> {
    let secs = epoch.floor() as i64;
    Local.timestamp_opt(secs, 0).single().unwrap_or_else(Local::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChatType, StreamInfo};

    fn stream_info(chat_type: ChatType) -> StreamInfo {
        StreamInfo {
            stream_id: "s1".to_string(),
            bot_id: "bot-1".to_string(),
            chat_type,
            platform: "telegram".to_string(),
        }
    }

    #[test]
    fn system_prompt_includes_theme_guide_for_group() {
        let persona = PersonaProfile { nickname: "小艾".to_string(), ..Default::default() };
        let prompt = PromptBuilder::build_system_prompt(&persona, &stream_info(ChatType::Group), &[], 0.0);
        assert!(prompt.contains("群聊"));
    }

    #[test]
    fn tool_schema_suppresses_reason_param() {
        let schema = ToolSchema {
            name: "search".to_string(),
            description: "搜索网页".to_string(),
            params: vec![
                ("query".to_string(), "string".to_string(), true, "搜索词".to_string()),
                ("reason".to_string(), "string".to_string(), false, "调用原因".to_string()),
            ],
        };
        let rendered = PromptBuilder::render_tool_schema(&schema);
        assert!(rendered.contains("query(string)"));
        assert!(!rendered.contains("reason"));
    }

    #[test]
    fn user_payload_without_media_is_single_text() {
        let parts = PromptBuilder::build_user_payload("张三: 你好", &[], &[]);
        assert_eq!(parts, vec![ContentPart::Text("[新消息]\n张三: 你好".to_string())]);
    }

    #[test]
    fn user_payload_with_emoji_prefixes_text_marker() {
        let media = vec![MediaItem {
            media_type: MediaType::Emoji,
            base64_data: "abc".to_string(),
            source_message_id: "m1".to_string(),
        }];
        let parts = PromptBuilder::build_user_payload("张三: [表情]", &media, &[]);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], ContentPart::Text("[表情包]".to_string()));
    }

    #[test]
    fn user_payload_surfaces_pending_thoughts_from_wait() {
        let parts = PromptBuilder::build_user_payload("张三: 你好", &[], &["这人怎么还不理我".to_string()]);
        let ContentPart::Text(text) = &parts[0] else { panic!("expected text part") };
        assert!(text.contains("等待期间你曾经想到"));
        assert!(text.contains("这人怎么还不理我"));
    }

    #[test]
    fn timeout_payload_escalates_by_followup_count() {
        let first = PromptBuilder::build_timeout_payload(30.0, "", 1, "", &[]);
        assert!(first.contains("第一次超时"));
        let third = PromptBuilder::build_timeout_payload(30.0, "", 3, "", &[]);
        assert!(third.contains("不要再追问"));
    }

    #[test]
    fn fused_narrative_sorts_by_timestamp_and_empty_is_empty_string() {
        let mut log = MentalLog::new(50);
        let mut entry = kfc_sessions::MentalLogEntry::new(EventKind::BotPlanning, 5.0);
        entry.thought = "我在想".to_string();
        log.add(entry);

        let history = vec![
            HistoryMessage { sender_id: "u1".to_string(), sender_name: "张三".to_string(), text: "在吗".to_string(), time: 10.0 },
            HistoryMessage { sender_id: "bot-1".to_string(), sender_name: "我".to_string(), text: "在的".to_string(), time: 1.0 },
        ];

        let narrative = PromptBuilder::build_fused_narrative(&history, &log, "bot-1");
        let thought_pos = narrative.find("你的内心").unwrap();
        let reply_pos = narrative.find("你回复").unwrap();
        let ask_pos = narrative.find("说：在吗").unwrap();
        assert!(reply_pos < thought_pos);
        assert!(thought_pos < ask_pos);

        let empty = PromptBuilder::build_fused_narrative(&[], &MentalLog::new(50), "bot-1");
        assert_eq!(empty, "");
    }

    #[test]
    fn fused_narrative_omits_stale_thoughts_below_cutoff() {
        let mut log = MentalLog::new(50);
        let mut stale = kfc_sessions::MentalLogEntry::new(EventKind::BotPlanning, 0.0);
        stale.thought = "很久以前的想法".to_string();
        log.add(stale);

        let history: Vec<HistoryMessage> = (1..=7)
            .map(|i| HistoryMessage {
                sender_id: "u1".to_string(),
                sender_name: "张三".to_string(),
                text: format!("消息{i}"),
                time: i as f64,
            })
            .collect();

        let narrative = PromptBuilder::build_fused_narrative(&history, &log, "bot-1");
        assert!(!narrative.contains("很久以前的想法"));
    }
}
