//! One *turn*: drives the LLM request/response chain to a parsed
//! [`ToolCallResult`], normalizing tool-call names, extracting metadata,
//! dispatching recognized and third-party actions, and sanitizing outbound
//! reply content.

use std::sync::Arc;
use std::time::Duration;

use std::sync::OnceLock;

use kfc_core::{KfcConfig, Result, StreamId};
use kfc_sessions::{ActionRecord, ToolCallResult};
use regex::Regex;
use tracing::{debug, instrument, warn};

use crate::traits::{
    ContentPart, LlmRequestChain, LlmResponse, OutboundSender, ToolCall, ToolRegistry, TriggerMessage, Watchdog,
};

pub const KFC_REPLY: &str = kfc_sessions::models::KFC_REPLY;
pub const KFC_REPLY_ALIAS: &str = kfc_sessions::models::KFC_REPLY_ALIAS;
pub const DO_NOTHING: &str = kfc_sessions::models::DO_NOTHING;

const KFC_PERCEIVE_FOLLOWUP_PROMPT: &str =
    "你刚才的话已经被记录了。现在请用规定的 JSON 结构（或工具调用）给出你的具体动作。";

/// Matches a metadata-keyword label at the start of a line, e.g. `想法：`
/// or `expected_reaction:`. Two or more distinct matches in a reply body
/// indicate the model leaked its own planning fields into user-visible text.
fn metadata_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?im)^(想法|内心想法|思考|thought|thinking|预计反应|预期反应|期望反应|expected_reaction|expected_user_reaction|最大等待秒数|等待时间|max_wait_seconds|心情|情绪|mood|理由|原因|reason)\s*[:：]",
        )
        .expect("metadata pattern is a valid regex")
    })
}

fn normalize_call_name(name: &str) -> &str {
    match name.rsplit_once(':') {
        Some((_, suffix)) => suffix,
        None => name,
    }
}

/// Truncates a reply at the earliest of ≥2 distinct metadata-keyword
/// matches. Returns the original text unchanged if fewer than 2 matches.
pub fn sanitize_reply_content(content: &str) -> String {
    let matches: Vec<_> = metadata_pattern().find_iter(content).collect();
    let mut distinct_labels = std::collections::HashSet::new();
    let mut tripped = false;
    for m in &matches {
        distinct_labels.insert(m.as_str().to_lowercase());
        if distinct_labels.len() >= 2 {
            tripped = true;
            break;
        }
    }
    if tripped {
        content[..matches[0].start()].trim_end().to_string()
    } else {
        content.to_string()
    }
}

fn extract_metadata(result: &mut ToolCallResult, call: &ToolCall) {
    if let Some(v) = call.args.get("thought").and_then(|v| v.as_str()) {
        result.thought = v.to_string();
    }
    if let Some(v) = call.args.get("expected_reaction").and_then(|v| v.as_str()) {
        result.expected_reaction = v.to_string();
    }
    if let Some(v) = call.args.get("expected_user_reaction").and_then(|v| v.as_str()) {
        result.expected_reaction = v.to_string();
    }
    if let Some(v) = call.args.get("max_wait_seconds").and_then(|v| v.as_f64()) {
        result.max_wait_seconds = v;
    }
    if let Some(v) = call.args.get("mood").and_then(|v| v.as_str()) {
        result.mood = v.to_string();
    }
}

/// Extracts the top-level `thought`/`expected_user_reaction`/
/// `max_wait_seconds`/`mood` fields from a parsed JSON action envelope (the
/// fenced-JSON / prose fallback path, as opposed to native tool calls).
pub fn parse_json_envelope(text: &str) -> Option<serde_json::Value> {
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(text.trim()) {
        return Some(v);
    }
    if let Some(start) = text.find("```json") {
        let after = &text[start + 7..];
        if let Some(end) = after.find("```") {
            if let Ok(v) = serde_json::from_str::<serde_json::Value>(after[..end].trim()) {
                return Some(v);
            }
        }
    }
    fn json_object_pattern() -> &'static Regex {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        PATTERN.get_or_init(|| Regex::new(r"\{[\s\S]*\}").unwrap())
    }
    if let Some(m) = json_object_pattern().find(text) {
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(m.as_str()) {
            return Some(v);
        }
    }
    None
}

fn result_from_json_envelope(value: &serde_json::Value) -> ToolCallResult {
    let mut result = ToolCallResult::default();
    if let Some(t) = value.get("thought").and_then(|v| v.as_str()) {
        result.thought = t.to_string();
    }
    if let Some(r) = value
        .get("expected_user_reaction")
        .or_else(|| value.get("expected_reaction"))
        .and_then(|v| v.as_str())
    {
        result.expected_reaction = r.to_string();
    }
    if let Some(w) = value.get("max_wait_seconds").and_then(|v| v.as_f64()) {
        result.max_wait_seconds = w;
    }
    if let Some(m) = value.get("mood").and_then(|v| v.as_str()) {
        result.mood = m.to_string();
    }
    if let Some(actions) = value.get("actions").and_then(|v| v.as_array()) {
        for action in actions {
            let Some(kind) = action.get("type").and_then(|v| v.as_str()) else { continue };
            let mut args = std::collections::HashMap::new();
            if let Some(obj) = action.as_object() {
                for (k, v) in obj {
                    if k != "type" {
                        args.insert(k.clone(), v.clone());
                    }
                }
            }
            let record = ActionRecord { kind: kind.to_string(), args };
            if record.is_reply() {
                result.has_reply = true;
            } else if record.is_do_nothing() {
                result.has_do_nothing = true;
            } else {
                result.has_third_party = true;
            }
            result.actions.push(record);
        }
    }
    result
}

/// Runs a single turn: call-name normalization, metadata extraction,
/// dispatch (reply / do-nothing / third-party), and the
/// perceive-then-decide retry loop for native-multimodal inputs.
pub struct TurnProtocol {
    pub config: Arc<KfcConfig>,
    pub outbound: Arc<dyn OutboundSender>,
    pub tools: Arc<dyn ToolRegistry>,
    pub watchdog: Arc<dyn Watchdog>,
}

impl TurnProtocol {
    /// `perceive_then_decide` enables the retry loop (native-multimodal mode).
    #[instrument(skip(self, chain, trigger), fields(stream_id = %stream_id.as_str()))]
    pub async fn run_turn(
        &self,
        stream_id: &StreamId,
        chain: &mut dyn LlmRequestChain,
        trigger: &TriggerMessage,
        perceive_then_decide: bool,
    ) -> Result<ToolCallResult> {
        let response = if perceive_then_decide {
            self.perceive_then_decide_loop(stream_id, chain).await?
        } else {
            self.watchdog.feed_dog(stream_id);
            let r = chain.send(false).await?;
            self.watchdog.feed_dog(stream_id);
            r
        };

        self.dispatch(stream_id, chain, trigger, response).await
    }

    async fn perceive_then_decide_loop(
        &self,
        stream_id: &StreamId,
        chain: &mut dyn LlmRequestChain,
    ) -> Result<LlmResponse> {
        let max_attempts = 1 + self.config.general.max_compat_retries;
        let mut last = LlmResponse::default();
        for attempt in 0..max_attempts {
            self.watchdog.feed_dog(stream_id);
            let response = chain.send(true).await?;
            self.watchdog.feed_dog(stream_id);
            if !response.call_list.is_empty() {
                return Ok(response);
            }
            last = response;
            if attempt + 1 < max_attempts {
                let preview: String = last.message.chars().take(80).collect();
                debug!(preview = %preview, "perceive-then-decide retry: no call_list yet");
                chain.append_user(vec![ContentPart::Text(KFC_PERCEIVE_FOLLOWUP_PROMPT.to_string())]);
            }
        }
        Ok(last)
    }

    async fn dispatch(
        &self,
        stream_id: &StreamId,
        chain: &mut dyn LlmRequestChain,
        trigger: &TriggerMessage,
        response: LlmResponse,
    ) -> Result<ToolCallResult> {
        if response.call_list.is_empty() {
            return match parse_json_envelope(&response.message) {
                Some(v) => Ok(result_from_json_envelope(&v)),
                None if response.message.trim().is_empty() => Ok(ToolCallResult::default()),
                None => {
                    warn!("LLM response was neither parseable JSON nor a tool call; treating as do_nothing");
                    Ok(ToolCallResult::create_error("无法解析的回复"))
                }
            };
        }

        if !response.message.trim().is_empty() {
            let preview: String = response.message.chars().take(80).collect();
            debug!(preview = %preview, "native call_list present; ignoring accompanying prose");
        }

        let mut result = ToolCallResult::default();
        let mut reply_ordinal = 0u32;

        for call in &response.call_list {
            let name = normalize_call_name(&call.name);
            extract_metadata(&mut result, call);

            if name == KFC_REPLY || name == KFC_REPLY_ALIAS {
                result.has_reply = true;
                let content = call.args.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let mut record = ActionRecord::new(KFC_REPLY);
                record.args.insert("content".to_string(), serde_json::Value::String(content.clone()));

                if !content.is_empty() {
                    if reply_ordinal > 0 {
                        let delay = self.config.reply.typing_delay_for(content.chars().count());
                        tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                    }
                    reply_ordinal += 1;

                    let sanitized = sanitize_reply_content(&content);
                    if sanitized.is_empty() {
                        warn!("清洗后内容为空，未发送");
                        record.args.insert("content".to_string(), serde_json::Value::String(String::new()));
                        chain.append_tool_result(&call.id, "清洗后内容为空，未发送");
                    } else {
                        record.args.insert("content".to_string(), serde_json::Value::String(sanitized.clone()));
                        for segment in split_reply_content(&sanitized, self.config.reply.max_segment_length) {
                            self.outbound.send_reply(stream_id, trigger, &segment).await?;
                        }
                        chain.append_tool_result(&call.id, "已发送");
                    }
                }
                result.actions.push(record);
            } else if name == DO_NOTHING {
                result.has_do_nothing = true;
                result.actions.push(ActionRecord::do_nothing());
                chain.append_tool_result(&call.id, "已选择不回复");
            } else {
                result.has_third_party = true;
                let mut record = ActionRecord::new(name);
                record.args = call.args.clone();
                result.actions.push(record);
                match self.tools.run_tool_call(call).await {
                    Ok(_) => {}
                    Err(e) => warn!(tool = name, error = %e, "third-party tool call failed; continuing turn"),
                }
            }
        }

        Ok(result)
    }
}

/// Splits long reply content for segment-by-segment sending: first by
/// paragraph, then (for any paragraph still over the cap) by sentence-
/// ending punctuation, regrouping sentences up to `max_len` each.
pub fn split_reply_content(content: &str, max_len: usize) -> Vec<String> {
    let mut segments = Vec::new();
    for paragraph in content.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if paragraph.chars().count() <= max_len {
            segments.push(paragraph.to_string());
        } else {
            segments.extend(split_by_punctuation(paragraph, max_len));
        }
    }
    if segments.is_empty() {
        vec![content.to_string()]
    } else {
        segments
    }
}

fn sentence_boundary_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // `regex` has no lookbehind; split on the punctuation itself and glue it
    // back onto the preceding piece so sentence terminators aren't dropped.
    PATTERN.get_or_init(|| Regex::new(r"([。！？；.!?;])").unwrap())
}

fn split_by_punctuation(text: &str, max_len: usize) -> Vec<String> {
    let pattern = sentence_boundary_pattern();
    let mut sentences: Vec<String> = Vec::new();
    let mut last_end = 0;
    let mut current = String::new();
    for m in pattern.find_iter(text) {
        current.push_str(&text[last_end..m.end()]);
        sentences.push(std::mem::take(&mut current));
        last_end = m.end();
    }
    if last_end < text.len() {
        sentences.push(text[last_end..].to_string());
    }
    let sentences: Vec<&str> = sentences.iter().map(|s| s.as_str()).filter(|s| !s.is_empty()).collect();
    let mut groups = Vec::new();
    let mut current = String::new();
    for sentence in sentences {
        if !current.is_empty() && current.chars().count() + sentence.chars().count() > max_len {
            groups.push(std::mem::take(&mut current));
        }
        current.push_str(sentence);
    }
    if !current.is_empty() {
        groups.push(current);
    }
    if groups.is_empty() {
        vec![text.to_string()]
    } else {
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_call_name_strips_namespace_prefix() {
        assert_eq!(normalize_call_name("action:kfc_reply"), "kfc_reply");
        assert_eq!(normalize_call_name("kfc_reply"), "kfc_reply");
    }

    #[test]
    fn sanitize_leaves_single_match_untouched() {
        let text = "想法: 只有一个标签\n其余内容";
        assert_eq!(sanitize_reply_content(text), text);
    }

    #[test]
    fn sanitize_truncates_at_two_distinct_matches() {
        let text = "好的\n想法: 我其实很累\n心情: 疲倦";
        assert_eq!(sanitize_reply_content(text), "好的");
    }

    #[test]
    fn json_envelope_parses_fenced_block() {
        let text = "这是我的想法\n```json\n{\"thought\":\"x\",\"actions\":[{\"type\":\"do_nothing\"}],\"max_wait_seconds\":0}\n```";
        let v = parse_json_envelope(text).expect("should parse");
        let result = result_from_json_envelope(&v);
        assert!(result.has_do_nothing);
    }

    #[test]
    fn split_reply_content_respects_paragraphs() {
        let segments = split_reply_content("第一段。\n\n第二段。", 200);
        assert_eq!(segments, vec!["第一段。".to_string(), "第二段。".to_string()]);
    }

    #[test]
    fn split_by_punctuation_regroups_under_cap() {
        let text = "一。二。三。";
        let groups = split_by_punctuation(text, 2);
        assert!(groups.iter().all(|g| g.chars().count() <= 4));
        assert_eq!(groups.join(""), text);
    }
}
