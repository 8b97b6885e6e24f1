//! Narrow host-capability traits the dialogue loop is built against. A host
//! program wires concrete implementations of each; this crate never talks
//! to a transport, a database, or an LLM vendor directly.

use std::collections::HashMap;

use async_trait::async_trait;
use kfc_core::{Result, StreamId};
use serde_json::Value;

/// One piece of content in a payload: plain text or an inline image.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text(String),
    Image { base64_data: String },
}

/// An opaque attachment extracted from an unread message.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaItem {
    pub media_type: MediaType,
    pub base64_data: String,
    pub source_message_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
    Emoji,
}

/// Structural view of a host message — the only fields this crate reads.
#[derive(Debug, Clone)]
pub struct UnreadMessage {
    pub message_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub processed_plain_text: String,
    pub time: f64,
    pub media: Vec<MediaItem>,
}

/// One line of already-rendered chat history, used by `build_fused_narrative`.
#[derive(Debug, Clone)]
pub struct HistoryMessage {
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub time: f64,
}

/// Per-stream unread-message mailbox.
#[async_trait]
pub trait UnreadQueue: Send + Sync {
    async fn fetch_unreads(&self, stream_id: &StreamId) -> Result<(String, Vec<UnreadMessage>)>;
    async fn flush_unreads(&self, stream_id: &StreamId, consumed: &[UnreadMessage]) -> Result<()>;
}

/// A message to attribute an outbound reply to, when one is available.
#[derive(Debug, Clone, Default)]
pub struct TriggerMessage {
    pub message_id: Option<String>,
    pub sender_id: Option<String>,
}

#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send_reply(&self, stream_id: &StreamId, trigger: &TriggerMessage, content: &str) -> Result<bool>;
}

#[derive(Debug, Clone, Default)]
pub struct StreamInfo {
    pub stream_id: String,
    pub bot_id: String,
    pub chat_type: ChatType,
    pub platform: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatType {
    #[default]
    Private,
    Group,
    Other,
}

#[async_trait]
pub trait StreamRegistry: Send + Sync {
    async fn activate(&self, stream_id: &StreamId) -> Result<StreamInfo>;
    async fn get(&self, stream_id: &StreamId) -> Result<Option<StreamInfo>>;
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub message: String,
    pub call_list: Vec<ToolCall>,
}

#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// `(name, type, required, description)`.
    pub params: Vec<(String, String, bool, String)>,
}

/// One append-only request/response chain for a single turn (or the few
/// requests of a perceive-then-decide retry loop). Owned exclusively by the
/// dialogue loop for the duration of one stream invocation.
#[async_trait]
pub trait LlmRequestChain: Send {
    fn append_system(&mut self, text: &str);
    fn append_user(&mut self, parts: Vec<ContentPart>);
    fn append_tool_result(&mut self, call_id: &str, value: &str);
    fn register_tool_schemas(&mut self, schemas: &[ToolSchema]);

    /// Send the accumulated chain. `auto_append_response` echoes the
    /// model's own textual output back into the chain (used by the
    /// perceive-then-decide loop).
    async fn send(&mut self, auto_append_response: bool) -> Result<LlmResponse>;
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Build a fresh chain scoped to the named model task (e.g. `"actor"`,
    /// `"sub_actor"`). Returns `Err` if no model is configured for the task.
    async fn build_request(&self, model_task: &str) -> Result<Box<dyn LlmRequestChain>>;
}

#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn to_schema(&self) -> Vec<ToolSchema>;
    async fn run_tool_call(&self, call: &ToolCall) -> Result<String>;
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<()>;
}

pub trait Watchdog: Send + Sync {
    fn feed_dog(&self, stream_id: &StreamId);
}

/// Idempotent per-stream VLM bypass registration.
pub trait MediaManager: Send + Sync {
    fn skip_vlm_for_stream(&self, stream_id: &StreamId);
    fn unskip_vlm_for_stream(&self, stream_id: &StreamId);
}
