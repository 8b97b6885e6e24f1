//! The per-stream state machine: Decide → (Wait | Stop), one invocation per
//! scheduler tick. The loop itself never sleeps for a wait — it yields
//! `Wait(0)` and trusts the host to re-invoke it later; elapsed time is
//! always measured from `WaitingConfig.started_at`.

use std::sync::Arc;

use kfc_core::{KfcConfig, Result, StreamId};
use kfc_sessions::SessionStore;
use tracing::{instrument, warn};

use crate::prompt::{PersonaProfile, PromptBuilder};
use crate::timeout::TimeoutHandler;
use crate::traits::{ContentPart, HistoryMessage, LlmClient, MediaManager, StreamRegistry, TriggerMessage, UnreadQueue};
use crate::turn_protocol::TurnProtocol;

/// Outcome of one `DialogueLoop` tick. `Failure` surfaces a transport-level
/// error without mutating session state.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopOutcome {
    Wait,
    Stop,
    Failure(String),
}

/// Drives exactly one Decide pass for a stream. Stateless across ticks
/// except through `SessionStore` and whatever the host persists; a fresh
/// LLM request/response chain is built and discarded every invocation.
pub struct DialogueLoop {
    pub config: Arc<KfcConfig>,
    pub sessions: Arc<SessionStore>,
    pub streams: Arc<dyn StreamRegistry>,
    pub unreads: Arc<dyn UnreadQueue>,
    pub llm: Arc<dyn LlmClient>,
    pub media: Arc<dyn MediaManager>,
    pub persona: PersonaProfile,
    pub turn_protocol: TurnProtocol,
}

impl DialogueLoop {
    #[instrument(skip(self, history), fields(stream_id = %stream_id.as_str()))]
    pub async fn run_once(&self, stream_id: &StreamId, now: f64, history: &[HistoryMessage]) -> Result<LoopOutcome> {
        if !self.config.general.enabled {
            return Ok(LoopOutcome::Stop);
        }

        let stream_info = self.streams.activate(stream_id).await?;
        let mut session = self.sessions.lock(stream_id).await?;
        if session.created_at == 0.0 {
            session.created_at = now;
        }

        let native_multimodal = self.config.general.native_multimodal;
        if native_multimodal {
            self.media.skip_vlm_for_stream(stream_id);
        }
        let _vlm_guard = VlmSkipGuard { media: native_multimodal.then_some(self.media.as_ref()), stream_id };

        let tool_schemas = self.turn_protocol.tools.to_schema();
        let mut chain = self.llm.build_request(&self.config.general.model_task).await?;
        chain.append_system(&PromptBuilder::build_system_prompt(&self.persona, &stream_info, &tool_schemas, now));
        if !history.is_empty() {
            let narrative = PromptBuilder::build_fused_narrative(history, &session.mental_log, &stream_info.bot_id);
            if !narrative.is_empty() {
                chain.append_user(vec![ContentPart::Text(narrative)]);
            }
        }
        chain.register_tool_schemas(&tool_schemas);

        let (formatted, messages) = self.unreads.fetch_unreads(stream_id).await?;
        let mut trigger = TriggerMessage::default();
        if let Some(last) = messages.last() {
            trigger.message_id = Some(last.message_id.clone());
            trigger.sender_id = Some(last.sender_id.clone());
        }

        if !messages.is_empty() {
            let was_waiting = session.is_waiting();
            let prior_expected_reaction = session.waiting_config.expected_reaction.clone();
            let prior_pending_thoughts = session.waiting_config.pending_thoughts.clone();
            for m in &messages {
                let ts = if m.time.is_finite() { m.time } else { now };
                session.add_user_message(ts, &m.sender_name, &kfc_core::UserId::from(m.sender_id.as_str()), &m.processed_plain_text);
            }
            if was_waiting {
                session.record_reply_timing(now, &prior_expected_reaction);
                session.clear_waiting(now);
            }

            let mut budget = self.config.general.max_images_per_payload;
            let mut media_items = Vec::new();
            'outer: for m in &messages {
                for item in &m.media {
                    if budget == 0 {
                        break 'outer;
                    }
                    media_items.push(item.clone());
                    budget -= 1;
                }
            }

            chain.append_user(PromptBuilder::build_user_payload(&formatted, &media_items, &prior_pending_thoughts));
        } else if session.is_waiting() {
            if TimeoutHandler::check_timeout(&session, now) {
                let ctx = TimeoutHandler::handle_timeout(&mut session, now);
                if TimeoutHandler::should_give_up(&session, &self.config.wait) {
                    self.sessions.save(&session).await?;
                    return Ok(LoopOutcome::Stop);
                }
                let payload = PromptBuilder::build_timeout_payload(
                    ctx.elapsed_seconds,
                    &ctx.expected_reaction,
                    ctx.consecutive_timeouts,
                    &ctx.last_bot_message,
                    &ctx.pending_thoughts,
                );
                chain.append_user(vec![ContentPart::Text(payload)]);
            } else {
                return Ok(LoopOutcome::Wait);
            }
        } else {
            return Ok(LoopOutcome::Wait);
        }

        let perceive_then_decide = native_multimodal;
        let result = match self.turn_protocol.run_turn(stream_id, chain.as_mut(), &trigger, perceive_then_decide).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "LLM turn failed; yielding Failure without mutating session");
                return Ok(LoopOutcome::Failure(e.to_string()));
            }
        };

        self.unreads.flush_unreads(stream_id, &messages).await?;
        session.add_bot_planning(now, &result.thought, result.actions.clone(), &result.expected_reaction, result.max_wait_seconds);

        if !result.has_meaningful_action() || (result.has_do_nothing && !result.has_reply) {
            self.sessions.save(&session).await?;
            return Ok(LoopOutcome::Stop);
        }

        let wait_seconds = self.config.wait.apply(result.max_wait_seconds, session.consecutive_timeout_count);
        if wait_seconds > 0.0 {
            let followup_count = session.consecutive_timeout_count;
            session.set_waiting(now, &result.expected_reaction, wait_seconds, followup_count);
            self.sessions.save(&session).await?;
            Ok(LoopOutcome::Wait)
        } else {
            session.clear_waiting(now);
            self.sessions.save(&session).await?;
            Ok(LoopOutcome::Stop)
        }
    }
}

/// Best-effort scoped cleanup for the native-multimodal VLM-skip
/// registration. Registration is idempotent and cleanup is best-effort per
/// the cancellation policy, so a missed `unskip` on task cancellation is
/// not a correctness bug — just a stream that stays VLM-skipped slightly
/// longer than it needs to.
struct VlmSkipGuard<'a> {
    media: Option<&'a dyn MediaManager>,
    stream_id: &'a StreamId,
}

impl Drop for VlmSkipGuard<'_> {
    fn drop(&mut self) {
        if let Some(media) = self.media {
            media.unskip_vlm_for_stream(self.stream_id);
        }
    }
}
