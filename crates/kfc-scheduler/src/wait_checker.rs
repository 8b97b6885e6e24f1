//! Background trigger for continuous-thinking updates during an active
//! wait. Ticks on a fixed interval, walks every cached session, and for
//! each one that has crossed its next progress threshold, asks a
//! lightweight `sub_actor` LLM task for a short inner monologue.

use std::sync::Arc;
use std::time::Duration;

use kfc_agent::prompt::PromptBuilder;
use kfc_agent::traits::{ContentPart, LlmClient};
use kfc_core::{KfcConfig, StreamId};
use kfc_sessions::SessionStore;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::error::Result;

/// Canned fallback thoughts, bucketed by wait progress into four bands
/// (`< 0.3`, `< 0.6`, `< 0.85`, else), used when the `sub_actor` call fails
/// or returns nothing usable.
fn canned_thought(progress: f64) -> &'static str {
    if progress < 0.3 {
        "对方还没回复，再等等看吧。"
    } else if progress < 0.6 {
        "有点久了，不知道对方在忙什么。"
    } else if progress < 0.85 {
        "都这么久了，要不要再说一句？"
    } else {
        "再不回复我就要多想了。"
    }
}

pub struct WaitChecker {
    config: Arc<KfcConfig>,
    sessions: Arc<SessionStore>,
    llm: Arc<dyn LlmClient>,
}

impl WaitChecker {
    pub fn new(config: Arc<KfcConfig>, sessions: Arc<SessionStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self { config, sessions, llm }
    }

    /// Runs until `shutdown` reports `true`. Mirrors the tick/shutdown
    /// select loop used for every periodic task in this crate.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs_f64(self.config.continuous_thinking.min_interval.max(1.0));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(now_unix()).await {
                        warn!(error = %e, "wait-checker tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn tick(&self, now: f64) -> Result<()> {
        if !self.config.continuous_thinking.enabled {
            return Ok(());
        }
        for stream_id in self.sessions.all_stream_ids() {
            if let Err(e) = self.check_stream(&stream_id, now).await {
                warn!(stream_id = %stream_id.as_str(), error = %e, "wait-checker failed for stream");
            }
        }
        Ok(())
    }

    async fn check_stream(&self, stream_id: &StreamId, now: f64) -> Result<()> {
        let mut session = self.sessions.lock(stream_id).await?;
        if !session.is_waiting() {
            return Ok(());
        }

        let progress = session.waiting_config.progress(now);
        let n = session.waiting_config.thinking_count as usize;
        let thresholds = &self.config.continuous_thinking.progress_thresholds;
        if n >= thresholds.len() || progress < thresholds[n] {
            return Ok(());
        }

        let last = session.waiting_config.last_thinking_at;
        if last > 0.0 && now - last < self.config.continuous_thinking.min_interval {
            return Ok(());
        }

        let elapsed = session.waiting_config.elapsed_seconds(now);
        let expected_reaction = session.waiting_config.expected_reaction.clone();
        let last_bot_message = session.mental_log.last_bot_reply_content();

        let thought = self.generate_thought(elapsed, progress, &expected_reaction, &last_bot_message).await;

        session.waiting_config.last_thinking_at = now;
        session.waiting_config.thinking_count += 1;
        session.add_waiting_update(now, &thought);
        self.sessions.save(&session).await?;
        debug!(stream_id = %stream_id.as_str(), progress, "recorded continuous-thinking update");
        Ok(())
    }

    async fn generate_thought(&self, elapsed: f64, progress: f64, expected_reaction: &str, last_bot_message: &str) -> String {
        let context = PromptBuilder::build_continuous_thinking_context(elapsed, progress, expected_reaction, last_bot_message);
        let attempt = async {
            let mut chain = self.llm.build_request("sub_actor").await?;
            chain.append_user(vec![ContentPart::Text(context)]);
            chain.send(false).await
        };
        match attempt.await {
            Ok(resp) if !resp.message.trim().is_empty() => truncate_chars(resp.message.trim(), 200),
            _ => canned_thought(progress).to_string(),
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
