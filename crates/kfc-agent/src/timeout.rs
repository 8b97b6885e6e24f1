//! Wait-timeout detection and bookkeeping, called directly from
//! [`crate::dialogue::DialogueLoop`] on every tick where a stream is
//! waiting and no new unread messages arrived.

use kfc_core::config::WaitConfig;
use kfc_sessions::Session;

/// Everything the timeout user-payload needs, captured at the moment a
/// timeout fires (before the waiting state is cleared).
#[derive(Debug, Clone, Default)]
pub struct TimeoutContext {
    pub elapsed_seconds: f64,
    pub expected_reaction: String,
    pub consecutive_timeouts: u32,
    pub pending_thoughts: Vec<String>,
    pub last_bot_message: String,
}

pub struct TimeoutHandler;

impl TimeoutHandler {
    pub fn check_timeout(session: &Session, now: f64) -> bool {
        session.waiting_config.is_timeout(now)
    }

    /// Increments the timeout streak, appends a `WaitTimeout` entry, and
    /// clears the wait — mirroring `Session::record_timeout`, but also
    /// capturing the context a timeout user-payload is rendered from.
    pub fn handle_timeout(session: &mut Session, now: f64) -> TimeoutContext {
        let elapsed_seconds = session.waiting_config.elapsed_seconds(now);
        let expected_reaction = session.waiting_config.expected_reaction.clone();
        let last_bot_message = session.mental_log.last_bot_reply_content();
        let pending_thoughts = session.record_timeout(now);
        TimeoutContext {
            elapsed_seconds,
            expected_reaction,
            consecutive_timeouts: session.consecutive_timeout_count,
            pending_thoughts,
            last_bot_message,
        }
    }

    /// Called strictly after `handle_timeout`, so the `N`th timeout yields
    /// `consecutive_timeout_count == N`.
    pub fn should_give_up(session: &Session, config: &WaitConfig) -> bool {
        session.consecutive_timeout_count >= config.max_consecutive_timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kfc_core::StreamId;

    #[test]
    fn give_up_threshold_is_checked_after_increment() {
        let mut session = Session::new(StreamId::from("s1"), 50);
        session.set_waiting(0.0, "回复我", 10.0, 0);
        let config = WaitConfig::default();

        let ctx = TimeoutHandler::handle_timeout(&mut session, 11.0);
        assert_eq!(ctx.consecutive_timeouts, 1);
        assert!(!TimeoutHandler::should_give_up(&session, &config));

        session.set_waiting(11.0, "回复我", 10.0, 1);
        TimeoutHandler::handle_timeout(&mut session, 22.0);
        session.set_waiting(22.0, "回复我", 10.0, 2);
        TimeoutHandler::handle_timeout(&mut session, 33.0);
        assert_eq!(session.consecutive_timeout_count, 3);
        assert!(TimeoutHandler::should_give_up(&session, &config));
    }
}
