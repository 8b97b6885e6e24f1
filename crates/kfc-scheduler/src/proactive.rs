//! Background trigger for bot-initiated ("proactive") conversation starts.
//! Ticks on a fixed interval and, per cached session, runs it through four
//! independent gates before emitting a host event.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;
use kfc_agent::traits::EventPublisher;
use kfc_core::{KfcConfig, StreamId};
use kfc_sessions::SessionStore;
use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, instrument, warn};

use crate::error::Result;

pub struct ProactiveThinker {
    config: Arc<KfcConfig>,
    sessions: Arc<SessionStore>,
    events: Arc<dyn EventPublisher>,
}

impl ProactiveThinker {
    pub fn new(config: Arc<KfcConfig>, sessions: Arc<SessionStore>, events: Arc<dyn EventPublisher>) -> Self {
        Self { config, sessions, events }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = Duration::from_secs(self.config.proactive.check_interval.max(1));
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(now_unix()).await {
                        warn!(error = %e, "proactive-thinker tick failed");
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
        if !self.config.proactive.enabled {
            return Ok(());
        }
        if in_quiet_hours(&self.config.proactive.quiet_hours_start, &self.config.proactive.quiet_hours_end, now) {
            return Ok(());
        }
        for stream_id in self.sessions.all_stream_ids() {
            if let Err(e) = self.check_stream(&stream_id, now).await {
                warn!(stream_id = %stream_id.as_str(), error = %e, "proactive-thinker failed for stream");
            }
        }
        Ok(())
    }

    async fn check_stream(&self, stream_id: &StreamId, now: f64) -> Result<()> {
        let mut session = self.sessions.lock(stream_id).await?;

        if session.is_waiting() {
            return Ok(());
        }
        if now - session.last_activity_at < self.config.proactive.silence_threshold as f64 {
            return Ok(());
        }
        if let Some(last_proactive_at) = session.last_proactive_at {
            if now - last_proactive_at < self.config.proactive.min_interval as f64 {
                return Ok(());
            }
        }
        if !rand::thread_rng().gen_bool(self.config.proactive.trigger_probability.clamp(0.0, 1.0)) {
            return Ok(());
        }

        self.events
            .publish("kfc.proactive_trigger", serde_json::json!({ "stream_id": stream_id.as_str() }))
            .await?;
        session.mark_proactive(now);
        self.sessions.save(&session).await?;
        debug!(stream_id = %stream_id.as_str(), "proactive trigger fired");
        Ok(())
    }
}

/// `HH:MM` quiet-hours window, wrapping past midnight when `start > end`
/// (e.g. `23:00`–`07:00`).
fn in_quiet_hours(start: &str, end: &str, now: f64) -> bool {
    let (Some(start), Some(end)) = (parse_hhmm(start), parse_hhmm(end)) else {
        return false;
    };
    let current = epoch_to_local_time(now);

    if start <= end {
        current >= start && current < end
    } else {
        current >= start || current < end
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

fn epoch_to_local_time(now: f64) -> NaiveTime {
    use chrono::{Local, TimeZone};
    let secs = now.floor() as i64;
    Local
        .timestamp_opt(secs, 0)
        .single()
        .map(|dt| dt.time())
        .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap())
}

fn now_unix() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kfc_core::Result as KfcResult;
    use kfc_sessions::NullBackingStore;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;

    struct RecordingEvents {
        published: StdMutex<Vec<(String, Value)>>,
    }
    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(&self, topic: &str, payload: Value) -> KfcResult<()> {
            self.published.lock().unwrap().push((topic.to_string(), payload));
            Ok(())
        }
    }

    fn config_always_fires() -> KfcConfig {
        let mut config = KfcConfig::default();
        config.proactive.trigger_probability = 1.0;
        config.proactive.silence_threshold = 60;
        config.proactive.min_interval = 60;
        config.proactive.quiet_hours_start = "00:00".to_string();
        config.proactive.quiet_hours_end = "00:00".to_string();
        config
    }

    #[tokio::test]
    async fn fires_when_all_gates_pass() {
        let sessions = Arc::new(SessionStore::new(Arc::new(NullBackingStore), 50));
        let stream_id = StreamId::from("s1");
        {
            let mut session = sessions.lock(&stream_id).await.unwrap();
            session.last_activity_at = 0.0;
        }
        let events = Arc::new(RecordingEvents { published: StdMutex::new(Vec::new()) });
        let thinker = ProactiveThinker::new(Arc::new(config_always_fires()), sessions.clone(), events.clone());

        thinker.tick(1000.0).await.unwrap();

        assert_eq!(events.published.lock().unwrap().len(), 1);
        let session = sessions.lock(&stream_id).await.unwrap();
        assert!(session.last_proactive_at.is_some());
    }

    #[tokio::test]
    async fn silence_gate_blocks_recent_activity() {
        let sessions = Arc::new(SessionStore::new(Arc::new(NullBackingStore), 50));
        let stream_id = StreamId::from("s1");
        {
            let mut session = sessions.lock(&stream_id).await.unwrap();
            session.last_activity_at = 990.0;
        }
        let events = Arc::new(RecordingEvents { published: StdMutex::new(Vec::new()) });
        let thinker = ProactiveThinker::new(Arc::new(config_always_fires()), sessions.clone(), events.clone());

        thinker.tick(1000.0).await.unwrap();

        assert!(events.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn min_interval_gate_blocks_recent_trigger() {
        let sessions = Arc::new(SessionStore::new(Arc::new(NullBackingStore), 50));
        let stream_id = StreamId::from("s1");
        {
            let mut session = sessions.lock(&stream_id).await.unwrap();
            session.last_activity_at = 0.0;
            session.last_proactive_at = Some(990.0);
        }
        let events = Arc::new(RecordingEvents { published: StdMutex::new(Vec::new()) });
        let thinker = ProactiveThinker::new(Arc::new(config_always_fires()), sessions.clone(), events.clone());

        thinker.tick(1000.0).await.unwrap();

        assert!(events.published.lock().unwrap().is_empty());
    }

    #[test]
    fn quiet_hours_wraps_past_midnight() {
        // 2026-01-01T23:30:00Z-ish epoch isn't portable across timezones, so
        // exercise the pure wraparound logic directly instead.
        let start = parse_hhmm("23:00").unwrap();
        let end = parse_hhmm("07:00").unwrap();
        let late_night = NaiveTime::from_hms_opt(23, 30, 0).unwrap();
        let early_morning = NaiveTime::from_hms_opt(3, 0, 0).unwrap();
        let midday = NaiveTime::from_hms_opt(12, 0, 0).unwrap();

        assert!(start > end);
        assert!(late_night >= start || late_night < end);
        assert!(early_morning >= start || early_morning < end);
        assert!(!(midday >= start || midday < end));
    }
}
