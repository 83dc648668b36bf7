use crate::round::reconciler::ReconcileStats;
use crate::round::types::RoundPhase;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub const STATUS_ERROR_THROTTLE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoundConnectionState {
    Connecting,
    Live,
    Desynced,
    Reconnecting,
    Stopped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStreamStatusSnapshot {
    pub state: RoundConnectionState,
    pub topic: String,
    pub round_id: Option<String>,
    pub phase: Option<RoundPhase>,
    pub stale: bool,
    pub stats: ReconcileStats,
    pub clock_offset_ms: Option<i64>,
    pub reason: Option<String>,
}

impl RoundStreamStatusSnapshot {
    pub fn stopped(topic: String, reason: Option<String>) -> Self {
        Self {
            state: RoundConnectionState::Stopped,
            topic,
            round_id: None,
            phase: None,
            stale: true,
            stats: ReconcileStats::default(),
            clock_offset_ms: None,
            reason,
        }
    }
}

/// Suppresses repeats of the same error or reconnect status inside a short
/// window so a flapping link does not flood subscribers.
#[derive(Debug, Default)]
pub struct StatusPublishThrottle {
    last_state: Option<RoundConnectionState>,
    last_reason: Option<String>,
    last_emit: Option<Instant>,
}

impl StatusPublishThrottle {
    pub fn allow(
        &mut self,
        state: RoundConnectionState,
        reason: &Option<String>,
        now: Instant,
    ) -> bool {
        let should_throttle = matches!(
            state,
            RoundConnectionState::Error | RoundConnectionState::Reconnecting
        );

        if should_throttle
            && self.last_state == Some(state)
            && self.last_reason == *reason
            && self
                .last_emit
                .map(|instant| {
                    now.duration_since(instant) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS)
                })
                .unwrap_or(false)
        {
            return false;
        }

        self.last_state = Some(state);
        self.last_reason = reason.clone();
        self.last_emit = Some(now);
        true
    }
}
