use crate::error::AppError;
use crate::round::actions::ActionPayload;
use crate::round::clock::Clock;
use crate::round::timer::{PhaseTimer, TimerState};
use crate::round::types::{RoundId, RoundPhase, RoundRecord};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadyStatus {
    Pending,
    Ready,
    NotReady,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReadyCheckSnapshot {
    pub round_id: RoundId,
    pub expires_at_ms: i64,
    pub remaining_ms: i64,
    pub local_status: ReadyStatus,
    pub responded: bool,
    pub sending: bool,
    pub open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Unsent,
    Sending(bool),
    Sent(bool),
}

/// Timed ready handshake for a scheduled match.
///
/// One response is accepted, strictly before expiry. A response is reserved
/// while it is in flight and only counts once delivered; a failed delivery
/// frees the slot again. With no delivered response the local user resolves
/// to not-ready once the deadline passes.
pub struct ReadyCheck {
    round_id: RoundId,
    expires_at_ms: i64,
    response: ResponseState,
    invalidated: bool,
    timer: PhaseTimer,
}

impl ReadyCheck {
    /// Opens a check if the record is starting, carries a starting deadline
    /// and lists `wallet` as a participant.
    pub fn open(record: &RoundRecord, wallet: &str, clock: Arc<dyn Clock>) -> Option<Self> {
        if record.phase != RoundPhase::Starting {
            return None;
        }
        let expires_at_ms = record.deadline_for(RoundPhase::Starting)?;
        record.participant(wallet)?;

        info!(round_id = %record.round_id, expires_at_ms, "ready check opened");
        Some(Self {
            round_id: record.round_id.clone(),
            expires_at_ms,
            response: ResponseState::Unsent,
            invalidated: false,
            timer: PhaseTimer::single(clock, RoundPhase::Starting, expires_at_ms),
        })
    }

    pub fn round_id(&self) -> &RoundId {
        &self.round_id
    }

    pub fn expires_at_ms(&self) -> i64 {
        self.expires_at_ms
    }

    pub fn is_open(&self) -> bool {
        !self.invalidated
    }

    pub fn is_expired(&self, now_ms: Option<i64>) -> bool {
        now_ms
            .map(|now_ms| now_ms >= self.expires_at_ms)
            .unwrap_or(true)
    }

    /// Reserves the single response and hands back the payload to transmit.
    /// Follow with `commit` or `release` once delivery is known.
    pub fn respond(&mut self, ready: bool, now_ms: Option<i64>) -> Result<ActionPayload, AppError> {
        if self.invalidated {
            return Err(AppError::ReadyCheckClosed(format!(
                "round {} is no longer starting",
                self.round_id
            )));
        }
        match self.response {
            ResponseState::Unsent => (),
            ResponseState::Sending(_) => {
                return Err(AppError::ActionConflict {
                    round_id: self.round_id.to_string(),
                });
            }
            ResponseState::Sent(_) => {
                return Err(AppError::ReadyCheckClosed(format!(
                    "already responded for round {}",
                    self.round_id
                )));
            }
        }
        if self.is_expired(now_ms) {
            debug!(round_id = %self.round_id, "late ready response refused");
            return Err(AppError::ReadyCheckClosed(format!(
                "ready check for round {} expired",
                self.round_id
            )));
        }

        self.response = ResponseState::Sending(ready);
        Ok(ActionPayload::ReadyResponse { ready })
    }

    /// The reserved response reached the backend.
    pub fn commit(&mut self) {
        if let ResponseState::Sending(ready) = self.response {
            self.response = ResponseState::Sent(ready);
            info!(round_id = %self.round_id, ready, "ready response delivered");
        }
    }

    /// The reserved response never landed; another attempt may be made.
    pub fn release(&mut self) {
        if let ResponseState::Sending(ready) = self.response {
            self.response = ResponseState::Unsent;
            debug!(round_id = %self.round_id, ready, "ready response not delivered");
        }
    }

    pub fn local_status(&self, now_ms: Option<i64>) -> ReadyStatus {
        match self.response {
            ResponseState::Sent(true) => ReadyStatus::Ready,
            ResponseState::Sent(false) => ReadyStatus::NotReady,
            ResponseState::Sending(_) if !self.invalidated => ReadyStatus::Pending,
            _ if self.invalidated || self.is_expired(now_ms) => ReadyStatus::NotReady,
            _ => ReadyStatus::Pending,
        }
    }

    /// Tracks the canonical record; the check closes once its round leaves
    /// `starting` or is replaced.
    pub fn follow(&mut self, record: Option<&RoundRecord>) -> bool {
        let still_starting = record
            .map(|record| record.round_id == self.round_id && record.phase == RoundPhase::Starting)
            .unwrap_or(false);
        if !still_starting {
            self.invalidate();
        }
        self.is_open()
    }

    pub fn invalidate(&mut self) {
        if !self.invalidated {
            self.invalidated = true;
            debug!(round_id = %self.round_id, "ready check closed");
        }
    }

    pub fn tick(&mut self) -> TimerState {
        self.timer.tick()
    }

    pub fn snapshot(&self, now_ms: Option<i64>) -> ReadyCheckSnapshot {
        ReadyCheckSnapshot {
            round_id: self.round_id.clone(),
            expires_at_ms: self.expires_at_ms,
            remaining_ms: self.timer.state().remaining_ms,
            local_status: self.local_status(now_ms),
            responded: matches!(self.response, ResponseState::Sent(_)),
            sending: matches!(self.response, ResponseState::Sending(_)),
            open: self.is_open(),
        }
    }
}
