use crate::round::clock::{signed_time_delta_ms, Clock};
use crate::round::types::{RoundPhase, RoundRecord};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const SMOOTH_TICK_MS: u64 = 100;
pub const DIGITS_TICK_MS: u64 = 1_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TimerCadence {
    Smooth,
    Digits,
}

impl TimerCadence {
    pub fn tick_ms(self) -> u64 {
        match self {
            Self::Smooth => SMOOTH_TICK_MS,
            Self::Digits => DIGITS_TICK_MS,
        }
    }
}

pub fn remaining_ms(deadline_ms: i64, now_ms: Option<i64>) -> i64 {
    match now_ms {
        Some(now) => signed_time_delta_ms(deadline_ms, now).max(0),
        None => 0,
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TimerState {
    pub phase: Option<RoundPhase>,
    pub deadline_ms: Option<i64>,
    pub remaining_ms: i64,
}

impl TimerState {
    pub fn expired(&self) -> bool {
        self.deadline_ms.is_some() && self.remaining_ms == 0
    }
}

/// Countdown against an absolute deadline, recomputed from the clock on every
/// read so event arrival never drives the displayed value.
pub struct PhaseTimer {
    clock: Arc<dyn Clock>,
    phase: Option<RoundPhase>,
    deadline_ms: Option<i64>,
    state: TimerState,
}

impl PhaseTimer {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            phase: None,
            deadline_ms: None,
            state: TimerState::default(),
        }
    }

    /// Timer pinned to one deadline, as used by the ready check.
    pub fn single(clock: Arc<dyn Clock>, phase: RoundPhase, deadline_ms: i64) -> Self {
        let mut timer = Self::new(clock);
        timer.phase = Some(phase);
        timer.deadline_ms = Some(deadline_ms);
        timer.tick();
        timer
    }

    /// Follows the record's phase; a phase change is recomputed immediately
    /// against the new deadline.
    pub fn sync(&mut self, record: Option<&RoundRecord>) -> TimerState {
        match record {
            Some(record) => {
                self.phase = Some(record.phase);
                self.deadline_ms = record.current_deadline();
            }
            None => {
                self.phase = None;
                self.deadline_ms = None;
            }
        }
        self.tick()
    }

    pub fn tick(&mut self) -> TimerState {
        let remaining = self
            .deadline_ms
            .map(|deadline_ms| remaining_ms(deadline_ms, self.clock.now_ms()))
            .unwrap_or(0);
        self.state = TimerState {
            phase: self.phase,
            deadline_ms: self.deadline_ms,
            remaining_ms: remaining,
        };
        self.state
    }

    pub fn state(&self) -> TimerState {
        self.state
    }
}
