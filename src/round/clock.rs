use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source in epoch milliseconds. `None` means the clock is unavailable.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Option<i64>;
}

/// System wall clock shifted by an estimated server offset.
#[derive(Debug, Default)]
pub struct SystemClock {
    offset_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> Option<i64> {
        let local = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        let local_ms = local.as_millis().min(i64::MAX as u128) as i64;
        Some(local_ms.saturating_add(self.offset_ms()))
    }
}

/// Hand-driven clock for tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now_ms: Arc<AtomicI64>,
    available: Arc<AtomicBool>,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: Arc::new(AtomicI64::new(now_ms)),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Option<i64> {
        if self.available.load(Ordering::Relaxed) {
            Some(self.now_ms.load(Ordering::Relaxed))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOffsetSample {
    pub offset_ms: i64,
    pub rtt_ms: i64,
}

impl ClockOffsetSample {
    /// Offset of the server clock against the midpoint of the local request window.
    pub fn from_round_trip(
        request_started_ms: i64,
        server_time_ms: i64,
        request_finished_ms: i64,
    ) -> Self {
        let rtt_ms = signed_time_delta_ms(request_finished_ms, request_started_ms).max(0);
        let local_midpoint_ms = request_started_ms.saturating_add(rtt_ms / 2);
        Self {
            offset_ms: signed_time_delta_ms(server_time_ms, local_midpoint_ms),
            rtt_ms,
        }
    }
}

/// Smooths server offset samples; low-RTT samples move the estimate faster.
#[derive(Debug, Default)]
pub struct ClockOffsetEstimator {
    initialized: bool,
    value_ms: i64,
}

impl ClockOffsetEstimator {
    pub fn update(&mut self, sample: ClockOffsetSample) -> i64 {
        if !self.initialized {
            self.value_ms = sample.offset_ms;
            self.initialized = true;
            return self.value_ms;
        }

        let alpha_permille = if sample.rtt_ms <= 80 {
            280_i64
        } else if sample.rtt_ms <= 180 {
            200_i64
        } else if sample.rtt_ms <= 350 {
            130_i64
        } else {
            90_i64
        };
        let delta = sample.offset_ms.saturating_sub(self.value_ms);
        let bounded_delta = delta.clamp(-300, 300);
        self.value_ms = self
            .value_ms
            .saturating_add(bounded_delta.saturating_mul(alpha_permille) / 1_000);
        self.value_ms
    }

    pub fn value_ms(&self) -> Option<i64> {
        self.initialized.then_some(self.value_ms)
    }
}

pub fn signed_time_delta_ms(lhs_ms: i64, rhs_ms: i64) -> i64 {
    let delta = (lhs_ms as i128) - (rhs_ms as i128);
    delta.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn computes_signed_time_delta() {
        assert_eq!(signed_time_delta_ms(1_000, 900), 100);
        assert_eq!(signed_time_delta_ms(900, 1_000), -100);
    }

    #[test]
    fn sample_uses_request_midpoint() {
        let sample = ClockOffsetSample::from_round_trip(10_000, 10_650, 10_200);
        assert_eq!(sample.rtt_ms, 200);
        assert_eq!(sample.offset_ms, 550);
    }

    #[test]
    fn estimator_takes_first_sample_then_smooths() {
        let mut estimator = ClockOffsetEstimator::default();
        assert_eq!(estimator.value_ms(), None);

        let first = estimator.update(ClockOffsetSample {
            offset_ms: 1_000,
            rtt_ms: 50,
        });
        assert_eq!(first, 1_000);

        let second = estimator.update(ClockOffsetSample {
            offset_ms: 2_000,
            rtt_ms: 50,
        });
        // delta clamps to 300ms and moves 28% of it
        assert_eq!(second, 1_084);
    }

    #[test]
    fn manual_clock_reports_unavailable() {
        let clock = ManualClock::new(5_000);
        clock.advance(250);
        assert_eq!(clock.now_ms(), Some(5_250));

        clock.set_available(false);
        assert_eq!(clock.now_ms(), None);
    }

    #[test]
    fn system_clock_applies_offset() {
        let clock = SystemClock::new();
        clock.set_offset_ms(60_000);
        let shifted = clock.now_ms().expect("system clock should be readable");
        assert!(shifted - now_unix_ms() >= 59_000);
    }
}
