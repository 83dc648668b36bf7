use serde::Serialize;

pub const DEFAULT_ANIMATION_DURATION_MS: i64 = 150;

pub type Easing = fn(f64) -> f64;

pub fn ease_out_cubic(progress: f64) -> f64 {
    let inverse = 1.0 - progress.clamp(0.0, 1.0);
    1.0 - inverse * inverse * inverse
}

pub fn linear(progress: f64) -> f64 {
    progress.clamp(0.0, 1.0)
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnimatedValue {
    pub displayed: f64,
    pub target: f64,
    pub from: f64,
    pub animation_start_ms: Option<i64>,
}

impl AnimatedValue {
    pub fn settled(value: f64) -> Self {
        Self {
            displayed: value,
            target: value,
            from: value,
            animation_start_ms: None,
        }
    }

    pub fn is_animating(&self) -> bool {
        self.animation_start_ms.is_some()
    }
}

/// Interpolation over a fixed window with a pluggable easing curve.
#[derive(Debug, Clone, Copy)]
pub struct Tween {
    duration_ms: i64,
    easing: Easing,
}

impl Tween {
    pub fn new(duration_ms: i64, easing: Easing) -> Self {
        Self {
            duration_ms,
            easing,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    pub fn value_at(&self, from: f64, to: f64, elapsed_ms: i64) -> f64 {
        if self.duration_ms <= 0 || elapsed_ms >= self.duration_ms {
            return to;
        }
        let progress = elapsed_ms.max(0) as f64 / self.duration_ms as f64;
        from + (to - from) * (self.easing)(progress)
    }
}

impl Default for Tween {
    fn default() -> Self {
        Self::new(DEFAULT_ANIMATION_DURATION_MS, ease_out_cubic)
    }
}

/// Display smoothing for a price feed. Samples set the target; frames read the
/// eased value. A retarget mid-flight restarts from what is currently shown.
#[derive(Debug, Clone)]
pub struct PriceAnimator {
    tween: Tween,
    reduced_motion: bool,
    observed: bool,
    value: AnimatedValue,
}

impl PriceAnimator {
    pub fn new(tween: Tween, reduced_motion: bool) -> Self {
        Self {
            tween,
            reduced_motion,
            observed: false,
            value: AnimatedValue::default(),
        }
    }

    pub fn set_reduced_motion(&mut self, reduced_motion: bool) {
        self.reduced_motion = reduced_motion;
        if reduced_motion {
            self.value = AnimatedValue::settled(self.value.target);
        }
    }

    pub fn observe(&mut self, target: f64, now_ms: i64) {
        if !target.is_finite() {
            return;
        }

        if !self.observed {
            self.observed = true;
            self.value = AnimatedValue::settled(target);
            return;
        }

        if target == self.value.target {
            return;
        }

        if self.reduced_motion {
            self.value = AnimatedValue::settled(target);
            return;
        }

        let current = self.frame(now_ms).displayed;
        self.value = AnimatedValue {
            displayed: current,
            target,
            from: current,
            animation_start_ms: Some(now_ms),
        };
    }

    pub fn frame(&mut self, now_ms: i64) -> AnimatedValue {
        if let Some(started_ms) = self.value.animation_start_ms {
            let elapsed_ms = now_ms.saturating_sub(started_ms);
            if elapsed_ms >= self.tween.duration_ms() {
                self.value = AnimatedValue::settled(self.value.target);
            } else {
                self.value.displayed = self
                    .tween
                    .value_at(self.value.from, self.value.target, elapsed_ms);
            }
        }
        self.value
    }

    pub fn value(&self) -> AnimatedValue {
        self.value
    }

    /// Drops the current value so the next sample snaps, as after a resubscribe.
    pub fn reset(&mut self) {
        self.observed = false;
        self.value = AnimatedValue::default();
    }
}

impl Default for PriceAnimator {
    fn default() -> Self {
        Self::new(Tween::default(), false)
    }
}
