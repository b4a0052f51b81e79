/// Reward scalar from inter-tap timing: `max(1, reference / dt)`.
///
/// `dt` is floored at [`MIN_TAP_INTERVAL_MS`] and the result is capped at
/// `max_multiplier`, so double-fired taps cannot produce unbounded rewards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TapMultiplier {
    pub reference_interval_ms: f64,
    pub max_multiplier: f64,
    pub base_points: f64,
}

pub const MIN_TAP_INTERVAL_MS: i64 = 1;

impl Default for TapMultiplier {
    fn default() -> Self {
        Self {
            reference_interval_ms: 500.0,
            max_multiplier: 10.0,
            base_points: 3.0,
        }
    }
}

impl TapMultiplier {
    pub fn multiplier(&self, last_tap_ms: Option<i64>, now_ms: i64) -> f64 {
        let Some(last) = last_tap_ms else {
            return 1.0;
        };
        let dt = now_ms.saturating_sub(last).max(MIN_TAP_INTERVAL_MS) as f64;
        (self.reference_interval_ms / dt).clamp(1.0, self.max_multiplier.max(1.0))
    }

    pub fn reward(&self, last_tap_ms: Option<i64>, now_ms: i64) -> (f64, f64) {
        let m = self.multiplier(last_tap_ms, now_ms);
        (self.base_points * m, m)
    }
}
