/// Regenerating tap resource. `0 <= current <= max` holds after every mutation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergyStore {
    current: f64,
    max: f64,
    regen_per_second: f64,
}

impl EnergyStore {
    pub fn new(max: f64, regen_per_second: f64) -> Self {
        let max = if max.is_finite() { max.max(0.0) } else { 0.0 };
        Self {
            current: max,
            max,
            regen_per_second: regen_per_second.max(0.0),
        }
    }

    /// Starts from an explicit level (e.g. restored state), clamped into range.
    pub fn with_current(mut self, current: f64) -> Self {
        self.current = clamp(current, self.max);
        self
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn regen_per_second(&self) -> f64 {
        self.regen_per_second
    }

    pub fn is_exhausted(&self) -> bool {
        self.current <= 0.0
    }

    /// Spends `amount`. Only an empty store refuses; a partial balance is
    /// drained to zero rather than rejected.
    pub fn consume(&mut self, amount: f64) -> bool {
        if self.is_exhausted() {
            return false;
        }
        if amount.is_finite() && amount > 0.0 {
            self.current = clamp(self.current - amount, self.max);
        }
        true
    }

    pub fn regenerate(&mut self, elapsed_seconds: f64) {
        if !elapsed_seconds.is_finite() || elapsed_seconds <= 0.0 {
            return;
        }
        self.current = clamp(self.current + elapsed_seconds * self.regen_per_second, self.max);
    }
}

fn clamp(v: f64, max: f64) -> f64 {
    if v.is_nan() {
        return 0.0;
    }
    v.clamp(0.0, max)
}
