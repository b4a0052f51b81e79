use serde::{Deserialize, Serialize};

use crate::balance::PointBalance;
use crate::energy::EnergyStore;
use crate::multiplier::TapMultiplier;

/// Interactive area; tap coordinates are relative to its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Surface {
    pub width: f64,
    pub height: f64,
}

impl Default for Surface {
    fn default() -> Self {
        Self {
            width: 320.0,
            height: 320.0,
        }
    }
}

impl Surface {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        (0.0..=self.width).contains(&x) && (0.0..=self.height).contains(&y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TapEvent {
    pub timestamp_ms: i64,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TapOutcome {
    Accepted { points: f64, multiplier: f64 },
    Rejected(TapRejection),
}

impl TapOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, TapOutcome::Accepted { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapRejection {
    OutOfBounds,
    Exhausted,
}

/// Per-tap entry point. Owns inter-tap timing; the caller owns the state it mutates.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    surface: Surface,
    calculator: TapMultiplier,
    energy_cost: f64,
    last_tap_ms: Option<i64>,
    taps: u64,
}

impl Dispatcher {
    pub fn new(surface: Surface, calculator: TapMultiplier, energy_cost: f64) -> Self {
        Self {
            surface,
            calculator,
            energy_cost,
            last_tap_ms: None,
            taps: 0,
        }
    }

    pub fn taps(&self) -> u64 {
        self.taps
    }

    /// Rejections leave every piece of state untouched, including the tap clock.
    pub fn dispatch(
        &mut self,
        tap: &TapEvent,
        energy: &mut EnergyStore,
        balance: &mut PointBalance,
    ) -> TapOutcome {
        if !self.surface.contains(tap.x, tap.y) {
            return TapOutcome::Rejected(TapRejection::OutOfBounds);
        }
        if !energy.consume(self.energy_cost) {
            return TapOutcome::Rejected(TapRejection::Exhausted);
        }

        let (points, multiplier) = self.calculator.reward(self.last_tap_ms, tap.timestamp_ms);
        self.last_tap_ms = Some(tap.timestamp_ms);
        self.taps += 1;
        balance.buffer.append(points);

        TapOutcome::Accepted { points, multiplier }
    }
}
