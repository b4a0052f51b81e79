//! Point balance: the authority's last acknowledged total plus what has been earned
//! locally since. The two are summed for display and never folded into each other.

use serde::Serialize;

/// Points earned since the last acknowledged sync.
///
/// Grows only through [`AccrualBuffer::append`] between sync attempts and shrinks
/// only when the authority acknowledges a submitted amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AccrualBuffer {
    pending: f64,
}

/// Residue below this after an acknowledgement is float noise, not earnings.
const EPSILON: f64 = 1e-9;

impl AccrualBuffer {
    pub fn restored(pending: f64) -> Self {
        let mut b = Self::default();
        b.append(pending);
        b
    }

    pub fn pending(&self) -> f64 {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending <= 0.0
    }

    pub fn append(&mut self, points: f64) {
        if points.is_finite() && points > 0.0 {
            self.pending += points;
        }
    }

    /// Removes an amount the authority has accepted. Anything appended after the
    /// submission was taken stays buffered.
    pub fn acknowledge(&mut self, submitted: f64) {
        let rest = self.pending - submitted.max(0.0);
        self.pending = if rest > EPSILON { rest } else { 0.0 };
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PointBalance {
    pub confirmed: f64,
    pub buffer: AccrualBuffer,
}

impl PointBalance {
    pub fn new(confirmed: f64, pending: f64) -> Self {
        Self {
            confirmed: if confirmed.is_finite() { confirmed } else { 0.0 },
            buffer: AccrualBuffer::restored(pending),
        }
    }

    pub fn pending(&self) -> f64 {
        self.buffer.pending()
    }

    pub fn displayed(&self) -> f64 {
        self.confirmed + self.buffer.pending()
    }

    /// Authority's total replaces the confirmed side; the acknowledged part of the
    /// buffer is dropped.
    pub fn reconcile(&mut self, authority_total: f64, submitted: f64) {
        self.confirmed = authority_total;
        self.buffer.acknowledge(submitted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_ignores_non_positive() {
        let mut b = AccrualBuffer::default();
        b.append(3.0);
        b.append(-1.0);
        b.append(f64::NAN);
        b.append(0.0);
        assert_eq!(b.pending(), 3.0);
    }

    #[test]
    fn acknowledge_keeps_later_earnings() {
        let mut b = AccrualBuffer::default();
        b.append(9.0);
        b.append(3.0);
        b.acknowledge(9.0);
        assert_eq!(b.pending(), 3.0);
        b.acknowledge(3.0);
        assert!(b.is_empty());
    }

    #[test]
    fn acknowledge_snaps_float_residue() {
        let mut b = AccrualBuffer::default();
        b.append(0.1);
        b.append(0.2);
        b.acknowledge(0.1 + 0.2);
        assert_eq!(b.pending(), 0.0);
    }

    #[test]
    fn reconcile_replaces_confirmed() {
        let mut bal = PointBalance::new(100.0, 12.0);
        assert_eq!(bal.displayed(), 112.0);
        bal.reconcile(112.0, 12.0);
        assert_eq!(bal.confirmed, 112.0);
        assert_eq!(bal.pending(), 0.0);
        assert_eq!(bal.displayed(), 112.0);
    }
}
