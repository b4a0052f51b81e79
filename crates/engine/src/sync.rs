//! Trailing-edge debounced reconciliation with the points authority.
//!
//! [`SyncCoordinator`] is the decision half: it owns the single debounce deadline
//! and the in-flight slot, and turns "the deadline passed" into at most one
//! [`SyncRequest`]. The session actor owns the timer and the network call and
//! feeds results back through [`SyncCoordinator::settle`].

use crowntap_protocol::UserIdentity;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::balance::PointBalance;
use crate::remote::RemoteError;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
    pub user: UserIdentity,
    pub points_to_add: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireSkip {
    InFlight,
    Offline,
    Nothing,
}

/// What [`SyncCoordinator::settle`] did to the balance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Settled {
    Acked { authority_total: f64, submitted: f64 },
    Failed { submitted: f64 },
}

#[derive(Debug)]
pub struct SyncCoordinator {
    user: UserIdentity,
    window: Duration,
    deadline: Option<Instant>,
    in_flight: Option<f64>,
    /// A deadline expired while a request was out.
    deferred: bool,
    online: bool,
    acked_once: bool,
}

impl SyncCoordinator {
    pub fn new(user: UserIdentity, window: Duration) -> Self {
        Self {
            user,
            window,
            deadline: None,
            in_flight: None,
            deferred: false,
            online: true,
            acked_once: false,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn in_flight(&self) -> Option<f64> {
        self.in_flight
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    /// True once any submission has been acknowledged this session; later
    /// hydration snapshots are older than that answer.
    pub fn has_acked(&self) -> bool {
        self.acked_once
    }

    /// Re-arms the single pending deadline to `now + window`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.window);
    }

    /// Makes the next [`fire`](Self::fire) eligible immediately.
    pub fn flush(&mut self, now: Instant) {
        self.deadline = Some(now);
    }

    /// Returns true when a delta is outstanding and the caller should arm.
    pub fn set_online(&mut self, online: bool, balance: &PointBalance) -> bool {
        let came_back = online && !self.online;
        self.online = online;
        came_back && !balance.buffer.is_empty()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    /// Consumes an expired deadline. Carries the whole pending delta as of now.
    pub fn fire(&mut self, balance: &PointBalance) -> Result<SyncRequest, FireSkip> {
        self.deadline = None;
        if self.in_flight.is_some() {
            self.deferred = true;
            return Err(FireSkip::InFlight);
        }
        if !self.online {
            debug!(user = %self.user, pending = balance.pending(), "offline; holding delta");
            return Err(FireSkip::Offline);
        }
        let pending = balance.pending();
        if pending <= 0.0 {
            return Err(FireSkip::Nothing);
        }
        self.in_flight = Some(pending);
        Ok(SyncRequest {
            user: self.user.clone(),
            points_to_add: pending,
        })
    }

    /// Applies the authority's answer to the in-flight request.
    ///
    /// Returns `None` if nothing was in flight. When a deadline expired during the
    /// round-trip the coordinator re-arms itself relative to `now`.
    pub fn settle(
        &mut self,
        result: Result<f64, &RemoteError>,
        balance: &mut PointBalance,
        now: Instant,
    ) -> Option<Settled> {
        let submitted = self.in_flight.take()?;
        let settled = match result {
            Ok(total) => {
                balance.reconcile(total, submitted);
                self.acked_once = true;
                info!(
                    user = %self.user,
                    submitted,
                    authority_total = total,
                    pending = balance.pending(),
                    "points synced"
                );
                Settled::Acked {
                    authority_total: total,
                    submitted,
                }
            }
            Err(err) => {
                warn!(
                    user = %self.user,
                    submitted,
                    pending = balance.pending(),
                    error = %err,
                    "points sync failed; keeping buffered delta"
                );
                Settled::Failed { submitted }
            }
        };
        if std::mem::take(&mut self.deferred) && !balance.buffer.is_empty() && self.deadline.is_none() {
            self.arm(now);
        }
        Some(settled)
    }
}
