//! Client-side points/energy accrual and reconciliation engine.
//!
//! A tap goes through the [`Dispatcher`](dispatcher::Dispatcher) (bounds, energy,
//! multiplier) into the accrual buffer, and the [`SyncCoordinator`](sync::SyncCoordinator)
//! hands buffered points to the remote authority once taps go quiet. The user always
//! sees `confirmed + pending`; the authority's answer replaces `confirmed`.
//! [`Session`](session::Session) runs all of it on one actor task.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod balance;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod energy;
pub mod identity;
pub mod multiplier;
pub mod remote;
pub mod rewards;
pub mod session;
pub mod sync;

#[cfg(test)]
mod tests;

pub use balance::{AccrualBuffer, PointBalance};
pub use cache::{BalanceCache, SyncLogEntry, SyncOutcome};
pub use config::{Config, PlatformUser};
pub use dispatcher::{Dispatcher, Surface, TapEvent, TapOutcome, TapRejection};
pub use energy::EnergyStore;
pub use identity::{IdentityResolver, Registration};
pub use multiplier::TapMultiplier;
pub use remote::{HttpAuthority, RemoteAuthority, RemoteError};
pub use rewards::{RewardBoard, RewardError};
pub use session::{Session, SessionError, SessionHandle, Snapshot};
pub use sync::{SyncCoordinator, SyncRequest};

pub use crowntap_protocol as protocol;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(i64::MAX)
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
