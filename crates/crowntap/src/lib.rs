//! Umbrella crate for crowntap.
//!
//! Re-exports the accrual engine and the wire protocol so embedders (a mini-app shell,
//! a bot, the console client) can depend on a single crate name (`crowntap`).

pub use crowntap_engine as engine;
pub use crowntap_protocol as protocol;
