//! Tunnel State Aggregation
//!
//! A pure reducer layer that combines the tunnel engine's connection state,
//! the companion link's service state and the current entitlement checkers
//! into one coherent view for downstream consumers. No I/O happens here;
//! upstream sources feed the aggregator and subscribers read a
//! de-duplicated stream that never emits the same aggregate twice in a row.

mod aggregator;
mod tunnel;
mod unlock;

pub use aggregator::{AggregateState, StateAggregator};
pub use tunnel::{ConnectionData, NetworkState, TunnelState};
pub use unlock::{
    APP_INSTALL_PREFIX, Checker, DEFAULT_APP_INSTALL_PRIORITY, DEFAULT_COMPANION_PRIORITY,
    DEFAULT_SUBSCRIPTION_PRIORITY, ENTRY_COMPANION, ENTRY_SUBSCRIPTION, UnlockEntry, UnlockKind,
    UnlockOptions, UnlockStoreError,
};
