//! The state aggregator.
//!
//! Combines the tunnel engine state, the companion link state and the
//! unlock options into one aggregate view. Upstream sources feed the
//! aggregator on whatever thread they deliver on; each feed recomputes the
//! aggregate under the internal lock, so arrival order per source is
//! preserved (there is no ordering guarantee between independent sources).

use crate::tunnel::TunnelState;
use crate::unlock::{UnlockEntry, UnlockOptions};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tracing::debug;
use veil_bus::{StateBus, StateStream};
use veil_companion::ServiceState;

/// One coherent snapshot of everything downstream consumers care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateState {
    pub tunnel: TunnelState,
    pub companion: ServiceState,
    pub unlock_required: bool,
}

struct Inputs {
    tunnel: TunnelState,
    companion: ServiceState,
    unlock: UnlockOptions,
}

/// Pure reducer over the three upstream sources. No I/O.
pub struct StateAggregator {
    inputs: Mutex<Inputs>,
    aggregate_bus: StateBus<AggregateState>,
    keys_bus: StateBus<BTreeSet<String>>,
}

impl StateAggregator {
    pub fn new() -> Self {
        Self {
            inputs: Mutex::new(Inputs {
                tunnel: TunnelState::Unknown,
                companion: ServiceState::Idle,
                unlock: UnlockOptions::new(),
            }),
            aggregate_bus: StateBus::new(),
            keys_bus: StateBus::new(),
        }
    }

    /// Feed a tunnel engine state transition.
    pub fn on_tunnel_state(&self, state: TunnelState) {
        let mut inputs = self.inputs.lock().unwrap();
        inputs.tunnel = state;
        self.publish_locked(&inputs);
    }

    /// Feed a companion link state transition.
    pub fn on_companion_state(&self, state: ServiceState) {
        let mut inputs = self.inputs.lock().unwrap();
        inputs.companion = state;
        self.publish_locked(&inputs);
    }

    /// Atomically replace the entitlement checker mapping. Always emits a
    /// keys change notification, once per replacement; subscribers that
    /// want distinct values de-duplicate on their side.
    pub fn set_entitlement_checkers(&self, entries: HashMap<String, UnlockEntry>) {
        let mut inputs = self.inputs.lock().unwrap();
        debug!("replacing {} entitlement checkers", entries.len());
        inputs.unlock.set_entries(entries);
        self.keys_bus.publish_always(inputs.unlock.active_keys());
        self.publish_locked(&inputs);
    }

    /// Whether the unlock dialog must be shown; see
    /// [`UnlockOptions::unlock_required`].
    pub fn unlock_required(&self) -> bool {
        self.inputs.lock().unwrap().unlock.unlock_required()
    }

    /// Snapshot of the current unlock option keys.
    pub fn active_unlock_option_keys(&self) -> BTreeSet<String> {
        self.inputs.lock().unwrap().unlock.active_keys()
    }

    /// Current unlock entries, ordered by display priority.
    pub fn unlock_entries_by_priority(&self) -> Vec<(String, UnlockEntry)> {
        self.inputs.lock().unwrap().unlock.entries_by_priority()
    }

    pub fn has_displayable_unlock_entries(&self) -> bool {
        self.inputs.lock().unwrap().unlock.has_displayable_entries()
    }

    /// The aggregate stream. Consecutive identical aggregates never emit
    /// twice in a row.
    pub fn aggregate_stream(&self) -> StateStream<AggregateState> {
        self.aggregate_bus.subscribe()
    }

    /// Stream of unlock option key sets, notified on every replacement.
    pub fn unlock_keys_stream(&self) -> StateStream<BTreeSet<String>> {
        self.keys_bus.subscribe()
    }

    /// The current aggregate.
    pub fn snapshot(&self) -> AggregateState {
        let inputs = self.inputs.lock().unwrap();
        Self::reduce(&inputs)
    }

    fn reduce(inputs: &Inputs) -> AggregateState {
        AggregateState {
            tunnel: inputs.tunnel.clone(),
            companion: inputs.companion.clone(),
            unlock_required: inputs.unlock.unlock_required(),
        }
    }

    fn publish_locked(&self, inputs: &Inputs) {
        self.aggregate_bus.publish(Self::reduce(inputs));
    }
}

impl Default for StateAggregator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{ConnectionData, NetworkState};
    use crate::unlock::{Checker, UnlockKind};
    use std::sync::Arc;
    use veil_companion::StateReport;

    fn running_state() -> TunnelState {
        TunnelState::running(ConnectionData {
            network_state: NetworkState::Connected,
            region: "CA".to_string(),
            local_proxy_port: 1080,
            ..ConnectionData::default()
        })
    }

    fn checker(result: bool) -> Checker {
        Arc::new(move || result)
    }

    fn subscription_entry(satisfied: bool) -> (String, UnlockEntry) {
        let kind = UnlockKind::Subscription;
        (
            kind.key(),
            UnlockEntry::with_checker(kind.clone(), true, kind.default_priority(), checker(satisfied)),
        )
    }

    #[test]
    fn test_identical_upstream_values_emit_once() {
        let aggregator = StateAggregator::new();
        let mut stream = aggregator.aggregate_stream();

        aggregator.on_tunnel_state(running_state());
        aggregator.on_tunnel_state(running_state());

        let first = stream.try_next().unwrap();
        assert_eq!(first.tunnel, running_state());
        assert!(stream.try_next().is_none(), "duplicate aggregate emitted");
    }

    #[test]
    fn test_per_source_arrival_order_is_preserved() {
        let aggregator = StateAggregator::new();
        let mut stream = aggregator.aggregate_stream();

        aggregator.on_tunnel_state(TunnelState::stopped());
        aggregator.on_companion_state(ServiceState::Connecting);
        aggregator.on_companion_state(ServiceState::Connected);

        assert_eq!(stream.try_next().unwrap().tunnel, TunnelState::Stopped);
        assert_eq!(
            stream.try_next().unwrap().companion,
            ServiceState::Connecting
        );
        assert_eq!(
            stream.try_next().unwrap().companion,
            ServiceState::Connected
        );
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_unlock_required_reflects_checkers() {
        let aggregator = StateAggregator::new();
        assert!(!aggregator.unlock_required(), "empty mapping requires no unlock");

        aggregator.set_entitlement_checkers(HashMap::from([subscription_entry(true)]));
        assert!(!aggregator.unlock_required());

        aggregator.set_entitlement_checkers(HashMap::from([subscription_entry(false)]));
        assert!(aggregator.unlock_required());
    }

    #[test]
    fn test_checker_replacement_always_notifies_keys() {
        let aggregator = StateAggregator::new();
        let mut keys = aggregator.unlock_keys_stream();

        aggregator.set_entitlement_checkers(HashMap::from([subscription_entry(false)]));
        aggregator.set_entitlement_checkers(HashMap::from([subscription_entry(false)]));

        // Same key set twice, but each replacement notifies.
        assert!(keys.try_next().is_some());
        assert!(keys.try_next().is_some());
        assert!(keys.try_next().is_none());
        assert_eq!(
            aggregator.active_unlock_option_keys(),
            BTreeSet::from(["Subscription".to_string()])
        );
    }

    #[test]
    fn test_checker_replacement_updates_aggregate() {
        let aggregator = StateAggregator::new();
        aggregator.on_tunnel_state(running_state());
        let mut stream = aggregator.aggregate_stream();
        assert!(!stream.try_next().unwrap().unlock_required);

        aggregator.set_entitlement_checkers(HashMap::from([subscription_entry(false)]));
        assert!(stream.try_next().unwrap().unlock_required);

        aggregator.set_entitlement_checkers(HashMap::from([subscription_entry(true)]));
        assert!(!stream.try_next().unwrap().unlock_required);
    }

    #[test]
    fn test_companion_report_flows_into_aggregate() {
        let aggregator = StateAggregator::new();
        aggregator.on_companion_state(ServiceState::Report(StateReport {
            app_version: 12,
            running: Some(true),
        }));

        let snapshot = aggregator.snapshot();
        assert!(snapshot.companion.is_companion_running());
        assert!(snapshot.tunnel.is_unknown());
    }

    #[test]
    fn test_late_subscriber_sees_latest_aggregate() {
        let aggregator = StateAggregator::new();
        aggregator.on_tunnel_state(TunnelState::stopped());
        aggregator.on_tunnel_state(running_state());

        let mut stream = aggregator.aggregate_stream();
        assert_eq!(stream.try_next().unwrap().tunnel, running_state());
        assert!(stream.try_next().is_none());
    }
}
