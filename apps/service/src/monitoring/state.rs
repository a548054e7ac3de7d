//! Health state transitions driven by probe outcomes.

use super::types::{HealthLevel, HealthState, Outcome};

/// A state change produced by one dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: HealthState,
    pub to: HealthState,
    /// Whether the change is reported as an event and marks the node changed.
    /// A first success out of `unknown` is applied silently.
    pub announce: bool,
}

/// Target state for `outcome`, or `None` when the state stays as it is.
fn next_state(current: HealthState, outcome: Outcome, level: HealthLevel) -> Option<HealthState> {
    match (outcome, current) {
        (Outcome::Pass, HealthState::Unknown) => Some(HealthState::Normal),
        (Outcome::Pass, HealthState::Failing(_)) => Some(HealthState::Repaired),
        (Outcome::Pass, HealthState::Normal | HealthState::Repaired) => None,
        (Outcome::Fail, current) if current == HealthState::Failing(level) => None,
        (Outcome::Fail, _) => Some(HealthState::Failing(level)),
        (Outcome::Indeterminate, HealthState::Unknown) => None,
        (Outcome::Indeterminate, _) => Some(HealthState::Unknown),
    }
}

/// Apply `outcome` to `state` in place.
pub fn apply(state: &mut HealthState, outcome: Outcome, level: HealthLevel) -> Option<Transition> {
    let from = *state;
    let to = next_state(from, outcome, level)?;
    *state = to;
    Some(Transition { from, to, announce: !(from == HealthState::Unknown && to == HealthState::Normal) })
}
