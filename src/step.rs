//! Scratchpad for one microstep.

use crate::event::TriggerEvent;
use crate::model::{NodeId, TransitionId};
use std::collections::HashSet;

/// Working state threaded through the phases of a single microstep.
///
/// The phases fill it in order: candidate transitions, then the exit and
/// entry lists and the resulting configuration, then the internal events
/// produced by executing actions. Events in `internal_events` become the
/// `before_events` of the next microstep of the same macrostep.
#[derive(Debug, Default)]
pub struct Step {
    /// External events driving this microstep. Empty after the first
    /// microstep of a macrostep.
    pub external_events: Vec<TriggerEvent>,
    /// Leaf configuration before the step.
    pub before: HashSet<NodeId>,
    /// Internal events carried over from the previous microstep.
    pub before_events: Vec<TriggerEvent>,
    /// Leaf configuration after the step.
    pub after: HashSet<NodeId>,
    /// Internal events produced while executing this step.
    pub internal_events: Vec<TriggerEvent>,
    /// Transitions taken, in document order.
    pub transitions: Vec<TransitionId>,
    /// States to enter, outermost first.
    pub entry_list: Vec<NodeId>,
    /// States to exit, innermost first.
    pub exit_list: Vec<NodeId>,
}

impl Step {
    pub fn new(
        external_events: Vec<TriggerEvent>,
        before: HashSet<NodeId>,
        before_events: Vec<TriggerEvent>,
    ) -> Self {
        Self {
            external_events,
            before,
            before_events,
            ..Self::default()
        }
    }

    /// All events visible to transition matching in this step.
    pub fn visible_events(&self) -> impl Iterator<Item = &TriggerEvent> {
        self.before_events.iter().chain(self.external_events.iter())
    }
}
