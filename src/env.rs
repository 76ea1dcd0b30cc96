//! Pluggable collaborators of the executor.
//!
//! The engine core is deliberately thin: expression evaluation, error
//! reporting, observation, and invoked child processes all sit behind
//! traits so hosts can swap them out per machine.

use crate::error::{ExprError, InvokerError, ReportKind};
use crate::event::TriggerEvent;
use crate::instance::Scope;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Expression interpreter used for guards, assignments, and invoke params.
///
/// Implementations read variables through the [`Scope`] chain and must not
/// mutate engine state; assignment binding is handled by the core.
pub trait Evaluator {
    /// Evaluates an expression to a value.
    fn eval(&self, scope: &Scope<'_>, expr: &str) -> Result<Value, ExprError>;

    /// Evaluates an expression to a boolean, using the language's
    /// truthiness rules.
    fn eval_cond(&self, scope: &Scope<'_>, expr: &str) -> Result<bool, ExprError>;
}

/// Sink for recoverable conditions.
///
/// The engine reports and continues; only genuinely unrecoverable
/// situations become [`EngineError`](crate::error::EngineError)s.
pub trait ErrorReporter {
    fn report(&self, kind: ReportKind, message: &str, node: Option<&str>);
}

/// Default reporter, logging through `tracing` at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, kind: ReportKind, message: &str, node: Option<&str>) {
        tracing::warn!(
            code = kind.as_str(),
            node = node.unwrap_or(""),
            "{message}"
        );
    }
}

/// Observer notified as the machine moves.
///
/// All methods default to no-ops so implementations only override what
/// they care about.
pub trait Listener {
    fn on_entry(&mut self, _id: &str) {}
    fn on_exit(&mut self, _id: &str) {}
    fn on_transition(&mut self, _source: &str, _target: Option<&str>, _event: Option<&str>) {}
    /// Called for every internally generated event, in generation order.
    fn on_event(&mut self, _event: &TriggerEvent) {}
}

/// A running child process started by an `invoke` declaration.
///
/// Invokers run on the host's own threads; they never call back into the
/// executor directly and instead push events through the [`EventSender`]
/// their factory received.
pub trait Invoker {
    /// Starts the child process.
    fn invoke(&mut self, source: &str, params: HashMap<String, Value>) -> Result<(), InvokerError>;

    /// Forwards an external event from the parent machine.
    fn parent_event(&mut self, event: &TriggerEvent) -> Result<(), InvokerError>;

    /// Cancels the child process. Called when the invoking state exits.
    fn cancel(&mut self) -> Result<(), InvokerError>;
}

/// Creates invokers by type name.
pub trait InvokerFactory {
    fn new_invoker(
        &self,
        kind: &str,
        parent_id: &str,
        sender: EventSender,
    ) -> Result<Box<dyn Invoker>, InvokerError>;
}

/// Cloneable handle onto the executor's pending-event queue.
///
/// This is the only channel by which invokers (or any other thread) talk
/// back to the machine. Queued events sit untouched until the host calls
/// [`Executor::process_pending`](crate::executor::Executor::process_pending).
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    queue: Arc<Mutex<VecDeque<TriggerEvent>>>,
}

impl EventSender {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enqueues an event for the next pending-queue drain.
    pub fn send(&self, event: TriggerEvent) {
        self.queue.lock().push_back(event);
    }

    /// Takes a snapshot of the queued events, leaving the queue empty.
    /// Events sent while the snapshot is being processed wait for the
    /// next drain.
    pub(crate) fn drain(&self) -> Vec<TriggerEvent> {
        let mut queue = self.queue.lock();
        std::mem::take(&mut *queue).into()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_drain_snapshot() {
        let sender = EventSender::new();
        sender.send(TriggerEvent::signal("a"));
        sender.send(TriggerEvent::signal("b"));
        assert!(!sender.is_empty());

        let drained = sender.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].name, "a");
        assert!(sender.is_empty());

        // events sent after the drain land in a fresh queue
        sender.send(TriggerEvent::signal("c"));
        let drained = sender.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].name, "c");
    }

    #[test]
    fn test_sender_clones_share_queue() {
        let sender = EventSender::new();
        let clone = sender.clone();
        clone.send(TriggerEvent::signal("x"));
        assert_eq!(sender.drain().len(), 1);
    }
}
