//! The macrostep driver.
//!
//! An [`Executor`] owns one running machine: the shared model, the
//! instance state, and the pluggable collaborators. It is single-threaded
//! by construction; other threads only ever touch the pending-event queue
//! through an [`EventSender`].

use crate::env::{
    ErrorReporter, Evaluator, EventSender, InvokerFactory, Listener, TracingReporter,
};
use crate::error::{EngineError, ReportKind};
use crate::event::TriggerEvent;
use crate::expr::BuiltinEvaluator;
use crate::instance::{Instance, Snapshot};
use crate::model::{Model, NodeId};
use crate::order::exit_order;
use crate::semantics;
use crate::step::Step;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Interprets one machine against a shared model.
pub struct Executor {
    model: Arc<Model>,
    instance: Instance,
    evaluator: Box<dyn Evaluator>,
    reporter: Box<dyn ErrorReporter>,
    listeners: Vec<Box<dyn Listener>>,
    factory: Option<Box<dyn InvokerFactory>>,
    sender: EventSender,
    // internal events awaiting the next microstep
    current_events: Vec<TriggerEvent>,
}

impl Executor {
    /// Creates an executor with the built-in evaluator and the tracing
    /// reporter. The machine is idle until [`go`](Self::go) is called.
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            instance: Instance::new(),
            evaluator: Box::new(BuiltinEvaluator),
            reporter: Box::new(TracingReporter),
            listeners: Vec::new(),
            factory: None,
            sender: EventSender::new(),
            current_events: Vec::new(),
        }
    }

    pub fn with_evaluator(mut self, evaluator: impl Evaluator + 'static) -> Self {
        self.evaluator = Box::new(evaluator);
        self
    }

    pub fn with_reporter(mut self, reporter: impl ErrorReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn with_invoker_factory(mut self, factory: impl InvokerFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn add_listener(&mut self, listener: impl Listener + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    /// Seeds a variable in the root scope, visible from every state.
    pub fn set_var(&mut self, name: impl Into<String>, value: Value) {
        self.instance.scopes.set_local(None, name, value);
    }

    pub fn get_var(&self, name: &str) -> Option<&Value> {
        self.instance.scopes.get(&self.model, None, name)
    }

    /// Handle for feeding events from other threads (invokers, timers).
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Active leaf state ids, in document order.
    pub fn configuration(&self) -> Vec<&str> {
        let mut leaves: Vec<NodeId> = self.instance.configuration.iter().copied().collect();
        leaves.sort_by_key(|n| self.model.node(*n).order);
        leaves.iter().map(|n| self.model.id_of(*n)).collect()
    }

    /// True iff the state is active, directly or as an ancestor of an
    /// active leaf.
    pub fn is_active(&self, id: &str) -> bool {
        let Some(node) = self.model.node_by_id(id) else {
            return false;
        };
        self.instance.configuration.contains(&node)
            || self
                .instance
                .configuration
                .iter()
                .any(|leaf| self.model.is_descendant(*leaf, node))
    }

    /// True iff the state's completion event has fired.
    pub fn is_done(&self, id: &str) -> bool {
        self.model
            .node_by_id(id)
            .map(|n| self.instance.is_done(n))
            .unwrap_or(false)
    }

    /// (Re)starts the machine: enters the initial configuration, runs its
    /// entry actions, starts invokers, and runs the first macrostep so
    /// eventless transitions settle.
    ///
    /// Invokers left over from a previous run are cancelled. Root-scope
    /// variables survive a restart; everything else resets.
    pub fn go(&mut self) -> Result<(), EngineError> {
        for (n, mut invoker) in self.instance.invokers.drain() {
            if let Err(e) = invoker.cancel() {
                self.reporter.report(
                    ReportKind::CancelFailed,
                    &e.reason,
                    Some(self.model.id_of(n)),
                );
            }
        }
        self.instance.configuration.clear();
        self.instance.histories.clear();
        self.instance.done.clear();
        self.current_events.clear();

        let targets =
            semantics::determine_initial_states(&self.model, &self.instance, self.reporter.as_ref())?;
        let mut step = Step::new(Vec::new(), HashSet::new(), Vec::new());
        step.after = targets.clone();
        let mut entry_list: Vec<NodeId> = self
            .model
            .ancestor_closure(targets.iter().copied(), None)
            .into_iter()
            .collect();
        entry_list.sort_by(|a, b| exit_order(&self.model, *a, *b));
        entry_list.reverse();
        step.entry_list = entry_list;

        semantics::execute_actions(
            &self.model,
            &mut self.instance,
            self.evaluator.as_ref(),
            self.reporter.as_ref(),
            &mut self.listeners,
            &mut step,
        );
        self.instance.configuration = targets;
        self.log_configuration();
        self.notify_events(&step.internal_events);

        self.current_events = step.internal_events;
        semantics::initiate_invokes(
            &self.model,
            &mut self.instance,
            self.evaluator.as_ref(),
            self.reporter.as_ref(),
            self.factory.as_deref(),
            &self.sender,
            &mut self.current_events,
        );
        self.macrostep(Vec::new())
    }

    /// Delivers one external event and runs the macrostep to quiescence.
    pub fn trigger_event(&mut self, event: TriggerEvent) -> Result<(), EngineError> {
        self.trigger_events(vec![event])
    }

    /// Delivers a batch of external events and runs the macrostep to
    /// quiescence. The whole batch is visible to the first microstep only.
    pub fn trigger_events(&mut self, events: Vec<TriggerEvent>) -> Result<(), EngineError> {
        semantics::process_invokes(&self.model, &mut self.instance, &events)?;
        self.macrostep(events)
    }

    /// Drains the pending-event queue and delivers the snapshot as one
    /// batch. Events queued during processing wait for the next call.
    pub fn process_pending(&mut self) -> Result<(), EngineError> {
        let pending = self.sender.drain();
        if pending.is_empty() {
            return Ok(());
        }
        self.trigger_events(pending)
    }

    /// Runs microsteps until one fires no transition.
    fn macrostep(&mut self, mut external: Vec<TriggerEvent>) -> Result<(), EngineError> {
        loop {
            let mut step = Step::new(
                std::mem::take(&mut external),
                self.instance.configuration.clone(),
                std::mem::take(&mut self.current_events),
            );
            let candidates = semantics::enumerate_reachable_transitions(&self.model, &step);
            semantics::filter_transitions(
                &self.model,
                &mut self.instance,
                self.evaluator.as_ref(),
                self.reporter.as_ref(),
                &mut step,
                candidates,
            );
            if step.transitions.is_empty() {
                // finalize blocks may queue events even when nothing fires;
                // those get one more microstep before the fixed point
                if step.internal_events.is_empty() {
                    return Ok(());
                }
                self.notify_events(&step.internal_events);
                self.current_events = step.internal_events;
                continue;
            }
            semantics::follow_transitions(
                &self.model,
                &mut self.instance,
                self.reporter.as_ref(),
                &mut step,
            )?;
            semantics::execute_actions(
                &self.model,
                &mut self.instance,
                self.evaluator.as_ref(),
                self.reporter.as_ref(),
                &mut self.listeners,
                &mut step,
            );
            semantics::update_history_states(&self.model, &mut self.instance, &step);
            self.instance.configuration = step.after;
            self.log_configuration();
            self.notify_events(&step.internal_events);

            self.current_events = step.internal_events;
            semantics::initiate_invokes(
                &self.model,
                &mut self.instance,
                self.evaluator.as_ref(),
                self.reporter.as_ref(),
                self.factory.as_deref(),
                &self.sender,
                &mut self.current_events,
            );
            if self.current_events.is_empty() {
                return Ok(());
            }
        }
    }

    /// Captures the instance state. Running invokers are not part of the
    /// snapshot; [`restore`](Self::restore) re-invokes for active states.
    pub fn snapshot(&self) -> Snapshot {
        self.instance.snapshot(&self.model)
    }

    /// Replaces the instance state with a snapshot and restarts invokers
    /// for active states that declare one. Snapshots whose configuration
    /// violates the tree invariants are rejected without touching the
    /// running instance.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<(), EngineError> {
        let instance = Instance::restore(&self.model, snapshot)?;
        if let Some(reason) = semantics::config_violation(&self.model, &instance.configuration) {
            self.reporter.report(ReportKind::IllegalConfig, &reason, None);
            return Err(EngineError::IllegalConfiguration { reason });
        }
        self.instance = instance;
        self.current_events.clear();
        semantics::initiate_invokes(
            &self.model,
            &mut self.instance,
            self.evaluator.as_ref(),
            self.reporter.as_ref(),
            self.factory.as_deref(),
            &self.sender,
            &mut self.current_events,
        );
        Ok(())
    }

    fn notify_events(&mut self, events: &[TriggerEvent]) {
        for event in events {
            for listener in self.listeners.iter_mut() {
                listener.on_event(event);
            }
        }
    }

    fn log_configuration(&self) {
        tracing::debug!(configuration = ?self.configuration(), "configuration changed");
    }
}
