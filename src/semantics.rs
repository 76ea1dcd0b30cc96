//! The microstep algorithm.
//!
//! Each phase of a microstep is a free function over the shared model, the
//! mutable instance, and the [`Step`] scratchpad:
//!
//! 1. enumerate transitions reachable from the active configuration,
//! 2. filter them by event match, guard, and conflict resolution,
//! 3. follow the survivors to compute exit/entry lists and the next
//!    configuration,
//! 4. execute exit, transition, and entry actions,
//! 5. capture history for exited states,
//! 6. reconcile invokers against the new configuration.
//!
//! The [`Executor`](crate::executor::Executor) drives these in a loop
//! until no transition fires, which closes one macrostep.

use crate::env::{ErrorReporter, Evaluator, EventSender, InvokerFactory, Listener};
use crate::error::{EngineError, ReportKind};
use crate::event::{event_match, TriggerEvent};
use crate::instance::{Instance, Scope};
use crate::model::{Action, Kind, Model, NodeId, Transition, TransitionId};
use crate::order::exit_order;
use crate::step::Step;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Expands the document's initial targets into the starting configuration.
pub(crate) fn determine_initial_states(
    model: &Model,
    instance: &Instance,
    reporter: &dyn ErrorReporter,
) -> Result<HashSet<NodeId>, EngineError> {
    if model.initial_targets().is_empty() {
        reporter.report(
            ReportKind::NoInitial,
            "document declares no initial target",
            None,
        );
        return Err(EngineError::NoInitialTarget {
            id: "<document>".to_string(),
        });
    }
    let seed: HashSet<NodeId> = model.initial_targets().iter().copied().collect();
    let targets = determine_target_states(model, instance, reporter, &seed)?;
    if let Some(reason) = config_violation(model, &targets) {
        reporter.report(ReportKind::IllegalInitial, &reason, None);
        return Err(EngineError::IllegalConfiguration { reason });
    }
    Ok(targets)
}

/// Expands a seed set down to runnable leaf states.
///
/// Composites descend through their initial targets, orthogonal states
/// through their parallel child, parallels fan out to every region, and
/// history pseudo-states replay their capture (or their default targets
/// when empty).
pub(crate) fn determine_target_states(
    model: &Model,
    instance: &Instance,
    reporter: &dyn ErrorReporter,
    seed: &HashSet<NodeId>,
) -> Result<HashSet<NodeId>, EngineError> {
    let mut work: Vec<NodeId> = seed.iter().copied().collect();
    work.sort_by_key(|n| model.node(*n).order);
    let mut targets = HashSet::new();
    while let Some(node_id) = work.pop() {
        let node = model.node(node_id);
        match node.kind {
            Kind::Final => {
                targets.insert(node_id);
            }
            Kind::State => {
                if model.is_simple(node_id) {
                    targets.insert(node_id);
                } else if let Some(parallel) = model.parallel_child(node_id) {
                    work.push(parallel);
                } else if !node.initial.is_empty() {
                    work.extend(node.initial.iter().copied());
                } else {
                    let reason = format!("composite '{}' has no initial target", node.id);
                    reporter.report(ReportKind::NoInitial, &reason, Some(&node.id));
                    return Err(EngineError::NoInitialTarget {
                        id: node.id.clone(),
                    });
                }
            }
            Kind::Parallel => {
                work.extend(enterable_children(model, node_id));
            }
            Kind::History { .. } => {
                let saved = instance.histories.get(&node_id).filter(|s| !s.is_empty());
                if let Some(saved) = saved {
                    work.extend(saved.iter().copied());
                } else if !node.initial.is_empty() {
                    work.extend(node.initial.iter().copied());
                } else {
                    let reason = format!("history '{}' is empty and has no default", node.id);
                    reporter.report(ReportKind::NoInitial, &reason, Some(&node.id));
                    return Err(EngineError::NoInitialTarget {
                        id: node.id.clone(),
                    });
                }
            }
        }
    }
    Ok(targets)
}

/// Transitions owned by the active configuration and its ancestors, in
/// document order.
pub(crate) fn enumerate_reachable_transitions(model: &Model, step: &Step) -> Vec<TransitionId> {
    let closure = model.ancestor_closure(step.before.iter().copied(), None);
    let mut candidates: Vec<TransitionId> = closure
        .iter()
        .flat_map(|n| model.node(*n).transitions.iter().copied())
        .collect();
    candidates.sort_by_key(|t| model.transition(*t).order);
    candidates
}

/// Narrows the candidates down to the transitions actually taken and
/// stores them on the step.
///
/// Runs invoke finalize blocks first (their assignments must be visible
/// to guards), then applies event matching and guards, then resolves
/// conflicts: of two transitions whose exit sets overlap, the one with
/// the deeper source wins, and at equal footing the one declared first.
pub(crate) fn filter_transitions(
    model: &Model,
    instance: &mut Instance,
    evaluator: &dyn Evaluator,
    reporter: &dyn ErrorReporter,
    step: &mut Step,
    candidates: Vec<TransitionId>,
) {
    process_finalize(model, instance, evaluator, reporter, step);

    let mut enabled: Vec<TransitionId> = Vec::new();
    for tid in candidates {
        let t = model.transition(tid);
        if !event_match(t.event.as_deref(), step.visible_events()) {
            continue;
        }
        if let Some(cond) = &t.cond {
            let passed = {
                let scope = Scope::new(model, &instance.scopes, Some(t.source));
                evaluator.eval_cond(&scope, cond)
            };
            match passed {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    // a failing guard disables the transition
                    reporter.report(
                        ReportKind::ExpressionError,
                        &format!("guard '{cond}': {e}"),
                        Some(model.id_of(t.source)),
                    );
                    continue;
                }
            }
        }
        enabled.push(tid);
    }

    let exit_sets: Vec<HashSet<NodeId>> = enabled
        .iter()
        .map(|tid| states_exited(model, model.transition(*tid), &step.before))
        .collect();
    let mut removed = vec![false; enabled.len()];
    for i in 0..enabled.len() {
        if removed[i] {
            continue;
        }
        for j in (i + 1)..enabled.len() {
            if removed[j] || exit_sets[i].is_disjoint(&exit_sets[j]) {
                continue;
            }
            let source_i = model.transition(enabled[i]).source;
            let source_j = model.transition(enabled[j]).source;
            if model.is_descendant(source_j, source_i) {
                // the inner state overrides its ancestor
                removed[i] = true;
                break;
            }
            // equal footing: the earlier declared transition wins
            removed[j] = true;
        }
    }
    step.transitions = enabled
        .into_iter()
        .enumerate()
        .filter(|(i, _)| !removed[*i])
        .map(|(_, tid)| tid)
        .collect();
}

fn process_finalize(
    model: &Model,
    instance: &mut Instance,
    evaluator: &dyn Evaluator,
    reporter: &dyn ErrorReporter,
    step: &mut Step,
) {
    let mut invoking: Vec<NodeId> = instance.invokers.keys().copied().collect();
    invoking.sort_by_key(|n| model.node(*n).order);
    for n in invoking {
        let node = model.node(n);
        let invoke = match &node.invoke {
            Some(i) if !i.finalize.is_empty() => i,
            _ => continue,
        };
        let prefix = format!("{}.invoke.", node.id);
        if step.visible_events().any(|e| e.name.starts_with(&prefix)) {
            run_actions(
                model,
                instance,
                evaluator,
                reporter,
                Some(n),
                &invoke.finalize,
                &mut step.internal_events,
            );
        }
    }
}

/// Computes exit list, entry list, and the next configuration from the
/// taken transitions.
pub(crate) fn follow_transitions(
    model: &Model,
    instance: &mut Instance,
    reporter: &dyn ErrorReporter,
    step: &mut Step,
) -> Result<(), EngineError> {
    let mut exited: HashSet<NodeId> = HashSet::new();
    for tid in &step.transitions {
        exited.extend(states_exited(
            model,
            model.transition(*tid),
            &step.before,
        ));
    }
    let residual: HashSet<NodeId> = step.before.difference(&exited).copied().collect();
    let seed = seed_target_set(model, &residual, &step.transitions);
    let target_set = determine_target_states(model, instance, reporter, &seed)?;
    let after: HashSet<NodeId> = target_set.union(&residual).copied().collect();
    if let Some(reason) = config_violation(model, &after) {
        reporter.report(ReportKind::IllegalConfig, &reason, None);
        return Err(EngineError::IllegalConfiguration { reason });
    }

    let residual_closure = model.ancestor_closure(residual.iter().copied(), None);
    let mut entered: HashSet<NodeId> = model
        .ancestor_closure(target_set.iter().copied(), None)
        .difference(&residual_closure)
        .copied()
        .collect();
    for tid in &step.transitions {
        for path in &model.transition(*tid).paths {
            for n in &path.down_seg {
                if !residual_closure.contains(n) {
                    entered.insert(*n);
                }
            }
        }
    }
    // history targets resolve to their capture; the pseudo-state itself is
    // never entered
    entered.retain(|n| !matches!(model.node(*n).kind, Kind::History { .. }));

    let mut exit_list: Vec<NodeId> = exited.into_iter().collect();
    exit_list.sort_by(|a, b| exit_order(model, *a, *b));
    let mut entry_list: Vec<NodeId> = entered.into_iter().collect();
    entry_list.sort_by(|a, b| exit_order(model, *a, *b));
    entry_list.reverse();

    for n in &entry_list {
        instance.done.remove(n);
    }

    step.after = after;
    step.exit_list = exit_list;
    step.entry_list = entry_list;
    Ok(())
}

/// The states a transition exits, given the active leaf configuration:
/// the path from its source up to its scope, the active subtree of the
/// source, and for region-crossing transitions the active subtrees of
/// sibling regions.
pub(crate) fn states_exited(
    model: &Model,
    t: &Transition,
    current: &HashSet<NodeId>,
) -> HashSet<NodeId> {
    let mut exited = HashSet::new();
    if t.paths.is_empty() {
        // targetless transitions execute actions without exiting anything
        return exited;
    }
    for path in &t.paths {
        exited.extend(path.up_seg.iter().copied());
        if path.cross_region {
            for region in path.up_seg.iter().filter(|n| model.is_region(**n)) {
                let Some(parallel) = model.node(*region).parent else {
                    continue;
                };
                for sibling in enterable_children(model, parallel) {
                    if sibling != *region {
                        exited.insert(sibling);
                        collect_active_descendants(model, current, sibling, &mut exited);
                    }
                }
            }
        }
    }
    collect_active_descendants(model, current, t.source, &mut exited);
    exited
}

fn collect_active_descendants(
    model: &Model,
    current: &HashSet<NodeId>,
    root: NodeId,
    out: &mut HashSet<NodeId>,
) {
    for leaf in current {
        if !model.is_descendant(*leaf, root) {
            continue;
        }
        out.insert(*leaf);
        let mut parent = model.node(*leaf).parent;
        while let Some(n) = parent {
            if n == root || !out.insert(n) {
                break;
            }
            parent = model.node(n).parent;
        }
    }
}

/// Explicit targets of the taken transitions, widened with the sibling
/// regions of any parallel being entered from outside that no target or
/// residual state already covers.
fn seed_target_set(
    model: &Model,
    residual: &HashSet<NodeId>,
    transitions: &[TransitionId],
) -> HashSet<NodeId> {
    let mut seed: HashSet<NodeId> = HashSet::new();
    for tid in transitions {
        seed.extend(model.transition(*tid).targets.iter().copied());
    }
    let covered = model.ancestor_closure(residual.iter().chain(seed.iter()).copied(), None);
    let mut extra = Vec::new();
    for tid in transitions {
        for path in &model.transition(*tid).paths {
            if !path.cross_region {
                continue;
            }
            for region in path.down_seg.iter().filter(|n| model.is_region(**n)) {
                let Some(parallel) = model.node(*region).parent else {
                    continue;
                };
                for sibling in enterable_children(model, parallel) {
                    if sibling != *region && !covered.contains(&sibling) {
                        extra.push(sibling);
                    }
                }
            }
        }
    }
    seed.extend(extra);
    seed
}

fn enterable_children(model: &Model, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
    model
        .node(node)
        .children
        .iter()
        .copied()
        .filter(|c| !matches!(model.node(*c).kind, Kind::History { .. }))
}

/// Checks the AND/OR invariants of a leaf configuration. Returns a
/// human-readable reason on violation.
pub(crate) fn config_violation(model: &Model, leaves: &HashSet<NodeId>) -> Option<String> {
    if leaves.is_empty() {
        return Some("configuration is empty".to_string());
    }
    let closure = model.ancestor_closure(leaves.iter().copied(), None);
    let mut active_children: HashMap<Option<NodeId>, Vec<NodeId>> = HashMap::new();
    for n in &closure {
        active_children
            .entry(model.node(*n).parent)
            .or_default()
            .push(*n);
    }
    if active_children.get(&None).map_or(0, Vec::len) > 1 {
        return Some("more than one top-level state is active".to_string());
    }
    for (parent, active) in &active_children {
        let Some(parent) = parent else { continue };
        let parent_node = model.node(*parent);
        match parent_node.kind {
            Kind::Parallel => {
                let regions = enterable_children(model, *parent).count();
                if active.len() != regions {
                    return Some(format!(
                        "parallel '{}' is not completely active",
                        parent_node.id
                    ));
                }
            }
            _ => {
                if active.len() > 1 {
                    return Some(format!(
                        "more than one child of '{}' is active",
                        parent_node.id
                    ));
                }
            }
        }
    }
    None
}

/// Runs exit actions, transition actions, and entry actions, raising the
/// lifecycle events (`.exit`, `.entry`, `.done`) and cancelling invokers
/// of exited states along the way.
pub(crate) fn execute_actions(
    model: &Model,
    instance: &mut Instance,
    evaluator: &dyn Evaluator,
    reporter: &dyn ErrorReporter,
    listeners: &mut [Box<dyn Listener>],
    step: &mut Step,
) {
    let Step {
        transitions,
        entry_list,
        exit_list,
        internal_events,
        ..
    } = step;

    for n in exit_list.iter().copied() {
        let node = model.node(n);
        run_actions(
            model,
            instance,
            evaluator,
            reporter,
            Some(n),
            &node.on_exit,
            internal_events,
        );
        if let Some(mut invoker) = instance.invokers.remove(&n) {
            if let Err(e) = invoker.cancel() {
                reporter.report(ReportKind::CancelFailed, &e.reason, Some(&node.id));
                internal_events.push(TriggerEvent::error(format!(
                    "{}.invoke.cancel.failed",
                    node.id
                )));
            }
        }
        internal_events.push(TriggerEvent::change(format!("{}.exit", node.id)));
        for listener in listeners.iter_mut() {
            listener.on_exit(&node.id);
        }
    }

    for tid in transitions.iter().copied() {
        let t = model.transition(tid);
        run_actions(
            model,
            instance,
            evaluator,
            reporter,
            Some(t.source),
            &t.actions,
            internal_events,
        );
        let target = t.targets.first().map(|n| model.id_of(*n));
        for listener in listeners.iter_mut() {
            listener.on_transition(model.id_of(t.source), target, t.event.as_deref());
        }
    }

    for n in entry_list.iter().copied() {
        let node = model.node(n);
        run_actions(
            model,
            instance,
            evaluator,
            reporter,
            Some(n),
            &node.on_entry,
            internal_events,
        );
        for listener in listeners.iter_mut() {
            listener.on_entry(&node.id);
        }
        internal_events.push(TriggerEvent::change(format!("{}.entry", node.id)));
        if node.kind == Kind::Final {
            if let Some(parent) = node.parent {
                complete(model, instance, parent, internal_events);
            }
        }
    }
}

/// Marks `state` complete and fires its `.done` event, propagating to the
/// enclosing parallel when its last region completes. The orthogonal
/// wrapper state is flagged too, but only the parallel's event fires.
fn complete(model: &Model, instance: &mut Instance, state: NodeId, out: &mut Vec<TriggerEvent>) {
    if !instance.done.insert(state) {
        return;
    }
    out.push(TriggerEvent::change(format!("{}.done", model.id_of(state))));
    if !model.is_region(state) {
        return;
    }
    let Some(parallel) = model.node(state).parent else {
        return;
    };
    let all_done = enterable_children(model, parallel).all(|r| instance.done.contains(&r));
    if all_done && instance.done.insert(parallel) {
        out.push(TriggerEvent::change(format!(
            "{}.done",
            model.id_of(parallel)
        )));
        if let Some(wrapper) = model.node(parallel).parent {
            instance.done.insert(wrapper);
        }
    }
}

/// Executes a list of actions in the scope of `node`, pushing any raised
/// or change events onto `out`.
pub(crate) fn run_actions(
    model: &Model,
    instance: &mut Instance,
    evaluator: &dyn Evaluator,
    reporter: &dyn ErrorReporter,
    node: Option<NodeId>,
    actions: &[Action],
    out: &mut Vec<TriggerEvent>,
) {
    let node_id = node.map(|n| model.id_of(n).to_string());
    for action in actions {
        match action {
            Action::Assign { name, expr } => {
                let value = match eval_in(model, instance, evaluator, node, expr) {
                    Ok(v) => v,
                    Err(e) => {
                        reporter.report(
                            ReportKind::ExpressionError,
                            &format!("assign to '{name}': {e}"),
                            node_id.as_deref(),
                        );
                        continue;
                    }
                };
                if instance.scopes.set(model, node, name, value) {
                    out.push(TriggerEvent::change(format!("{name}.change")));
                } else {
                    reporter.report(
                        ReportKind::UndefinedVariable,
                        &format!("assignment to undeclared variable '{name}'"),
                        node_id.as_deref(),
                    );
                }
            }
            Action::Var { name, expr } => match eval_in(model, instance, evaluator, node, expr) {
                Ok(value) => {
                    instance.scopes.set_local(node, name.clone(), value);
                    out.push(TriggerEvent::change(format!("{name}.change")));
                }
                Err(e) => reporter.report(
                    ReportKind::ExpressionError,
                    &format!("var '{name}': {e}"),
                    node_id.as_deref(),
                ),
            },
            Action::Log { label, expr } => match eval_in(model, instance, evaluator, node, expr) {
                Ok(value) => {
                    tracing::info!(label = %label, value = %value, "log action");
                }
                Err(e) => reporter.report(
                    ReportKind::ExpressionError,
                    &format!("log '{label}': {e}"),
                    node_id.as_deref(),
                ),
            },
            Action::Raise { event } => {
                out.push(TriggerEvent::signal(event.clone()));
            }
        }
    }
}

fn eval_in(
    model: &Model,
    instance: &Instance,
    evaluator: &dyn Evaluator,
    node: Option<NodeId>,
    expr: &str,
) -> Result<Value, crate::error::ExprError> {
    let scope = Scope::new(model, &instance.scopes, node);
    evaluator.eval(&scope, expr)
}

/// Captures history for every exited state owning history pseudo-states.
/// Deep history records the active leaves of the subtree, shallow history
/// the active direct children.
pub(crate) fn update_history_states(model: &Model, instance: &mut Instance, step: &Step) {
    let before_closure = model.ancestor_closure(step.before.iter().copied(), None);
    for n in &step.exit_list {
        for h in model.history_children(*n) {
            let Kind::History { deep } = model.node(h).kind else {
                continue;
            };
            let capture: HashSet<NodeId> = if deep {
                step.before
                    .iter()
                    .copied()
                    .filter(|leaf| model.is_descendant(*leaf, *n))
                    .collect()
            } else {
                model
                    .node(*n)
                    .children
                    .iter()
                    .copied()
                    .filter(|c| before_closure.contains(c))
                    .collect()
            };
            instance.histories.insert(h, capture);
        }
    }
}

/// Starts invokers for newly active states declaring an invoke. Failures
/// are recoverable: they are reported and surface as
/// `"<id>.invoke.failed"` error events.
pub(crate) fn initiate_invokes(
    model: &Model,
    instance: &mut Instance,
    evaluator: &dyn Evaluator,
    reporter: &dyn ErrorReporter,
    factory: Option<&dyn InvokerFactory>,
    sender: &EventSender,
    out: &mut Vec<TriggerEvent>,
) {
    let mut pending: Vec<NodeId> = model
        .ancestor_closure(instance.configuration.iter().copied(), None)
        .into_iter()
        .filter(|n| model.node(*n).invoke.is_some() && !instance.invokers.contains_key(n))
        .collect();
    pending.sort_by_key(|n| model.node(*n).order);

    for n in pending {
        let node = model.node(n);
        let Some(invoke) = &node.invoke else { continue };
        let mut fail = |reason: &str| {
            reporter.report(ReportKind::InvokeFailed, reason, Some(&node.id));
            out.push(TriggerEvent::error(format!("{}.invoke.failed", node.id)));
        };
        let Some(factory) = factory else {
            fail("no invoker factory registered");
            continue;
        };

        let src = if let Some(src) = &invoke.src {
            src.clone()
        } else if let Some(expr) = &invoke.src_expr {
            match eval_in(model, instance, evaluator, Some(n), expr) {
                Ok(Value::String(s)) => s,
                Ok(other) => other.to_string(),
                Err(e) => {
                    fail(&format!("source expression: {e}"));
                    continue;
                }
            }
        } else {
            fail("invoke declares neither src nor src_expr");
            continue;
        };

        let mut params = HashMap::new();
        let mut bad_param = None;
        for (name, expr) in &invoke.params {
            match eval_in(model, instance, evaluator, Some(n), expr) {
                Ok(value) => {
                    params.insert(name.clone(), value);
                }
                Err(e) => {
                    bad_param = Some(format!("param '{name}': {e}"));
                    break;
                }
            }
        }
        if let Some(reason) = bad_param {
            fail(&reason);
            continue;
        }

        match factory.new_invoker(&invoke.kind, &node.id, sender.clone()) {
            Ok(mut invoker) => match invoker.invoke(&src, params) {
                Ok(()) => {
                    instance.invokers.insert(n, invoker);
                }
                Err(e) => fail(&e.reason),
            },
            Err(e) => fail(&e.reason),
        }
    }
}

/// Forwards external events to running invokers. An invoker whose own
/// `"<id>.invoke.*"` event is part of the batch gets nothing from it;
/// forwarding that batch back would cycle. Forwarding failures are fatal.
pub(crate) fn process_invokes(
    model: &Model,
    instance: &mut Instance,
    events: &[TriggerEvent],
) -> Result<(), EngineError> {
    for (n, invoker) in instance.invokers.iter_mut() {
        let prefix = format!("{}.invoke.", model.id_of(*n));
        if events.iter().any(|e| e.name.starts_with(&prefix)) {
            continue;
        }
        for event in events {
            invoker.parent_event(event).map_err(|e| EngineError::Invoker {
                id: model.id_of(*n).to_string(),
                reason: e.reason,
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::TracingReporter;
    use serde_json::json;

    fn parallel_model() -> Model {
        Model::from_json(&json!({
            "initial": "idle",
            "states": [
                {"id": "idle", "transitions": [{"event": "run", "targets": "wrap"}]},
                {"id": "wrap", "states": [
                    {"id": "p", "kind": "parallel", "states": [
                        {"id": "r1", "initial": "r1a", "states": [
                            {"id": "r1a", "transitions": [{"event": "out", "targets": "idle"}]}
                        ]},
                        {"id": "r2", "initial": "r2a", "states": [{"id": "r2a"}]}
                    ]}
                ]}
            ]
        }))
        .unwrap()
    }

    fn leaves(model: &Model, ids: &[&str]) -> HashSet<NodeId> {
        ids.iter().map(|i| model.node_by_id(i).unwrap()).collect()
    }

    #[test]
    fn test_determine_target_states_expands_composites() {
        let m = parallel_model();
        let instance = Instance::new();
        let seed = leaves(&m, &["wrap"]);
        let targets =
            determine_target_states(&m, &instance, &TracingReporter, &seed).unwrap();
        assert_eq!(targets, leaves(&m, &["r1a", "r2a"]));
    }

    #[test]
    fn test_determine_target_states_missing_initial() {
        let m = Model::from_json(&json!({
            "states": [{"id": "c", "states": [{"id": "c1"}]}]
        }))
        .unwrap();
        let instance = Instance::new();
        let seed = leaves(&m, &["c"]);
        let result = determine_target_states(&m, &instance, &TracingReporter, &seed);
        assert!(matches!(result, Err(EngineError::NoInitialTarget { .. })));
    }

    #[test]
    fn test_history_replays_capture_over_default() {
        let m = Model::from_json(&json!({
            "states": [
                {"id": "c", "initial": "c1", "states": [
                    {"id": "h", "kind": "history", "initial": "c1"},
                    {"id": "c1"},
                    {"id": "c2"}
                ]}
            ]
        }))
        .unwrap();
        let h = m.node_by_id("h").unwrap();
        let mut instance = Instance::new();

        let seed = leaves(&m, &["h"]);
        let targets =
            determine_target_states(&m, &instance, &TracingReporter, &seed).unwrap();
        assert_eq!(targets, leaves(&m, &["c1"]), "empty history uses default");

        instance.histories.insert(h, leaves(&m, &["c2"]));
        let targets =
            determine_target_states(&m, &instance, &TracingReporter, &seed).unwrap();
        assert_eq!(targets, leaves(&m, &["c2"]));
    }

    #[test]
    fn test_states_exited_covers_sibling_regions() {
        let m = parallel_model();
        let r1a = m.node_by_id("r1a").unwrap();
        let current = leaves(&m, &["r1a", "r2a"]);
        let t = m.transition(m.node(r1a).transitions[0]);
        let exited = states_exited(&m, t, &current);
        let expected = leaves(&m, &["r1a", "r1", "r2a", "r2", "p", "wrap"]);
        assert_eq!(exited, expected);
    }

    #[test]
    fn test_seed_adds_unentered_sibling_regions() {
        let m = Model::from_json(&json!({
            "initial": "out",
            "states": [
                {"id": "out", "transitions": [{"event": "in", "targets": "r1a"}]},
                {"id": "wrap", "states": [
                    {"id": "p", "kind": "parallel", "states": [
                        {"id": "r1", "initial": "r1a", "states": [{"id": "r1a"}]},
                        {"id": "r2", "initial": "r2a", "states": [{"id": "r2a"}]}
                    ]}
                ]}
            ]
        }))
        .unwrap();
        let out = m.node_by_id("out").unwrap();
        let tid = m.node(out).transitions[0];
        let seed = seed_target_set(&m, &HashSet::new(), &[tid]);
        assert_eq!(seed, leaves(&m, &["r1a", "r2"]));
    }

    #[test]
    fn test_config_violation() {
        let m = parallel_model();
        assert!(config_violation(&m, &leaves(&m, &["r1a", "r2a"])).is_none());
        assert!(config_violation(&m, &leaves(&m, &["idle"])).is_none());
        // incomplete parallel
        assert!(config_violation(&m, &leaves(&m, &["r1a"])).is_some());
        // two top-level actives
        assert!(config_violation(&m, &leaves(&m, &["idle", "wrap"])).is_some());
        assert!(config_violation(&m, &HashSet::new()).is_some());
    }

    #[test]
    fn test_update_history_shallow_and_deep() {
        let m = Model::from_json(&json!({
            "states": [
                {"id": "c", "initial": "mid", "states": [
                    {"id": "hs", "kind": "history"},
                    {"id": "hd", "kind": "history", "deep": true},
                    {"id": "mid", "initial": "leaf", "states": [{"id": "leaf"}]}
                ]}
            ]
        }))
        .unwrap();
        let c = m.node_by_id("c").unwrap();
        let hs = m.node_by_id("hs").unwrap();
        let hd = m.node_by_id("hd").unwrap();
        let mut instance = Instance::new();
        let mut step = Step::new(Vec::new(), leaves(&m, &["leaf"]), Vec::new());
        step.exit_list = vec![c];

        update_history_states(&m, &mut instance, &step);
        assert_eq!(instance.histories[&hs], leaves(&m, &["mid"]));
        assert_eq!(instance.histories[&hd], leaves(&m, &["leaf"]));
    }
}
