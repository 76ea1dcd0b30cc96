//! Mutable per-machine runtime state.
//!
//! Everything the interpreter knows about one running machine lives here:
//! the active configuration (stored as its leaf states), the chained
//! variable scopes, captured history, completion flags, and the running
//! invokers. The model tree itself stays immutable and shared.

use crate::env::Invoker;
use crate::error::EngineError;
use crate::model::{Model, NodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Variable storage, one map per state plus a root map.
///
/// Lookup walks from a state's own scope up through its ancestors to the
/// root. Assignment binds to the nearest enclosing scope that defines the
/// name; declaring (`Var`) always writes the local scope.
#[derive(Debug, Default)]
pub struct Scopes {
    root: HashMap<String, Value>,
    by_node: HashMap<NodeId, HashMap<String, Value>>,
}

impl Scopes {
    /// Reads a variable visible from `node`, walking up the state chain.
    pub fn get<'a>(&'a self, model: &Model, node: Option<NodeId>, name: &str) -> Option<&'a Value> {
        let mut current = node;
        while let Some(n) = current {
            if let Some(value) = self.by_node.get(&n).and_then(|m| m.get(name)) {
                return Some(value);
            }
            current = model.node(n).parent;
        }
        self.root.get(name)
    }

    /// True iff `name` is defined in any scope visible from `node`.
    pub fn has(&self, model: &Model, node: Option<NodeId>, name: &str) -> bool {
        self.get(model, node, name).is_some()
    }

    /// Assigns to the nearest enclosing scope defining `name`. Returns
    /// false when no scope defines it.
    pub fn set(&mut self, model: &Model, node: Option<NodeId>, name: &str, value: Value) -> bool {
        let mut current = node;
        while let Some(n) = current {
            if let Some(map) = self.by_node.get_mut(&n) {
                if let Some(slot) = map.get_mut(name) {
                    *slot = value;
                    return true;
                }
            }
            current = model.node(n).parent;
        }
        if let Some(slot) = self.root.get_mut(name) {
            *slot = value;
            return true;
        }
        false
    }

    /// Declares `name` in the scope of `node` (the root scope for `None`),
    /// shadowing any outer definition.
    pub fn set_local(&mut self, node: Option<NodeId>, name: impl Into<String>, value: Value) {
        match node {
            Some(n) => {
                self.by_node.entry(n).or_default().insert(name.into(), value);
            }
            None => {
                self.root.insert(name.into(), value);
            }
        }
    }

    /// Drops the local scopes of the given states. Used on exit so
    /// re-entered states start fresh.
    pub fn clear_nodes<'a>(&mut self, nodes: impl IntoIterator<Item = &'a NodeId>) {
        for node in nodes {
            self.by_node.remove(node);
        }
    }
}

/// Read-only view of the scope chain at one state, handed to the
/// [`Evaluator`](crate::env::Evaluator).
pub struct Scope<'a> {
    model: &'a Model,
    scopes: &'a Scopes,
    node: Option<NodeId>,
}

impl<'a> Scope<'a> {
    pub(crate) fn new(model: &'a Model, scopes: &'a Scopes, node: Option<NodeId>) -> Self {
        Self {
            model,
            scopes,
            node,
        }
    }

    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.scopes.get(self.model, self.node, name)
    }

    /// The document's namespace prefix map.
    pub fn namespaces(&self) -> &'a HashMap<String, String> {
        self.model.namespaces()
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

/// The runtime state of one machine.
///
/// Owned exclusively by its [`Executor`](crate::executor::Executor); there
/// is no sharing between instances.
#[derive(Default)]
pub struct Instance {
    /// Active leaf states. Composite and parallel membership is implied
    /// by the ancestor closure.
    pub configuration: HashSet<NodeId>,
    pub scopes: Scopes,
    /// Last captured configuration per history pseudo-state.
    pub histories: HashMap<NodeId, HashSet<NodeId>>,
    /// States whose completion event has fired.
    pub done: HashSet<NodeId>,
    /// Running invokers, keyed by their invoking state.
    pub invokers: HashMap<NodeId, Box<dyn Invoker>>,
}

impl Instance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self, node: NodeId) -> bool {
        self.done.contains(&node)
    }

    /// Serializable snapshot of this instance.
    ///
    /// Invokers are not captured; after a restore the machine re-invokes
    /// for any active state that declares an invoke.
    pub fn snapshot(&self, model: &Model) -> Snapshot {
        let id = |n: &NodeId| model.id_of(*n).to_string();
        let id_set = |set: &HashSet<NodeId>| {
            let mut v: Vec<String> = set.iter().map(id).collect();
            v.sort();
            v
        };
        Snapshot {
            configuration: id_set(&self.configuration),
            root_vars: self.scopes.root.clone(),
            scoped_vars: self
                .scopes
                .by_node
                .iter()
                .map(|(n, vars)| (id(n), vars.clone()))
                .collect(),
            histories: self
                .histories
                .iter()
                .map(|(n, set)| (id(n), id_set(set)))
                .collect(),
            done: id_set(&self.done),
        }
    }

    /// Rebuilds an instance from a snapshot against the same model.
    pub fn restore(model: &Model, snapshot: &Snapshot) -> Result<Self, EngineError> {
        let resolve = |id: &String| {
            model
                .node_by_id(id)
                .ok_or_else(|| EngineError::UnresolvedTarget { id: id.clone() })
        };
        let resolve_set = |ids: &Vec<String>| -> Result<HashSet<NodeId>, EngineError> {
            ids.iter().map(resolve).collect()
        };

        let mut scopes = Scopes {
            root: snapshot.root_vars.clone(),
            by_node: HashMap::new(),
        };
        for (id, vars) in &snapshot.scoped_vars {
            scopes.by_node.insert(resolve(id)?, vars.clone());
        }
        let mut histories = HashMap::new();
        for (id, set) in &snapshot.histories {
            histories.insert(resolve(id)?, resolve_set(set)?);
        }
        Ok(Self {
            configuration: resolve_set(&snapshot.configuration)?,
            scopes,
            histories,
            done: resolve_set(&snapshot.done)?,
            invokers: HashMap::new(),
        })
    }
}

/// Portable instance state, keyed by document ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub configuration: Vec<String>,
    #[serde(default)]
    pub root_vars: HashMap<String, Value>,
    #[serde(default)]
    pub scoped_vars: HashMap<String, HashMap<String, Value>>,
    #[serde(default)]
    pub histories: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub done: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn model() -> Model {
        Model::from_json(&json!({
            "initial": "a",
            "states": [
                {"id": "a"},
                {"id": "b", "initial": "b1", "states": [
                    {"id": "h", "kind": "history"},
                    {"id": "b1"},
                    {"id": "b2"}
                ]}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_scope_chain_lookup() {
        let m = model();
        let b = m.node_by_id("b").unwrap();
        let b1 = m.node_by_id("b1").unwrap();
        let mut scopes = Scopes::default();
        scopes.set_local(None, "global", json!(1));
        scopes.set_local(Some(b), "shared", json!("outer"));

        // visible from the child through the chain
        assert_eq!(scopes.get(&m, Some(b1), "shared"), Some(&json!("outer")));
        assert_eq!(scopes.get(&m, Some(b1), "global"), Some(&json!(1)));
        assert_eq!(scopes.get(&m, Some(b1), "missing"), None);
    }

    #[test]
    fn test_set_binds_to_defining_scope() {
        let m = model();
        let b = m.node_by_id("b").unwrap();
        let b1 = m.node_by_id("b1").unwrap();
        let mut scopes = Scopes::default();
        scopes.set_local(Some(b), "counter", json!(0));

        assert!(scopes.set(&m, Some(b1), "counter", json!(5)));
        // the write landed in b's scope, not b1's
        assert_eq!(scopes.get(&m, Some(b), "counter"), Some(&json!(5)));
        assert!(!scopes.set(&m, Some(b1), "undeclared", json!(1)));
    }

    #[test]
    fn test_local_shadowing() {
        let m = model();
        let b = m.node_by_id("b").unwrap();
        let b1 = m.node_by_id("b1").unwrap();
        let mut scopes = Scopes::default();
        scopes.set_local(Some(b), "x", json!("outer"));
        scopes.set_local(Some(b1), "x", json!("inner"));

        assert_eq!(scopes.get(&m, Some(b1), "x"), Some(&json!("inner")));
        assert_eq!(scopes.get(&m, Some(b), "x"), Some(&json!("outer")));

        scopes.clear_nodes(&[b1]);
        assert_eq!(scopes.get(&m, Some(b1), "x"), Some(&json!("outer")));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let m = model();
        let b = m.node_by_id("b").unwrap();
        let b1 = m.node_by_id("b1").unwrap();
        let h = m.node_by_id("h").unwrap();

        let mut instance = Instance::new();
        instance.configuration.insert(b1);
        instance.scopes.set_local(None, "global", json!(7));
        instance.scopes.set_local(Some(b), "local", json!("v"));
        instance.histories.insert(h, [b1].into_iter().collect());
        instance.done.insert(b);

        let snapshot = instance.snapshot(&m);
        let json = serde_json::to_string(&snapshot).unwrap();
        let decoded: Snapshot = serde_json::from_str(&json).unwrap();
        let restored = Instance::restore(&m, &decoded).unwrap();

        assert_eq!(restored.configuration, instance.configuration);
        assert_eq!(restored.histories, instance.histories);
        assert_eq!(restored.done, instance.done);
        assert_eq!(
            restored.scopes.get(&m, Some(b1), "local"),
            Some(&json!("v"))
        );
    }

    #[test]
    fn test_restore_rejects_unknown_ids() {
        let m = model();
        let snapshot = Snapshot {
            configuration: vec!["ghost".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            Instance::restore(&m, &snapshot),
            Err(EngineError::UnresolvedTarget { .. })
        ));
    }
}
