//! The immutable statechart model tree.
//!
//! Models are described with a JSON DSL and compiled into an arena: nodes
//! are stored in a flat vector and reference each other through [`NodeId`]
//! handles, so parent links are plain indices rather than owning pointers.
//!
//! ```json
//! {
//!   "initial": "idle",
//!   "states": [
//!     {"id": "idle", "transitions": [{"event": "start", "targets": "work"}]},
//!     {"id": "work", "initial": "w1", "states": [
//!       {"id": "w1", "transitions": [{"event": "next", "targets": "w2"}]},
//!       {"id": "w2", "kind": "final"}
//!     ]}
//!   ]
//! }
//! ```

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Handle to a node in the model arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

/// Handle to a transition in the model arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransitionId(pub(crate) u32);

/// The closed set of node kinds, matched exhaustively by the semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Simple, composite, or orthogonal state.
    State,
    /// All child regions are simultaneously active when this node is active.
    Parallel,
    /// Pseudo-state replaying the last captured configuration.
    History { deep: bool },
    /// Entering one of these completes the parent composite.
    Final,
}

/// Executable content attached to entries, exits, transitions, and
/// invoke finalize blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Action {
    /// Assign to a variable defined in an enclosing scope; fires
    /// `"<name>.change"` on success.
    Assign { name: String, expr: String },
    /// Declare a variable in the local scope; fires `"<name>.change"`.
    Var { name: String, expr: String },
    /// Evaluate an expression and log the result.
    Log {
        #[serde(default)]
        label: String,
        expr: String,
    },
    /// Enqueue an internal signal event.
    Raise { event: String },
}

/// An `invoke` declaration on a state.
#[derive(Debug, Clone)]
pub struct Invoke {
    /// Invoker type name, resolved through the InvokerFactory.
    pub kind: String,
    /// Literal source, if present.
    pub src: Option<String>,
    /// Source expression, evaluated in the state's context when `src` is
    /// absent.
    pub src_expr: Option<String>,
    /// Param name/expression pairs, evaluated in the state's context.
    pub params: Vec<(String, String)>,
    /// Actions run against the internal queue when a matching
    /// `"<id>.invoke.*"` event is pending.
    pub finalize: Vec<Action>,
}

/// One node of the model tree.
#[derive(Debug)]
pub struct Node {
    /// Stable document id.
    pub id: String,
    pub kind: Kind,
    pub parent: Option<NodeId>,
    /// Children in document order (includes history pseudo-children).
    pub children: Vec<NodeId>,
    /// Outgoing transitions in document order.
    pub transitions: Vec<TransitionId>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
    /// Initial transition targets of a composite, or the default targets
    /// of a history node. Empty when not applicable.
    pub initial: Vec<NodeId>,
    pub invoke: Option<Invoke>,
    /// Distance from the root.
    pub depth: u32,
    /// Document-order index, unique across the model.
    pub order: u32,
}

/// The location of a transition in the tree: the path from its source up to
/// the transition scope and back down to one target.
#[derive(Debug, Clone)]
pub struct Path {
    /// Least state not exited nor entered by the transition; `None` for a
    /// document-level transition.
    pub scope: Option<NodeId>,
    /// Source up to (excluding) the scope, bottom-up.
    pub up_seg: Vec<NodeId>,
    /// Scope (excluded) down to the target, top-down.
    pub down_seg: Vec<NodeId>,
    /// Whether the path crosses a parallel-region border.
    pub cross_region: bool,
}

/// A compiled transition.
#[derive(Debug)]
pub struct Transition {
    pub source: NodeId,
    /// Event specifier; `None` means eventless.
    pub event: Option<String>,
    /// Guard expression.
    pub cond: Option<String>,
    /// Resolved runtime targets; empty for a targetless transition.
    pub targets: Vec<NodeId>,
    /// One path per target, same order as `targets`.
    pub paths: Vec<Path>,
    pub actions: Vec<Action>,
    /// Document-order priority, unique across the model.
    pub order: u32,
}

// =============================================================================
// Raw definition (serde DSL)
// =============================================================================

/// Raw document definition as written in the JSON DSL.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DocumentDef {
    /// Id of the document's initial target(s).
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub initial: Vec<String>,
    #[serde(default)]
    pub states: Vec<NodeDef>,
    /// Namespace prefix map handed to the expression evaluator.
    #[serde(default)]
    pub namespaces: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KindDef {
    #[default]
    State,
    Parallel,
    History,
    Final,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(default)]
    pub kind: KindDef,
    /// Deep history flag; ignored for non-history nodes.
    #[serde(default)]
    pub deep: bool,
    /// Initial target id(s) of a composite, or a history default target.
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub initial: Vec<String>,
    #[serde(default)]
    pub states: Vec<NodeDef>,
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
    #[serde(default)]
    pub on_entry: Vec<Action>,
    #[serde(default)]
    pub on_exit: Vec<Action>,
    #[serde(default)]
    pub invoke: Option<InvokeDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionDef {
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub cond: Option<String>,
    /// Target id(s). A single string or a list; may be omitted for a
    /// targetless (actions-only) transition.
    #[serde(default, deserialize_with = "deserialize_id_list")]
    pub targets: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvokeDef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub src_expr: Option<String>,
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default)]
    pub finalize: Vec<Action>,
}

fn deserialize_id_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::{self, Visitor};
    use std::fmt;

    struct IdListVisitor;

    impl<'de> Visitor<'de> for IdListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or array of strings")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(vec![v.to_string()])
        }

        fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
        where
            A: de::SeqAccess<'de>,
        {
            let mut ids = Vec::new();
            while let Some(s) = seq.next_element::<String>()? {
                ids.push(s);
            }
            Ok(ids)
        }
    }

    deserializer.deserialize_any(IdListVisitor)
}

// =============================================================================
// Compiled model
// =============================================================================

/// Validated, indexed model tree.
#[derive(Debug)]
pub struct Model {
    nodes: Vec<Node>,
    transitions: Vec<Transition>,
    initial: Vec<NodeId>,
    namespaces: HashMap<String, String>,
    ids: HashMap<String, NodeId>,
}

impl Model {
    /// Parses and compiles a model from JSON.
    pub fn from_json(json: &serde_json::Value) -> Result<Self, EngineError> {
        let def: DocumentDef = serde_json::from_value(json.clone())?;
        Self::from_def(def)
    }

    /// Compiles a model from its raw definition.
    pub fn from_def(def: DocumentDef) -> Result<Self, EngineError> {
        Compiler::default().compile(def)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.0 as usize]
    }

    /// Looks up a node by its document id.
    pub fn node_by_id(&self, id: &str) -> Option<NodeId> {
        self.ids.get(id).copied()
    }

    /// Document id of a node.
    pub fn id_of(&self, node: NodeId) -> &str {
        &self.node(node).id
    }

    /// The document's initial targets; empty when the document declares none.
    pub fn initial_targets(&self) -> &[NodeId] {
        &self.initial
    }

    pub fn namespaces(&self) -> &HashMap<String, String> {
        &self.namespaces
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// True iff `node` is a strict descendant of `ancestor`.
    pub fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = self.node(node).parent;
        while let Some(p) = current {
            if p == ancestor {
                return true;
            }
            current = self.node(p).parent;
        }
        false
    }

    /// Nearest ancestor of kind `State`, skipping parallels.
    pub fn parent_state(&self, node: NodeId) -> Option<NodeId> {
        let mut current = self.node(node).parent;
        while let Some(p) = current {
            if self.node(p).kind == Kind::State {
                return Some(p);
            }
            current = self.node(p).parent;
        }
        None
    }

    /// True iff `node` is a direct child region of a parallel.
    pub fn is_region(&self, node: NodeId) -> bool {
        match self.node(node).parent {
            Some(p) => self.node(p).kind == Kind::Parallel,
            None => false,
        }
    }

    /// The single parallel child of an orthogonal state, if any.
    pub fn parallel_child(&self, node: NodeId) -> Option<NodeId> {
        self.node(node)
            .children
            .iter()
            .copied()
            .find(|c| self.node(*c).kind == Kind::Parallel)
    }

    /// True iff the state has no enterable children (history pseudo-children
    /// do not count).
    pub fn is_simple(&self, node: NodeId) -> bool {
        self.node(node)
            .children
            .iter()
            .all(|c| matches!(self.node(*c).kind, Kind::History { .. }))
    }

    /// History pseudo-children of a state, in document order.
    pub fn history_children(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(node)
            .children
            .iter()
            .copied()
            .filter(|c| matches!(self.node(*c).kind, Kind::History { .. }))
    }

    /// Extends `states` with every strict ancestor of each member, stopping
    /// at members of `upper_bounds`.
    pub fn ancestor_closure<I>(
        &self,
        states: I,
        upper_bounds: Option<&HashSet<NodeId>>,
    ) -> HashSet<NodeId>
    where
        I: IntoIterator<Item = NodeId>,
    {
        let mut closure = HashSet::new();
        for node in states {
            closure.insert(node);
            let mut current = self.node(node).parent;
            while let Some(p) = current {
                if let Some(bounds) = upper_bounds {
                    if bounds.contains(&p) {
                        break;
                    }
                }
                if !closure.insert(p) {
                    // parent is already a part of the closure
                    break;
                }
                current = self.node(p).parent;
            }
        }
        closure
    }

    /// Least common ancestor of kind `State`, or `None` for unrelated
    /// top-level nodes.
    pub fn lca(&self, a: NodeId, b: NodeId) -> Option<NodeId> {
        if a == b {
            return Some(a);
        }
        if self.is_descendant(a, b) {
            return Some(b);
        }
        if self.is_descendant(b, a) {
            return Some(a);
        }
        let mut seen = HashSet::new();
        let mut current = self.node(a).parent;
        while let Some(p) = current {
            if self.node(p).kind == Kind::State {
                seen.insert(p);
            }
            current = self.node(p).parent;
        }
        current = self.node(b).parent;
        while let Some(p) = current {
            if self.node(p).kind == Kind::State && seen.contains(&p) {
                return Some(p);
            }
            current = self.node(p).parent;
        }
        None
    }

    fn build_path(&self, source: NodeId, target: NodeId) -> Path {
        let mut scope = self.lca(source, target);
        if let Some(s) = scope {
            if s == source || s == target {
                scope = self.parent_state(s);
            }
        }
        let mut up_seg = Vec::new();
        let mut cross_region = false;
        let mut current = Some(source);
        while current != scope {
            let node = current.expect("path walk passed the root");
            up_seg.push(node);
            if self.is_region(node) {
                cross_region = true;
            }
            current = self.node(node).parent;
        }
        let mut down_seg = Vec::new();
        current = Some(target);
        while current != scope {
            let node = current.expect("path walk passed the root");
            down_seg.insert(0, node);
            if self.is_region(node) {
                cross_region = true;
            }
            current = self.node(node).parent;
        }
        Path {
            scope,
            up_seg,
            down_seg,
            cross_region,
        }
    }
}

#[derive(Default)]
struct Compiler {
    nodes: Vec<Node>,
    ids: HashMap<String, NodeId>,
    // raw transitions, paired with their source, in document order
    pending: Vec<(NodeId, TransitionDef)>,
    // initial target ids awaiting resolution: (node, ids)
    pending_initial: Vec<(NodeId, Vec<String>)>,
}

impl Compiler {
    fn compile(mut self, def: DocumentDef) -> Result<Model, EngineError> {
        for state in &def.states {
            self.add_node(state, None, 0)?;
        }

        let mut model = Model {
            nodes: self.nodes,
            transitions: Vec::new(),
            initial: Vec::new(),
            namespaces: def.namespaces,
            ids: self.ids,
        };

        for id in &def.initial {
            model.initial.push(resolve(&model.ids, id)?);
        }
        for (node, ids) in &self.pending_initial {
            let mut targets = Vec::with_capacity(ids.len());
            for id in ids {
                targets.push(resolve(&model.ids, id)?);
            }
            model.nodes[node.0 as usize].initial = targets;
        }

        // compile transitions last so paths can see the whole tree
        for (order, (source, raw)) in self.pending.drain(..).enumerate() {
            let mut targets = Vec::with_capacity(raw.targets.len());
            for id in &raw.targets {
                targets.push(resolve(&model.ids, id)?);
            }
            let paths = targets
                .iter()
                .map(|t| model.build_path(source, *t))
                .collect();
            let tid = TransitionId(order as u32);
            model.transitions.push(Transition {
                source,
                event: raw.event.filter(|e| !e.trim().is_empty()),
                cond: raw.cond.filter(|c| !c.trim().is_empty()),
                targets,
                paths,
                actions: raw.actions,
                order: order as u32,
            });
            model.nodes[source.0 as usize].transitions.push(tid);
        }

        validate(&model)?;
        Ok(model)
    }

    fn add_node(
        &mut self,
        def: &NodeDef,
        parent: Option<NodeId>,
        depth: u32,
    ) -> Result<NodeId, EngineError> {
        let kind = match def.kind {
            KindDef::State => Kind::State,
            KindDef::Parallel => Kind::Parallel,
            KindDef::History => Kind::History { deep: def.deep },
            KindDef::Final => Kind::Final,
        };
        let id = NodeId(self.nodes.len() as u32);
        if self.ids.insert(def.id.clone(), id).is_some() {
            return Err(EngineError::InvalidModel {
                reason: format!("duplicate node id '{}'", def.id),
            });
        }
        let order = id.0;
        self.nodes.push(Node {
            id: def.id.clone(),
            kind,
            parent,
            children: Vec::new(),
            transitions: Vec::new(),
            on_entry: def.on_entry.clone(),
            on_exit: def.on_exit.clone(),
            initial: Vec::new(),
            invoke: def.invoke.as_ref().map(|i| Invoke {
                kind: i.kind.clone(),
                src: i.src.clone(),
                src_expr: i.src_expr.clone(),
                params: i.params.clone(),
                finalize: i.finalize.clone(),
            }),
            depth,
            order,
        });
        if !def.initial.is_empty() {
            self.pending_initial.push((id, def.initial.clone()));
        }
        for raw in &def.transitions {
            self.pending.push((id, raw.clone()));
        }
        for child in &def.states {
            let child_id = self.add_node(child, Some(id), depth + 1)?;
            self.nodes[id.0 as usize].children.push(child_id);
        }
        Ok(id)
    }
}

fn resolve(ids: &HashMap<String, NodeId>, id: &str) -> Result<NodeId, EngineError> {
    ids.get(id)
        .copied()
        .ok_or_else(|| EngineError::UnresolvedTarget { id: id.to_string() })
}

fn validate(model: &Model) -> Result<(), EngineError> {
    for node_id in model.node_ids() {
        let node = model.node(node_id);
        match node.kind {
            Kind::Parallel => {
                if node.children.is_empty() {
                    return Err(EngineError::InvalidModel {
                        reason: format!("parallel '{}' has no regions", node.id),
                    });
                }
            }
            Kind::History { .. } => {
                if !node.children.is_empty() {
                    return Err(EngineError::InvalidModel {
                        reason: format!("history '{}' cannot have children", node.id),
                    });
                }
                if node.parent.is_none() {
                    return Err(EngineError::InvalidModel {
                        reason: format!("history '{}' must belong to a state", node.id),
                    });
                }
            }
            Kind::Final => {
                if !node.children.is_empty() || !node.transitions.is_empty() {
                    return Err(EngineError::InvalidModel {
                        reason: format!("final '{}' cannot have children or transitions", node.id),
                    });
                }
            }
            Kind::State => {}
        }
    }
    Ok(())
}
