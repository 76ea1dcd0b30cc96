//! # statecharts
//!
//! A Harel statechart execution engine with SCXML-style semantics.
//!
//! This crate provides:
//! - Model compilation from a JSON DSL, with validation
//! - Microstep/macrostep execution with run-to-completion semantics
//! - Parallel regions, shallow and deep history, completion events
//! - Guard and action expression evaluation over chained scopes
//! - An invoke lifecycle for external child processes
//!
//! ```
//! use statecharts::{Executor, Model, TriggerEvent};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let model = Model::from_json(&json!({
//!     "initial": "idle",
//!     "states": [
//!         {"id": "idle", "transitions": [{"event": "start", "targets": "running"}]},
//!         {"id": "running"}
//!     ]
//! })).unwrap();
//!
//! let mut machine = Executor::new(Arc::new(model));
//! machine.go().unwrap();
//! machine.trigger_event(TriggerEvent::signal("start")).unwrap();
//! assert_eq!(machine.configuration(), vec!["running"]);
//! ```

pub mod env;
pub mod error;
pub mod event;
pub mod executor;
pub mod expr;
pub mod instance;
pub mod model;
pub mod order;
mod semantics;
mod step;

pub use env::{
    ErrorReporter, Evaluator, EventSender, Invoker, InvokerFactory, Listener, TracingReporter,
};
pub use error::{EngineError, ExprError, InvokerError, ReportKind};
pub use event::{EventKind, TriggerEvent};
pub use executor::Executor;
pub use expr::{BuiltinEvaluator, Expr};
pub use instance::{Instance, Scope, Snapshot};
pub use model::{Action, DocumentDef, Kind, Model, NodeId, TransitionId};
