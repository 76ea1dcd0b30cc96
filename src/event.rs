//! Trigger events and event-specifier matching.
//!
//! Event names are plain strings, dot-delimited for namespacing. The engine
//! relies on a fixed naming contract for the events it generates itself:
//! `"<id>.entry"`, `"<id>.exit"`, `"<id>.done"`, `"<var>.change"`,
//! `"<id>.invoke.failed"`, `"<id>.invoke.cancel.failed"`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The kind of a trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// An external stimulus, or an event raised by executable content.
    #[default]
    Signal,
    /// Internally generated bookkeeping event (`.entry`, `.exit`, `.done`,
    /// `.change`). Never matched by the `"*"` wildcard.
    Change,
    /// Internally generated error event (`.invoke.failed` etc.).
    Error,
}

/// An event delivered to, or generated by, the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub name: String,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl TriggerEvent {
    pub fn new(name: impl Into<String>, kind: EventKind) -> Self {
        Self {
            name: name.into(),
            kind,
            payload: None,
        }
    }

    /// An external signal event.
    pub fn signal(name: impl Into<String>) -> Self {
        Self::new(name, EventKind::Signal)
    }

    /// An internal change event.
    pub fn change(name: impl Into<String>) -> Self {
        Self::new(name, EventKind::Change)
    }

    /// An internal error event.
    pub fn error(name: impl Into<String>) -> Self {
        Self::new(name, EventKind::Error)
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Matches a transition's event specifier against a set of pending events.
///
/// An empty or absent specifier always matches (eventless transition).
/// Otherwise:
/// - exact match after trimming both sides;
/// - `"*"` matches any pending event that is not a change event;
/// - `"prefix.*"` matches any event sharing the dot-delimited prefix,
///   including the event named exactly `prefix`.
pub(crate) fn event_match<'a, I>(specifier: Option<&str>, events: I) -> bool
where
    I: IntoIterator<Item = &'a TriggerEvent>,
{
    let spec = match specifier {
        Some(s) if !s.trim().is_empty() => s.trim(),
        _ => return true,
    };
    for event in events {
        let name = event.name.trim();
        if spec == name {
            return true;
        }
        if spec == "*" && event.kind != EventKind::Change {
            return true;
        }
        if let Some(prefix) = spec.strip_suffix(".*") {
            if name == prefix || name.starts_with(&format!("{}.", prefix)) {
                return true;
            }
        }
    }
    false
}
