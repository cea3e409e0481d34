//! Port traits — the boundary between the session engine and the node tree.
//!
//! ```text
//!   Responder ──▶ NodeResolver ──▶ Node / DelegateResponder
//!        ▲                             │
//!        └──── ChildListener / ValueListener ◀┘
//! ```
//!
//! The responder never sees how nodes store values or metadata. It resolves
//! a path, asks the node to describe itself, and drives invoke/set/list/
//! subscribe through these traits. Resolution failures are tagged
//! [`DsError`]s, not panics.

use std::sync::Arc;

use crate::error::DsError;
use crate::rpc::frame::ValueUpdate;
use crate::rpc::permission::Permission;
use crate::rpc::responder::{ActionResult, DelegateReply, InvokeStream};
use crate::rpc::value::{Map, Value};

// ───────────────────────────────────────────────────────────────
// Resolution
// ───────────────────────────────────────────────────────────────

/// Looks up the target of a request path.
pub trait NodeResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Result<Resolution, DsError>;
}

/// Where a path leads.
pub enum Resolution {
    /// A node served by this responder.
    Node(Arc<dyn Node>),
    /// The path enters a sub-tree owned by another responder; `remainder`
    /// is the path relative to it.
    Delegate {
        responder: Arc<dyn DelegateResponder>,
        remainder: String,
    },
}

// ───────────────────────────────────────────────────────────────
// Nodes
// ───────────────────────────────────────────────────────────────

/// What a node tells `list` and the permission checks about itself.
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    /// `$is` profile name.
    pub profile: String,
    /// `$type` of the node's value, if it has one.
    pub value_type: Option<String>,
    /// Level required to invoke; `None` if the node is not an action.
    pub invokable: Option<Permission>,
    /// Level required to set; `None` if the value is read-only.
    pub writable: Option<Permission>,
    /// Action signature.
    pub params: Vec<Value>,
    pub columns: Vec<Value>,
    /// Extra `$`/`@` attributes, emitted verbatim.
    pub attributes: Map,
}

impl NodeInfo {
    pub fn node() -> Self {
        Self {
            profile: "node".to_string(),
            ..Self::default()
        }
    }

    /// Metadata rows for the head of a list response.
    pub fn to_rows(&self) -> Vec<Value> {
        let mut rows = vec![Value::list().push("$is").push(self.profile.as_str())];
        if let Some(t) = &self.value_type {
            rows.push(Value::list().push("$type").push(t.as_str()));
        }
        if let Some(p) = self.invokable {
            rows.push(Value::list().push("$invokable").push(p.as_str()));
            if !self.params.is_empty() {
                rows.push(Value::list().push("$params").push(self.params.clone()));
            }
            if !self.columns.is_empty() {
                rows.push(Value::list().push("$columns").push(self.columns.clone()));
            }
        }
        if let Some(p) = self.writable {
            rows.push(Value::list().push("$writable").push(p.as_str()));
        }
        for (k, v) in &self.attributes {
            rows.push(Value::list().push(k.as_str()).push(v.clone()));
        }
        rows
    }

    /// Summary object describing this node as a child in its parent's list.
    pub fn summary(&self) -> Map {
        let mut m = Map::new();
        m.insert("$is".to_string(), Value::from(self.profile.as_str()));
        if let Some(t) = &self.value_type {
            m.insert("$type".to_string(), Value::from(t.as_str()));
        }
        if let Some(p) = self.invokable {
            m.insert("$invokable".to_string(), Value::from(p.as_str()));
        }
        m
    }
}

/// A node in the local tree.
///
/// Default methods describe a plain container: no value, not invokable,
/// not writable, no change notifications.
pub trait Node: Send + Sync {
    fn info(&self) -> NodeInfo;

    /// Current children as `(name, summary)` in display order.
    fn children(&self) -> Vec<(String, Map)> {
        Vec::new()
    }

    fn value(&self) -> Option<ValueUpdate> {
        None
    }

    /// Run the action. `stream` stays valid after return for actions that
    /// keep pushing rows.
    fn invoke(&self, _params: &Value, _stream: InvokeStream) -> Result<ActionResult, DsError> {
        Err(DsError::not_implemented("invoke"))
    }

    fn set_value(&self, _value: Value) -> Result<(), DsError> {
        Err(DsError::not_implemented("set"))
    }

    /// Register for structural changes. Dropping the guard unregisters.
    fn watch_children(&self, _listener: Arc<dyn ChildListener>) -> Option<WatchGuard> {
        None
    }

    /// Register for value changes. Dropping the guard unregisters.
    fn watch_value(&self, _listener: Arc<dyn ValueListener>) -> Option<WatchGuard> {
        None
    }
}

// ───────────────────────────────────────────────────────────────
// Change notification
// ───────────────────────────────────────────────────────────────

pub trait ChildListener: Send + Sync {
    fn child_added(&self, name: &str, summary: &Map);

    fn child_removed(&self, name: &str);

    /// A rename is reported as a removal followed by an addition.
    fn child_renamed(&self, old: &str, new: &str, summary: &Map) {
        self.child_removed(old);
        self.child_added(new, summary);
    }
}

pub trait ValueListener: Send + Sync {
    fn value_changed(&self, update: &ValueUpdate);
}

/// Cancels a watch when dropped.
#[must_use = "dropping the guard cancels the watch"]
pub struct WatchGuard(Option<Box<dyn FnOnce() + Send>>);

impl WatchGuard {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel();
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Delegation
// ───────────────────────────────────────────────────────────────

/// A nested responder that owns part of the tree. Requests whose path
/// enters it are forwarded untouched (except for the rewritten path).
pub trait DelegateResponder: Send + Sync {
    /// Handle a forwarded request. `reply` sends response frames for the
    /// original RID and stays usable until a closed frame goes through it.
    fn forward(&self, request: &Value, reply: DelegateReply);

    /// The peer closed a forwarded request.
    fn close(&self, _rid: u32) {}
}

// ───────────────────────────────────────────────────────────────
// Event sink port (session → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The session emits [`LinkEvent`](super::events::LinkEvent)s through
/// this port. Called from the dispatch and I/O threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &super::events::LinkEvent);
}

/// Sink that drops every event.
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &super::events::LinkEvent) {}
}
