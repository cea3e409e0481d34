//! In-memory node tree.
//!
//! [`MemoryTree`] is the resolver the binary serves and the tests drive.
//! Nodes are addressed by absolute path (`/`, `/sys`, `/sys/uptime`).
//! Structural changes are reported to list watchers and value changes to
//! subscribers; listeners always run after the tree lock is released, so
//! they may call back into the tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{SecondsFormat, Utc};
use log::debug;

use crate::error::DsError;
use crate::rpc::frame::ValueUpdate;
use crate::rpc::guard::{lock, shielded};
use crate::rpc::permission::Permission;
use crate::rpc::responder::{ActionResult, InvokeStream};
use crate::rpc::value::{Map, Value};

use super::ports::{
    ChildListener, DelegateResponder, Node, NodeInfo, NodeResolver, Resolution, ValueListener,
    WatchGuard,
};

/// Action body: `(params, stream)`.
pub type ActionFn = dyn Fn(&Value, InvokeStream) -> Result<ActionResult, DsError> + Send + Sync;

/// Current wall-clock time in the form value updates carry.
pub fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Normalized absolute path: leading `/`, no trailing `/`.
fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn split(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

// ── Storage ──────────────────────────────────────────────────

struct Entry {
    info: NodeInfo,
    value: Option<ValueUpdate>,
    action: Option<Arc<ActionFn>>,
    /// Child names in insertion order.
    children: Vec<String>,
    child_watchers: Vec<(u64, Arc<dyn ChildListener>)>,
    value_watchers: Vec<(u64, Arc<dyn ValueListener>)>,
}

impl Entry {
    fn new(info: NodeInfo) -> Self {
        Self {
            info,
            value: None,
            action: None,
            children: Vec::new(),
            child_watchers: Vec::new(),
            value_watchers: Vec::new(),
        }
    }
}

#[derive(Default)]
struct Nodes {
    by_path: HashMap<String, Entry>,
    mounts: Vec<(String, Arc<dyn DelegateResponder>)>,
}

impl Nodes {
    fn child_watchers(&self, path: &str) -> Vec<Arc<dyn ChildListener>> {
        self.by_path
            .get(path)
            .map(|e| e.child_watchers.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    /// Paths of `path` and everything below it.
    fn subtree(&self, path: &str) -> Vec<String> {
        let mut out = vec![path.to_string()];
        let mut i = 0;
        while i < out.len() {
            if let Some(e) = self.by_path.get(&out[i]) {
                let base = out[i].clone();
                out.extend(e.children.iter().map(|c| join(&base, c)));
            }
            i += 1;
        }
        out
    }
}

pub struct MemoryTree {
    me: Weak<MemoryTree>,
    nodes: Mutex<Nodes>,
    next_watch: AtomicU64,
}

impl MemoryTree {
    /// A tree holding only the root node.
    pub fn new() -> Arc<Self> {
        let mut nodes = Nodes::default();
        nodes.by_path.insert("/".to_string(), Entry::new(NodeInfo::node()));
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            nodes: Mutex::new(nodes),
            next_watch: AtomicU64::new(1),
        })
    }

    pub fn contains(&self, path: &str) -> bool {
        lock(&self.nodes).by_path.contains_key(&normalize(path))
    }

    pub fn len(&self) -> usize {
        lock(&self.nodes).by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Building ────────────────────────────────────────────

    /// Add a node under an existing parent.
    pub fn add_node(&self, path: &str, info: NodeInfo) -> Result<(), DsError> {
        self.insert(path, Entry::new(info))
    }

    /// Add a value node. `writable` enables `set` at that level.
    pub fn add_value(
        &self,
        path: &str,
        value_type: &str,
        initial: impl Into<Value>,
        writable: Option<Permission>,
    ) -> Result<(), DsError> {
        let mut entry = Entry::new(NodeInfo {
            value_type: Some(value_type.to_string()),
            writable,
            ..NodeInfo::node()
        });
        entry.value = Some(ValueUpdate::new(initial).at(timestamp()));
        self.insert(path, entry)
    }

    /// Add an action node.
    pub fn add_action(
        &self,
        path: &str,
        invokable: Permission,
        params: Vec<Value>,
        columns: Vec<Value>,
        action: impl Fn(&Value, InvokeStream) -> Result<ActionResult, DsError> + Send + Sync + 'static,
    ) -> Result<(), DsError> {
        let mut entry = Entry::new(NodeInfo {
            invokable: Some(invokable),
            params,
            columns,
            ..NodeInfo::node()
        });
        entry.action = Some(Arc::new(action));
        self.insert(path, entry)
    }

    /// Hand the sub-tree at `path` to another responder.
    pub fn mount(&self, path: &str, responder: Arc<dyn DelegateResponder>) {
        let path = normalize(path);
        let mut nodes = lock(&self.nodes);
        nodes.mounts.retain(|(p, _)| *p != path);
        nodes.mounts.push((path, responder));
    }

    fn insert(&self, path: &str, entry: Entry) -> Result<(), DsError> {
        let path = normalize(path);
        let (parent, name) = split(&path).ok_or_else(|| DsError::not_found(&path))?;
        let summary = entry.info.summary();
        let watchers = {
            let mut nodes = lock(&self.nodes);
            if nodes.by_path.contains_key(&path) {
                return Err(DsError::new(
                    crate::error::ErrorKind::InvalidPath,
                    format!("{path} already exists"),
                ));
            }
            let Some(p) = nodes.by_path.get_mut(parent) else {
                return Err(DsError::not_found(parent));
            };
            p.children.push(name.to_string());
            nodes.by_path.insert(path.clone(), entry);
            nodes.child_watchers(parent)
        };
        debug!("TREE: added {}", path);
        for w in watchers {
            shielded("TREE child_added", || w.child_added(name, &summary));
        }
        Ok(())
    }

    /// Remove `path` and everything below it. Watchers of removed nodes are
    /// dropped.
    pub fn remove(&self, path: &str) -> bool {
        let path = normalize(path);
        let Some((parent, name)) = split(&path) else {
            return false;
        };
        let (removed, watchers) = {
            let mut nodes = lock(&self.nodes);
            if !nodes.by_path.contains_key(&path) {
                return false;
            }
            let removed: Vec<Entry> = nodes
                .subtree(&path)
                .iter()
                .filter_map(|p| nodes.by_path.remove(p))
                .collect();
            if let Some(p) = nodes.by_path.get_mut(parent) {
                p.children.retain(|c| c != name);
            }
            (removed, nodes.child_watchers(parent))
        };
        debug!("TREE: removed {} ({} nodes)", path, removed.len());
        drop(removed);
        for w in watchers {
            shielded("TREE child_removed", || w.child_removed(name));
        }
        true
    }

    /// Rename the last segment of `path`, keeping its position and sub-tree.
    pub fn rename(&self, path: &str, new_name: &str) -> Result<(), DsError> {
        let path = normalize(path);
        let (parent, name) = split(&path).ok_or_else(|| DsError::not_found(&path))?;
        let new_path = join(parent, new_name);
        let (summary, watchers) = {
            let mut nodes = lock(&self.nodes);
            if !nodes.by_path.contains_key(&path) {
                return Err(DsError::not_found(&path));
            }
            if nodes.by_path.contains_key(&new_path) {
                return Err(DsError::new(
                    crate::error::ErrorKind::InvalidPath,
                    format!("{new_path} already exists"),
                ));
            }
            for old in nodes.subtree(&path) {
                if let Some(e) = nodes.by_path.remove(&old) {
                    let moved = format!("{new_path}{}", &old[path.len()..]);
                    nodes.by_path.insert(moved, e);
                }
            }
            if let Some(p) = nodes.by_path.get_mut(parent) {
                if let Some(slot) = p.children.iter_mut().find(|c| *c == name) {
                    *slot = new_name.to_string();
                }
            }
            let summary = nodes
                .by_path
                .get(&new_path)
                .map(|e| e.info.summary())
                .unwrap_or_default();
            (summary, nodes.child_watchers(parent))
        };
        for w in watchers {
            shielded("TREE child_renamed", || {
                w.child_renamed(name, new_name, &summary);
            });
        }
        Ok(())
    }

    // ── Values ──────────────────────────────────────────────

    /// Update a value and notify subscribers. Unlike a peer `set`, no
    /// permission applies.
    pub fn update(&self, path: &str, value: impl Into<Value>) -> Result<(), DsError> {
        self.publish(&normalize(path), ValueUpdate::new(value).at(timestamp()))
    }

    pub fn value(&self, path: &str) -> Option<ValueUpdate> {
        lock(&self.nodes)
            .by_path
            .get(&normalize(path))
            .and_then(|e| e.value.clone())
    }

    fn publish(&self, path: &str, update: ValueUpdate) -> Result<(), DsError> {
        let watchers: Vec<_> = {
            let mut nodes = lock(&self.nodes);
            let entry = nodes
                .by_path
                .get_mut(path)
                .ok_or_else(|| DsError::not_found(path))?;
            entry.value = Some(update.clone());
            entry.value_watchers.iter().map(|(_, l)| l.clone()).collect()
        };
        for w in watchers {
            shielded("TREE value_changed", || w.value_changed(&update));
        }
        Ok(())
    }

    fn watch_id(&self) -> u64 {
        self.next_watch.fetch_add(1, Ordering::Relaxed)
    }

    fn unwatch(&self, path: &str, id: u64) {
        let mut nodes = lock(&self.nodes);
        if let Some(e) = nodes.by_path.get_mut(path) {
            e.child_watchers.retain(|(i, _)| *i != id);
            e.value_watchers.retain(|(i, _)| *i != id);
        }
    }

    fn guard(&self, path: &str, id: u64) -> WatchGuard {
        let tree = self.me.clone();
        let path = path.to_string();
        WatchGuard::new(move || {
            if let Some(tree) = tree.upgrade() {
                tree.unwatch(&path, id);
            }
        })
    }
}

impl NodeResolver for MemoryTree {
    fn resolve(&self, path: &str) -> Result<Resolution, DsError> {
        let path = normalize(path);
        let nodes = lock(&self.nodes);
        for (mount, responder) in &nodes.mounts {
            let inside = path == *mount || path.starts_with(&format!("{mount}/"));
            if inside {
                let remainder = normalize(&path[mount.len()..]);
                return Ok(Resolution::Delegate {
                    responder: responder.clone(),
                    remainder,
                });
            }
        }
        if !nodes.by_path.contains_key(&path) {
            return Err(DsError::not_found(&path));
        }
        let tree = self.me.upgrade().ok_or_else(DsError::disconnected)?;
        Ok(Resolution::Node(Arc::new(TreeNode { tree, path })))
    }
}

// ── Node view ────────────────────────────────────────────────

/// A handle to one path. Reads go through the tree, so a node removed
/// after resolution reports an empty container.
struct TreeNode {
    tree: Arc<MemoryTree>,
    path: String,
}

impl Node for TreeNode {
    fn info(&self) -> NodeInfo {
        lock(&self.tree.nodes)
            .by_path
            .get(&self.path)
            .map_or_else(NodeInfo::node, |e| e.info.clone())
    }

    fn children(&self) -> Vec<(String, Map)> {
        let nodes = lock(&self.tree.nodes);
        let Some(entry) = nodes.by_path.get(&self.path) else {
            return Vec::new();
        };
        entry
            .children
            .iter()
            .filter_map(|name| {
                let child = nodes.by_path.get(&join(&self.path, name))?;
                Some((name.clone(), child.info.summary()))
            })
            .collect()
    }

    fn value(&self) -> Option<ValueUpdate> {
        self.tree.value(&self.path)
    }

    fn invoke(&self, params: &Value, stream: InvokeStream) -> Result<ActionResult, DsError> {
        let action = lock(&self.tree.nodes)
            .by_path
            .get(&self.path)
            .and_then(|e| e.action.clone())
            .ok_or_else(|| DsError::not_implemented("invoke"))?;
        action(params, stream)
    }

    fn set_value(&self, value: Value) -> Result<(), DsError> {
        self.tree
            .publish(&self.path, ValueUpdate::new(value).at(timestamp()))
    }

    fn watch_children(&self, listener: Arc<dyn ChildListener>) -> Option<WatchGuard> {
        let id = self.tree.watch_id();
        lock(&self.tree.nodes)
            .by_path
            .get_mut(&self.path)?
            .child_watchers
            .push((id, listener));
        Some(self.tree.guard(&self.path, id))
    }

    fn watch_value(&self, listener: Arc<dyn ValueListener>) -> Option<WatchGuard> {
        let id = self.tree.watch_id();
        lock(&self.tree.nodes)
            .by_path
            .get_mut(&self.path)?
            .value_watchers
            .push((id, listener));
        Some(self.tree.guard(&self.path, id))
    }
}

// ── Tests ────────────────────────────────────────────────────
