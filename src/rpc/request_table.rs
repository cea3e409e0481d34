//! RID → live request map.
//!
//! Used on both sides of the link: the requester stores its outbound stubs,
//! the responder its inbound responses. RIDs are allocated upward from 1 and
//! wrap from `i32::MAX` back to 1; an id still in use is skipped, so an open
//! request is never shadowed. RID 0 belongs to subscription delivery and is
//! never handed out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{ProtocolError, Result};

use super::guard::lock;

/// Largest id handed out before wrapping.
pub const MAX_ID: u32 = i32::MAX as u32;

/// Next id after `id`, wrapping to 1 and never yielding 0.
pub fn next_id(id: u32) -> u32 {
    if id >= MAX_ID { 1 } else { id + 1 }
}

struct Inner<T: ?Sized> {
    entries: HashMap<u32, Arc<T>>,
    last_rid: u32,
}

pub struct RequestTable<T: ?Sized> {
    inner: Mutex<Inner<T>>,
}

impl<T: ?Sized> Default for RequestTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> RequestTable<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last_rid: 0,
            }),
        }
    }

    /// Allocate a fresh RID and register the entry built for it, as one
    /// step, so no other caller can observe the id unregistered. `erase`
    /// turns the concrete entry into the table's entry type; the concrete
    /// handle is returned.
    pub fn allocate<E: ?Sized>(
        &self,
        make: impl FnOnce(u32) -> Arc<E>,
        erase: impl FnOnce(Arc<E>) -> Arc<T>,
    ) -> Arc<E> {
        let mut inner = lock(&self.inner);
        let mut rid = next_id(inner.last_rid);
        while inner.entries.contains_key(&rid) {
            rid = next_id(rid);
        }
        inner.last_rid = rid;
        let entry = make(rid);
        inner.entries.insert(rid, erase(entry.clone()));
        entry
    }

    /// Register an entry under a peer-chosen RID (responder side).
    pub fn insert(&self, rid: u32, entry: Arc<T>) -> Result<()> {
        let mut inner = lock(&self.inner);
        if rid == 0 {
            return Err(ProtocolError::InvalidField("rid").into());
        }
        if inner.entries.contains_key(&rid) {
            return Err(ProtocolError::DuplicateRid(rid).into());
        }
        inner.entries.insert(rid, entry);
        Ok(())
    }

    pub fn lookup(&self, rid: u32) -> Option<Arc<T>> {
        lock(&self.inner).entries.get(&rid).cloned()
    }

    /// Remove and return the entry. Only the first caller gets it.
    pub fn remove(&self, rid: u32) -> Option<Arc<T>> {
        lock(&self.inner).entries.remove(&rid)
    }

    pub fn contains(&self, rid: u32) -> bool {
        lock(&self.inner).entries.contains_key(&rid)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).entries.is_empty()
    }

    /// Empty the table, returning every entry in RID order (disconnect).
    pub fn drain_all(&self) -> Vec<Arc<T>> {
        let mut entries: Vec<_> = lock(&self.inner).entries.drain().collect();
        entries.sort_unstable_by_key(|(rid, _)| *rid);
        entries.into_iter().map(|(_, e)| e).collect()
    }

    #[cfg(test)]
    fn set_last_rid(&self, rid: u32) {
        lock(&self.inner).last_rid = rid;
    }
}
