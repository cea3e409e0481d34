//! Responder-side value subscriptions, delivered on `rid 0`.
//!
//! Each SID keeps its own pending queue. QoS 0 keeps only the newest value
//! (coalescing); any higher QoS keeps every value in order. The current
//! value is queued as soon as the subscription is registered, unless a
//! newer change already got there first.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::app::ports::{NodeResolver, Resolution, ValueListener, WatchGuard};
use crate::rpc::frame::{SUBSCRIPTION_RID, ValueUpdate};
use crate::rpc::guard::lock;
use crate::rpc::outbound::{OutboundEntry, OutboundQueue, ScheduleFlag, WriteContext, WriteStatus};
use crate::rpc::value::Value;

/// Highest QoS level on the wire.
const MAX_QOS: u8 = 3;

struct Sub {
    path: String,
    qos: u8,
    /// Distinguishes this registration from an earlier one on the same SID.
    epoch: u64,
    /// Values queued since registration, listener or `push`.
    changes: u64,
    pending: VecDeque<ValueUpdate>,
    queued: bool,
    _watch: Option<WatchGuard>,
}

#[derive(Default)]
struct Inner {
    subs: HashMap<u32, Sub>,
    dirty: VecDeque<u32>,
    next_epoch: u64,
}

impl Inner {
    /// Append to the SID's queue. Returns true when the responder itself
    /// needs scheduling.
    fn queue(&mut self, sid: u32, update: ValueUpdate) -> bool {
        let Some(sub) = self.subs.get_mut(&sid) else {
            return false;
        };
        sub.changes += 1;
        if sub.qos == 0 {
            sub.pending.clear();
        }
        sub.pending.push_back(update);
        if sub.queued {
            return false;
        }
        sub.queued = true;
        self.dirty.push_back(sid);
        true
    }
}

pub struct SubscriptionResponder {
    me: Weak<SubscriptionResponder>,
    flag: ScheduleFlag,
    queue: Arc<OutboundQueue>,
    resolver: Arc<dyn NodeResolver>,
    inner: Mutex<Inner>,
}

struct ValueWatcher {
    sid: u32,
    epoch: u64,
    responder: Weak<SubscriptionResponder>,
}

impl ValueListener for ValueWatcher {
    fn value_changed(&self, update: &ValueUpdate) {
        if let Some(r) = self.responder.upgrade() {
            r.changed(self.sid, self.epoch, update.clone());
        }
    }
}

impl SubscriptionResponder {
    pub fn new(queue: Arc<OutboundQueue>, resolver: Arc<dyn NodeResolver>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            flag: ScheduleFlag::new(),
            queue,
            resolver,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn schedule(&self) {
        if let Some(me) = self.me.upgrade() {
            self.queue.enqueue(me);
        }
    }

    /// Register `{path, sid, qos}` entries. Re-subscribing a SID replaces
    /// it. A path that does not resolve gets a null value with status
    /// `unknown`.
    ///
    /// The SID is registered before the watch and the value read, so a
    /// change racing the read is never lost; the value read is only queued
    /// if no change arrived in the meantime.
    pub fn subscribe(&self, entries: &[Value]) {
        for entry in entries {
            let path = entry.get("path").and_then(Value::as_str);
            let sid = entry.get("sid").and_then(Value::as_u32);
            let (Some(path), Some(sid)) = (path, sid) else {
                warn!("SUB: malformed subscribe entry {}", entry);
                continue;
            };
            let qos = entry
                .get("qos")
                .and_then(Value::as_u32)
                .map_or(0, |q| q.min(u32::from(MAX_QOS)) as u8);

            let (epoch, replaced) = {
                let mut inner = lock(&self.inner);
                inner.next_epoch += 1;
                let epoch = inner.next_epoch;
                // A replaced SID may still sit in `dirty`.
                let queued = inner.subs.get(&sid).is_some_and(|s| s.queued);
                let replaced = inner.subs.insert(
                    sid,
                    Sub {
                        path: path.to_string(),
                        qos,
                        epoch,
                        changes: 0,
                        pending: VecDeque::new(),
                        queued,
                        _watch: None,
                    },
                );
                (epoch, replaced)
            };
            // Dropped outside the lock: cancelling a watch may call back
            // into the tree.
            drop(replaced);

            let (watch, current) = match self.resolver.resolve(path) {
                Ok(Resolution::Node(node)) => {
                    let watcher = Arc::new(ValueWatcher {
                        sid,
                        epoch,
                        responder: self.me.clone(),
                    });
                    let watch = node.watch_value(watcher);
                    (watch, node.value())
                }
                Ok(Resolution::Delegate { .. }) | Err(_) => {
                    debug!("SUB[{}]: {} does not resolve", sid, path);
                    (None, Some(ValueUpdate::new(Value::Null).with_status("unknown")))
                }
            };

            let (orphan, schedule) = {
                let mut inner = lock(&self.inner);
                match inner.subs.get_mut(&sid) {
                    Some(sub) if sub.epoch == epoch => {
                        sub._watch = watch;
                        let fresh = sub.changes == 0;
                        let schedule = match current {
                            Some(update) if fresh => inner.queue(sid, update),
                            _ => false,
                        };
                        (None, schedule)
                    }
                    // Unsubscribed or replaced while resolving.
                    _ => (watch, false),
                }
            };
            drop(orphan);
            if schedule {
                self.schedule();
            }
        }
    }

    pub fn unsubscribe(&self, sids: &[Value]) {
        let removed: Vec<Sub> = {
            let mut inner = lock(&self.inner);
            sids.iter()
                .filter_map(Value::as_u32)
                .filter_map(|sid| inner.subs.remove(&sid))
                .collect()
        };
        for sub in &removed {
            debug!("SUB: unsubscribed {}", sub.path);
        }
    }

    /// Queue a value for `sid`. Unknown SIDs are ignored.
    pub fn push(&self, sid: u32, update: ValueUpdate) {
        let schedule = lock(&self.inner).queue(sid, update);
        if schedule {
            self.schedule();
        }
    }

    /// A watched node changed. Watches left over from an earlier
    /// registration of the same SID are ignored.
    fn changed(&self, sid: u32, epoch: u64, update: ValueUpdate) {
        let schedule = {
            let mut inner = lock(&self.inner);
            if inner.subs.get(&sid).is_none_or(|s| s.epoch != epoch) {
                return;
            }
            inner.queue(sid, update)
        };
        if schedule {
            self.schedule();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn on_disconnect(&self) -> usize {
        let subs: Vec<Sub> = {
            let mut inner = lock(&self.inner);
            inner.dirty.clear();
            inner.subs.drain().map(|(_, s)| s).collect()
        };
        subs.len()
    }
}

impl OutboundEntry for SubscriptionResponder {
    fn schedule_flag(&self) -> &ScheduleFlag {
        &self.flag
    }

    fn write_to(&self, ctx: &mut WriteContext<'_>) -> WriteStatus {
        let mut inner = lock(&self.inner);
        let inner = &mut *inner;
        let mut rows = Vec::new();
        let mut bytes = 24;

        'sids: while let Some(sid) = inner.dirty.pop_front() {
            let Some(sub) = inner.subs.get_mut(&sid) else {
                continue;
            };
            while let Some(update) = sub.pending.front() {
                let row = update.to_row(sid);
                let size = row.size_hint() + 1;
                if !(rows.is_empty() && ctx.is_empty()) && ctx.should_end_with(bytes + size) {
                    inner.dirty.push_front(sid);
                    break 'sids;
                }
                bytes += size;
                rows.push(row);
                sub.pending.pop_front();
            }
            sub.queued = false;
        }

        if !rows.is_empty() {
            ctx.write_response(
                Value::map()
                    .with("rid", SUBSCRIPTION_RID)
                    .with("updates", rows),
            );
        }
        if inner.dirty.is_empty() {
            WriteStatus::Done
        } else {
            WriteStatus::More
        }
    }
}
