//! List response state machine.
//!
//! ```text
//!  Init ──metadata──▶ Children ──snapshot exhausted──▶ Updates ──close──▶ closed frame
//! ```
//!
//! The child watch is registered before the snapshot is taken, so a change
//! racing the snapshot shows up as an update instead of being lost. The
//! watch is torn down before the entry leaves the request table.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::app::ports::{ChildListener, Node, WatchGuard};
use crate::rpc::frame::{self, ListUpdate, STREAM_CLOSED, STREAM_OPEN};
use crate::rpc::guard::lock;
use crate::rpc::outbound::{OutboundEntry, ScheduleFlag, WriteContext, WriteStatus};
use crate::rpc::stream::{StreamState, UpdateQueue};
use crate::rpc::value::{Map, Value};

use super::{InboundRequest, ResponderCore};

enum Phase {
    Init,
    Children,
    Updates,
}

struct Writer {
    phase: Phase,
    snapshot: VecDeque<ListUpdate>,
}

pub(crate) struct ListResponse {
    rid: u32,
    me: Weak<ListResponse>,
    core: Weak<ResponderCore>,
    flag: ScheduleFlag,
    node: Arc<dyn Node>,
    writer: Mutex<Writer>,
    updates: UpdateQueue<ListUpdate>,
    watch: Mutex<Option<WatchGuard>>,
}

pub(crate) fn open(core: &Arc<ResponderCore>, rid: u32, node: Arc<dyn Node>) {
    let response = Arc::new_cyclic(|me| ListResponse {
        rid,
        me: me.clone(),
        core: Arc::downgrade(core),
        flag: ScheduleFlag::new(),
        node,
        writer: Mutex::new(Writer {
            phase: Phase::Init,
            snapshot: VecDeque::new(),
        }),
        updates: UpdateQueue::new(),
        watch: Mutex::new(None),
    });
    if let Err(e) = core.requests.insert(rid, response.clone()) {
        warn!("RESP[{}]: {}", rid, e);
        return;
    }
    core.opened(rid, "list");

    let watcher = Arc::new(ChildWatcher {
        response: Arc::downgrade(&response),
    });
    let guard = response.node.watch_children(watcher);
    *lock(&response.watch) = guard;
    response.schedule();
}

struct ChildWatcher {
    response: Weak<ListResponse>,
}

impl ChildWatcher {
    fn push(&self, update: ListUpdate) {
        if let Some(response) = self.response.upgrade() {
            if response.updates.push(update) {
                response.schedule();
            }
        }
    }
}

impl ChildListener for ChildWatcher {
    fn child_added(&self, name: &str, summary: &Map) {
        self.push(ListUpdate::Child {
            name: name.to_string(),
            summary: Value::Map(summary.clone()),
        });
    }

    fn child_removed(&self, name: &str) {
        self.push(ListUpdate::Removed {
            name: name.to_string(),
        });
    }
}

impl ListResponse {
    fn schedule(&self) {
        if let (Some(me), Some(core)) = (self.me.upgrade(), self.core.upgrade()) {
            core.queue.enqueue(me);
        }
    }

    fn unwatch(&self) {
        let guard = lock(&self.watch).take();
        drop(guard);
    }

    fn finalize(&self) {
        self.unwatch();
        if let Some(core) = self.core.upgrade() {
            core.release(self.rid);
        }
    }

    fn snapshot(&self) -> VecDeque<ListUpdate> {
        let mut rows = VecDeque::new();
        for row in self.node.info().to_rows() {
            if let Ok(update) = ListUpdate::from_row(&row) {
                rows.push_back(update);
            }
        }
        for (name, summary) in self.node.children() {
            rows.push_back(ListUpdate::Child {
                name,
                summary: Value::Map(summary),
            });
        }
        rows
    }
}

impl OutboundEntry for ListResponse {
    fn schedule_flag(&self) -> &ScheduleFlag {
        &self.flag
    }

    fn write_to(&self, ctx: &mut WriteContext<'_>) -> WriteStatus {
        if self.updates.state() == StreamState::Closed {
            return WriteStatus::Done;
        }
        if self.updates.is_failing() {
            if let Some(Some(e)) = self.updates.take_close() {
                debug!("RESP[{}]: list failed: {}", self.rid, e);
                ctx.write_response(frame::error_response(self.rid, &e));
                self.finalize();
            }
            return WriteStatus::Done;
        }

        let mut w = lock(&self.writer);
        if let Phase::Init = w.phase {
            w.snapshot = self.snapshot();
            w.phase = Phase::Children;
        }

        let mut rows = Vec::new();
        let mut bytes = 32;
        let fits = |rows: &Vec<Value>, bytes: usize, ctx: &WriteContext<'_>| {
            (rows.is_empty() && ctx.is_empty()) || !ctx.should_end_with(bytes)
        };

        if let Phase::Children = w.phase {
            while let Some(next) = w.snapshot.front() {
                let row = next.to_row();
                let size = row.size_hint() + 1;
                if !fits(&rows, bytes + size, &*ctx) {
                    break;
                }
                bytes += size;
                rows.push(row);
                w.snapshot.pop_front();
            }
            if w.snapshot.is_empty() {
                w.phase = Phase::Updates;
            }
        }
        let in_updates = matches!(w.phase, Phase::Updates);
        drop(w);

        let mut closing = None;
        if in_updates {
            while let Some(update) = self.updates.pop_if(|u| {
                let size = u.to_row().size_hint() + 1;
                fits(&rows, bytes + size, &*ctx)
            }) {
                let row = update.to_row();
                bytes += row.size_hint() + 1;
                rows.push(row);
            }
            if self.updates.is_empty() {
                closing = self.updates.take_close();
            }
        }

        match closing {
            Some(Some(e)) => {
                ctx.write_response(frame::error_response(self.rid, &e));
                self.finalize();
                return WriteStatus::Done;
            }
            Some(None) => {
                let mut f = frame::response(self.rid, STREAM_CLOSED);
                if !rows.is_empty() {
                    f.insert("updates", rows);
                }
                ctx.write_response(f);
                self.finalize();
                return WriteStatus::Done;
            }
            None => {}
        }

        if !rows.is_empty() {
            ctx.write_response(frame::response(self.rid, STREAM_OPEN).with("updates", rows));
        }
        if !in_updates || !self.updates.is_empty() {
            WriteStatus::More
        } else {
            WriteStatus::Done
        }
    }
}

impl InboundRequest for ListResponse {
    fn close(&self) {
        if self.updates.close() {
            self.schedule();
        }
    }

    fn cancel(&self) {
        if self.updates.finish() {
            self.unwatch();
        }
    }
}
