//! Invoke response state machine.
//!
//! ```text
//!  Start ──result──▶ Rows ──rows exhausted──▶ Updates ──queue empty + close──▶ closed frame
//!    │                │  (yields on backpressure,       │
//!    │                │   cursor never rewinds)         │
//!    └────────────────┴──── error close ────────────────┴──▶ error frame
//! ```
//!
//! Columns go out with the first rows frame. A result that is not left
//! open closes right after its initial rows; an open one keeps accepting
//! updates through its [`InvokeStream`] until someone closes it.

use std::iter::Peekable;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::app::ports::Node;
use crate::error::{DsError, ErrorKind};
use crate::rpc::frame::{self, InvokeMode, InvokeUpdate, STREAM_CLOSED, STREAM_OPEN};
use crate::rpc::guard::{lock, shielded, shielded_call};
use crate::rpc::outbound::{OutboundEntry, ScheduleFlag, WriteContext, WriteStatus};
use crate::rpc::permission::{self, Permission};
use crate::rpc::stream::{StreamState, UpdateQueue};
use crate::rpc::value::Value;

use super::{InboundRequest, ResponderCore};

type Rows = Box<dyn Iterator<Item = Vec<Value>> + Send>;

/// What an action hands back.
pub enum ActionResult {
    /// No output; the stream closes with an empty closed frame.
    Empty,
    /// A single row.
    Row(Vec<Value>),
    /// Columns plus a row source, drained lazily. With `open` the stream
    /// stays up for updates after the rows.
    Table {
        columns: Vec<Value>,
        rows: Rows,
        open: bool,
    },
}

impl ActionResult {
    pub fn table<I>(columns: Vec<Value>, rows: I) -> Self
    where
        I: IntoIterator<Item = Vec<Value>>,
        I::IntoIter: Send + 'static,
    {
        Self::Table {
            columns,
            rows: Box::new(rows.into_iter()),
            open: false,
        }
    }

    /// No initial rows; everything arrives as updates.
    pub fn stream(columns: Vec<Value>) -> Self {
        Self::Table {
            columns,
            rows: Box::new(std::iter::empty()),
            open: true,
        }
    }

    /// Keep the stream open after the initial rows.
    pub fn keep_open(self) -> Self {
        match self {
            Self::Table { columns, rows, .. } => Self::Table {
                columns,
                rows,
                open: true,
            },
            other => other,
        }
    }
}

// ── Stream handle ────────────────────────────────────────────

/// Handle an action uses to push rows after returning.
#[derive(Clone)]
pub struct InvokeStream {
    rid: u32,
    response: Weak<InvokeResponse>,
}

impl InvokeStream {
    pub fn rid(&self) -> u32 {
        self.rid
    }

    pub fn is_open(&self) -> bool {
        self.response
            .upgrade()
            .is_some_and(|r| r.updates.is_open())
    }

    pub fn append(&self, rows: Vec<Vec<Value>>) -> bool {
        self.push(InvokeUpdate::new(InvokeMode::Append, rows))
    }

    /// Replace the requester's whole table.
    pub fn refresh(&self, rows: Vec<Vec<Value>>) -> bool {
        self.push(InvokeUpdate::new(InvokeMode::Refresh, rows))
    }

    pub fn insert(&self, at: usize, rows: Vec<Vec<Value>>) -> bool {
        self.push(InvokeUpdate::new(InvokeMode::Insert(at), rows))
    }

    /// Replace rows `start..=end`.
    pub fn replace(&self, start: usize, end: usize, rows: Vec<Vec<Value>>) -> bool {
        self.push(InvokeUpdate::new(InvokeMode::Replace(start, end), rows))
    }

    fn push(&self, update: InvokeUpdate) -> bool {
        let Some(response) = self.response.upgrade() else {
            return false;
        };
        if !response.updates.push(update) {
            return false;
        }
        response.schedule();
        true
    }

    /// Close after everything queued so far has been written.
    pub fn close(&self) {
        if let Some(response) = self.response.upgrade() {
            response.close();
        }
    }

    /// Close with an error; queued rows are dropped.
    pub fn close_with_error(&self, error: DsError) {
        if let Some(response) = self.response.upgrade() {
            response.fail(error);
        }
    }

    /// Run `f` once the stream ends, however it ends.
    pub fn on_close(&self, f: impl FnOnce() + Send + 'static) {
        if let Some(response) = self.response.upgrade() {
            *lock(&response.on_close) = Some(Box::new(f));
        }
    }
}

// ── Response ─────────────────────────────────────────────────

enum Phase {
    /// The action has not returned yet.
    Start,
    Rows,
    Updates,
}

struct Writer {
    phase: Phase,
    columns: Option<Vec<Value>>,
    rows: Option<Peekable<Rows>>,
    open: bool,
}

pub(crate) struct InvokeResponse {
    rid: u32,
    me: Weak<InvokeResponse>,
    core: Weak<ResponderCore>,
    flag: ScheduleFlag,
    writer: Mutex<Writer>,
    updates: UpdateQueue<InvokeUpdate>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// Check access, run the action, and queue its response.
pub(crate) fn open(
    core: &Arc<ResponderCore>,
    rid: u32,
    node: Arc<dyn Node>,
    request: &Value,
    granted: Permission,
) {
    let info = node.info();
    let Some(required) = info.invokable else {
        core.send(frame::error_response(
            rid,
            &DsError::new(ErrorKind::InvalidMethod, "node is not an action"),
        ));
        return;
    };
    let permit = request
        .get("permit")
        .and_then(Value::as_str)
        .and_then(Permission::parse);
    if !permission::has_permission(required, permission::effective(granted, permit)) {
        core.send(frame::error_response(rid, &DsError::permission_denied()));
        return;
    }

    let response = Arc::new_cyclic(|me| InvokeResponse {
        rid,
        me: me.clone(),
        core: Arc::downgrade(core),
        flag: ScheduleFlag::new(),
        writer: Mutex::new(Writer {
            phase: Phase::Start,
            columns: None,
            rows: None,
            open: false,
        }),
        updates: UpdateQueue::new(),
        on_close: Mutex::new(None),
    });
    if let Err(e) = core.requests.insert(rid, response.clone()) {
        warn!("RESP[{}]: {}", rid, e);
        return;
    }
    core.opened(rid, "invoke");

    let stream = InvokeStream {
        rid,
        response: Arc::downgrade(&response),
    };
    let params = request.get("params").cloned().unwrap_or_else(Value::map);
    match shielded_call(|| node.invoke(&params, stream)) {
        Ok(Ok(result)) => response.set_result(result),
        Ok(Err(e)) => response.fail(e),
        Err(panic) => {
            warn!("RESP[{}]: action panicked: {}", rid, panic);
            response.fail(DsError::server(panic));
        }
    }
}

impl InvokeResponse {
    fn schedule(&self) {
        if let (Some(me), Some(core)) = (self.me.upgrade(), self.core.upgrade()) {
            core.queue.enqueue(me);
        }
    }

    fn set_result(&self, result: ActionResult) {
        {
            let mut w = lock(&self.writer);
            let (columns, rows, open): (Option<Vec<Value>>, Rows, bool) = match result {
                ActionResult::Empty => (None, Box::new(std::iter::empty()), false),
                ActionResult::Row(row) => (None, Box::new(std::iter::once(row)), false),
                ActionResult::Table {
                    columns,
                    rows,
                    open,
                } => (Some(columns), rows, open),
            };
            w.columns = columns;
            w.rows = Some(rows.peekable());
            w.open = open;
            w.phase = Phase::Rows;
        }
        self.schedule();
    }

    fn fail(&self, error: DsError) {
        if self.updates.close_with_error(error) {
            self.schedule();
        }
    }

    /// Writer reached the closed frame, or the peer went away.
    fn finalize(&self) {
        if let Some(core) = self.core.upgrade() {
            core.release(self.rid);
        }
        let hook = lock(&self.on_close).take();
        if let Some(hook) = hook {
            shielded("RESP invoke", hook);
        }
    }

    fn write_close(&self, ctx: &mut WriteContext<'_>, reason: Option<DsError>) -> WriteStatus {
        match reason {
            Some(e) => {
                debug!("RESP[{}]: invoke failed: {}", self.rid, e);
                ctx.write_response(frame::error_response(self.rid, &e));
            }
            None => ctx.write_response(frame::closed_response(self.rid)),
        }
        self.finalize();
        WriteStatus::Done
    }

    /// Initial rows, columns first. Returns the close reason if this frame
    /// turned out to be the last one.
    fn write_rows(&self, w: &mut Writer, ctx: &mut WriteContext<'_>) -> Option<Option<DsError>> {
        let mut out = Vec::new();
        let columns = w.columns.take();
        let mut bytes = 32 + columns.as_ref().map_or(0, |c| Value::List(c.clone()).size_hint());

        let mut exhausted = true;
        if let Some(rows) = w.rows.as_mut() {
            while let Some(row) = rows.peek() {
                let size = row.iter().map(|v| v.size_hint() + 1).sum::<usize>() + 2;
                if !(out.is_empty() && ctx.is_empty()) && ctx.should_end_with(bytes + size) {
                    break;
                }
                bytes += size;
                if let Some(row) = rows.next() {
                    out.push(Value::List(row));
                }
            }
            exhausted = rows.peek().is_none();
        }

        let mut closing = None;
        if exhausted {
            w.rows = None;
            w.phase = Phase::Updates;
            if !w.open {
                self.updates.close();
            }
            closing = self.updates.take_close();
        }

        let stream = match closing {
            Some(None) => STREAM_CLOSED,
            _ => STREAM_OPEN,
        };
        if let Some(Some(e)) = &closing {
            // Failed between the check at the top of the write and now.
            ctx.write_response(frame::error_response(self.rid, e));
            return closing;
        }
        if columns.is_none() && out.is_empty() && closing.is_none() {
            return None;
        }
        let mut f = frame::response(self.rid, stream);
        if let Some(columns) = columns {
            f.insert("columns", columns);
        }
        if !out.is_empty() {
            f.insert("updates", out);
        }
        ctx.write_response(f);
        closing
    }

    /// Queued updates. Consecutive appends share a frame; every other mode
    /// gets a frame of its own.
    fn write_updates(&self, ctx: &mut WriteContext<'_>) {
        while !ctx.should_end_message() {
            let Some(first) = self.updates.pop() else {
                return;
            };
            let mut f = frame::response(self.rid, STREAM_OPEN);
            if let Some(meta) = first.mode.to_meta() {
                f.insert("meta", meta);
            }
            let batching = !first.mode.is_mode_change();
            let mut bytes = 32 + first.size_hint();
            let mut rows = first.rows;
            if batching {
                while let Some(next) = self.updates.pop_if(|u| {
                    !u.mode.is_mode_change() && !ctx.should_end_with(bytes + u.size_hint())
                }) {
                    bytes += next.size_hint();
                    rows.extend(next.rows);
                }
            }
            f.insert("updates", rows);
            ctx.write_response(f);
        }
    }
}

impl OutboundEntry for InvokeResponse {
    fn schedule_flag(&self) -> &ScheduleFlag {
        &self.flag
    }

    fn write_to(&self, ctx: &mut WriteContext<'_>) -> WriteStatus {
        if self.updates.state() == StreamState::Closed {
            return WriteStatus::Done;
        }
        if self.updates.is_failing() {
            if let Some(reason) = self.updates.take_close() {
                return self.write_close(ctx, reason);
            }
        }

        let mut w = lock(&self.writer);
        if let Phase::Start = w.phase {
            return WriteStatus::Done;
        }
        if let Phase::Rows = w.phase {
            if let Some(_reason) = self.write_rows(&mut w, ctx) {
                drop(w);
                self.finalize();
                return WriteStatus::Done;
            }
            if let Phase::Rows = w.phase {
                return WriteStatus::More;
            }
        }
        drop(w);

        self.write_updates(ctx);
        if !self.updates.is_empty() {
            return WriteStatus::More;
        }
        match self.updates.take_close() {
            Some(reason) => self.write_close(ctx, reason),
            None => WriteStatus::Done,
        }
    }
}

impl InboundRequest for InvokeResponse {
    fn close(&self) {
        if self.updates.close() {
            self.schedule();
        }
    }

    fn cancel(&self) {
        if self.updates.finish() {
            lock(&self.writer).rows = None;
            let hook = lock(&self.on_close).take();
            if let Some(hook) = hook {
                shielded("RESP invoke", hook);
            }
        }
    }
}
