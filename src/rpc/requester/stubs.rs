//! Outbound request stubs.
//!
//! A stub is both the table entry that receives responses for its RID and
//! the outbound entry that writes the request frame. It is also the handle
//! the application keeps to close the request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use crate::error::DsError;
use crate::rpc::frame::{InvokeMode, InvokeUpdate, ListUpdate};
use crate::rpc::guard::{CloseOnce, lock, shielded};
use crate::rpc::outbound::{OutboundEntry, ScheduleFlag, WriteContext, WriteStatus};
use crate::rpc::value::Value;

use super::Requester;
use super::handlers::{InvokeHandler, ListHandler, RequestHandler};

pub(crate) enum StubKind {
    Invoke(Arc<dyn InvokeHandler>),
    List {
        handler: Arc<dyn ListHandler>,
        initialized: AtomicBool,
    },
    Set(Arc<dyn RequestHandler>),
    /// Subscribe/unsubscribe acknowledgement; nobody is listening.
    Ack,
}

pub struct RequestStub {
    rid: u32,
    method: &'static str,
    flag: ScheduleFlag,
    request: Mutex<Option<Value>>,
    closed: CloseOnce,
    kind: StubKind,
    requester: Weak<Requester>,
}

impl RequestStub {
    pub(crate) fn new(
        rid: u32,
        method: &'static str,
        request: Option<Value>,
        kind: StubKind,
        requester: Weak<Requester>,
    ) -> Arc<Self> {
        Arc::new(Self {
            rid,
            method,
            flag: ScheduleFlag::new(),
            request: Mutex::new(request),
            closed: CloseOnce::new(),
            kind,
            requester,
        })
    }

    pub(crate) fn ack(rid: u32, method: &'static str) -> Arc<Self> {
        Self::new(rid, method, None, StubKind::Ack, Weak::new())
    }

    pub fn rid(&self) -> u32 {
        self.rid
    }

    pub fn method(&self) -> &'static str {
        self.method
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    /// Close locally: the peer gets a close frame and the handler's
    /// `on_close` runs, unless the peer closed first.
    pub fn close(&self) {
        if let Some(requester) = self.requester.upgrade() {
            requester.close_request(self.rid);
        }
    }

    /// Route one response frame to the handler.
    pub(crate) fn on_response(&self, frame: &Value) {
        if self.closed.is_closed() {
            return;
        }
        let error = frame.get("error").map(DsError::from_value);

        match &self.kind {
            StubKind::Invoke(handler) => {
                if let Some(columns) = frame.get("columns").and_then(Value::as_list) {
                    shielded("REQ invoke", || handler.on_columns(columns));
                }
                let mode = InvokeMode::from_meta(frame.get("meta"));
                let rows = frame.get("updates").and_then(Value::as_list).unwrap_or(&[]);
                if !rows.is_empty() || mode.is_mode_change() {
                    let update = InvokeUpdate {
                        mode,
                        rows: rows.to_vec(),
                    };
                    shielded("REQ invoke", || handler.on_update(&update));
                }
                if let Some(e) = &error {
                    shielded("REQ invoke", || handler.on_error(e));
                }
            }
            StubKind::List {
                handler,
                initialized,
            } => {
                for row in frame.get("updates").and_then(Value::as_list).unwrap_or(&[]) {
                    match ListUpdate::from_row(row) {
                        Ok(update) => shielded("REQ list", || handler.on_update(&update)),
                        Err(e) => warn!("REQ[{}]: bad list row: {}", self.rid, e),
                    }
                }
                if let Some(e) = &error {
                    shielded("REQ list", || handler.on_error(e));
                }
                if !initialized.swap(true, Ordering::AcqRel) {
                    shielded("REQ list", || handler.on_initialized());
                }
            }
            StubKind::Set(handler) => {
                if let Some(e) = &error {
                    shielded("REQ set", || handler.on_error(e));
                }
            }
            StubKind::Ack => {
                if let Some(e) = &error {
                    warn!("REQ[{}]: {} rejected: {}", self.rid, self.method, e);
                }
            }
        }
    }

    /// Deliver an error that did not come from the peer (disconnect).
    pub(crate) fn fail(&self, error: &DsError) {
        if self.closed.is_closed() {
            return;
        }
        match &self.kind {
            StubKind::Invoke(h) => shielded("REQ", || h.on_error(error)),
            StubKind::List { handler, .. } => shielded("REQ", || handler.on_error(error)),
            StubKind::Set(h) => shielded("REQ", || h.on_error(error)),
            StubKind::Ack => {}
        }
    }

    /// Terminal notification. Only the first call has any effect. Returns
    /// `false` if the request frame never went out.
    pub(crate) fn finish(&self) -> bool {
        if !self.closed.close() {
            return true;
        }
        debug!("REQ[{}]: {} closed", self.rid, self.method);
        let sent = lock(&self.request).take().is_none();
        match &self.kind {
            StubKind::Invoke(h) => shielded("REQ", || h.on_close()),
            StubKind::List { handler, .. } => shielded("REQ", || handler.on_close()),
            StubKind::Set(h) => shielded("REQ", || h.on_close()),
            StubKind::Ack => {}
        }
        sent
    }
}

impl OutboundEntry for RequestStub {
    fn schedule_flag(&self) -> &ScheduleFlag {
        &self.flag
    }

    fn write_to(&self, ctx: &mut WriteContext<'_>) -> WriteStatus {
        if let Some(frame) = lock(&self.request).take() {
            ctx.write_request(frame);
        }
        WriteStatus::Done
    }
}
