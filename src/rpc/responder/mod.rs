//! Responder side: serving the peer's requests against the local tree.
//!
//! ```text
//!  transport ──requests──▶ Responder::process_request
//!                              │ resolve(path)
//!        ┌─────────────┬───────┴──────┬──────────────┬───────────────┐
//!        ▼             ▼              ▼              ▼               ▼
//!   InvokeResponse ListResponse   set (one-shot) SubscriptionResp. DelegateReply
//!        │             │                             │ rid 0           │
//!        └─────────────┴──────────▶ OutboundQueue ◀──┴─────────────────┘
//! ```
//!
//! Streaming responses live in the request table until they write their
//! closed frame, the peer closes them, or the link drops.

pub mod invoke;
pub mod list;
pub mod set;
pub mod subscribe;

use std::sync::{Arc, Weak};

use log::{debug, warn};

use crate::app::events::{LinkEvent, Side};
use crate::app::ports::{DelegateResponder, EventSink, NodeResolver, Resolution};
use crate::error::{DsError, ErrorKind};

use super::frame::{self, closed_response, error_response};
use super::guard::shielded;
use super::outbound::{FrameEntry, OutboundQueue};
use super::permission::Permission;
use super::request_table::RequestTable;
use super::value::Value;

pub use invoke::{ActionResult, InvokeStream};
pub use subscribe::SubscriptionResponder;

/// An inbound request that outlives its first frame.
pub(crate) trait InboundRequest: Send + Sync {
    /// Flushing close requested by the local side.
    fn close(&self);

    /// The peer closed it or the link dropped. No frame goes out.
    fn cancel(&self);
}

/// State shared by the responder and every live response.
pub(crate) struct ResponderCore {
    pub(crate) queue: Arc<OutboundQueue>,
    pub(crate) requests: RequestTable<dyn InboundRequest>,
    events: Arc<dyn EventSink>,
}

impl ResponderCore {
    pub(crate) fn send(&self, frame: Value) {
        self.queue.enqueue(FrameEntry::response(frame));
    }

    pub(crate) fn opened(&self, rid: u32, method: &'static str) {
        self.events.emit(&LinkEvent::RequestOpened {
            side: Side::Responder,
            rid,
            method,
        });
    }

    /// Drop the table entry once the closed frame has been written.
    pub(crate) fn release(&self, rid: u32) {
        if self.requests.remove(rid).is_some() {
            self.events.emit(&LinkEvent::RequestClosed {
                side: Side::Responder,
                rid,
            });
        }
    }
}

pub struct Responder {
    core: Arc<ResponderCore>,
    resolver: Arc<dyn NodeResolver>,
    /// Level granted to the peer.
    permission: Permission,
    subscriptions: Arc<SubscriptionResponder>,
}

impl Responder {
    pub fn new(
        queue: Arc<OutboundQueue>,
        resolver: Arc<dyn NodeResolver>,
        permission: Permission,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let subscriptions = SubscriptionResponder::new(queue.clone(), resolver.clone());
        Self {
            core: Arc::new(ResponderCore {
                queue,
                requests: RequestTable::new(),
                events,
            }),
            resolver,
            permission,
            subscriptions,
        }
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionResponder> {
        &self.subscriptions
    }

    pub fn open_requests(&self) -> usize {
        self.core.requests.len()
    }

    /// Close a streaming response from this side. Queued updates are
    /// written before the closed frame.
    pub fn close_stream(&self, rid: u32) {
        if let Some(request) = self.core.requests.lookup(rid) {
            request.close();
        }
    }

    /// Handle one request frame.
    pub fn process_request(&self, request: &Value) {
        let rid = match frame::rid_of(request) {
            Ok(rid) => rid,
            Err(e) => {
                warn!("RESP: dropping request: {}", e);
                return;
            }
        };
        let Some(method) = request.get("method").and_then(Value::as_str) else {
            self.core.send(error_response(
                rid,
                &DsError::new(ErrorKind::InvalidMethod, "missing method"),
            ));
            return;
        };
        debug!("RESP[{}]: {}", rid, method);

        match method {
            "close" => self.cancel(rid),
            "subscribe" => {
                let paths = request.get("paths").and_then(Value::as_list).unwrap_or(&[]);
                self.subscriptions.subscribe(paths);
                self.core.send(closed_response(rid));
            }
            "unsubscribe" => {
                let sids = request.get("sids").and_then(Value::as_list).unwrap_or(&[]);
                self.subscriptions.unsubscribe(sids);
                self.core.send(closed_response(rid));
            }
            "list" => self.route(rid, "list", request),
            "invoke" => self.route(rid, "invoke", request),
            "set" => self.route(rid, "set", request),
            other => {
                warn!("RESP[{}]: unknown method {}", rid, other);
                self.core.send(error_response(
                    rid,
                    &DsError::new(ErrorKind::InvalidMethod, format!("unknown method {other}")),
                ));
            }
        }
    }

    fn route(&self, rid: u32, method: &'static str, request: &Value) {
        if self.core.requests.contains(rid) {
            warn!("RESP[{}]: rid already open, ignoring {}", rid, method);
            return;
        }
        let Some(path) = request.get("path").and_then(Value::as_str) else {
            self.core.send(error_response(
                rid,
                &DsError::new(ErrorKind::InvalidPath, "missing path"),
            ));
            return;
        };

        match self.resolver.resolve(path) {
            Err(e) => self.core.send(error_response(rid, &e)),
            Ok(Resolution::Delegate {
                responder,
                remainder,
            }) => self.forward(rid, method, request, responder, &remainder),
            Ok(Resolution::Node(node)) => match method {
                "list" => list::open(&self.core, rid, node),
                "invoke" => invoke::open(&self.core, rid, node, request, self.permission),
                _ => set::handle(&self.core, rid, node.as_ref(), request, self.permission),
            },
        }
    }

    fn forward(
        &self,
        rid: u32,
        method: &'static str,
        request: &Value,
        responder: Arc<dyn DelegateResponder>,
        remainder: &str,
    ) {
        let entry = Arc::new(Delegated {
            rid,
            responder: responder.clone(),
        });
        if self.core.requests.insert(rid, entry).is_err() {
            return;
        }
        self.core.opened(rid, method);
        let mut forwarded = request.clone();
        forwarded.insert("path", remainder);
        let reply = DelegateReply {
            rid,
            core: Arc::downgrade(&self.core),
        };
        shielded("RESP delegate", || responder.forward(&forwarded, reply));
    }

    /// End `rid` with `error` in place of whatever it would have written
    /// next. Open responses are cancelled first.
    pub fn abort(&self, rid: u32, error: &DsError) {
        self.cancel(rid);
        self.core.send(error_response(rid, error));
    }

    /// Peer-initiated close.
    fn cancel(&self, rid: u32) {
        if let Some(request) = self.core.requests.remove(rid) {
            request.cancel();
            self.core.events.emit(&LinkEvent::RequestClosed {
                side: Side::Responder,
                rid,
            });
        }
    }

    /// Cancel every open response and subscription. Returns
    /// `(responses, subscriptions)` that were live.
    pub fn on_disconnect(&self) -> (usize, usize) {
        let requests = self.core.requests.drain_all();
        for request in &requests {
            request.cancel();
        }
        (requests.len(), self.subscriptions.on_disconnect())
    }
}

// ── Delegation ───────────────────────────────────────────────

struct Delegated {
    rid: u32,
    responder: Arc<dyn DelegateResponder>,
}

impl InboundRequest for Delegated {
    fn close(&self) {
        self.responder.close(self.rid);
    }

    fn cancel(&self) {
        shielded("RESP delegate", || self.responder.close(self.rid));
    }
}

/// Sends response frames for a forwarded request.
#[derive(Clone)]
pub struct DelegateReply {
    rid: u32,
    core: Weak<ResponderCore>,
}

impl DelegateReply {
    pub fn rid(&self) -> u32 {
        self.rid
    }

    /// Send a response frame; `rid` is filled in. A frame with
    /// `stream: "closed"` ends the request. Returns `false` once the
    /// request is gone.
    pub fn send(&self, mut frame: Value) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        if !core.requests.contains(self.rid) {
            return false;
        }
        frame.insert("rid", self.rid);
        let closed = frame::is_closed(&frame);
        core.send(frame);
        if closed {
            core.release(self.rid);
        }
        true
    }
}
