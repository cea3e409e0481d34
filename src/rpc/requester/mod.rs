//! Requester side: operations this link issues against the peer's tree.
//!
//! ```text
//!  app ──invoke/list/set──▶ RequestStub ──▶ RequestTable (rid)
//!   │                           │ enqueue
//!   └──subscribe──▶ SubscriptionTable ──▶ OutboundQueue ──▶ transport
//!
//!  transport ──responses──▶ process_response
//!        rid 0  ──▶ SubscriptionTable::dispatch
//!        rid n  ──▶ stub.on_response (+ finish on stream: closed)
//!        unknown rid, still open ──▶ close frame
//! ```

pub mod handlers;
pub mod stubs;
pub mod subscriptions;

use std::sync::{Arc, Weak};

use log::{debug, warn};

use crate::app::events::{LinkEvent, Side};
use crate::app::ports::EventSink;
use crate::error::DsError;

use super::frame::{self, SUBSCRIPTION_RID};
use super::outbound::{FrameEntry, OutboundQueue};
use super::permission::Permission;
use super::request_table::RequestTable;
use super::value::Value;

pub use handlers::{
    IgnoreResult, InvokeHandler, ListHandler, RequestHandler, SubscriptionHandler,
};
pub use stubs::RequestStub;
pub use subscriptions::{GroupSnapshot, GroupState, Subscription, SubscriptionTable};

use stubs::StubKind;

pub struct Requester {
    me: Weak<Requester>,
    queue: Arc<OutboundQueue>,
    requests: Arc<RequestTable<RequestStub>>,
    subscriptions: Arc<SubscriptionTable>,
    events: Arc<dyn EventSink>,
}

impl Requester {
    pub fn new(queue: Arc<OutboundQueue>, events: Arc<dyn EventSink>) -> Arc<Self> {
        let requests = Arc::new(RequestTable::new());
        let subscriptions = SubscriptionTable::new(queue.clone(), requests.clone());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            queue,
            requests,
            subscriptions,
            events,
        })
    }

    fn open(
        &self,
        method: &'static str,
        build: impl FnOnce(Value) -> Value,
        kind: StubKind,
    ) -> Arc<RequestStub> {
        let me = self.me.clone();
        let stub = self.requests.allocate(
            |rid| RequestStub::new(rid, method, Some(build(frame::request(rid, method))), kind, me),
            |s| s,
        );
        debug!("REQ[{}]: {}", stub.rid(), method);
        self.events.emit(&LinkEvent::RequestOpened {
            side: Side::Requester,
            rid: stub.rid(),
            method,
        });
        self.queue.enqueue(stub.clone());
        stub
    }

    /// Invoke the action at `path`. `permit` caps the permission the peer
    /// should apply to this call.
    pub fn invoke(
        &self,
        path: &str,
        params: Value,
        permit: Option<Permission>,
        handler: Arc<dyn InvokeHandler>,
    ) -> Arc<RequestStub> {
        self.open(
            "invoke",
            |f| {
                let f = f.with("path", path).with("params", params);
                match permit {
                    Some(p) => f.with("permit", p.as_str()),
                    None => f,
                }
            },
            StubKind::Invoke(handler),
        )
    }

    /// Stream the metadata and children of `path`.
    pub fn list(&self, path: &str, handler: Arc<dyn ListHandler>) -> Arc<RequestStub> {
        self.open(
            "list",
            |f| f.with("path", path),
            StubKind::List {
                handler,
                initialized: Default::default(),
            },
        )
    }

    pub fn set(
        &self,
        path: &str,
        value: Value,
        permit: Option<Permission>,
        handler: Arc<dyn RequestHandler>,
    ) -> Arc<RequestStub> {
        self.open(
            "set",
            |f| {
                let f = f.with("path", path).with("value", value);
                match permit {
                    Some(p) => f.with("permit", p.as_str()),
                    None => f,
                }
            },
            StubKind::Set(handler),
        )
    }

    pub fn subscribe(
        &self,
        path: &str,
        qos: u8,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Subscription {
        self.subscriptions.subscribe(path, qos, handler)
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionTable> {
        &self.subscriptions
    }

    pub fn open_requests(&self) -> usize {
        self.requests.len()
    }

    /// Local close. Whoever removes the entry first (this, or a closed
    /// response from the peer) runs `on_close`.
    pub fn close_request(&self, rid: u32) {
        let Some(stub) = self.requests.remove(rid) else {
            return;
        };
        if stub.finish() {
            self.queue.enqueue(FrameEntry::request(frame::close_request(rid)));
        }
        self.events.emit(&LinkEvent::RequestClosed {
            side: Side::Requester,
            rid,
        });
    }

    /// Fail one request without involving the peer: its handler sees
    /// `error`, then `on_close`.
    pub fn fail_request(&self, rid: u32, error: &DsError) {
        let Some(stub) = self.requests.remove(rid) else {
            return;
        };
        stub.fail(error);
        stub.finish();
        self.events.emit(&LinkEvent::RequestClosed {
            side: Side::Requester,
            rid,
        });
    }

    /// Route one response frame.
    pub fn process_response(&self, response: &Value) {
        let rid = match frame::rid_of(response) {
            Ok(rid) => rid,
            Err(e) => {
                warn!("REQ: dropping response: {}", e);
                return;
            }
        };

        if rid == SUBSCRIPTION_RID {
            if let Some(rows) = response.get("updates").and_then(Value::as_list) {
                self.subscriptions.dispatch(rows);
            }
            return;
        }

        let closed = frame::is_closed(response);
        let Some(stub) = self.requests.lookup(rid) else {
            if !closed {
                warn!("REQ[{}]: response for unknown request, closing", rid);
                self.queue.enqueue(FrameEntry::request(frame::close_request(rid)));
            }
            return;
        };

        stub.on_response(response);
        if closed && self.requests.remove(rid).is_some() {
            stub.finish();
            self.events.emit(&LinkEvent::RequestClosed {
                side: Side::Requester,
                rid,
            });
        }
    }

    /// Fail and close every open request and subscription. Returns
    /// `(requests, subscriptions)` that were live.
    pub fn on_disconnect(&self) -> (usize, usize) {
        let stubs = self.requests.drain_all();
        let error = DsError::disconnected();
        for stub in &stubs {
            stub.fail(&error);
            stub.finish();
        }
        let groups = self.subscriptions.on_disconnect();
        (stubs.len(), groups)
    }
}
