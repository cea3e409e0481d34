//! One link session: the requester and responder halves sharing a single
//! outbound queue and message sink.
//!
//! ```text
//!   incoming envelope                         outgoing envelope
//!  {msg, ack, requests, responses}           {msg, ack?, requests?, responses?}
//!         │                                          ▲
//!         ▼ process_incoming                          │ next_message / flush
//!  ┌─────────────────────────────────────────────────┴───────┐
//!  │ Session                                                  │
//!  │   requests  ──▶ Responder ──┐                            │
//!  │   responses ──▶ Requester ──┼──▶ OutboundQueue ──drain──▶│ MessageSink
//!  │   msg       ──▶ ack owed ───┘   (wake)                   │
//!  └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every outbound envelope carrying frames is numbered from 1. The highest
//! `msg` received since the last send is acknowledged in the next envelope;
//! if nothing else is pending the session emits an ack-only envelope, which
//! carries no `msg` and so is never acknowledged itself.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};

use crate::app::events::LinkEvent;
use crate::app::ports::{EventSink, NodeResolver};
use crate::error::{DsError, Error, ProtocolError, Result, TransportError};

use super::frame::{self, SUBSCRIPTION_RID, error_response};
use super::guard::lock;
use super::outbound::{FrameEntry, OutboundEntry, OutboundQueue, WriteContext};
use super::permission::Permission;
use super::requester::Requester;
use super::responder::Responder;
use super::transport::MessageSink;
use super::value::Value;

/// Which halves a session runs and what the peer may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub requester: bool,
    pub responder: bool,
    /// Level granted to the remote requester.
    pub peer_permission: Permission,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            requester: true,
            responder: true,
            peer_permission: Permission::Config,
        }
    }
}

pub struct Session {
    queue: Arc<OutboundQueue>,
    sink: Arc<dyn MessageSink>,
    requester: Option<Arc<Requester>>,
    responder: Option<Responder>,
    events: Arc<dyn EventSink>,
    /// Last outbound message id.
    msg_id: AtomicU32,
    /// Highest inbound `msg` not yet acknowledged.
    ack_owed: Mutex<Option<u32>>,
    connected: AtomicBool,
    /// Serializes envelope assembly so message ids go out in order.
    writing: Mutex<()>,
}

impl Session {
    pub fn new(
        options: SessionOptions,
        resolver: Arc<dyn NodeResolver>,
        sink: Arc<dyn MessageSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let queue = Arc::new(OutboundQueue::new());
        let requester = options
            .requester
            .then(|| Requester::new(queue.clone(), events.clone()));
        let responder = options.responder.then(|| {
            Responder::new(
                queue.clone(),
                resolver,
                options.peer_permission,
                events.clone(),
            )
        });
        Self {
            queue,
            sink,
            requester,
            responder,
            events,
            msg_id: AtomicU32::new(0),
            ack_owed: Mutex::new(None),
            connected: AtomicBool::new(false),
            writing: Mutex::new(()),
        }
    }

    pub fn queue(&self) -> &Arc<OutboundQueue> {
        &self.queue
    }

    pub fn requester(&self) -> Option<&Arc<Requester>> {
        self.requester.as_ref()
    }

    pub fn responder(&self) -> Option<&Responder> {
        self.responder.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Id of the last numbered envelope handed to the sink (0 before the
    /// first).
    pub fn last_msg_id(&self) -> u32 {
        self.msg_id.load(Ordering::Acquire)
    }

    pub fn pending_ack(&self) -> Option<u32> {
        *lock(&self.ack_owed)
    }

    /// Schedule an entry for output. No-op if it is already queued.
    pub fn enqueue(&self, entry: Arc<dyn OutboundEntry>) -> bool {
        self.queue.enqueue(entry)
    }

    /// Backpressure poll, delegated to the sink.
    pub fn should_end_message(&self, bytes: usize, frames: usize) -> bool {
        self.sink.should_end_message(bytes, frames)
    }

    // ── Inbound ─────────────────────────────────────────────

    /// Route one decoded envelope. Malformed frames inside a well-formed
    /// envelope are logged and skipped; only a non-map envelope is an
    /// error.
    pub fn process_incoming(&self, envelope: &Value) -> Result<()> {
        if envelope.as_map().is_none() {
            return Err(ProtocolError::MalformedEnvelope.into());
        }

        if let Some(msg) = envelope.get("msg").and_then(Value::as_u32) {
            {
                let mut owed = lock(&self.ack_owed);
                *owed = Some(owed.map_or(msg, |prev| prev.max(msg)));
            }
            self.queue.wake();
        }
        if let Some(ack) = envelope.get("ack").and_then(Value::as_u32) {
            debug!("SESSION: peer acked {}", ack);
        }

        if let Some(requests) = envelope.get("requests").and_then(Value::as_list) {
            for request in requests {
                self.route_request(request);
            }
        }
        if let Some(responses) = envelope.get("responses").and_then(Value::as_list) {
            for response in responses {
                match &self.requester {
                    Some(requester) => requester.process_response(response),
                    None => debug!("SESSION: requester disabled, dropping response"),
                }
            }
        }
        Ok(())
    }

    fn route_request(&self, request: &Value) {
        if let Some(responder) = &self.responder {
            responder.process_request(request);
            return;
        }
        let Ok(rid) = frame::rid_of(request) else {
            return;
        };
        if request.get("method").and_then(Value::as_str) == Some("close") {
            return;
        }
        warn!("SESSION: responder disabled, rejecting rid {}", rid);
        self.queue.enqueue(FrameEntry::response(error_response(
            rid,
            &DsError::not_implemented("responder"),
        )));
    }

    // ── Outbound ────────────────────────────────────────────

    /// Assemble and send at most one envelope (more if an oversized one
    /// had to be split). Returns whether any frames were drained; an
    /// ack-only envelope reports `false`.
    pub fn next_message(&self) -> Result<bool> {
        let _writing = lock(&self.writing);

        let sink = self.sink.clone();
        let should_end = move |bytes: usize, frames: usize| sink.should_end_message(bytes, frames);
        let mut ctx = WriteContext::new(&should_end);
        self.queue.drain(&mut ctx);
        let (requests, responses) = ctx.into_parts();

        let ack = lock(&self.ack_owed).take();
        if requests.is_empty() && responses.is_empty() {
            if let Some(ack) = ack {
                debug!("SESSION: ack-only {}", ack);
                self.sink.send(&Value::map().with("ack", ack))?;
            }
            return Ok(false);
        }

        self.send_envelope(ack, requests, responses)?;
        Ok(true)
    }

    /// Send frames as one numbered envelope. When the sink rejects it as
    /// too large the frames are split across two envelopes; a lone frame
    /// that still does not fit fails its own request, not the link.
    fn send_envelope(
        &self,
        ack: Option<u32>,
        requests: Vec<Value>,
        responses: Vec<Value>,
    ) -> Result<()> {
        let msg = self.msg_id.load(Ordering::Acquire) + 1;
        let mut envelope = Value::map().with("msg", msg);
        if let Some(ack) = ack {
            envelope.insert("ack", ack);
        }
        let frames = requests.len() + responses.len();
        if !requests.is_empty() {
            envelope.insert("requests", requests);
        }
        if !responses.is_empty() {
            envelope.insert("responses", responses);
        }

        match self.sink.send(&envelope) {
            Ok(()) => {
                self.msg_id.store(msg, Ordering::Release);
                debug!("SESSION: sent msg {} ({} frames)", msg, frames);
                Ok(())
            }
            Err(Error::Transport(TransportError::FrameTooLarge(len))) => {
                let mut requests = take_list(&mut envelope, "requests");
                let mut responses = take_list(&mut envelope, "responses");
                if frames > 1 {
                    debug!("SESSION: msg {} is {} bytes, splitting", msg, len);
                    let half = frames / 2;
                    let (tail_requests, tail_responses) = if half < requests.len() {
                        (requests.split_off(half), std::mem::take(&mut responses))
                    } else {
                        (Vec::new(), responses.split_off(half - requests.len()))
                    };
                    self.send_envelope(ack, requests, responses)?;
                    return self.send_envelope(None, tail_requests, tail_responses);
                }

                let error = DsError::server(format!("frame of {len} bytes exceeds the link limit"));
                if let Some(request) = requests.pop() {
                    self.reject_request(&request, &error);
                } else if let Some(response) = responses.pop() {
                    self.reject_response(&response, &error);
                }
                // The ack still has to go out.
                if let Some(ack) = ack {
                    let mut owed = lock(&self.ack_owed);
                    *owed = Some(owed.map_or(ack, |a| a.max(ack)));
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn reject_request(&self, request: &Value, error: &DsError) {
        let Ok(rid) = frame::rid_of(request) else {
            return;
        };
        warn!("REQ[{}]: request too large to send: {}", rid, error.msg);
        if let Some(requester) = &self.requester {
            requester.fail_request(rid, error);
        }
    }

    fn reject_response(&self, response: &Value, error: &DsError) {
        let Ok(rid) = frame::rid_of(response) else {
            return;
        };
        if rid == SUBSCRIPTION_RID {
            warn!("SUB: dropping update frame: {}", error.msg);
            return;
        }
        warn!("RESP[{}]: response too large to send: {}", rid, error.msg);
        match &self.responder {
            Some(responder) => responder.abort(rid, error),
            None => {
                self.queue
                    .enqueue(FrameEntry::response(error_response(rid, error)));
            }
        }
    }

    /// Send envelopes until the queue has nothing more to write. Returns
    /// how many rounds had frames to send.
    pub fn flush(&self) -> Result<usize> {
        let mut sent = 0;
        while self.next_message()? {
            sent += 1;
        }
        Ok(sent)
    }

    // ── Lifecycle ───────────────────────────────────────────

    pub fn on_connect(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!("SESSION: connected");
            self.events.emit(&LinkEvent::Connected);
            self.queue.wake();
        }
    }

    /// Fail every open request, drop every subscription and discard queued
    /// output. Safe to call more than once.
    pub fn on_disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);

        let (mut requests, mut subscriptions) = self
            .requester
            .as_ref()
            .map_or((0, 0), |r| r.on_disconnect());
        if let Some(responder) = &self.responder {
            let (responses, served) = responder.on_disconnect();
            requests += responses;
            subscriptions += served;
        }
        self.queue.clear();
        *lock(&self.ack_owed) = None;

        if was_connected || requests > 0 || subscriptions > 0 {
            info!(
                "SESSION: disconnected ({} requests, {} subscriptions swept)",
                requests, subscriptions
            );
            self.events.emit(&LinkEvent::Disconnected {
                requests,
                subscriptions,
            });
        }
    }
}

fn take_list(envelope: &mut Value, key: &str) -> Vec<Value> {
    match envelope.remove(key) {
        Some(Value::List(frames)) => frames,
        _ => Vec::new(),
    }
}

// ── Tests ────────────────────────────────────────────────────
