//! Link lifecycle events.
//!
//! The [`Session`](crate::rpc::session::Session) emits these through the
//! [`EventSink`](super::ports::EventSink) port. Adapters on the other
//! side decide what to do with them: log them, count them, forward them.

/// Which side of the link a request belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Issued by this link.
    Requester,
    /// Received from the peer.
    Responder,
}

/// Structured events emitted by the session engine.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// The transport is up and the session is accepting traffic.
    Connected,

    /// The transport went away; every open request and subscription was
    /// notified.
    Disconnected { requests: usize, subscriptions: usize },

    /// A request entered a request table.
    RequestOpened { side: Side, rid: u32, method: &'static str },

    /// A request left its table.
    RequestClosed { side: Side, rid: u32 },
}
