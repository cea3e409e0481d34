//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing link events through the `log`
//! facade. A metrics or UI adapter would implement the same trait.

use log::{debug, info};

use crate::app::events::{LinkEvent, Side};
use crate::app::ports::EventSink;

/// Adapter that logs every [`LinkEvent`].
#[derive(Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

fn side_tag(side: Side) -> &'static str {
    match side {
        Side::Requester => "REQ",
        Side::Responder => "RESP",
    }
}

impl EventSink for LogEventSink {
    fn emit(&self, event: &LinkEvent) {
        match event {
            LinkEvent::Connected => {
                info!("LINK | connected");
            }
            LinkEvent::Disconnected {
                requests,
                subscriptions,
            } => {
                info!(
                    "LINK | disconnected, closed {} request(s) and {} subscription(s)",
                    requests, subscriptions
                );
            }
            LinkEvent::RequestOpened { side, rid, method } => {
                debug!("{}[{}]: {} opened", side_tag(*side), rid, method);
            }
            LinkEvent::RequestClosed { side, rid } => {
                debug!("{}[{}]: closed", side_tag(*side), rid);
            }
        }
    }
}
