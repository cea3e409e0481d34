//! Inter-thread plumbing between the I/O thread and the dispatch worker.
//!
//! Uses `embassy-sync` primitives so both sides can `.await` without a
//! full async runtime. One set of channels per connection.
//!
//! ```text
//! ┌──────────────┐   Inbound (frames, lifecycle)   ┌──────────────────┐
//! │   I/O Task   │───────────────────────────────▶│ Dispatch worker  │
//! │ read · write │                                 │ Session::process │
//! │              │◀──────── write Signal ──────────│ OutboundQueue    │
//! └──────────────┘         (queue waker)           └──────────────────┘
//! ```

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use log::warn;

/// Depth of the inbound frame channel. The read loop waits when it is
/// full, which stops reading from the socket.
pub const INBOUND_DEPTH: usize = 16;

/// Message from the I/O thread to the dispatch worker.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Transport is up.
    Connected,
    /// One complete frame payload (length prefix already stripped).
    Frame(Vec<u8>),
    /// Transport is gone. Always the last message of a connection.
    Disconnected,
}

pub struct LinkChannels {
    pub inbound: Channel<CriticalSectionRawMutex, Inbound, INBOUND_DEPTH>,
    /// Raised whenever the outbound queue has work or an ack is owed.
    pub write: Signal<CriticalSectionRawMutex, ()>,
    /// Raised to tear the connection down.
    pub stop: Signal<CriticalSectionRawMutex, ()>,
}

impl LinkChannels {
    pub const fn new() -> Self {
        Self {
            inbound: Channel::new(),
            write: Signal::new(),
            stop: Signal::new(),
        }
    }

    /// Wake the write loop.
    pub fn wake_writer(&self) {
        self.write.signal(());
    }

    pub fn request_stop(&self) {
        self.stop.signal(());
    }

    /// Non-blocking send for callers outside the executor. Returns `false`
    /// if the channel is full.
    pub fn try_push(&self, msg: Inbound) -> bool {
        if self.inbound.try_send(msg).is_err() {
            warn!("IO: inbound channel full");
            return false;
        }
        true
    }

    pub fn try_recv(&self) -> Option<Inbound> {
        self.inbound.try_receive().ok()
    }
}

impl Default for LinkChannels {
    fn default() -> Self {
        Self::new()
    }
}
