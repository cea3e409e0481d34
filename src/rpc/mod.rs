//! Link protocol engine.
//!
//! Multiplexes many concurrent requests, streaming responses and value
//! subscriptions over one transport.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                        Session                                 │
//! │                                                                │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────────────────────┐  │
//! │  │ Transport │──▶│  Codec   │──▶│ process_incoming         │  │
//! │  │ (trait)   │   │ (framing)│   │  requests  → Responder   │  │
//! │  └───────────┘   └──────────┘   │  responses → Requester   │  │
//! │       ▲                         └────────────┬─────────────┘  │
//! │       │                                      ▼                │
//! │  ┌───────────┐   ┌──────────┐   ┌──────────────────────────┐  │
//! │  │ Transport │◀──│ Framed   │◀──│ OutboundQueue            │  │
//! │  │ (write)   │   │ Sink     │   │  stubs · responses · subs│  │
//! │  └───────────┘   └──────────┘   └──────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────┘
//! ```

pub mod channels;
pub mod codec;
pub mod frame;
pub mod guard;
pub mod io_task;
pub mod outbound;
pub mod permission;
pub mod request_table;
pub mod requester;
pub mod responder;
pub mod session;
pub mod stream;
pub mod transport;
pub mod value;
