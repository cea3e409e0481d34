//! DSLink session engine library.
//!
//! Link side of the DSA protocol: a requester and a responder sharing one
//! transport, with request/response correlation, streaming invoke and list
//! responses, and fan-in/fan-out value subscriptions.
//!
//! The binary (`src/main.rs`) serves a small [`app::tree::MemoryTree`];
//! everything here is usable on its own with any [`rpc::transport::Transport`].

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod config;
pub mod error;
pub mod rpc;

pub use app::service::Link;
pub use config::LinkConfig;
pub use error::{DsError, Error, ErrorKind, Result};
pub use rpc::session::{Session, SessionOptions};
pub use rpc::value::Value;
