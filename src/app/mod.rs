//! Application layer — everything around the session engine that is not
//! protocol plumbing.
//!
//! The responder reaches the node tree only through the **port traits**
//! in [`ports`]; [`tree::MemoryTree`] is the in-memory implementation and
//! [`service::Link`] the façade that ties a tree, a session and a transport
//! together.

pub mod events;
pub mod ports;
pub mod service;
pub mod tree;
