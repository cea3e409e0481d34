//! Callback traits for requester-side consumers.
//!
//! Every call is made from the dispatch thread and wrapped so a panic is
//! logged and swallowed. Implementations should hand long work off to
//! their own worker instead of blocking.

use crate::error::DsError;
use crate::rpc::frame::{InvokeUpdate, ListUpdate, ValueUpdate};
use crate::rpc::value::Value;

/// Common to every request kind.
pub trait RequestHandler: Send + Sync {
    /// The peer reported an error. Closing is signalled separately.
    fn on_error(&self, _error: &DsError) {}

    /// The request is finished. Called exactly once.
    fn on_close(&self) {}
}

pub trait InvokeHandler: RequestHandler {
    fn on_columns(&self, _columns: &[Value]) {}

    fn on_update(&self, update: &InvokeUpdate);
}

pub trait ListHandler: RequestHandler {
    fn on_update(&self, update: &ListUpdate);

    /// The first response, carrying the initial metadata and children,
    /// has been delivered.
    fn on_initialized(&self) {}
}

/// Consumer of one local subscription.
pub trait SubscriptionHandler: Send + Sync {
    fn on_update(&self, update: &ValueUpdate);

    /// The subscription ended (local unsubscribe or disconnect).
    fn on_close(&self) {}
}

/// Handler for requests whose outcome is only success or error (set).
pub struct IgnoreResult;

impl RequestHandler for IgnoreResult {}
