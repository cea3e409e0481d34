//! Per-stream update queue with a two-phase close.
//!
//! ```text
//!   push ──▶ Open ──close()──▶ ClosePending ──queue drained──▶ Closed
//!             │                     │                             ▲
//!             └──close_with_error()─┴── queue discarded ──────────┘
//! ```
//!
//! A plain close keeps every queued update and only lets the writer emit
//! the terminal frame once the queue is empty. An error close discards the
//! queue and overrides a pending plain close. Once `Closed`, pushes are
//! refused.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::error::DsError;

use super::guard::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    ClosePending,
    Closed,
}

struct Inner<U> {
    state: StreamState,
    updates: VecDeque<U>,
    reason: Option<DsError>,
}

/// FIFO of pending updates guarded by its own lock, so independent
/// streams never contend.
pub struct UpdateQueue<U> {
    inner: Mutex<Inner<U>>,
}

impl<U> Default for UpdateQueue<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U> UpdateQueue<U> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StreamState::Open,
                updates: VecDeque::new(),
                reason: None,
            }),
        }
    }

    pub fn state(&self) -> StreamState {
        lock(&self.inner).state
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// Queue an update. Refused once a close has been requested.
    pub fn push(&self, update: U) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != StreamState::Open {
            return false;
        }
        inner.updates.push_back(update);
        true
    }

    pub fn pop(&self) -> Option<U> {
        lock(&self.inner).updates.pop_front()
    }

    /// Pop the head only if `accept` says it belongs to the current batch.
    pub fn pop_if(&self, accept: impl FnOnce(&U) -> bool) -> Option<U> {
        let mut inner = lock(&self.inner);
        if inner.updates.front().is_some_and(accept) {
            inner.updates.pop_front()
        } else {
            None
        }
    }

    /// Put an update back at the head (the writer ran out of budget after
    /// popping it).
    pub fn unpop(&self, update: U) {
        let mut inner = lock(&self.inner);
        if inner.state != StreamState::Closed {
            inner.updates.push_front(update);
        }
    }

    /// An error close is waiting to be written.
    pub fn is_failing(&self) -> bool {
        let inner = lock(&self.inner);
        inner.state == StreamState::ClosePending && inner.reason.is_some()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).updates.len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.inner).updates.is_empty()
    }

    /// Request a flushing close. Returns `true` if this call moved the
    /// stream out of `Open`.
    pub fn close(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state != StreamState::Open {
            return false;
        }
        inner.state = StreamState::ClosePending;
        true
    }

    /// Request an error close: queued updates are dropped and the error
    /// frame goes out next. Wins over a pending plain close.
    pub fn close_with_error(&self, error: DsError) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == StreamState::Closed || inner.reason.is_some() {
            return false;
        }
        inner.state = StreamState::ClosePending;
        inner.updates.clear();
        inner.reason = Some(error);
        true
    }

    /// Writer side: if a close is pending and nothing is left to flush,
    /// move to `Closed` and hand back the close reason. Returns `Some` at
    /// most once per stream.
    pub fn take_close(&self) -> Option<Option<DsError>> {
        let mut inner = lock(&self.inner);
        if inner.state != StreamState::ClosePending || !inner.updates.is_empty() {
            return None;
        }
        inner.state = StreamState::Closed;
        Some(inner.reason.take())
    }

    /// Close without a terminal frame (peer closed, or disconnect).
    /// Returns `false` if already closed.
    pub fn finish(&self) -> bool {
        let mut inner = lock(&self.inner);
        if inner.state == StreamState::Closed {
            return false;
        }
        inner.state = StreamState::Closed;
        inner.updates.clear();
        inner.reason = None;
        true
    }
}
