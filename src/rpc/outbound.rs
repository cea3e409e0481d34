//! Outbound multiplexer shared by the requester and responder sides.
//!
//! ```text
//!  stub / response / subscription table
//!        │ enqueue (at most once, ScheduleFlag CAS)
//!        ▼
//!  ┌──────────────┐   drain(ctx)    ┌──────────────┐
//!  │ OutboundQueue│────────────────▶│ WriteContext │──▶ one envelope
//!  │  FIFO of     │◀────────────────│ (budgeted)   │
//!  │  entries     │  WriteStatus::More re-enqueues  └──────────────┘
//!  └──────────────┘
//! ```
//!
//! An entry writes whole frames only. Backpressure is consulted between
//! units of work (rows, list children, subscription entries), never in the
//! middle of a frame, so a message never carries a half-written frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::guard::lock;
use super::value::Value;

/// Per-entry "already in the queue" flag.
#[derive(Debug, Default)]
pub struct ScheduleFlag(AtomicBool);

impl ScheduleFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claim the scheduled slot. `false` means the entry is already queued.
    pub fn try_schedule(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_scheduled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of one `write_to` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Nothing left to send until new work arrives.
    Done,
    /// Yielded on backpressure; put the entry back in the queue.
    More,
}

/// Anything that produces framed output on demand.
pub trait OutboundEntry: Send + Sync {
    fn schedule_flag(&self) -> &ScheduleFlag;

    /// Write as many complete frames as the context allows.
    fn write_to(&self, ctx: &mut WriteContext<'_>) -> WriteStatus;
}

/// The message currently being assembled, plus the transport's
/// should-end-message budget.
pub struct WriteContext<'a> {
    requests: Vec<Value>,
    responses: Vec<Value>,
    bytes: usize,
    should_end: &'a dyn Fn(usize, usize) -> bool,
}

impl<'a> WriteContext<'a> {
    /// `should_end(bytes, frames)` is the transport's budget check.
    pub fn new(should_end: &'a dyn Fn(usize, usize) -> bool) -> Self {
        Self {
            requests: Vec::new(),
            responses: Vec::new(),
            bytes: 0,
            should_end,
        }
    }

    pub fn frames(&self) -> usize {
        self.requests.len() + self.responses.len()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    /// Whether the message is full. An empty message never is.
    pub fn should_end_message(&self) -> bool {
        self.should_end_with(0)
    }

    /// Whether `pending` more bytes (an in-progress frame) would overflow
    /// the message.
    pub fn should_end_with(&self, pending: usize) -> bool {
        if self.is_empty() && pending == 0 {
            return false;
        }
        (self.should_end)(self.bytes + pending, self.frames())
    }

    pub fn write_request(&mut self, frame: Value) {
        self.bytes += frame.size_hint();
        self.requests.push(frame);
    }

    pub fn write_response(&mut self, frame: Value) {
        self.bytes += frame.size_hint();
        self.responses.push(frame);
    }

    pub fn requests(&self) -> &[Value] {
        &self.requests
    }

    pub fn responses(&self) -> &[Value] {
        &self.responses
    }

    pub fn into_parts(self) -> (Vec<Value>, Vec<Value>) {
        (self.requests, self.responses)
    }
}

/// Which envelope array a frame belongs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// A single prebuilt frame (close request, ack, one-shot error).
pub struct FrameEntry {
    flag: ScheduleFlag,
    direction: Direction,
    frame: Mutex<Option<Value>>,
}

impl FrameEntry {
    pub fn new(direction: Direction, frame: Value) -> Arc<Self> {
        Arc::new(Self {
            flag: ScheduleFlag::new(),
            direction,
            frame: Mutex::new(Some(frame)),
        })
    }

    pub fn request(frame: Value) -> Arc<Self> {
        Self::new(Direction::Request, frame)
    }

    pub fn response(frame: Value) -> Arc<Self> {
        Self::new(Direction::Response, frame)
    }
}

impl OutboundEntry for FrameEntry {
    fn schedule_flag(&self) -> &ScheduleFlag {
        &self.flag
    }

    fn write_to(&self, ctx: &mut WriteContext<'_>) -> WriteStatus {
        if let Some(frame) = lock(&self.frame).take() {
            match self.direction {
                Direction::Request => ctx.write_request(frame),
                Direction::Response => ctx.write_response(frame),
            }
        }
        WriteStatus::Done
    }
}

type Waker = Arc<dyn Fn() + Send + Sync>;

/// FIFO of entries with pending output.
#[derive(Default)]
pub struct OutboundQueue {
    entries: Mutex<VecDeque<Arc<dyn OutboundEntry>>>,
    waker: Mutex<Option<Waker>>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the callback run after every successful enqueue (the I/O
    /// task's write signal).
    pub fn set_waker(&self, waker: Option<Waker>) {
        *lock(&self.waker) = waker;
    }

    /// Schedule `entry`. Idempotent: an entry already waiting is not added
    /// twice. Returns whether it was newly queued.
    pub fn enqueue(&self, entry: Arc<dyn OutboundEntry>) -> bool {
        if !entry.schedule_flag().try_schedule() {
            return false;
        }
        lock(&self.entries).push_back(entry);
        self.wake();
        true
    }

    /// Run the waker without queueing anything (an ack is owed).
    pub fn wake(&self) {
        let waker = lock(&self.waker).clone();
        if let Some(wake) = waker {
            wake();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Give each entry that was queued when the drain started one chance to
    /// write into `ctx`, stopping early once the message is full. Entries
    /// reporting [`WriteStatus::More`] go to the back of the queue.
    ///
    /// Returns the number of entries that wrote.
    pub fn drain(&self, ctx: &mut WriteContext<'_>) -> usize {
        let mut remaining = self.len();
        let mut served = 0;

        while remaining > 0 && !ctx.should_end_message() {
            let Some(entry) = lock(&self.entries).pop_front() else {
                break;
            };
            remaining -= 1;
            served += 1;

            // Cleared before writing so work produced during the write
            // reschedules the entry.
            entry.schedule_flag().clear();
            if entry.write_to(ctx) == WriteStatus::More {
                self.requeue(entry);
            }
        }

        served
    }

    fn requeue(&self, entry: Arc<dyn OutboundEntry>) {
        if entry.schedule_flag().try_schedule() {
            lock(&self.entries).push_back(entry);
        }
    }

    /// Drop every queued entry (disconnect).
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.entries).drain(..).collect();
        for entry in drained {
            entry.schedule_flag().clear();
        }
    }
}

// ── Tests ────────────────────────────────────────────────────
