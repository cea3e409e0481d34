//! Exactly-once close flags and panic isolation for application callbacks.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::warn;

/// Open→closed transition that only one caller can win.
#[derive(Debug, Default)]
pub struct CloseOnce(AtomicBool);

impl CloseOnce {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns `true` for exactly one caller; later calls are no-ops.
    pub fn close(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Run an application callback; a panic is logged and swallowed so it
/// never unwinds into the dispatch loop.
pub fn shielded(what: &str, f: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        warn!("{what}: callback panicked: {}", panic_message(&*payload));
    }
}

/// Like [`shielded`] but keeps the callback's return value. The panic
/// message is returned as the error so callers can surface it.
pub fn shielded_call<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload))
}

/// Lock a mutex, recovering the data if a previous holder panicked.
/// Application callbacks never run under these locks, so the protected
/// state is consistent even then.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
