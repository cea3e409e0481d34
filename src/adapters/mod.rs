//! Adapters — concrete implementations of the port traits.
//!
//! | Adapter    | Implements  | Connects to            |
//! |------------|-------------|------------------------|
//! | `log_sink` | EventSink   | `log` facade           |
//! | `tcp`      | Transport   | non-blocking TCP socket |

pub mod log_sink;
pub mod tcp;
