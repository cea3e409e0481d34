//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises one part of the session
//! against in-memory peers. Nothing touches the network: envelopes are
//! handed from one session to the other directly.

mod concurrency_tests;
mod invoke_tests;
mod session_tests;
mod subscription_tests;
