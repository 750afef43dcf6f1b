//! External process invocation
//!
//! Runs the mining binary (or any executable) with captured output, an
//! optional timeout and an optional cancellation signal.

mod runner;

pub use runner::{CapturedOutput, ProcessOutput, ProcessRunner, ProcessSpec, MAX_CAPTURE_BYTES};
