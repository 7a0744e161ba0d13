//! Foundational low-level utilities shared across Latch crates.
//!
//! Provides the atomic file-write helper used when trust and policy files are
//! edited, and the timestamp helper used to stamp diagnostics.

pub mod atomic_io;
pub mod time_utils;

pub use atomic_io::write_text_atomic;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
