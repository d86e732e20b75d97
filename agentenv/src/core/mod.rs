//! Deterministic, pure logic shared by the environment layer.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! strings and return deterministic outputs suitable for tests.

pub mod env_pairs;
pub mod line_range;
pub mod output;
pub mod patch;
pub mod search_replace;
pub mod terminal;
