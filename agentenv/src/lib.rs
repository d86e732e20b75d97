//! Isolated execution environments for concurrently running agents.
//!
//! Each agent gets an [`Environment`](environment::Environment) backed either
//! by a container snapshot or by the local host. Every command and file
//! mutation is recorded in an append-only notes log, and cross-process
//! repository locks keep agents sharing one repository from corrupting it.
//!
//! - **[`core`]**: Pure, deterministic logic (env pairs, line ranges, match
//!   resolution, diffs). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting helpers (processes, ports, settings, lock files).
//! - **[`environment`]**: Lifecycle, file mutation, execution strategies and
//!   the environment registry.
//! - **[`runtime`]**: The container engine contract consumed in container mode.

pub mod cancel;
pub mod core;
pub mod environment;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod runtime;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
