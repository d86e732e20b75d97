//! Stable exit codes for the `agentenv` binary.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid arguments, config, or a failed build or command.
pub const INVALID: i32 = 1;
/// `agentenv lock` could not acquire the lock before its deadline.
pub const LOCK_TIMEOUT: i32 = 3;
