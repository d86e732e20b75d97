//! I/O helpers for environments: processes, ports, settings and lock files.

pub mod config;
pub mod ports;
pub mod process;
pub mod repo_lock;
