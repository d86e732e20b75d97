//! Container runtime abstraction.
//!
//! The [`ContainerRuntime`] trait is everything the container strategy needs
//! from the engine that actually pulls images and executes layers. Snapshots
//! are immutable: every `with_*` call returns a new [`SnapshotId`] and leaves
//! its input untouched, so a failed step never disturbs the snapshot an
//! environment currently points at. Tests use a scripted in-memory runtime.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::error::{Cancelled, EnvError};

/// Runtime-issued reference to an immutable container state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runtime-issued handle of a running service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceId(pub String);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Directory tree materialized into a snapshot during a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTree {
    /// A directory on the invoking host.
    HostDir(PathBuf),
    /// A directory inside an existing snapshot.
    Snapshot { snapshot: SnapshotId, path: String },
    /// Nothing to materialize.
    Empty,
}

/// Process to execute inside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecRequest {
    /// Argument vector. Empty runs the image's default command.
    pub args: Vec<String>,
    /// Prefix `args` with the image entrypoint.
    pub use_entrypoint: bool,
}

impl ExecRequest {
    /// `shell -c command`, or the default command when `command` is empty.
    pub fn shell(shell: &str, command: &str, use_entrypoint: bool) -> Self {
        let args = if command.is_empty() {
            Vec::new()
        } else {
            vec![shell.to_string(), "-c".to_string(), command.to_string()]
        };
        Self {
            args,
            use_entrypoint,
        }
    }
}

/// Result of running a process to completion. A non-zero `exit_code` is a
/// normal outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutcome {
    /// State after the process ran, including its side effects.
    pub snapshot: SnapshotId,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A process exited non-zero where success was required (service start).
    #[error("command failed with exit code {exit_code}.\nstdout: {stdout}\nstderr: {stderr}")]
    Exec {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// A deadline derived from the caller's token passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

impl From<RuntimeError> for EnvError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Cancelled | RuntimeError::DeadlineExceeded => {
                EnvError::Infra(anyhow::Error::new(Cancelled))
            }
            RuntimeError::Other(err) => EnvError::Infra(err),
            exec @ RuntimeError::Exec { .. } => EnvError::Infra(anyhow::Error::new(exec)),
        }
    }
}

/// Capabilities consumed from the container engine.
pub trait ContainerRuntime: Send + Sync {
    fn from_image(&self, image: &str) -> RuntimeResult<SnapshotId>;

    fn with_workdir(&self, snapshot: &SnapshotId, workdir: &str) -> RuntimeResult<SnapshotId>;

    fn with_env(&self, snapshot: &SnapshotId, key: &str, value: &str)
    -> RuntimeResult<SnapshotId>;

    /// Inject a secret value. Runtimes must not persist it in the snapshot's
    /// inspectable metadata.
    fn with_secret(
        &self,
        snapshot: &SnapshotId,
        key: &str,
        value: &str,
    ) -> RuntimeResult<SnapshotId>;

    fn with_exposed_port(&self, snapshot: &SnapshotId, port: u16) -> RuntimeResult<SnapshotId>;

    /// Overlay `source` at `path` (relative paths resolve against the workdir).
    fn with_directory(
        &self,
        snapshot: &SnapshotId,
        path: &str,
        source: &SourceTree,
    ) -> RuntimeResult<SnapshotId>;

    /// Make `service` reachable from the snapshot under `alias`.
    fn with_service_binding(
        &self,
        snapshot: &SnapshotId,
        alias: &str,
        service: &ServiceId,
    ) -> RuntimeResult<SnapshotId>;

    fn with_new_file(
        &self,
        snapshot: &SnapshotId,
        path: &str,
        contents: &str,
    ) -> RuntimeResult<SnapshotId>;

    fn without_file(&self, snapshot: &SnapshotId, path: &str) -> RuntimeResult<SnapshotId>;

    /// Apply a unified diff to the directory `dir`.
    fn with_patch(&self, snapshot: &SnapshotId, dir: &str, patch: &str)
    -> RuntimeResult<SnapshotId>;

    /// Run a process to completion, whatever its exit code.
    fn exec(
        &self,
        snapshot: &SnapshotId,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> RuntimeResult<ExecOutcome>;

    /// Start `request` as a long-running service, returning once it is up.
    ///
    /// Returns [`RuntimeError::DeadlineExceeded`] when `cancel` expires first and
    /// [`RuntimeError::Exec`] when the process exits during startup.
    fn start_service(
        &self,
        snapshot: &SnapshotId,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> RuntimeResult<ServiceId>;

    fn stop_service(&self, service: &ServiceId) -> RuntimeResult<()>;

    /// Address of `port` as seen from other snapshots.
    fn service_endpoint(&self, service: &ServiceId, port: u16) -> RuntimeResult<String>;

    /// Forward `port` to the operator's machine and return the reachable address.
    fn tunnel(&self, service: &ServiceId, port: u16) -> RuntimeResult<String>;

    fn read_file(&self, snapshot: &SnapshotId, path: &str) -> RuntimeResult<String>;

    fn list_entries(&self, snapshot: &SnapshotId, path: &str) -> RuntimeResult<Vec<String>>;

    /// Force evaluation and return an addressable reference for the snapshot.
    fn sync(&self, snapshot: &SnapshotId) -> RuntimeResult<SnapshotId>;

    /// Push the snapshot to `target` and return its content reference.
    fn publish(&self, snapshot: &SnapshotId, target: &str) -> RuntimeResult<String>;

    /// Attach an interactive session running `command`.
    fn terminal(&self, snapshot: &SnapshotId, command: &[String]) -> RuntimeResult<()>;
}
