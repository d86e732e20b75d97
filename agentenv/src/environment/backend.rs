//! Execution strategies behind an [`Environment`](super::Environment).
//!
//! A strategy is picked once, from the config's base image, when the
//! environment is created or loaded. The environment owns locking, notes on
//! file mutations and snapshot replacement; strategies only perform effects.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::environment::config::EnvironmentConfig;
use crate::environment::container::ContainerBackend;
use crate::environment::host::HostBackend;
use crate::environment::notes::Notes;
use crate::environment::state::{BoundService, EndpointMappings, EnvironmentState, SnapshotRef};
use crate::error::{EnvError, EnvResult, ExecutionMode};
use crate::io::config::Settings;
use crate::runtime::{ContainerRuntime, SourceTree};

/// A command to run in the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub shell: String,
    pub use_entrypoint: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            shell: "sh".to_string(),
            use_entrypoint: false,
        }
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn use_entrypoint(mut self, use_entrypoint: bool) -> Self {
        self.use_entrypoint = use_entrypoint;
        self
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub snapshot: SnapshotRef,
    pub services: Vec<BoundService>,
}

/// Result of a foreground command.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// State to adopt; includes the command's side effects even on non-zero exit.
    pub snapshot: SnapshotRef,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

pub trait Backend: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Run the full build sequence for `config`, recording every command in
    /// `notes`. Nothing built is kept on failure.
    fn build(
        &self,
        config: &EnvironmentConfig,
        source: &SourceTree,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<BuildOutput>;

    /// Run one command to completion and record it in `notes`.
    fn run(
        &self,
        state: &EnvironmentState,
        spec: &CommandSpec,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<RunOutput>;

    /// Start a long-lived process, track it in `state` and return once started.
    fn run_background(
        &self,
        state: &mut EnvironmentState,
        spec: &CommandSpec,
        ports: &[u16],
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<EndpointMappings>;

    fn kill_background(
        &self,
        state: &mut EnvironmentState,
        pid: u32,
        notes: &Notes,
    ) -> EnvResult<()>;

    fn terminal(&self, snapshot: &SnapshotRef) -> EnvResult<()>;

    fn checkpoint(&self, snapshot: &SnapshotRef, target: &str) -> EnvResult<String>;

    fn read_file(&self, state: &EnvironmentState, path: &str) -> EnvResult<String>;

    fn write_file(
        &self,
        state: &EnvironmentState,
        path: &str,
        contents: &str,
    ) -> EnvResult<SnapshotRef>;

    fn delete_file(&self, state: &EnvironmentState, path: &str) -> EnvResult<SnapshotRef>;

    /// Replace `old` with `new` at `path`; `old` is the content just read.
    fn edit_file(
        &self,
        state: &EnvironmentState,
        path: &str,
        old: &str,
        new: &str,
    ) -> EnvResult<SnapshotRef>;

    fn list_files(&self, state: &EnvironmentState, path: &str) -> EnvResult<Vec<String>>;

    /// Stop services replaced by a rebuild.
    fn release_services(&self, services: &[BoundService]);

    /// Stop everything `state` tracks. Best effort.
    fn teardown(&self, state: &mut EnvironmentState);
}

/// Pick the strategy for `config`.
pub fn select_backend(
    config: &EnvironmentConfig,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    settings: &Settings,
) -> EnvResult<Arc<dyn Backend>> {
    match config.mode() {
        ExecutionMode::Host => Ok(Arc::new(HostBackend::new(settings))),
        ExecutionMode::Container => match runtime {
            Some(runtime) => Ok(Arc::new(ContainerBackend::new(runtime, settings))),
            None => Err(EnvError::Config(format!(
                "base image {} needs a container runtime",
                config.base_image
            ))),
        },
    }
}
