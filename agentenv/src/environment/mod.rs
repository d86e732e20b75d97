//! Environment lifecycle and file mutation.
//!
//! An [`Environment`] is one agent's workspace. All of its mutable state sits
//! behind a single lock: every mutating operation takes the lock, performs its
//! effect through the execution strategy, and only on success swaps in the new
//! snapshot and bumps `updated_at`. Readers therefore never see a half-applied
//! snapshot, and mutations on one environment are strictly serialized.

pub mod backend;
pub mod config;
pub mod container;
pub mod host;
pub mod notes;
pub mod registry;
pub mod state;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, instrument};

use crate::cancel::CancelToken;
use crate::core::line_range::select_lines;
use crate::core::output::combine_output;
use crate::core::search_replace::resolve_edit;
use crate::error::{EnvError, EnvResult, ExecutionMode};
use crate::io::config::Settings;
use crate::runtime::{ContainerRuntime, SourceTree};

use self::backend::{Backend, CommandSpec, select_backend};
use self::config::EnvironmentConfig;
use self::notes::Notes;
use self::state::{
    BackgroundProcess, EndpointMappings, EnvironmentState, Lifecycle, ServiceKind, SnapshotRef,
    StateRecord,
};

/// Inputs for building a new environment.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub title: String,
    pub config: EnvironmentConfig,
    /// Tree materialized into the workdir (container mode).
    pub source: SourceTree,
    /// Log receiving every build command, kept by the caller even when the
    /// build fails.
    pub notes: Arc<Notes>,
}

impl CreateRequest {
    pub fn new(title: impl Into<String>, config: EnvironmentConfig) -> Self {
        Self {
            title: title.into(),
            config,
            source: SourceTree::Empty,
            notes: Arc::new(Notes::new()),
        }
    }

    pub fn with_source(mut self, source: SourceTree) -> Self {
        self.source = source;
        self
    }

    pub fn with_notes(mut self, notes: Arc<Notes>) -> Self {
        self.notes = notes;
        self
    }
}

pub struct Environment {
    id: String,
    backend: Arc<dyn Backend>,
    state: Mutex<EnvironmentState>,
    notes: Arc<Notes>,
}

impl Environment {
    /// Build a new environment. A failed build returns the error and nothing
    /// else; every command it ran is already in `request.notes`.
    #[instrument(skip_all, fields(env = %id, image = %request.config.base_image))]
    pub fn create(
        id: String,
        request: CreateRequest,
        backend: Arc<dyn Backend>,
        cancel: &CancelToken,
    ) -> EnvResult<Self> {
        let CreateRequest {
            title,
            config,
            source,
            notes,
        } = request;
        config.validate()?;
        ensure_mode(&config, backend.as_ref())?;
        info!(workdir = %config.workdir, mode = %backend.mode(), "creating environment");

        let built = backend.build(&config, &source, &notes, cancel)?;
        let mut state = EnvironmentState::new(config, title, built.snapshot);
        state.services = built.services;
        Ok(Self {
            id,
            backend,
            state: Mutex::new(state),
            notes,
        })
    }

    /// Restore an environment from its persisted JSON state without
    /// rebuilding it.
    pub fn load(
        id: String,
        state_json: &str,
        worktree: &Path,
        runtime: Option<Arc<dyn ContainerRuntime>>,
        settings: &Settings,
    ) -> EnvResult<Self> {
        let record: StateRecord =
            serde_json::from_str(state_json).context("parse environment state")?;
        let state = EnvironmentState::from_record(record, worktree, settings.force_host())?;
        let backend = select_backend(&state.config, runtime, settings)?;
        debug!(env = %id, mode = %backend.mode(), "environment loaded");
        Ok(Self {
            id,
            backend,
            state: Mutex::new(state),
            notes: Arc::new(Notes::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> ExecutionMode {
        self.backend.mode()
    }

    pub fn notes(&self) -> &Arc<Notes> {
        &self.notes
    }

    pub fn title(&self) -> String {
        self.state.lock().title.clone()
    }

    pub fn config(&self) -> EnvironmentConfig {
        self.state.lock().config.clone()
    }

    pub fn workdir(&self) -> String {
        self.state.lock().config.workdir.clone()
    }

    pub fn snapshot(&self) -> SnapshotRef {
        self.state.lock().snapshot.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.state.lock().created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state.lock().updated_at
    }

    pub fn background_processes(&self) -> Vec<BackgroundProcess> {
        self.state.lock().background_processes.clone()
    }

    /// Names of the running services, configured ones first.
    pub fn service_names(&self) -> Vec<String> {
        self.state
            .lock()
            .services
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Persisted form of the current state.
    pub fn state_json(&self) -> EnvResult<String> {
        let record = self.state.lock().to_record();
        Ok(serde_json::to_string_pretty(&record).context("serialize environment state")?)
    }

    fn ready(&self) -> EnvResult<MutexGuard<'_, EnvironmentState>> {
        let state = self.state.lock();
        if state.lifecycle == Lifecycle::Terminated {
            return Err(EnvError::NotFound(format!(
                "environment {} has been terminated",
                self.id
            )));
        }
        Ok(state)
    }

    /// Rebuild with `config`, adopting it only if the rebuild succeeds.
    #[instrument(skip_all, fields(env = %self.id))]
    pub fn update_config(&self, mut config: EnvironmentConfig, cancel: &CancelToken) -> EnvResult<()> {
        config.validate()?;
        ensure_mode(&config, self.backend.as_ref())?;
        let mut state = self.ready()?;

        let source = match &state.snapshot {
            SnapshotRef::Host => {
                config.workdir.clone_from(&state.config.workdir);
                SourceTree::Empty
            }
            SnapshotRef::Container(snapshot) => SourceTree::Snapshot {
                snapshot: snapshot.clone(),
                path: state.config.workdir.clone(),
            },
        };
        let built = self.backend.build(&config, &source, &self.notes, cancel)?;

        let (replaced, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.services)
            .into_iter()
            .partition(|s| s.kind == ServiceKind::Configured);
        self.backend.release_services(&replaced);
        state.services = built.services;
        state.services.extend(kept);
        state.config = config;
        state.replace_snapshot(built.snapshot);
        info!(snapshot = %state.snapshot, "config updated");
        Ok(())
    }

    /// Run one command and return stdout plus any stderr section.
    ///
    /// The command's own exit code is part of the result, not an error, and
    /// its side effects are kept either way.
    #[instrument(skip_all, fields(env = %self.id, shell = %spec.shell))]
    pub fn run(&self, spec: &CommandSpec, cancel: &CancelToken) -> EnvResult<String> {
        let mut state = self.ready()?;
        let out = self.backend.run(&state, spec, &self.notes, cancel)?;
        state.replace_snapshot(out.snapshot);
        debug!(exit_code = out.exit_code, "command finished");
        Ok(combine_output(&out.stdout, &out.stderr))
    }

    /// Start a long-running command and return once it is up.
    #[instrument(skip_all, fields(env = %self.id, ports = ?ports))]
    pub fn run_background(
        &self,
        spec: &CommandSpec,
        ports: &[u16],
        cancel: &CancelToken,
    ) -> EnvResult<EndpointMappings> {
        let mut state = self.ready()?;
        self.backend
            .run_background(&mut state, spec, ports, &self.notes, cancel)
    }

    #[instrument(skip_all, fields(env = %self.id, pid = pid))]
    pub fn kill_background(&self, pid: u32) -> EnvResult<()> {
        let mut state = self.ready()?;
        self.backend.kill_background(&mut state, pid, &self.notes)
    }

    /// Attach an interactive shell to the current snapshot.
    pub fn terminal(&self) -> EnvResult<()> {
        let snapshot = self.ready()?.snapshot.clone();
        self.backend.terminal(&snapshot)
    }

    /// Publish the current snapshot to `target`.
    #[instrument(skip_all, fields(env = %self.id, target_ref = target))]
    pub fn checkpoint(&self, target: &str) -> EnvResult<String> {
        let snapshot = self.ready()?.snapshot.clone();
        self.backend.checkpoint(&snapshot, target)
    }

    /// Read a whole file, or lines `[start_line, end_line]` (1-indexed,
    /// inclusive, clamped to the file).
    pub fn file_read(
        &self,
        path: &str,
        read_entire_file: bool,
        start_line: usize,
        end_line: usize,
    ) -> EnvResult<String> {
        let state = self.ready()?;
        let contents = self.backend.read_file(&state, path)?;
        drop(state);
        if read_entire_file {
            return Ok(contents);
        }
        select_lines(&contents, start_line, end_line)
    }

    #[instrument(skip_all, fields(env = %self.id, path = path))]
    pub fn file_write(&self, path: &str, contents: &str) -> EnvResult<()> {
        let mut state = self.ready()?;
        let snapshot = self.backend.write_file(&state, path, contents)?;
        state.replace_snapshot(snapshot);
        self.notes.add(format!("Write {path}"));
        Ok(())
    }

    #[instrument(skip_all, fields(env = %self.id, path = path))]
    pub fn file_delete(&self, path: &str) -> EnvResult<()> {
        let mut state = self.ready()?;
        let snapshot = self.backend.delete_file(&state, path)?;
        state.replace_snapshot(snapshot);
        self.notes.add(format!("Delete {path}"));
        Ok(())
    }

    /// Replace one occurrence of `search` in `path`.
    ///
    /// With several occurrences, `match_id` selects one of the ids reported by
    /// a previous [`EnvError::AmbiguousMatch`].
    #[instrument(skip_all, fields(env = %self.id, path = path))]
    pub fn file_edit(
        &self,
        path: &str,
        search: &str,
        replace: &str,
        match_id: Option<&str>,
    ) -> EnvResult<()> {
        let mut state = self.ready()?;
        let contents = self.backend.read_file(&state, path)?;
        let edited = resolve_edit(path, &contents, search, replace, match_id)?;
        let snapshot = self.backend.edit_file(&state, path, &contents, &edited)?;
        state.replace_snapshot(snapshot);
        self.notes.add(format!("Edit {path}"));
        Ok(())
    }

    pub fn file_list(&self, path: &str) -> EnvResult<Vec<String>> {
        let state = self.ready()?;
        self.backend.list_files(&state, path)
    }

    /// Stop everything the environment started. Later calls fail with
    /// [`EnvError::NotFound`].
    #[instrument(skip_all, fields(env = %self.id))]
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Terminated {
            return;
        }
        self.backend.teardown(&mut state);
        state.lifecycle = Lifecycle::Terminated;
        info!("environment terminated");
    }
}

fn ensure_mode(config: &EnvironmentConfig, backend: &dyn Backend) -> EnvResult<()> {
    if config.mode() == backend.mode() {
        return Ok(());
    }
    Err(EnvError::Config(format!(
        "base image {} needs {} mode but the environment runs in {} mode",
        config.base_image,
        config.mode(),
        backend.mode()
    )))
}
