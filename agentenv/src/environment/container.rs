//! Container execution on top of a [`ContainerRuntime`].
//!
//! Every step derives a new immutable snapshot from the previous one, so an
//! operation that fails midway leaves the environment's snapshot untouched.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::env_pairs::{parse_pairs, resolve_secrets};
use crate::core::patch::{patch_location, unified_diff};
use crate::core::terminal::{RC_PATH, plan_terminal};
use crate::environment::backend::{Backend, BuildOutput, CommandSpec, RunOutput};
use crate::environment::config::{EnvironmentConfig, ServiceConfig};
use crate::environment::notes::Notes;
use crate::environment::state::{
    BoundService, EndpointMapping, EndpointMappings, EnvironmentState, ServiceKind, SnapshotRef,
};
use crate::error::{BuildPhase, EnvError, EnvResult, ExecutionMode};
use crate::io::config::Settings;
use crate::io::ports::choose_port;
use crate::runtime::{
    ContainerRuntime, ExecRequest, RuntimeError, ServiceId, SnapshotId, SourceTree,
};

/// Exit code recorded for a service that did not start in time.
const START_TIMEOUT_EXIT: i32 = 137;

pub struct ContainerBackend {
    runtime: Arc<dyn ContainerRuntime>,
    service_start_timeout: Duration,
}

impl ContainerBackend {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: &Settings) -> Self {
        Self {
            runtime,
            service_start_timeout: settings.service_start_timeout(),
        }
    }

    fn with_env_and_secrets(
        &self,
        mut snapshot: SnapshotId,
        env: &[(String, String)],
        secrets: &[(String, String)],
    ) -> EnvResult<SnapshotId> {
        for (key, value) in env {
            snapshot = self.runtime.with_env(&snapshot, key, value)?;
        }
        for (key, value) in secrets {
            snapshot = self.runtime.with_secret(&snapshot, key, value)?;
        }
        Ok(snapshot)
    }

    fn run_phase(
        &self,
        mut snapshot: SnapshotId,
        phase: BuildPhase,
        commands: &[String],
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<SnapshotId> {
        for command in commands {
            let request = ExecRequest::shell("sh", command, false);
            let outcome = self.runtime.exec(&snapshot, &request, cancel)?;
            notes.add_command(command, outcome.exit_code, &outcome.stdout, &outcome.stderr);
            if outcome.exit_code != 0 {
                return Err(EnvError::Build {
                    phase,
                    command: command.clone(),
                    exit_code: outcome.exit_code,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                });
            }
            snapshot = outcome.snapshot;
        }
        Ok(snapshot)
    }

    /// Start `request` as a service under a start deadline, recording the
    /// outcome as `note_command` in `notes`.
    ///
    /// A process that exits during startup is a build failure when `phase` is
    /// set and an infrastructure error otherwise.
    fn start_service(
        &self,
        snapshot: &SnapshotId,
        request: &ExecRequest,
        note_command: &str,
        phase: Option<BuildPhase>,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<ServiceId> {
        let deadline = cancel.child_with_timeout(self.service_start_timeout);
        match self.runtime.start_service(snapshot, request, &deadline) {
            Ok(service) => {
                notes.add_command(note_command, 0, "", "");
                Ok(service)
            }
            Err(RuntimeError::Exec {
                exit_code,
                stdout,
                stderr,
            }) => {
                notes.add_command(note_command, exit_code, &stdout, &stderr);
                Err(match phase {
                    Some(phase) => EnvError::Build {
                        phase,
                        command: note_command.to_string(),
                        exit_code,
                        stdout,
                        stderr,
                    },
                    None => RuntimeError::Exec {
                        exit_code,
                        stdout,
                        stderr,
                    }
                    .into(),
                })
            }
            Err(RuntimeError::DeadlineExceeded) if !cancel.is_done() => {
                let err = EnvError::ServiceStartTimeout {
                    timeout: self.service_start_timeout,
                };
                warn!(command = note_command, "service start timed out");
                notes.add_command(note_command, START_TIMEOUT_EXIT, "", &err.to_string());
                Err(err)
            }
            Err(err) => {
                notes.add_command(note_command, 1, "", &err.to_string());
                Err(err.into())
            }
        }
    }

    fn start_configured_service(
        &self,
        service: &ServiceConfig,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<BoundService> {
        let env = parse_pairs(&service.env, "env")?;
        let secrets = resolve_secrets(&service.secrets, |name| std::env::var(name).ok())?;

        let mut snapshot = self.runtime.from_image(&service.image)?;
        snapshot = self.with_env_and_secrets(snapshot, &env, &secrets)?;
        for &port in &service.exposed_ports {
            snapshot = self.runtime.with_exposed_port(&snapshot, port)?;
        }

        let request = ExecRequest::shell("sh", &service.command, true);
        let note_command = format!("service {}: {} &", service.name, service.command);
        let id = self.start_service(
            &snapshot,
            &request,
            &note_command,
            Some(BuildPhase::Service),
            notes,
            cancel,
        )?;
        info!(service = %service.name, id = %id, "service started");
        Ok(BoundService {
            name: service.name.clone(),
            id,
            kind: ServiceKind::Configured,
            ports: service.exposed_ports.clone(),
        })
    }

    fn start_configured_services(
        &self,
        config: &EnvironmentConfig,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<Vec<BoundService>> {
        let mut started = Vec::with_capacity(config.services.len());
        for service in &config.services {
            match self.start_configured_service(service, notes, cancel) {
                Ok(bound) => started.push(bound),
                Err(err) => {
                    self.release_services(&started);
                    return Err(err);
                }
            }
        }
        Ok(started)
    }

    fn finish_build(
        &self,
        mut snapshot: SnapshotId,
        config: &EnvironmentConfig,
        services: &[BoundService],
        source: &SourceTree,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<SnapshotId> {
        for service in services {
            snapshot = self
                .runtime
                .with_service_binding(&snapshot, &service.name, &service.id)?;
        }
        if *source != SourceTree::Empty {
            snapshot = self.runtime.with_directory(&snapshot, ".", source)?;
        }
        snapshot = self.run_phase(
            snapshot,
            BuildPhase::Install,
            &config.install_commands,
            notes,
            cancel,
        )?;
        Ok(self.runtime.sync(&snapshot)?)
    }

    fn expose_endpoints(
        &self,
        service: &ServiceId,
        ports: &[u16],
    ) -> EnvResult<EndpointMappings> {
        let mut endpoints = EndpointMappings::new();
        for &port in ports {
            let host_external = self.runtime.tunnel(service, port)?;
            let environment_internal = self.runtime.service_endpoint(service, port)?;
            endpoints.insert(
                port,
                EndpointMapping {
                    environment_internal,
                    host_external,
                },
            );
        }
        Ok(endpoints)
    }
}

fn container_snapshot(snapshot: &SnapshotRef) -> EnvResult<&SnapshotId> {
    snapshot.as_container().ok_or_else(|| {
        EnvError::Config("container environment has no container snapshot".to_string())
    })
}

impl Backend for ContainerBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Container
    }

    #[instrument(skip_all, fields(image = %config.base_image, workdir = %config.workdir))]
    fn build(
        &self,
        config: &EnvironmentConfig,
        source: &SourceTree,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<BuildOutput> {
        let env = parse_pairs(&config.env, "env")?;
        let secrets = resolve_secrets(&config.secrets, |name| std::env::var(name).ok())?;

        let mut snapshot = self.runtime.from_image(&config.base_image)?;
        snapshot = self.runtime.with_workdir(&snapshot, &config.workdir)?;
        snapshot = self.with_env_and_secrets(snapshot, &env, &secrets)?;
        // Setup runs before the source tree lands so its layers stay cacheable.
        snapshot = self.run_phase(
            snapshot,
            BuildPhase::Setup,
            &config.setup_commands,
            notes,
            cancel,
        )?;

        let services = self.start_configured_services(config, notes, cancel)?;
        match self.finish_build(snapshot, config, &services, source, notes, cancel) {
            Ok(snapshot) => {
                info!(snapshot = %snapshot, services = services.len(), "container built");
                Ok(BuildOutput {
                    snapshot: SnapshotRef::Container(snapshot),
                    services,
                })
            }
            Err(err) => {
                self.release_services(&services);
                Err(err)
            }
        }
    }

    #[instrument(skip_all, fields(shell = %spec.shell, use_entrypoint = spec.use_entrypoint))]
    fn run(
        &self,
        state: &EnvironmentState,
        spec: &CommandSpec,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<RunOutput> {
        let snapshot = container_snapshot(&state.snapshot)?;
        let request = ExecRequest::shell(&spec.shell, &spec.command, spec.use_entrypoint);
        let outcome = self.runtime.exec(snapshot, &request, cancel)?;
        notes.add_command(
            &spec.command,
            outcome.exit_code,
            &outcome.stdout,
            &outcome.stderr,
        );
        let synced = self.runtime.sync(&outcome.snapshot)?;
        debug!(exit_code = outcome.exit_code, snapshot = %synced, "command applied");
        Ok(RunOutput {
            snapshot: SnapshotRef::Container(synced),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        })
    }

    #[instrument(skip_all, fields(shell = %spec.shell, ports = ?ports))]
    fn run_background(
        &self,
        state: &mut EnvironmentState,
        spec: &CommandSpec,
        ports: &[u16],
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<EndpointMappings> {
        let mut snapshot = container_snapshot(&state.snapshot)?.clone();

        // Requested ports live in the container's own namespace; only port 0
        // needs an allocation.
        let mut taken: HashSet<u16> = state.reserved_ports().collect();
        let mut chosen = Vec::with_capacity(ports.len());
        for &port in ports {
            let port = if port == 0 { choose_port(0, &taken)? } else { port };
            taken.insert(port);
            chosen.push(port);
        }

        for &port in &chosen {
            snapshot = self.runtime.with_exposed_port(&snapshot, port)?;
        }
        if let [port] = chosen.as_slice() {
            snapshot = self.runtime.with_env(&snapshot, "PORT", &port.to_string())?;
        }

        let request = ExecRequest::shell(&spec.shell, &spec.command, spec.use_entrypoint);
        let note_command = format!("{} &", spec.command);
        let service =
            self.start_service(&snapshot, &request, &note_command, None, notes, cancel)?;

        let endpoints = match self.expose_endpoints(&service, &chosen) {
            Ok(endpoints) => endpoints,
            Err(err) => {
                if let Err(stop) = self.runtime.stop_service(&service) {
                    warn!(service = %service, err = %stop, "failed to stop service");
                }
                return Err(err);
            }
        };
        info!(service = %service, ports = ?chosen, "background service started");
        state.services.push(BoundService {
            name: spec.command.clone(),
            id: service,
            kind: ServiceKind::Background,
            ports: chosen,
        });
        state.touch();
        Ok(endpoints)
    }

    fn kill_background(
        &self,
        _state: &mut EnvironmentState,
        _pid: u32,
        _notes: &Notes,
    ) -> EnvResult<()> {
        Err(EnvError::Unsupported {
            operation: "kill_background",
            mode: ExecutionMode::Container,
        })
    }

    #[instrument(skip_all)]
    fn terminal(&self, snapshot: &SnapshotRef) -> EnvResult<()> {
        let mut snapshot = container_snapshot(snapshot)?.clone();
        let shells = self.runtime.read_file(&snapshot, "/etc/shells").ok();
        let plan = plan_terminal(shells.as_deref());
        snapshot = self
            .runtime
            .with_new_file(&snapshot, RC_PATH, &plan.rc_script)?;
        if plan.env_hook {
            snapshot = self.runtime.with_env(&snapshot, "ENV", RC_PATH)?;
        }
        debug!(command = ?plan.command, "attaching terminal");
        Ok(self.runtime.terminal(&snapshot, &plan.command)?)
    }

    fn checkpoint(&self, snapshot: &SnapshotRef, target: &str) -> EnvResult<String> {
        let snapshot = container_snapshot(snapshot)?;
        let reference = self.runtime.publish(snapshot, target)?;
        info!(target, reference = %reference, "checkpoint published");
        Ok(reference)
    }

    fn read_file(&self, state: &EnvironmentState, path: &str) -> EnvResult<String> {
        let snapshot = container_snapshot(&state.snapshot)?;
        Ok(self.runtime.read_file(snapshot, path)?)
    }

    fn write_file(
        &self,
        state: &EnvironmentState,
        path: &str,
        contents: &str,
    ) -> EnvResult<SnapshotRef> {
        let snapshot = container_snapshot(&state.snapshot)?;
        let written = self.runtime.with_new_file(snapshot, path, contents)?;
        Ok(SnapshotRef::Container(self.runtime.sync(&written)?))
    }

    fn delete_file(&self, state: &EnvironmentState, path: &str) -> EnvResult<SnapshotRef> {
        let snapshot = container_snapshot(&state.snapshot)?;
        let removed = self.runtime.without_file(snapshot, path)?;
        Ok(SnapshotRef::Container(self.runtime.sync(&removed)?))
    }

    fn edit_file(
        &self,
        state: &EnvironmentState,
        path: &str,
        old: &str,
        new: &str,
    ) -> EnvResult<SnapshotRef> {
        let snapshot = container_snapshot(&state.snapshot)?;
        let location = patch_location(&state.config.workdir, path);
        let patch = unified_diff(&location.relative, old, new);
        debug!(dir = %location.dir, bytes = patch.len(), "applying patch");
        let patched = self.runtime.with_patch(snapshot, &location.dir, &patch)?;
        Ok(SnapshotRef::Container(self.runtime.sync(&patched)?))
    }

    fn list_files(&self, state: &EnvironmentState, path: &str) -> EnvResult<Vec<String>> {
        let snapshot = container_snapshot(&state.snapshot)?;
        Ok(self.runtime.list_entries(snapshot, path)?)
    }

    fn release_services(&self, services: &[BoundService]) {
        for service in services {
            if let Err(err) = self.runtime.stop_service(&service.id) {
                warn!(service = %service.name, err = %err, "failed to stop service");
            }
        }
    }

    fn teardown(&self, state: &mut EnvironmentState) {
        let services = std::mem::take(&mut state.services);
        self.release_services(&services);
    }
}
