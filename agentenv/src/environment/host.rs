//! Host execution: commands run as subprocesses rooted at the workdir.
//!
//! There is no snapshot to replace, so the snapshot reference stays `host`.
//! Services, terminals and checkpoints need a container and are refused.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;
use crate::core::env_pairs::{parse_pairs, resolve_secrets};
use crate::environment::backend::{Backend, BuildOutput, CommandSpec, RunOutput};
use crate::environment::config::EnvironmentConfig;
use crate::environment::notes::Notes;
use crate::environment::state::{
    BackgroundProcess, BoundService, EndpointMapping, EndpointMappings, EnvironmentState,
    SnapshotRef,
};
use crate::error::{BuildPhase, Cancelled, EnvError, EnvResult, ExecutionMode};
use crate::io::config::Settings;
use crate::io::ports::choose_ports;
use crate::io::process::run_command;
use crate::runtime::SourceTree;

const REAP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct HostBackend {
    kill_grace: Duration,
    output_limit_bytes: usize,
    /// Children spawned by this process, reaped when killed.
    children: Mutex<HashMap<u32, Child>>,
}

struct Captured {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

impl HostBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            kill_grace: settings.kill_grace(),
            output_limit_bytes: settings.output_limit_bytes,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Run `command` under `shell -c`, recording it in `notes`.
    fn exec(
        &self,
        config: &EnvironmentConfig,
        envs: &[(String, String)],
        shell: &str,
        command: &str,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<Captured> {
        let mut cmd = Command::new(shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&config.workdir)
            .envs(envs.iter().map(|(k, v)| (k, v)));

        let output = match run_command(cmd, cancel, self.output_limit_bytes) {
            Ok(output) => output,
            Err(err) => {
                notes.add_command(command, 1, "", &format!("{err:#}"));
                return Err(err.into());
            }
        };
        let captured = Captured {
            exit_code: output.exit_code(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
        };
        notes.add_command(command, captured.exit_code, &captured.stdout, &captured.stderr);
        if output.cancelled {
            return Err(EnvError::Infra(anyhow::Error::new(Cancelled)));
        }
        Ok(captured)
    }

    fn run_phase(
        &self,
        config: &EnvironmentConfig,
        envs: &[(String, String)],
        phase: BuildPhase,
        commands: &[String],
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<()> {
        for command in commands {
            let captured = self.exec(config, envs, "sh", command, notes, cancel)?;
            if captured.exit_code != 0 {
                return Err(EnvError::Build {
                    phase,
                    command: command.clone(),
                    exit_code: captured.exit_code,
                    stdout: captured.stdout,
                    stderr: captured.stderr,
                });
            }
        }
        Ok(())
    }

    /// Reap children that exited on their own. Their tracking entries stay
    /// until `kill_background` or teardown.
    fn reap_finished(&self) {
        self.children.lock().retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = *pid, ?status, "background process exited");
                false
            }
            Ok(None) => true,
            Err(err) => {
                warn!(pid = *pid, err = %err, "failed to poll background process");
                true
            }
        });
    }

    fn stop_process(&self, pid: u32) {
        signal_group(pid, Signal::SIGTERM);
        std::thread::sleep(self.kill_grace);
        signal_group(pid, Signal::SIGKILL);

        if let Some(mut child) = self.children.lock().remove(&pid) {
            match child.wait_timeout(REAP_TIMEOUT) {
                Ok(Some(status)) => debug!(pid, ?status, "background process reaped"),
                Ok(None) => warn!(pid, "background process still running after SIGKILL"),
                Err(err) => warn!(pid, err = %err, "failed to reap background process"),
            }
        }
    }
}

/// Merge configured env vars and resolved secrets for host commands.
fn host_env(config: &EnvironmentConfig) -> EnvResult<Vec<(String, String)>> {
    let mut envs = parse_pairs(&config.env, "env")?;
    envs.extend(resolve_secrets(&config.secrets, |name| {
        std::env::var(name).ok()
    })?);
    Ok(envs)
}

fn resolve(workdir: &str, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        Path::new(workdir).join(path)
    }
}

fn not_found_or_infra(err: std::io::Error, action: &str, path: &Path) -> EnvError {
    if err.kind() == ErrorKind::NotFound {
        EnvError::NotFound(format!("{}", path.display()))
    } else {
        EnvError::Infra(anyhow::Error::new(err).context(format!("{action} {}", path.display())))
    }
}

/// Signal the process group led by `pid`, falling back to the process itself.
fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        warn!(pid, "pid out of range");
        return;
    };
    let target = Pid::from_raw(raw);
    if killpg(target, signal).is_ok() {
        return;
    }
    if let Err(err) = kill(target, signal) {
        debug!(pid, ?signal, err = %err, "signal not delivered");
    }
}

impl Backend for HostBackend {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Host
    }

    #[instrument(skip_all, fields(workdir = %config.workdir))]
    fn build(
        &self,
        config: &EnvironmentConfig,
        _source: &SourceTree,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<BuildOutput> {
        let envs = host_env(config)?;
        if !Path::new(&config.workdir).is_dir() {
            return Err(EnvError::Config(format!(
                "host workdir {} is not a directory",
                config.workdir
            )));
        }
        if !config.services.is_empty() {
            warn!(count = config.services.len(), "services are ignored in host mode");
        }

        self.run_phase(config, &envs, BuildPhase::Setup, &config.setup_commands, notes, cancel)?;
        self.run_phase(
            config,
            &envs,
            BuildPhase::Install,
            &config.install_commands,
            notes,
            cancel,
        )?;
        info!("host environment built");
        Ok(BuildOutput {
            snapshot: SnapshotRef::Host,
            services: Vec::new(),
        })
    }

    #[instrument(skip_all, fields(shell = %spec.shell))]
    fn run(
        &self,
        state: &EnvironmentState,
        spec: &CommandSpec,
        notes: &Notes,
        cancel: &CancelToken,
    ) -> EnvResult<RunOutput> {
        if spec.command.trim().is_empty() {
            return Ok(RunOutput {
                snapshot: SnapshotRef::Host,
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        let envs = host_env(&state.config)?;
        let captured = self.exec(
            &state.config,
            &envs,
            &spec.shell,
            &spec.command,
            notes,
            cancel,
        )?;
        Ok(RunOutput {
            snapshot: SnapshotRef::Host,
            exit_code: captured.exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
        })
    }

    #[instrument(skip_all, fields(shell = %spec.shell, ports = ?ports))]
    fn run_background(
        &self,
        state: &mut EnvironmentState,
        spec: &CommandSpec,
        ports: &[u16],
        notes: &Notes,
        _cancel: &CancelToken,
    ) -> EnvResult<EndpointMappings> {
        if spec.command.trim().is_empty() {
            return Err(EnvError::Config("background command is empty".to_string()));
        }
        self.reap_finished();
        let reserved: HashSet<u16> = state.reserved_ports().collect();
        let chosen = choose_ports(ports, &reserved)?;
        let mut envs = host_env(&state.config)?;
        if let [port] = chosen.as_slice() {
            envs.push(("PORT".to_string(), port.to_string()));
        }

        let note_command = format!("{} &", spec.command);
        let mut cmd = Command::new(&spec.shell);
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&state.config.workdir)
            .envs(envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = match cmd
            .spawn()
            .with_context(|| format!("spawn background command {:?}", spec.command))
        {
            Ok(child) => child,
            Err(err) => {
                notes.add_command(&note_command, 1, "", &format!("{err:#}"));
                return Err(err.into());
            }
        };
        let pid = child.id();
        self.children.lock().insert(pid, child);
        info!(pid, ports = ?chosen, "background process started");

        state.background_processes.push(BackgroundProcess {
            pid,
            command: spec.command.clone(),
            shell: spec.shell.clone(),
            ports: chosen.clone(),
            workdir: state.config.workdir.clone(),
            started_at: Utc::now(),
        });
        state.touch();
        notes.add_command(&note_command, 0, "", "");

        Ok(chosen
            .into_iter()
            .map(|port| {
                let address = format!("tcp://127.0.0.1:{port}");
                (
                    port,
                    EndpointMapping {
                        environment_internal: address.clone(),
                        host_external: address,
                    },
                )
            })
            .collect())
    }

    #[instrument(skip_all, fields(pid = pid))]
    fn kill_background(
        &self,
        state: &mut EnvironmentState,
        pid: u32,
        notes: &Notes,
    ) -> EnvResult<()> {
        let Some(index) = state.background_processes.iter().position(|p| p.pid == pid) else {
            return Err(EnvError::NotFound(format!(
                "no background process with PID {pid}"
            )));
        };
        self.stop_process(pid);
        state.background_processes.remove(index);
        state.touch();
        notes.add(format!("Stopped background process PID={pid}"));
        Ok(())
    }

    fn terminal(&self, _snapshot: &SnapshotRef) -> EnvResult<()> {
        Err(EnvError::Unsupported {
            operation: "terminal",
            mode: ExecutionMode::Host,
        })
    }

    fn checkpoint(&self, _snapshot: &SnapshotRef, _target: &str) -> EnvResult<String> {
        Err(EnvError::Unsupported {
            operation: "checkpoint",
            mode: ExecutionMode::Host,
        })
    }

    fn read_file(&self, state: &EnvironmentState, path: &str) -> EnvResult<String> {
        let target = resolve(&state.config.workdir, path);
        fs::read_to_string(&target).map_err(|err| not_found_or_infra(err, "read", &target))
    }

    fn write_file(
        &self,
        state: &EnvironmentState,
        path: &str,
        contents: &str,
    ) -> EnvResult<SnapshotRef> {
        let target = resolve(&state.config.workdir, path);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&target, contents).with_context(|| format!("write {}", target.display()))?;
        Ok(SnapshotRef::Host)
    }

    fn delete_file(&self, state: &EnvironmentState, path: &str) -> EnvResult<SnapshotRef> {
        let target = resolve(&state.config.workdir, path);
        fs::remove_file(&target).map_err(|err| not_found_or_infra(err, "delete", &target))?;
        Ok(SnapshotRef::Host)
    }

    // The host has no cheaper primitive than rewriting the file.
    fn edit_file(
        &self,
        state: &EnvironmentState,
        path: &str,
        _old: &str,
        new: &str,
    ) -> EnvResult<SnapshotRef> {
        self.write_file(state, path, new)
    }

    fn list_files(&self, state: &EnvironmentState, path: &str) -> EnvResult<Vec<String>> {
        let target = resolve(&state.config.workdir, path);
        let entries =
            fs::read_dir(&target).map_err(|err| not_found_or_infra(err, "list", &target))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", target.display()))?;
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }

    fn release_services(&self, _services: &[BoundService]) {}

    fn teardown(&self, state: &mut EnvironmentState) {
        for process in std::mem::take(&mut state.background_processes) {
            debug!(pid = process.pid, "stopping background process");
            self.stop_process(process.pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fast_settings, host_config, host_workdir};

    #[test]
    fn exited_children_are_reaped_on_next_start() {
        let dir = host_workdir();
        let backend = HostBackend::new(&fast_settings());
        let mut state =
            EnvironmentState::new(host_config(dir.path()), "reap".to_string(), SnapshotRef::Host);
        let notes = Notes::new();
        let cancel = CancelToken::new();

        backend
            .run_background(&mut state, &CommandSpec::new("true"), &[], &notes, &cancel)
            .expect("short-lived process");
        assert_eq!(backend.children.lock().len(), 1);
        std::thread::sleep(Duration::from_millis(300));

        backend
            .run_background(&mut state, &CommandSpec::new("sleep 30"), &[], &notes, &cancel)
            .expect("long-lived process");
        let live: Vec<u32> = backend.children.lock().keys().copied().collect();
        assert_eq!(live, vec![state.background_processes[1].pid]);
        assert_eq!(state.background_processes.len(), 2);

        backend.teardown(&mut state);
        assert!(backend.children.lock().is_empty());
    }

    #[test]
    fn relative_paths_resolve_against_workdir() {
        assert_eq!(resolve("/w", "a/b.txt"), PathBuf::from("/w/a/b.txt"));
        assert_eq!(resolve("/w", "/etc/hosts"), PathBuf::from("/etc/hosts"));
    }

    #[test]
    fn unset_secret_variable_is_a_config_error() {
        let config = EnvironmentConfig {
            base_image: "host".to_string(),
            secrets: vec!["TOKEN=AGENTENV_TEST_SURELY_UNSET_VARIABLE".to_string()],
            ..EnvironmentConfig::default()
        };
        assert!(matches!(host_env(&config), Err(EnvError::Config(_))));
    }
}
