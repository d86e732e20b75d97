//! Test-only helpers: an in-memory container runtime and host workdirs.
//!
//! [`ScriptedRuntime`] keeps every snapshot as a map of files plus env vars and
//! understands a tiny shell dialect (`echo`, `touch`, `cat`, `rm`, `sleep`,
//! `exit`, `true`, `false`, `>` and `>&2` redirection, `;` sequencing), which
//! is enough to drive builds and commands without a real engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::cancel::CancelToken;
use crate::core::patch::{apply_unified_diff, patch_target};
use crate::environment::config::EnvironmentConfig;
use crate::io::config::Settings;
use crate::runtime::{
    ContainerRuntime, ExecOutcome, ExecRequest, RuntimeError, RuntimeResult, ServiceId,
    SnapshotId, SourceTree,
};

/// How `start_service` behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceBehavior {
    Ready,
    /// Never reports ready; returns once the deadline or cancellation hits.
    Hang,
    /// Exits during startup.
    Exit { exit_code: i32, stderr: String },
}

/// One materialized container state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub image: String,
    pub workdir: String,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    /// Absolute path to contents.
    pub files: BTreeMap<String, String>,
    pub exposed_ports: Vec<u16>,
    pub bindings: Vec<(String, ServiceId)>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    snapshots: HashMap<SnapshotId, Snapshot>,
    services: BTreeMap<ServiceId, bool>,
    calls: Vec<String>,
    service_behavior: Option<ServiceBehavior>,
    failing_commands: Vec<String>,
}

impl Inner {
    fn snapshot(&self, id: &SnapshotId) -> RuntimeResult<Snapshot> {
        self.snapshots
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::Other(anyhow!("unknown snapshot {id}")))
    }

    fn store(&mut self, snapshot: Snapshot) -> SnapshotId {
        self.next_id += 1;
        let id = SnapshotId(format!("snap-{}", self.next_id));
        self.snapshots.insert(id.clone(), snapshot);
        id
    }
}

/// In-memory [`ContainerRuntime`] with scriptable failures.
#[derive(Default)]
pub struct ScriptedRuntime {
    inner: Mutex<Inner>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_service_behavior(&self, behavior: ServiceBehavior) {
        self.inner.lock().service_behavior = Some(behavior);
    }

    /// `exec` or `start_service` of any command containing `needle` fails as an
    /// infrastructure error.
    pub fn fail_commands_containing(&self, needle: &str) {
        self.inner.lock().failing_commands.push(needle.to_string());
    }

    /// Recorded calls, e.g. `exec sh -c ls` or `with_patch . 120`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn snapshot(&self, id: &SnapshotId) -> Option<Snapshot> {
        self.inner.lock().snapshots.get(id).cloned()
    }

    pub fn file(&self, id: &SnapshotId, path: &str) -> Option<String> {
        let snapshot = self.snapshot(id)?;
        let full = resolve(&snapshot.workdir, path);
        snapshot.files.get(&full).cloned()
    }

    pub fn running_services(&self) -> Vec<ServiceId> {
        self.inner
            .lock()
            .services
            .iter()
            .filter(|(_, running)| **running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn derive<F>(&self, id: &SnapshotId, call: String, f: F) -> RuntimeResult<SnapshotId>
    where
        F: FnOnce(&mut Snapshot) -> RuntimeResult<()>,
    {
        let mut inner = self.inner.lock();
        inner.calls.push(call);
        let mut snapshot = inner.snapshot(id)?;
        f(&mut snapshot)?;
        Ok(inner.store(snapshot))
    }
}

/// Absolute, normalized path of `path` relative to `workdir`.
fn resolve(workdir: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new(workdir).join(path)
    };
    let mut parts: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

fn under(dir: &str, file: &str) -> Option<String> {
    if dir == "/" {
        return file.strip_prefix('/').map(str::to_string);
    }
    file.strip_prefix(dir)?.strip_prefix('/').map(str::to_string)
}

fn read_host_tree(root: &Path, prefix: &Path, out: &mut Vec<(String, String)>) -> anyhow::Result<()> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let relative = prefix.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            read_host_tree(&path, &relative, out)?;
        } else {
            let contents = fs::read_to_string(&path)?;
            out.push((relative.to_string_lossy().into_owned(), contents));
        }
    }
    Ok(())
}

struct ShellResult {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

fn run_script(
    snapshot: &mut Snapshot,
    script: &str,
    cancel: &CancelToken,
) -> RuntimeResult<ShellResult> {
    let mut result = ShellResult {
        exit_code: 0,
        stdout: String::new(),
        stderr: String::new(),
    };
    for step in script.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (word, rest) = step.split_once(' ').unwrap_or((step, ""));
        let rest = rest.trim();
        result.exit_code = 0;
        match word {
            "exit" => {
                result.exit_code = if rest.is_empty() { 0 } else { rest.parse().unwrap_or(2) };
                return Ok(result);
            }
            "true" => {}
            "false" => result.exit_code = 1,
            "touch" => {
                let path = resolve(&snapshot.workdir, rest);
                snapshot.files.entry(path).or_default();
            }
            "rm" => {
                let path = resolve(&snapshot.workdir, rest);
                if snapshot.files.remove(&path).is_none() {
                    result.stderr.push_str(&format!("rm: {rest}: No such file\n"));
                    result.exit_code = 1;
                }
            }
            "cat" => {
                let path = resolve(&snapshot.workdir, rest);
                match snapshot.files.get(&path) {
                    Some(contents) => result.stdout.push_str(contents),
                    None => {
                        result.stderr.push_str(&format!("cat: {rest}: No such file\n"));
                        result.exit_code = 1;
                    }
                }
            }
            "sleep" => {
                let secs: f64 = rest.parse().unwrap_or(0.0);
                let until = Instant::now() + Duration::from_secs_f64(secs);
                while Instant::now() < until {
                    if cancel.is_cancelled() {
                        return Err(RuntimeError::Cancelled);
                    }
                    if cancel.is_expired() {
                        return Err(RuntimeError::DeadlineExceeded);
                    }
                    cancel.sleep(Duration::from_millis(5));
                }
            }
            "echo" => {
                if let Some(text) = rest.strip_suffix(">&2") {
                    result.stderr.push_str(&format!("{}\n", text.trim()));
                } else if let Some((text, target)) = rest.split_once('>') {
                    let path = resolve(&snapshot.workdir, target.trim());
                    snapshot.files.insert(path, format!("{}\n", text.trim()));
                } else {
                    result.stdout.push_str(&format!("{rest}\n"));
                }
            }
            other => {
                result.stderr.push_str(&format!("sh: {other}: not found\n"));
                result.exit_code = 127;
            }
        }
    }
    Ok(result)
}

impl ContainerRuntime for ScriptedRuntime {
    fn from_image(&self, image: &str) -> RuntimeResult<SnapshotId> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("from_image {image}"));
        Ok(inner.store(Snapshot {
            image: image.to_string(),
            workdir: "/".to_string(),
            ..Snapshot::default()
        }))
    }

    fn with_workdir(&self, snapshot: &SnapshotId, workdir: &str) -> RuntimeResult<SnapshotId> {
        let workdir = resolve("/", workdir);
        self.derive(snapshot, format!("with_workdir {workdir}"), |s| {
            s.workdir = workdir;
            Ok(())
        })
    }

    fn with_env(&self, snapshot: &SnapshotId, key: &str, value: &str) -> RuntimeResult<SnapshotId> {
        self.derive(snapshot, format!("with_env {key}"), |s| {
            s.env.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn with_secret(
        &self,
        snapshot: &SnapshotId,
        key: &str,
        value: &str,
    ) -> RuntimeResult<SnapshotId> {
        self.derive(snapshot, format!("with_secret {key}"), |s| {
            s.secrets.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    fn with_exposed_port(&self, snapshot: &SnapshotId, port: u16) -> RuntimeResult<SnapshotId> {
        self.derive(snapshot, format!("with_exposed_port {port}"), |s| {
            s.exposed_ports.push(port);
            Ok(())
        })
    }

    fn with_directory(
        &self,
        snapshot: &SnapshotId,
        path: &str,
        source: &SourceTree,
    ) -> RuntimeResult<SnapshotId> {
        let files: Vec<(String, String)> = match source {
            SourceTree::Empty => Vec::new(),
            SourceTree::HostDir(dir) => {
                let mut out = Vec::new();
                read_host_tree(dir, Path::new(""), &mut out)?;
                out
            }
            SourceTree::Snapshot {
                snapshot: from,
                path: dir,
            } => {
                let inner = self.inner.lock();
                let source = inner.snapshot(from)?;
                let dir = resolve(&source.workdir, dir);
                source
                    .files
                    .iter()
                    .filter_map(|(file, contents)| Some((under(&dir, file)?, contents.clone())))
                    .collect()
            }
        };
        self.derive(snapshot, format!("with_directory {path}"), |s| {
            let target = resolve(&s.workdir, path);
            for (relative, contents) in files {
                s.files.insert(resolve(&target, &relative), contents);
            }
            Ok(())
        })
    }

    fn with_service_binding(
        &self,
        snapshot: &SnapshotId,
        alias: &str,
        service: &ServiceId,
    ) -> RuntimeResult<SnapshotId> {
        self.derive(snapshot, format!("with_service_binding {alias}"), |s| {
            s.bindings.push((alias.to_string(), service.clone()));
            Ok(())
        })
    }

    fn with_new_file(
        &self,
        snapshot: &SnapshotId,
        path: &str,
        contents: &str,
    ) -> RuntimeResult<SnapshotId> {
        self.derive(snapshot, format!("with_new_file {path}"), |s| {
            s.files.insert(resolve(&s.workdir, path), contents.to_string());
            Ok(())
        })
    }

    fn without_file(&self, snapshot: &SnapshotId, path: &str) -> RuntimeResult<SnapshotId> {
        self.derive(snapshot, format!("without_file {path}"), |s| {
            match s.files.remove(&resolve(&s.workdir, path)) {
                Some(_) => Ok(()),
                None => Err(RuntimeError::Other(anyhow!("no such file {path}"))),
            }
        })
    }

    fn with_patch(&self, snapshot: &SnapshotId, dir: &str, patch: &str) -> RuntimeResult<SnapshotId> {
        self.derive(snapshot, format!("with_patch {dir} {}", patch.len()), |s| {
            let target = patch_target(patch)
                .ok_or_else(|| RuntimeError::Other(anyhow!("patch names no file")))?;
            let base_dir = resolve(&s.workdir, dir);
            let full = resolve(&base_dir, target);
            let base = s.files.get(&full).cloned().unwrap_or_default();
            let patched = apply_unified_diff(&base, patch)?;
            s.files.insert(full, patched);
            Ok(())
        })
    }

    fn exec(
        &self,
        snapshot: &SnapshotId,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> RuntimeResult<ExecOutcome> {
        let mut working = {
            let mut inner = self.inner.lock();
            let line = request.args.join(" ");
            inner.calls.push(format!("exec {line}"));
            if inner.failing_commands.iter().any(|needle| line.contains(needle)) {
                return Err(RuntimeError::Other(anyhow!("engine unavailable")));
            }
            inner.snapshot(snapshot)?
        };
        let result = match request.args.as_slice() {
            [] => ShellResult {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
            [_, flag, script] if flag == "-c" => run_script(&mut working, script, cancel)?,
            other => {
                return Err(RuntimeError::Other(anyhow!("unsupported argv {other:?}")));
            }
        };
        let id = self.inner.lock().store(working);
        Ok(ExecOutcome {
            snapshot: id,
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    fn start_service(
        &self,
        snapshot: &SnapshotId,
        request: &ExecRequest,
        cancel: &CancelToken,
    ) -> RuntimeResult<ServiceId> {
        let behavior = {
            let mut inner = self.inner.lock();
            inner.snapshot(snapshot)?;
            let line = request.args.join(" ");
            inner.calls.push(format!("start_service {line}"));
            if inner.failing_commands.iter().any(|needle| line.contains(needle)) {
                return Err(RuntimeError::Other(anyhow!("engine unavailable")));
            }
            inner.service_behavior.clone().unwrap_or(ServiceBehavior::Ready)
        };
        match behavior {
            ServiceBehavior::Ready => {
                let mut inner = self.inner.lock();
                inner.next_id += 1;
                let id = ServiceId(format!("svc-{}", inner.next_id));
                inner.services.insert(id.clone(), true);
                Ok(id)
            }
            ServiceBehavior::Hang => loop {
                if cancel.is_cancelled() {
                    return Err(RuntimeError::Cancelled);
                }
                if cancel.is_expired() {
                    return Err(RuntimeError::DeadlineExceeded);
                }
                cancel.sleep(Duration::from_millis(5));
            },
            ServiceBehavior::Exit { exit_code, stderr } => Err(RuntimeError::Exec {
                exit_code,
                stdout: String::new(),
                stderr,
            }),
        }
    }

    fn stop_service(&self, service: &ServiceId) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("stop_service {service}"));
        match inner.services.get_mut(service) {
            Some(running) => {
                *running = false;
                Ok(())
            }
            None => Err(RuntimeError::Other(anyhow!("unknown service {service}"))),
        }
    }

    fn service_endpoint(&self, service: &ServiceId, port: u16) -> RuntimeResult<String> {
        Ok(format!("tcp://{service}:{port}"))
    }

    fn tunnel(&self, service: &ServiceId, port: u16) -> RuntimeResult<String> {
        self.inner
            .lock()
            .calls
            .push(format!("tunnel {service} {port}"));
        Ok(format!("tcp://127.0.0.1:{}", 40_000 + u32::from(port) % 20_000))
    }

    fn read_file(&self, snapshot: &SnapshotId, path: &str) -> RuntimeResult<String> {
        let inner = self.inner.lock();
        let snapshot = inner.snapshot(snapshot)?;
        snapshot
            .files
            .get(&resolve(&snapshot.workdir, path))
            .cloned()
            .ok_or_else(|| RuntimeError::Other(anyhow!("no such file {path}")))
    }

    fn list_entries(&self, snapshot: &SnapshotId, path: &str) -> RuntimeResult<Vec<String>> {
        let inner = self.inner.lock();
        let snapshot = inner.snapshot(snapshot)?;
        let dir = resolve(&snapshot.workdir, path);
        let entries: BTreeSet<String> = snapshot
            .files
            .keys()
            .filter_map(|file| under(&dir, file))
            .map(|rest| match rest.split_once('/') {
                Some((first, _)) => format!("{first}/"),
                None => rest,
            })
            .collect();
        Ok(entries.into_iter().collect())
    }

    fn sync(&self, snapshot: &SnapshotId) -> RuntimeResult<SnapshotId> {
        let mut inner = self.inner.lock();
        inner.snapshot(snapshot)?;
        inner.calls.push(format!("sync {snapshot}"));
        Ok(snapshot.clone())
    }

    fn publish(&self, snapshot: &SnapshotId, target: &str) -> RuntimeResult<String> {
        let mut inner = self.inner.lock();
        inner.snapshot(snapshot)?;
        inner.calls.push(format!("publish {target}"));
        Ok(format!("{target}@{snapshot}"))
    }

    fn terminal(&self, snapshot: &SnapshotId, command: &[String]) -> RuntimeResult<()> {
        let mut inner = self.inner.lock();
        inner.snapshot(snapshot)?;
        inner.calls.push(format!("terminal {}", command.join(" ")));
        Ok(())
    }
}

/// Settings with short grace and poll intervals.
pub fn fast_settings() -> Settings {
    Settings {
        service_start_timeout_secs: 1,
        kill_grace_millis: 50,
        lock_poll_millis: 10,
        ..Settings::default()
    }
}

/// Host-mode config rooted at `workdir`.
pub fn host_config(workdir: &Path) -> EnvironmentConfig {
    EnvironmentConfig {
        base_image: "host".to_string(),
        workdir: workdir.to_string_lossy().into_owned(),
        ..EnvironmentConfig::default()
    }
}

/// Fresh temporary directory for a host environment.
pub fn host_workdir() -> tempfile::TempDir {
    tempfile::tempdir().expect("create temp workdir")
}
