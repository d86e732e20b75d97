//! Mutable environment state and its persisted form.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::config::{EnvironmentConfig, HOST_IMAGE};
use crate::error::{EnvError, EnvResult};
use crate::io::config::load_environment_config;
use crate::runtime::{ServiceId, SnapshotId};

/// Current materialized state: a runtime snapshot, or the host itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SnapshotRef {
    Host,
    Container(SnapshotId),
}

impl SnapshotRef {
    pub fn as_container(&self) -> Option<&SnapshotId> {
        match self {
            SnapshotRef::Host => None,
            SnapshotRef::Container(id) => Some(id),
        }
    }
}

impl From<String> for SnapshotRef {
    fn from(value: String) -> Self {
        if value == HOST_IMAGE {
            SnapshotRef::Host
        } else {
            SnapshotRef::Container(SnapshotId(value))
        }
    }
}

impl From<SnapshotRef> for String {
    fn from(value: SnapshotRef) -> Self {
        match value {
            SnapshotRef::Host => HOST_IMAGE.to_string(),
            SnapshotRef::Container(id) => id.0,
        }
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotRef::Host => f.write_str(HOST_IMAGE),
            SnapshotRef::Container(id) => id.fmt(f),
        }
    }
}

/// Long-lived host process started by `run_background`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundProcess {
    pub pid: u32,
    pub command: String,
    pub shell: String,
    pub ports: Vec<u16>,
    pub workdir: String,
    pub started_at: DateTime<Utc>,
}

/// Addresses of one exposed port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMapping {
    /// Reachable from inside the environment.
    pub environment_internal: String,
    /// Reachable from the operator's machine.
    pub host_external: String,
}

/// Endpoints keyed by port, in port order.
pub type EndpointMappings = BTreeMap<u16, EndpointMapping>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Declared in the config and bound during the build.
    Configured,
    /// Started by `run_background`.
    Background,
}

/// Running container service owned by an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundService {
    pub name: String,
    pub id: ServiceId,
    pub kind: ServiceKind,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Ready,
    Terminated,
}

/// Everything guarded by an environment's lock.
#[derive(Debug, Clone)]
pub struct EnvironmentState {
    pub config: EnvironmentConfig,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub snapshot: SnapshotRef,
    pub background_processes: Vec<BackgroundProcess>,
    pub services: Vec<BoundService>,
    pub lifecycle: Lifecycle,
}

impl EnvironmentState {
    pub fn new(config: EnvironmentConfig, title: String, snapshot: SnapshotRef) -> Self {
        let now = Utc::now();
        Self {
            config,
            title,
            created_at: now,
            updated_at: now,
            snapshot,
            background_processes: Vec::new(),
            services: Vec::new(),
            lifecycle: Lifecycle::Ready,
        }
    }

    /// Advance `updated_at`, strictly, even when the clock has not moved.
    pub fn touch(&mut self) {
        let floor = self.updated_at + TimeDelta::nanoseconds(1);
        self.updated_at = Utc::now().max(floor);
    }

    pub fn replace_snapshot(&mut self, snapshot: SnapshotRef) {
        self.snapshot = snapshot;
        self.touch();
    }

    /// Ports held by tracked background processes and services.
    pub fn reserved_ports(&self) -> impl Iterator<Item = u16> + '_ {
        self.background_processes
            .iter()
            .flat_map(|p| p.ports.iter().copied())
            .chain(self.services.iter().flat_map(|s| s.ports.iter().copied()))
    }

    pub fn to_record(&self) -> StateRecord {
        StateRecord {
            config: Some(self.config.clone()),
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            container: self.snapshot.clone(),
            background_processes: self.background_processes.clone(),
        }
    }

    /// Rebuild state from a persisted record without rerunning the build.
    ///
    /// A record without a config takes the one stored in `worktree`. Host
    /// mode, forced or configured, rebinds the workdir to `worktree`.
    pub fn from_record(record: StateRecord, worktree: &Path, force_host: bool) -> EnvResult<Self> {
        let mut config = match record.config {
            Some(config) => config,
            None => load_environment_config(worktree)?,
        };
        if force_host {
            config.base_image = HOST_IMAGE.to_string();
        }

        let snapshot = if config.is_host() {
            config.workdir = worktree.to_string_lossy().into_owned();
            SnapshotRef::Host
        } else {
            match record.container {
                SnapshotRef::Host => {
                    return Err(EnvError::Config(
                        "container environment state has no snapshot".to_string(),
                    ));
                }
                snapshot => snapshot,
            }
        };

        Ok(Self {
            config,
            title: record.title,
            created_at: record.created_at,
            updated_at: record.updated_at,
            snapshot,
            background_processes: record.background_processes,
            services: Vec::new(),
            lifecycle: Lifecycle::Ready,
        })
    }
}

/// Serialized environment state (JSON).
///
/// Services and endpoints are runtime handles and are not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<EnvironmentConfig>,
    #[serde(default)]
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub container: SnapshotRef,
    #[serde(default)]
    pub background_processes: Vec<BackgroundProcess>,
}
