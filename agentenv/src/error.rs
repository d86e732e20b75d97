//! Error kinds surfaced by environment and lock operations.
//!
//! A command's own non-zero exit is never one of these: it is an agent-visible
//! result and travels in the output payload. Errors here mean the operation
//! itself could not be carried out.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::search_replace::MatchCandidate;
use crate::io::repo_lock::LockDomain;

pub type EnvResult<T> = Result<T, EnvError>;

/// Execution strategy of an environment, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    Container,
    Host,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionMode::Container => f.write_str("container"),
            ExecutionMode::Host => f.write_str("host"),
        }
    }
}

/// Build step that produced a [`EnvError::Build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Setup,
    Install,
    Service,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildPhase::Setup => f.write_str("setup"),
            BuildPhase::Install => f.write_str("install"),
            BuildPhase::Service => f.write_str("service"),
        }
    }
}

#[derive(Debug, Error)]
pub enum EnvError {
    /// Malformed `env`/`secret` entry or otherwise unusable configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(
        "{phase} command {command:?} failed with exit code {exit_code}\nstdout: {stdout}\nstderr: {stderr}"
    )]
    Build {
        phase: BuildPhase,
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// The runtime or host could not execute the request at all.
    #[error("infrastructure error: {0:#}")]
    Infra(#[from] anyhow::Error),

    #[error("invalid line range: {0}")]
    Range(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{}", describe_ambiguous(.path, .matches))]
    AmbiguousMatch {
        path: String,
        matches: Vec<MatchCandidate>,
    },

    #[error("service failed to start within {timeout:?}")]
    ServiceStartTimeout { timeout: Duration },

    #[error("{operation} is not supported in {mode} mode")]
    Unsupported {
        operation: &'static str,
        mode: ExecutionMode,
    },

    #[error("timed out acquiring {domain} lock for {}", .repo.display())]
    LockTimeout { domain: LockDomain, repo: PathBuf },
}

impl EnvError {
    /// True when the error is the caller's cancellation or deadline.
    pub fn is_cancellation(&self) -> bool {
        match self {
            EnvError::Infra(err) => err.downcast_ref::<Cancelled>().is_some(),
            EnvError::LockTimeout { .. } => true,
            _ => false,
        }
    }
}

/// Marker carried inside [`EnvError::Infra`] when a blocking step was aborted.
#[derive(Debug, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

fn describe_ambiguous(path: &str, matches: &[MatchCandidate]) -> String {
    let blocks: Vec<String> = matches
        .iter()
        .enumerate()
        .map(|(i, m)| format!("Match {} (ID: {}):\n{}", i + 1, m.id, m.context))
        .collect();
    format!(
        "multiple matches found for search text in {path}. Retry with one of the following match ids:\n\n{}",
        blocks.join("\n\n")
    )
}
