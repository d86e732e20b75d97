//! Developer entry point for agent environments.
//!
//! `agentenv run` builds a host-mode environment from a worktree and runs one
//! command in it; `agentenv lock` runs a command while holding a repository
//! lock, the same lock agents take around shared git operations.

use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::time::Duration;

use agentenv::cancel::CancelToken;
use agentenv::environment::CreateRequest;
use agentenv::environment::backend::CommandSpec;
use agentenv::environment::config::{EnvironmentConfig, HOST_IMAGE};
use agentenv::environment::registry::EnvironmentRegistry;
use agentenv::error::EnvError;
use agentenv::exit_codes;
use agentenv::io::config::{Settings, load_environment_config, load_settings};
use agentenv::io::repo_lock::{LockDomain, RepositoryLocks};
use agentenv::logging;
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(
    name = "agentenv",
    version,
    about = "Isolated execution environments for coding agents"
)]
struct Cli {
    /// Settings file (TOML). Defaults apply when missing.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a host environment for a worktree and run one command in it.
    Run {
        /// Worktree the environment operates on.
        #[arg(long)]
        workdir: PathBuf,
        /// Environment config (TOML). Defaults to `<workdir>/.agentenv/environment.toml`.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Command to run, after `--`.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// Run a command while holding a repository lock.
    Lock {
        #[arg(long)]
        repo: PathBuf,
        #[arg(long, value_enum)]
        domain: DomainArg,
        /// Take the lock shared instead of exclusive.
        #[arg(long)]
        shared: bool,
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Command to run, after `--`.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DomainArg {
    Repo,
    Worktree,
    Notes,
}

impl From<DomainArg> for LockDomain {
    fn from(value: DomainArg) -> Self {
        match value {
            DomainArg::Repo => LockDomain::Repo,
            DomainArg::Worktree => LockDomain::Worktree,
            DomainArg::Notes => LockDomain::Notes,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            let code = match err.downcast_ref::<EnvError>() {
                Some(EnvError::LockTimeout { .. }) => exit_codes::LOCK_TIMEOUT,
                _ => exit_codes::INVALID,
            };
            std::process::exit(code);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let settings = match &cli.settings {
        Some(path) => load_settings(path)?,
        None => Settings::default(),
    };
    match cli.command {
        Command::Run {
            workdir,
            config,
            command,
        } => cmd_run(settings, &workdir, config.as_deref(), &command),
        Command::Lock {
            repo,
            domain,
            shared,
            timeout_secs,
            command,
        } => cmd_lock(
            &settings,
            &repo,
            domain.into(),
            shared,
            Duration::from_secs(timeout_secs),
            &command,
        ),
    }
}

fn cmd_run(
    settings: Settings,
    workdir: &Path,
    config_path: Option<&Path>,
    command: &[String],
) -> Result<i32> {
    let workdir = workdir
        .canonicalize()
        .with_context(|| format!("resolve workdir {}", workdir.display()))?;
    let mut config = match config_path {
        Some(path) => {
            let raw =
                std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
            toml::from_str::<EnvironmentConfig>(&raw)
                .with_context(|| format!("parse {}", path.display()))?
        }
        None => load_environment_config(&workdir)?,
    };
    // No container runtime is linked into this binary.
    config.base_image = HOST_IMAGE.to_string();
    config.workdir = workdir.to_string_lossy().into_owned();

    let registry = EnvironmentRegistry::host_only(settings);
    let request = CreateRequest::new("cli", config);
    let notes = request.notes.clone();
    let cancel = CancelToken::new();

    let env = match registry.create(request, &cancel) {
        Ok(env) => env,
        Err(err) => {
            eprint!("{}", notes.pop());
            return Err(err.into());
        }
    };
    let output = env.run(&CommandSpec::new(command.join(" ")), &cancel)?;
    println!("{output}");
    eprint!("{}", env.notes().pop());
    registry.remove(env.id());
    Ok(exit_codes::OK)
}

fn cmd_lock(
    settings: &Settings,
    repo: &Path,
    domain: LockDomain,
    shared: bool,
    timeout: Duration,
    command: &[String],
) -> Result<i32> {
    let manager = RepositoryLocks::from_settings(settings).for_repo(repo)?;
    let cancel = CancelToken::with_timeout(timeout);
    let body = || -> Result<i32> {
        let status = ProcessCommand::new("sh")
            .arg("-c")
            .arg(command.join(" "))
            .status()
            .context("spawn locked command")?;
        if !status.success() {
            bail!("locked command failed with {status}");
        }
        Ok(exit_codes::OK)
    };
    if shared {
        manager.with_rlock(domain, &cancel, body)
    } else {
        manager.with_lock(domain, &cancel, body)
    }
}
