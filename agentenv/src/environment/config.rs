//! Declarative build recipe for an environment.

use serde::{Deserialize, Serialize};

use crate::core::env_pairs::parse_pairs;
use crate::error::{EnvError, EnvResult, ExecutionMode};

/// Sentinel base image selecting host execution.
pub const HOST_IMAGE: &str = "host";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Image reference, or `host` to run directly on this machine.
    pub base_image: String,
    /// Working directory inside the snapshot, or on the host in host mode.
    pub workdir: String,
    /// Run before the source tree is materialized.
    pub setup_commands: Vec<String>,
    /// Run after the source tree is materialized.
    pub install_commands: Vec<String>,
    /// `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// `KEY=HOST_VAR` entries resolved from the invoking process at build time.
    pub secrets: Vec<String>,
    /// Services started and bound during a container build.
    pub services: Vec<ServiceConfig>,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            base_image: "ubuntu:24.04".to_string(),
            workdir: "/workdir".to_string(),
            setup_commands: Vec::new(),
            install_commands: Vec::new(),
            env: Vec::new(),
            secrets: Vec::new(),
            services: Vec::new(),
        }
    }
}

impl EnvironmentConfig {
    pub fn is_host(&self) -> bool {
        self.base_image.eq_ignore_ascii_case(HOST_IMAGE)
    }

    pub fn mode(&self) -> ExecutionMode {
        if self.is_host() {
            ExecutionMode::Host
        } else {
            ExecutionMode::Container
        }
    }

    /// Reject malformed entries before anything runs.
    pub fn validate(&self) -> EnvResult<()> {
        if self.base_image.trim().is_empty() {
            return Err(EnvError::Config("base_image must not be empty".to_string()));
        }
        if self.workdir.trim().is_empty() {
            return Err(EnvError::Config("workdir must not be empty".to_string()));
        }
        parse_pairs(&self.env, "env")?;
        parse_pairs(&self.secrets, "secret")?;
        for service in &self.services {
            service.validate()?;
        }
        Ok(())
    }
}

/// Auxiliary service (database, cache, ...) reachable from the environment
/// under `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub image: String,
    /// Empty runs the image's default command.
    pub command: String,
    pub exposed_ports: Vec<u16>,
    pub env: Vec<String>,
    pub secrets: Vec<String>,
}

impl ServiceConfig {
    pub fn validate(&self) -> EnvResult<()> {
        if self.name.trim().is_empty() {
            return Err(EnvError::Config("service name must not be empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(EnvError::Config(format!(
                "service {} has no image",
                self.name
            )));
        }
        parse_pairs(&self.env, &format!("service {} env", self.name))?;
        parse_pairs(&self.secrets, &format!("service {} secret", self.name))?;
        Ok(())
    }
}
