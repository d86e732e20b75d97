//! Owner of the live environments of one process.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{info, instrument};

use crate::cancel::CancelToken;
use crate::environment::backend::select_backend;
use crate::environment::{CreateRequest, Environment};
use crate::error::EnvResult;
use crate::io::config::Settings;
use crate::runtime::ContainerRuntime;

const SLUG_MAX_LEN: usize = 32;

/// Environments keyed by id.
///
/// Created once by the layer that serves agents and passed down; there is no
/// process-wide instance.
pub struct EnvironmentRegistry {
    settings: Settings,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    environments: RwLock<BTreeMap<String, Arc<Environment>>>,
}

impl EnvironmentRegistry {
    /// Registry without a container runtime; only host environments can be built.
    pub fn host_only(settings: Settings) -> Self {
        Self {
            settings,
            runtime: None,
            environments: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_runtime(settings: Settings, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            settings,
            runtime: Some(runtime),
            environments: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Build an environment and register it under a fresh id.
    #[instrument(skip_all, fields(title = %request.title))]
    pub fn create(
        &self,
        request: CreateRequest,
        cancel: &CancelToken,
    ) -> EnvResult<Arc<Environment>> {
        let backend = select_backend(&request.config, self.runtime.clone(), &self.settings)?;
        let id = generate_environment_id(&request.title);
        let env = Arc::new(Environment::create(id, request, backend, cancel)?);
        self.insert(Arc::clone(&env));
        info!(env = env.id(), "environment registered");
        Ok(env)
    }

    /// Restore a persisted environment and register it.
    pub fn load(&self, id: &str, state_json: &str, worktree: &Path) -> EnvResult<Arc<Environment>> {
        let env = Arc::new(Environment::load(
            id.to_string(),
            state_json,
            worktree,
            self.runtime.clone(),
            &self.settings,
        )?);
        self.insert(Arc::clone(&env));
        Ok(env)
    }

    /// Register `env`, replacing (and terminating) any environment with the same id.
    pub fn insert(&self, env: Arc<Environment>) {
        let previous = self.environments.write().insert(env.id().to_string(), env);
        if let Some(previous) = previous {
            previous.terminate();
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<Environment>> {
        self.environments.read().get(id).cloned()
    }

    /// All environments in id order.
    pub fn list(&self) -> Vec<Arc<Environment>> {
        self.environments.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.environments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.environments.read().is_empty()
    }

    /// Unregister `id` and stop everything it started.
    pub fn remove(&self, id: &str) -> Option<Arc<Environment>> {
        let env = self.environments.write().remove(id)?;
        env.terminate();
        info!(env = id, "environment removed");
        Some(env)
    }
}

/// `<slug>-<6 random lowercase alphanumerics>` derived from `title`.
pub fn generate_environment_id(title: &str) -> String {
    format!("{}-{}", slugify(title), short_suffix())
}

fn slugify(title: &str) -> String {
    let mut slug = String::new();
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
        if slug.len() >= SLUG_MAX_LEN {
            break;
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "env".to_string()
    } else {
        slug.to_string()
    }
}

fn short_suffix() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
