//! Named backend instances built from configuration.

use super::{
    Backend, ClusterBackend, ComposeBackend, ComposeConfig, DockerBackend, DockerConfig,
    KindConfig, KubernetesConfig, LocalConfig, LocalProcessBackend,
};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Names that resolve without any configuration.
pub const BUILTIN_BACKENDS: [&str; 5] = ["local", "docker", "compose", "kind", "kubernetes"];

/// Configuration of one backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Local processes.
    Local(LocalConfig),
    /// Single containers.
    Docker(DockerConfig),
    /// A compose project.
    Compose(ComposeConfig),
    /// An ephemeral kind cluster.
    Kind(KindConfig),
    /// A persistent cluster.
    Kubernetes(KubernetesConfig),
}

impl BackendConfig {
    /// The default configuration of a built-in backend.
    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        match name {
            "local" => Some(Self::Local(LocalConfig::default())),
            "docker" => Some(Self::Docker(DockerConfig::default())),
            "compose" => Some(Self::Compose(ComposeConfig::default())),
            "kind" => Some(Self::Kind(KindConfig::default())),
            "kubernetes" => Some(Self::Kubernetes(KubernetesConfig::default())),
            _ => None,
        }
    }

    /// The type name, as written in configuration.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Docker(_) => "docker",
            Self::Compose(_) => "compose",
            Self::Kind(_) => "kind",
            Self::Kubernetes(_) => "kubernetes",
        }
    }

    /// Instantiates the backend under the given name.
    #[must_use]
    pub fn build(&self, name: &str) -> Arc<dyn Backend> {
        match self {
            Self::Local(config) => Arc::new(LocalProcessBackend::from_config(name, config)),
            Self::Docker(config) => Arc::new(DockerBackend::new(name, config.clone())),
            Self::Compose(config) => Arc::new(ComposeBackend::new(name, config.clone())),
            Self::Kind(config) => Arc::new(ClusterBackend::ephemeral(name, config.clone())),
            Self::Kubernetes(config) => Arc::new(ClusterBackend::persistent(name, config.clone())),
        }
    }
}

/// Resolves backend names to instances.
///
/// Configured entries take precedence over built-ins of the same name.
#[derive(Debug, Clone, Default)]
pub struct BackendRegistry {
    configured: BTreeMap<String, BackendConfig>,
}

impl BackendRegistry {
    /// Creates a registry with only the built-ins.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry from configured instances.
    #[must_use]
    pub fn from_configs(configured: BTreeMap<String, BackendConfig>) -> Self {
        Self { configured }
    }

    /// Adds or replaces a named instance.
    #[must_use]
    pub fn with_backend(mut self, name: impl Into<String>, config: BackendConfig) -> Self {
        self.configured.insert(name.into(), config);
        self
    }

    /// Every resolvable name: built-ins first, then configured extras.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN_BACKENDS.iter().map(ToString::to_string).collect();
        names.extend(
            self.configured
                .keys()
                .filter(|name| !BUILTIN_BACKENDS.contains(&name.as_str()))
                .cloned(),
        );
        names
    }

    /// The configuration a name resolves to.
    #[must_use]
    pub fn config_for(&self, name: &str) -> Option<BackendConfig> {
        self.configured
            .get(name)
            .cloned()
            .or_else(|| BackendConfig::builtin(name))
    }

    /// Instantiates one backend.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG-UNKNOWN-BACKEND` error for an unknown name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Backend>, ConfigError> {
        self.config_for(name)
            .map(|config| config.build(name))
            .ok_or_else(|| ConfigError::unknown_backend(name))
    }

    /// Instantiates several backends, rejecting unknown or repeated names.
    ///
    /// # Errors
    ///
    /// Returns the first unknown name, or an error for an empty selection.
    pub fn resolve_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<Arc<dyn Backend>>, ConfigError> {
        if names.is_empty() {
            return Err(ConfigError::new("No backends selected"));
        }
        let mut seen = Vec::new();
        let mut backends = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref().trim();
            if seen.contains(&name) {
                continue;
            }
            seen.push(name);
            backends.push(self.resolve(name)?);
        }
        Ok(backends)
    }
}
