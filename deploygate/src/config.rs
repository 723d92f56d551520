//! Deployment configuration files.
//!
//! A configuration holds run settings, named backend instances and the stage
//! list. YAML (`.yaml`/`.yml`) and JSON (`.json`) are accepted; any other
//! extension is parsed as YAML.

use crate::backends::{BackendConfig, BackendRegistry};
use crate::errors::{codes, ConfigError, ErrorInfo};
use crate::graph::{StageGraph, StageSpec};
use crate::orchestrator::RunSettings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// The contents of a deployment configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeploymentConfig {
    /// Run settings.
    #[serde(default)]
    pub settings: RunSettings,
    /// Named backend instances; entries override built-ins of the same name.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
    /// The stages to deploy.
    #[serde(default)]
    pub stages: Vec<StageSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Yaml,
    Json,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

fn parse_error(source: &str, detail: impl std::fmt::Display) -> ConfigError {
    ConfigError::new(format!("Failed to load configuration from {source}: {detail}")).with_error_info(
        ErrorInfo::new(codes::PARSE, format!("Configuration {source} could not be loaded"))
            .with_context_entry("path", source),
    )
}

impl DeploymentConfig {
    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG-PARSE` error naming the path if the file cannot be
    /// read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|e| parse_error(&source, e))?;
        let format = Format::for_path(path);
        debug!(path = %source, ?format, "loading configuration");
        match format {
            Format::Json => serde_json::from_str(&raw).map_err(|e| parse_error(&source, e)),
            Format::Yaml => serde_yaml::from_str(&raw).map_err(|e| parse_error(&source, e)),
        }
    }

    /// Parses YAML text.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG-PARSE` error.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| parse_error("<yaml>", e))
    }

    /// Parses JSON text.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG-PARSE` error.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| parse_error("<json>", e))
    }

    /// The backend registry: built-ins plus configured instances.
    #[must_use]
    pub fn registry(&self) -> BackendRegistry {
        BackendRegistry::from_configs(self.backends.clone())
    }

    /// Validates the stages and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error: empty list, duplicate name,
    /// missing dependency, invalid stage or cycle.
    pub fn build_graph(&self) -> Result<StageGraph, ConfigError> {
        StageGraph::build(self.stages.iter().cloned())
    }
}
