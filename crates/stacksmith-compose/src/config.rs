//! Project configuration: model, profile layering, and file loading.
//!
//! A project configures the composition through a single YAML document:
//! which services run by default, per-profile environment and overrides,
//! and naming (network name, volume prefix). The layering functions here
//! are pure; [`ConfigLoader`] is the thin filesystem adapter that finds
//! and parses the document, synthesizing defaults when it is absent.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use stacksmith_common::constants::{
    CONFIG_FILE_CANDIDATES, DEFAULT_SERVICES, ENGINE_NAME, default_network_name,
};
use stacksmith_common::error::StacksmithError;

use crate::error::Result;
use crate::model::CommandLine;

/// Per-service override record, applied after dependency-driven merge and
/// before conflict detection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOverride {
    /// Environment variables to set (an explicit override wins).
    pub environment: BTreeMap<String, String>,
    /// Port mappings to append, short syntax.
    pub ports: Vec<String>,
    /// Volume mounts to append, short syntax.
    pub volumes: Vec<String>,
    /// Labels to set.
    pub labels: BTreeMap<String, String>,
    /// Networks to attach.
    pub networks: Vec<String>,
    /// Command replacement.
    pub command: Option<CommandLine>,
    /// Entrypoint replacement.
    pub entrypoint: Option<CommandLine>,
    /// Arbitrary keys merged into the fragment.
    pub custom: BTreeMap<String, serde_yaml::Value>,
}

impl ServiceOverride {
    /// Merges a higher-precedence layer onto this one: maps are merged
    /// with the layer winning per key, lists are appended, and
    /// command/entrypoint are replaced when the layer sets them.
    #[must_use]
    pub fn merged_with(&self, layer: &Self) -> Self {
        let mut merged = self.clone();
        merged.environment.extend(
            layer
                .environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
            .labels
            .extend(layer.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.ports.extend(layer.ports.iter().cloned());
        merged.volumes.extend(layer.volumes.iter().cloned());
        merged.networks.extend(layer.networks.iter().cloned());
        if layer.command.is_some() {
            merged.command.clone_from(&layer.command);
        }
        if layer.entrypoint.is_some() {
            merged.entrypoint.clone_from(&layer.entrypoint);
        }
        merged
            .custom
            .extend(layer.custom.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

/// Basic project identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectInfo {
    /// Project name, used for container/network/volume naming.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Environment tag exposed as `PROJECT_ENVIRONMENT`.
    pub environment: String,
}

/// Which services a project or profile selects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSelection {
    /// Services selected when the caller names none.
    pub default: Vec<String>,
    /// Services always added to the selection.
    pub required: Vec<String>,
    /// Services removed from the selection.
    pub disabled: Vec<String>,
}

/// Project-wide override defaults, below any profile layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalOverrides {
    /// Environment added to every composed service.
    pub environment: BTreeMap<String, String>,
    /// Network name, overriding the derived default.
    pub network_name: Option<String>,
    /// Volume prefix, overriding the derived default.
    pub volume_prefix: Option<String>,
}

/// The override layers: per-service records plus global defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideLayers {
    /// Per-service override records, applied in every profile.
    pub services: BTreeMap<String, ServiceOverride>,
    /// Global defaults.
    pub global: GlobalOverrides,
}

/// One named profile's configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Free-form description.
    pub description: String,
    /// Profile-specific service selection, layered on the project's.
    pub services: ServiceSelection,
    /// Profile-specific environment, layered on the global environment.
    pub environment: BTreeMap<String, String>,
    /// Profile-specific overrides, layered on the project's.
    pub overrides: BTreeMap<String, ServiceOverride>,
    /// Services that keep host port publication under the test profile.
    pub retain_ports: Vec<String>,
}

/// Network naming configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworksConfig {
    /// The project network name.
    pub default: Option<String>,
}

/// Volume naming configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    /// Prefix applied to bare named volumes.
    pub prefix: Option<String>,
}

/// The complete project configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project identity.
    pub project: ProjectInfo,
    /// Project-wide service selection.
    pub services: ServiceSelection,
    /// Override layers.
    pub overrides: OverrideLayers,
    /// Named profiles.
    pub profiles: BTreeMap<String, ProfileConfig>,
    /// Network naming.
    pub networks: NetworksConfig,
    /// Volume naming.
    pub volumes: VolumesConfig,
}

impl ProjectConfig {
    /// Synthesizes the default configuration for a project rooted at a
    /// directory with the given name.
    #[must_use]
    pub fn default_for(project_name: &str) -> Self {
        let name = if project_name.is_empty() {
            ENGINE_NAME.to_owned()
        } else {
            project_name.to_owned()
        };

        let mut profiles = BTreeMap::new();
        let _ = profiles.insert(
            "dev".to_owned(),
            ProfileConfig {
                description: "Development environment with debugging enabled".to_owned(),
                environment: [
                    ("LOG_LEVEL".to_owned(), "DEBUG".to_owned()),
                    ("DEBUG".to_owned(), "true".to_owned()),
                ]
                .into(),
                ..ProfileConfig::default()
            },
        );
        let _ = profiles.insert(
            "test".to_owned(),
            ProfileConfig {
                description: "Test environment for automated runs".to_owned(),
                environment: [
                    ("LOG_LEVEL".to_owned(), "INFO".to_owned()),
                    ("TEST_MODE".to_owned(), "true".to_owned()),
                ]
                .into(),
                ..ProfileConfig::default()
            },
        );
        let _ = profiles.insert(
            "prod".to_owned(),
            ProfileConfig {
                description: "Production-like environment with resource limits".to_owned(),
                environment: [("LOG_LEVEL".to_owned(), "WARN".to_owned())].into(),
                ..ProfileConfig::default()
            },
        );

        Self {
            project: ProjectInfo {
                name: name.clone(),
                description: format!("Development environment for {name}"),
                environment: "development".to_owned(),
            },
            services: ServiceSelection {
                default: DEFAULT_SERVICES.iter().map(|s| (*s).to_owned()).collect(),
                ..ServiceSelection::default()
            },
            networks: NetworksConfig {
                default: Some(default_network_name(&name)),
            },
            volumes: VolumesConfig { prefix: Some(name) },
            ..Self::default()
        }
    }

    /// The effective network name.
    #[must_use]
    pub fn network_name(&self) -> String {
        self.networks
            .default
            .clone()
            .or_else(|| self.overrides.global.network_name.clone())
            .unwrap_or_else(|| default_network_name(&self.project.name))
    }

    /// The effective volume prefix.
    #[must_use]
    pub fn volume_prefix(&self) -> String {
        self.volumes
            .prefix
            .clone()
            .or_else(|| self.overrides.global.volume_prefix.clone())
            .unwrap_or_else(|| self.project.name.clone())
    }

    /// The service list for a profile: project default + required, plus
    /// the profile's own, minus disabled, deduplicated in first-seen order.
    #[must_use]
    pub fn services_for_profile(&self, profile: &str) -> Vec<String> {
        let mut candidates: Vec<&String> = Vec::new();
        candidates.extend(&self.services.default);
        candidates.extend(&self.services.required);
        let profile_config = self.profiles.get(profile);
        if let Some(config) = profile_config {
            candidates.extend(&config.services.default);
            candidates.extend(&config.services.required);
        }

        let mut disabled: BTreeSet<&String> = self.services.disabled.iter().collect();
        if let Some(config) = profile_config {
            disabled.extend(&config.services.disabled);
        }

        let mut seen = BTreeSet::new();
        candidates
            .into_iter()
            .filter(|name| !disabled.contains(name) && seen.insert(name.as_str()))
            .cloned()
            .collect()
    }

    /// Per-service overrides for a profile: the project layer first, then
    /// the profile layer merged on top.
    #[must_use]
    pub fn service_overrides(&self, profile: &str) -> BTreeMap<String, ServiceOverride> {
        let mut overrides = self.overrides.services.clone();
        if let Some(config) = self.profiles.get(profile) {
            for (name, layer) in &config.overrides {
                let merged = overrides
                    .get(name)
                    .map_or_else(|| layer.clone(), |base| base.merged_with(layer));
                let _ = overrides.insert(name.clone(), merged);
            }
        }
        overrides
    }

    /// The global environment for a profile: global layer, then profile
    /// layer, then the injected project variables.
    #[must_use]
    pub fn global_environment(&self, profile: &str) -> BTreeMap<String, String> {
        let mut environment = self.overrides.global.environment.clone();
        if let Some(config) = self.profiles.get(profile) {
            environment.extend(
                config
                    .environment
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }
        let _ = environment.insert("PROJECT_NAME".to_owned(), self.project.name.clone());
        if !self.project.environment.is_empty() {
            let _ = environment.insert(
                "PROJECT_ENVIRONMENT".to_owned(),
                self.project.environment.clone(),
            );
        }
        environment
    }

    /// Services that keep host port publication under the test profile:
    /// the profile's `retain_ports` when set, the stock data services
    /// otherwise.
    #[must_use]
    pub fn retain_ports(&self, profile: &str) -> BTreeSet<String> {
        self.profiles
            .get(profile)
            .filter(|config| !config.retain_ports.is_empty())
            .map_or_else(
                || DEFAULT_SERVICES.iter().map(|s| (*s).to_owned()).collect(),
                |config| config.retain_ports.iter().cloned().collect(),
            )
    }
}

/// Thin filesystem adapter that locates and parses the project
/// configuration document.
#[derive(Debug)]
pub struct ConfigLoader {
    root: PathBuf,
}

impl ConfigLoader {
    /// Creates a loader for the given project root.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn project_name_from_root(&self) -> String {
        self.root
            .file_name()
            .map_or_else(|| ENGINE_NAME.to_owned(), |n| n.to_string_lossy().into_owned())
    }

    /// Loads the project configuration, checking the candidate file names
    /// in order and synthesizing a default when none exists.
    ///
    /// # Errors
    ///
    /// Fails when a present file cannot be read or parsed.
    pub fn load(&self) -> Result<ProjectConfig> {
        for candidate in CONFIG_FILE_CANDIDATES {
            let path = self.root.join(candidate);
            if !path.exists() {
                continue;
            }
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| StacksmithError::io(&path, e))?;
            let mut config: ProjectConfig =
                serde_yaml::from_str(&raw).map_err(StacksmithError::from)?;
            if config.project.name.is_empty() {
                config.project.name = self.project_name_from_root();
            }
            tracing::debug!(path = %path.display(), "loaded project configuration");
            return Ok(config);
        }
        tracing::debug!(root = %self.root.display(), "no project configuration, using defaults");
        Ok(ProjectConfig::default_for(&self.project_name_from_root()))
    }
}
