//! Catalog ownership and dependency resolution.
//!
//! The registry owns the full set of known [`ServiceDefinition`]s and
//! resolves a requested set of names into a dependency-closed, ordered
//! selection. Catalog loading reads one fragment file per sub-directory;
//! unreadable entries are skipped with a warning so a single broken file
//! does not take the whole catalog down.

use std::collections::BTreeMap;
use std::path::Path;

use stacksmith_common::constants::FRAGMENT_FILE;
use stacksmith_common::error::StacksmithError;

use crate::error::{ComposeError, Result};
use crate::graph::DependencyGraph;
use crate::model::{ResolvedSelection, ServiceDefinition};

/// Findings from a fragment sanity check.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    /// Catalog entry the report is about.
    pub service: String,
    /// Error-level findings.
    pub errors: Vec<String>,
    /// Warning-level findings.
    pub warnings: Vec<String>,
}

impl ValidationReport {
    /// Whether the entry has no error-level findings.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Owns the catalog and resolves selections over it.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, ServiceDefinition>,
}

impl ServiceRegistry {
    /// Builds a registry from in-memory definitions.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::CyclicDependency`] for a self-dependency and
    /// a configuration error for duplicate catalog keys or unnamed entries.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ServiceDefinition>,
    ) -> Result<Self> {
        let mut services = BTreeMap::new();
        for definition in definitions {
            if definition.name.is_empty() {
                return Err(ComposeError::config("catalog entry with an empty name"));
            }
            if definition.dependencies.iter().any(|d| *d == definition.name) {
                return Err(ComposeError::CyclicDependency {
                    path: vec![definition.name.clone(), definition.name.clone()],
                });
            }
            let name = definition.name.clone();
            if services.insert(name.clone(), definition).is_some() {
                return Err(ComposeError::config(format!(
                    "duplicate catalog entry \"{name}\""
                )));
            }
        }
        Ok(Self { services })
    }

    /// Loads a catalog from a directory: one sub-directory per entry, each
    /// containing a fragment file.
    ///
    /// Unreadable or unparsable entries are skipped with a warning. Hidden
    /// directories are ignored.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be read or no valid entry was found.
    pub fn load_dir(path: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(path).map_err(|e| StacksmithError::io(path, e))?;

        let mut definitions = Vec::new();
        let mut skipped = 0usize;
        for entry in entries {
            let entry = entry.map_err(|e| StacksmithError::io(path, e))?;
            let file_type = entry.file_type().map_err(|e| StacksmithError::io(entry.path(), e))?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            match Self::load_entry(&entry.path(), &name) {
                Ok(definition) => definitions.push(definition),
                Err(error) => {
                    skipped += 1;
                    tracing::warn!(service = %name, %error, "skipping unloadable catalog entry");
                }
            }
        }

        if definitions.is_empty() {
            return Err(ComposeError::config(format!(
                "no valid services found in {}",
                path.display()
            )));
        }
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!(loaded = definitions.len(), skipped, "catalog loaded");
        Self::from_definitions(definitions)
    }

    fn load_entry(dir: &Path, name: &str) -> Result<ServiceDefinition> {
        let fragment_path = dir.join(FRAGMENT_FILE);
        let raw = std::fs::read_to_string(&fragment_path)
            .map_err(|e| StacksmithError::io(&fragment_path, e))?;
        let mut definition: ServiceDefinition =
            serde_yaml::from_str(&raw).map_err(StacksmithError::from)?;
        definition.name = name.to_owned();
        Self::extract_external_depends(&mut definition);
        Ok(definition)
    }

    /// Unions declared dependencies with external `depends_on` references:
    /// names a fragment depends on that are not fragments of the same
    /// catalog entry must be other catalog entries.
    fn extract_external_depends(definition: &mut ServiceDefinition) {
        let internal: Vec<String> = definition.services.keys().cloned().collect();
        let mut external = Vec::new();
        for fragment in definition.services.values() {
            if let Some(depends) = &fragment.depends_on {
                for dep in depends.service_names() {
                    if !internal.iter().any(|n| n == dep)
                        && !definition.dependencies.iter().any(|n| n == dep)
                        && !external.iter().any(|n: &String| n == dep)
                    {
                        external.push(dep.to_owned());
                    }
                }
            }
        }
        definition.dependencies.extend(external);
    }

    /// Whether the catalog contains an entry.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// All catalog entry names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.services.keys().map(String::as_str).collect()
    }

    /// Looks up one definition.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownService`] on a miss.
    pub fn get(&self, name: &str) -> Result<&ServiceDefinition> {
        self.services
            .get(name)
            .ok_or_else(|| ComposeError::UnknownService { name: name.to_owned() })
    }

    /// Looks up several definitions; pure lookup, no merge logic.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownService`] for any miss.
    pub fn get_many(&self, names: &[String]) -> Result<Vec<&ServiceDefinition>> {
        names.iter().map(|name| self.get(name)).collect()
    }

    /// Resolves a non-empty request into a dependency-closed, ordered
    /// selection.
    ///
    /// # Errors
    ///
    /// Fails with [`ComposeError::UnknownService`] for unknown requested or
    /// traversed names and [`ComposeError::CyclicDependency`] for cycles.
    pub fn resolve(&self, requested: &[String]) -> Result<ResolvedSelection> {
        if requested.is_empty() {
            return Err(ComposeError::config("no services requested"));
        }

        let mut graph = DependencyGraph::new();
        for (name, definition) in &self.services {
            graph.add_service(name);
            for dependency in &definition.dependencies {
                graph.add_dependency(name, dependency);
            }
        }

        let order = graph.resolution_order(requested)?;
        tracing::debug!(requested = ?requested, resolved = ?order, "selection resolved");
        Ok(ResolvedSelection::new(order))
    }

    /// Sanity-checks one catalog entry's fragments.
    ///
    /// A fragment with neither `image` nor `build` is an error; a declared
    /// dependency missing from the catalog is a warning (it may be provided
    /// by another catalog snapshot).
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::UnknownService`] when the entry itself is
    /// not in the catalog.
    pub fn validate(&self, name: &str) -> Result<ValidationReport> {
        let definition = self.get(name)?;
        let mut report = ValidationReport {
            service: name.to_owned(),
            ..ValidationReport::default()
        };

        if definition.services.is_empty() {
            report
                .errors
                .push("no container services defined in fragment file".to_owned());
        }
        for (fragment_name, fragment) in &definition.services {
            if fragment.image.is_none() && !fragment.extra.contains_key("build") {
                report.errors.push(format!(
                    "service \"{fragment_name}\" has neither \"image\" nor \"build\""
                ));
            }
        }
        for dependency in &definition.dependencies {
            if !self.contains(dependency) {
                report.warnings.push(format!(
                    "dependency \"{dependency}\" is not in the catalog"
                ));
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_entry(name: &str, yaml: &str, dependencies: &[&str]) -> ServiceDefinition {
        let mut definition: ServiceDefinition = serde_yaml::from_str(yaml).expect("valid yaml");
        definition.name = name.to_owned();
        definition
            .dependencies
            .extend(dependencies.iter().map(|d| (*d).to_owned()));
        definition
    }

    fn simple_entry(name: &str, dependencies: &[&str]) -> ServiceDefinition {
        catalog_entry(
            name,
            &format!("services:\n  {name}:\n    image: {name}:latest\n"),
            dependencies,
        )
    }

    #[test]
    fn resolve_includes_transitive_dependencies_in_order() {
        let registry = ServiceRegistry::from_definitions([
            simple_entry("kafka", &["zookeeper"]),
            simple_entry("zookeeper", &[]),
        ])
        .expect("registry");

        let selection = registry.resolve(&["kafka".into()]).expect("resolve");
        assert_eq!(selection.names(), ["zookeeper".to_owned(), "kafka".to_owned()]);
    }

    #[test]
    fn resolve_unknown_name_fails() {
        let registry =
            ServiceRegistry::from_definitions([simple_entry("redis", &[])]).expect("registry");
        let err = registry.resolve(&["ghost".into()]).expect_err("should fail");
        assert!(matches!(err, ComposeError::UnknownService { name } if name == "ghost"));
    }

    #[test]
    fn resolve_empty_request_fails() {
        let registry =
            ServiceRegistry::from_definitions([simple_entry("redis", &[])]).expect("registry");
        assert!(registry.resolve(&[]).is_err());
    }

    #[test]
    fn resolve_cycle_names_participants() {
        let registry = ServiceRegistry::from_definitions([
            simple_entry("a", &["b"]),
            simple_entry("b", &["a"]),
        ])
        .expect("registry");

        let err = registry.resolve(&["a".into()]).expect_err("cycle");
        let msg = err.to_string();
        assert!(msg.contains('a') && msg.contains('b'), "got: {msg}");
    }

    #[test]
    fn self_dependency_rejected_at_construction() {
        let err = ServiceRegistry::from_definitions([simple_entry("narcissus", &["narcissus"])])
            .expect_err("self-dependency");
        assert!(matches!(err, ComposeError::CyclicDependency { .. }));
    }

    #[test]
    fn duplicate_catalog_key_rejected() {
        let err = ServiceRegistry::from_definitions([
            simple_entry("redis", &[]),
            simple_entry("redis", &[]),
        ])
        .expect_err("duplicate");
        assert!(err.to_string().contains("duplicate catalog entry"));
    }

    #[test]
    fn get_many_is_pure_lookup() {
        let registry = ServiceRegistry::from_definitions([
            simple_entry("redis", &[]),
            simple_entry("postgres", &[]),
        ])
        .expect("registry");

        let defs = registry
            .get_many(&["postgres".into(), "redis".into()])
            .expect("lookup");
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "postgres");
        assert!(registry.get_many(&["ghost".into()]).is_err());
    }

    #[test]
    fn load_dir_reads_fragments_and_extracts_depends_on() {
        let dir = tempfile::tempdir().expect("tempdir");
        let kafka_dir = dir.path().join("kafka");
        std::fs::create_dir(&kafka_dir).expect("mkdir");
        std::fs::write(
            kafka_dir.join(FRAGMENT_FILE),
            "services:\n  kafka:\n    image: kafka:3.7\n    depends_on:\n      - zookeeper\n",
        )
        .expect("write");

        let zk_dir = dir.path().join("zookeeper");
        std::fs::create_dir(&zk_dir).expect("mkdir");
        std::fs::write(
            zk_dir.join(FRAGMENT_FILE),
            "services:\n  zookeeper:\n    image: zookeeper:3.9\n",
        )
        .expect("write");

        let registry = ServiceRegistry::load_dir(dir.path()).expect("load");
        assert_eq!(registry.names(), vec!["kafka", "zookeeper"]);
        assert_eq!(
            registry.get("kafka").expect("kafka").dependencies,
            vec!["zookeeper".to_owned()]
        );
    }

    #[test]
    fn load_dir_skips_broken_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("redis");
        std::fs::create_dir(&good).expect("mkdir");
        std::fs::write(
            good.join(FRAGMENT_FILE),
            "services:\n  redis:\n    image: redis:7\n",
        )
        .expect("write");

        let broken = dir.path().join("broken");
        std::fs::create_dir(&broken).expect("mkdir");
        std::fs::write(broken.join(FRAGMENT_FILE), ":- not yaml {").expect("write");

        let empty = dir.path().join("no-fragment");
        std::fs::create_dir(&empty).expect("mkdir");

        let registry = ServiceRegistry::load_dir(dir.path()).expect("load");
        assert_eq!(registry.names(), vec!["redis"]);
    }

    #[test]
    fn load_dir_with_no_valid_entries_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(ServiceRegistry::load_dir(dir.path()).is_err());
    }

    #[test]
    fn validate_flags_missing_image_and_dangling_dependency() {
        let registry = ServiceRegistry::from_definitions([catalog_entry(
            "webapp",
            "services:\n  webapp:\n    ports:\n      - 3000:3000\n",
            &["ghost"],
        )])
        .expect("registry");

        let report = registry.validate("webapp").expect("report");
        assert!(!report.is_valid());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn validate_accepts_build_in_place_of_image() {
        let registry = ServiceRegistry::from_definitions([catalog_entry(
            "webapp",
            "services:\n  webapp:\n    build: .\n",
            &[],
        )])
        .expect("registry");

        assert!(registry.validate("webapp").expect("report").is_valid());
    }
}
