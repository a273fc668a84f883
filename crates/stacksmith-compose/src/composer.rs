//! The composition pipeline.
//!
//! Turns a requested service selection, a profile, and override records
//! into a single merged [`Topology`]. The pipeline is linear: selection,
//! load, merge, per-fragment transforms, profile transform, default
//! network, conflict analysis, optional conflict application. Any stage
//! failure aborts the whole composition with the stage name attached; no
//! partial topology is ever returned.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_yaml::{Mapping, Value};
use stacksmith_common::constants::{
    COMPOSE_VERSION, DEFAULT_SERVICES, ENGINE_NAME, GENERIC_NETWORK_ALIASES, LABEL_PROFILE,
    LABEL_SERVICE, default_network_name,
};
use stacksmith_common::error::StacksmithError;

use crate::config::{ProjectConfig, ServiceOverride};
use crate::conflict::{
    self, ConflictReport, HostPortProbe, ResolutionPlan, ResolutionPlanner, TcpConnectProbe,
};
use crate::error::{ComposeError, Diagnostic, Result};
use crate::model::{
    CommandLine, Environment, LabelSet, NetworkAttachments, PortEntry, ResolvedSelection,
    ServiceDefinition, ServiceFragment, Topology, TopologyMetadata, VolumeMount,
};
use crate::ports;
use crate::registry::ServiceRegistry;

/// Options steering one composition run.
#[derive(Debug, Clone)]
pub struct ComposeOptions {
    /// Project name used for container/network/volume naming.
    pub project_name: String,
    /// Active profile name. Unknown profiles compose without a profile
    /// transform.
    pub profile: String,
    /// The project network every service ends up on.
    pub network_name: String,
    /// Prefix applied to bare named volumes; empty disables prefixing.
    pub volume_prefix: String,
    /// Environment map used for placeholder expansion and added to every
    /// service without clobbering fragment-set keys.
    pub environment: BTreeMap<String, String>,
    /// Services selected when the caller names none.
    pub default_services: Vec<String>,
    /// Whether to close the selection over declared dependencies.
    pub include_deps: bool,
    /// Whether to run conflict analysis at all.
    pub detect_conflicts: bool,
    /// Whether to plan and apply port reassignments automatically.
    pub auto_fix_ports: bool,
    /// Services that keep host port publication under the test profile.
    pub retain_ports: BTreeSet<String>,
    /// Fixed generation timestamp; `None` means "now". Fixing it makes
    /// identical inputs serialize byte-identically.
    pub generated_at: Option<DateTime<Utc>>,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            project_name: ENGINE_NAME.to_owned(),
            profile: "dev".to_owned(),
            network_name: default_network_name(ENGINE_NAME),
            volume_prefix: String::new(),
            environment: BTreeMap::new(),
            default_services: DEFAULT_SERVICES.iter().map(|s| (*s).to_owned()).collect(),
            include_deps: true,
            detect_conflicts: true,
            auto_fix_ports: false,
            retain_ports: DEFAULT_SERVICES.iter().map(|s| (*s).to_owned()).collect(),
            generated_at: None,
        }
    }
}

impl ComposeOptions {
    /// Derives options from a project configuration for one profile.
    #[must_use]
    pub fn for_project(config: &ProjectConfig, profile: &str) -> Self {
        Self {
            project_name: if config.project.name.is_empty() {
                ENGINE_NAME.to_owned()
            } else {
                config.project.name.clone()
            },
            profile: profile.to_owned(),
            network_name: config.network_name(),
            volume_prefix: config.volume_prefix(),
            environment: config.global_environment(profile),
            default_services: config.services_for_profile(profile),
            retain_ports: config.retain_ports(profile),
            ..Self::default()
        }
    }
}

/// The outcome of one composition run.
#[derive(Debug)]
pub struct Composition {
    /// The finished, merged, transform-applied topology.
    pub topology: Topology,
    /// Conflicts found before any automatic fix was applied.
    pub conflicts: ConflictReport,
    /// The applied resolution plan, when auto-fix was enabled and needed.
    pub plan: Option<ResolutionPlan>,
    /// Non-fatal anomalies accumulated along the way.
    pub diagnostics: Vec<Diagnostic>,
}

#[allow(clippy::expect_used)]
fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("placeholder pattern is valid")
    })
}

struct Expander<'a> {
    project_name: &'a str,
    environment: &'a BTreeMap<String, String>,
}

impl Expander<'_> {
    /// Substitutes `${KEY}` and `${KEY:-default}` for known keys;
    /// unresolved placeholders are left verbatim for the runtime driver.
    fn expand(&self, text: &str) -> String {
        placeholder_pattern()
            .replace_all(text, |caps: &regex::Captures<'_>| {
                let key = &caps[1];
                if let Some(value) = self.environment.get(key) {
                    value.clone()
                } else if key == "PROJECT_NAME" {
                    self.project_name.to_owned()
                } else {
                    caps[0].to_owned()
                }
            })
            .into_owned()
    }
}

/// Orchestrates registry, transforms, and conflict handling into a
/// finished topology. A pure transform from inputs to a value: nothing
/// here talks to the runtime driver.
pub struct Composer<'r> {
    registry: &'r ServiceRegistry,
    options: ComposeOptions,
    probe: Box<dyn HostPortProbe>,
}

impl<'r> Composer<'r> {
    /// Creates a composer over a registry with the given options and the
    /// production TCP liveness probe.
    #[must_use]
    pub fn new(registry: &'r ServiceRegistry, options: ComposeOptions) -> Self {
        Self {
            registry,
            options,
            probe: Box::new(TcpConnectProbe::default()),
        }
    }

    /// Replaces the host-port liveness probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Box<dyn HostPortProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// The options this composer runs with.
    #[must_use]
    pub fn options(&self) -> &ComposeOptions {
        &self.options
    }

    /// Runs the full composition pipeline.
    ///
    /// An empty `requested` list falls back to the options' default
    /// service list. Overrides are keyed by container-service name and
    /// applied after merging; overrides targeting services outside the
    /// selection produce diagnostics, not failures.
    ///
    /// # Errors
    ///
    /// Any structural failure (unknown service, cycle, duplicate service
    /// name, exhausted port search) aborts the composition, tagged with
    /// the pipeline stage it occurred in.
    pub fn compose(
        &self,
        requested: &[String],
        overrides: &BTreeMap<String, ServiceOverride>,
    ) -> Result<Composition> {
        let selection = self.select(requested).map_err(|e| e.in_stage("selection"))?;
        let definitions = self
            .registry
            .get_many(selection.names())
            .map_err(|e| e.in_stage("load"))?;

        let mut topology = self.new_topology(&selection);
        Self::merge(&definitions, &mut topology).map_err(|e| e.in_stage("merge"))?;

        let mut diagnostics = Vec::new();
        self.transform(&mut topology, overrides, &mut diagnostics);
        self.apply_profile(&mut topology);
        self.ensure_default_network(&mut topology);

        let (conflicts, plan) = if self.options.detect_conflicts {
            let (report, mut port_diagnostics) = conflict::detect(&topology);
            diagnostics.append(&mut port_diagnostics);
            let plan = if self.options.auto_fix_ports && !report.is_empty() {
                let planner = ResolutionPlanner::new(self.probe.as_ref());
                let plan = planner
                    .plan(&report, &topology)
                    .map_err(|e| e.in_stage("conflict"))?;
                apply_resolution(&mut topology, &plan);
                Some(plan)
            } else {
                None
            };
            (report, plan)
        } else {
            (ConflictReport::default(), None)
        };

        tracing::info!(
            project = %self.options.project_name,
            profile = %self.options.profile,
            services = topology.services.len(),
            conflicts = conflicts.len(),
            "composition finished"
        );

        Ok(Composition {
            topology,
            conflicts,
            plan,
            diagnostics,
        })
    }

    fn select(&self, requested: &[String]) -> Result<ResolvedSelection> {
        let names: Vec<String> = if requested.is_empty() {
            tracing::debug!(
                profile = %self.options.profile,
                "no services requested, using the default list"
            );
            self.options.default_services.clone()
        } else {
            requested.to_vec()
        };

        if self.options.include_deps {
            self.registry.resolve(&names)
        } else {
            let mut seen = BTreeSet::new();
            let unique: Vec<String> = names.into_iter().filter(|n| seen.insert(n.clone())).collect();
            let _ = self.registry.get_many(&unique)?;
            Ok(ResolvedSelection::new(unique))
        }
    }

    fn new_topology(&self, selection: &ResolvedSelection) -> Topology {
        let metadata = TopologyMetadata {
            generated_by: ENGINE_NAME.to_owned(),
            generated_at: self.options.generated_at.unwrap_or_else(Utc::now),
            project_name: self.options.project_name.clone(),
            services: selection.names().to_vec(),
            profile: self.options.profile.clone(),
            engine_version: env!("CARGO_PKG_VERSION").to_owned(),
        };
        Topology::new(COMPOSE_VERSION, metadata)
    }

    /// Merges each definition's fragments into the topology. Fragments are
    /// cloned so the catalog stays immutable across calls; volume and
    /// network specs merge first-writer-wins.
    fn merge(definitions: &[&ServiceDefinition], topology: &mut Topology) -> Result<()> {
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        for definition in definitions {
            for (name, fragment) in &definition.services {
                if let Some(first) = owners.get(name.as_str()) {
                    return Err(ComposeError::DuplicateServiceName {
                        name: name.clone(),
                        first: (*first).to_owned(),
                        second: definition.name.clone(),
                    });
                }
                let _ = owners.insert(name.as_str(), definition.name.as_str());
                tracing::debug!(service = %name, entry = %definition.name, "merging fragment");
                topology.insert_service(name.clone(), fragment.clone());
            }
            for (name, spec) in &definition.volumes {
                let _ = topology
                    .volumes
                    .entry(name.clone())
                    .or_insert_with(|| spec.clone());
            }
            for (name, spec) in &definition.networks {
                let _ = topology
                    .networks
                    .entry(name.clone())
                    .or_insert_with(|| spec.clone());
            }
        }
        Ok(())
    }

    fn transform(
        &self,
        topology: &mut Topology,
        overrides: &BTreeMap<String, ServiceOverride>,
        diagnostics: &mut Vec<Diagnostic>,
    ) {
        let expander = Expander {
            project_name: &self.options.project_name,
            environment: &self.options.environment,
        };

        let renames = self.volume_renames(topology);
        for (old, new) in &renames {
            if let Some(spec) = topology.volumes.remove(old) {
                let _ = topology.volumes.entry(new.clone()).or_insert(spec);
            }
        }

        let names: Vec<String> = topology.merge_order().iter().map(|n| (*n).to_owned()).collect();
        for name in &names {
            let Some(fragment) = topology.services.get_mut(name) else {
                continue;
            };
            self.transform_container_name(name, fragment, &expander);
            self.transform_networks(fragment);
            self.transform_environment(fragment, &expander);
            self.transform_volumes(fragment, &renames);
            if let Some(record) = overrides.get(name) {
                apply_override(fragment, record);
            }
        }

        for target in overrides.keys() {
            if !topology.services.contains_key(target) {
                tracing::warn!(service = %target, "override targets a service outside the selection");
                diagnostics.push(Diagnostic::OverrideTargetMissing {
                    service: target.clone(),
                });
            }
        }
    }

    fn transform_container_name(
        &self,
        service: &str,
        fragment: &mut ServiceFragment,
        expander: &Expander<'_>,
    ) {
        match &mut fragment.container_name {
            Some(name) => *name = expander.expand(name),
            None => {
                fragment.container_name =
                    Some(format!("{}-{service}", self.options.project_name));
            }
        }
    }

    fn transform_networks(&self, fragment: &mut ServiceFragment) {
        if let Some(networks) = &mut fragment.networks {
            networks.remap(|name| {
                GENERIC_NETWORK_ALIASES
                    .contains(&name)
                    .then(|| self.options.network_name.clone())
            });
        }
    }

    fn transform_environment(&self, fragment: &mut ServiceFragment, expander: &Expander<'_>) {
        if let Some(environment) = &mut fragment.environment {
            environment.expand_with(|text| expander.expand(text));
        }
        if !self.options.environment.is_empty() {
            let environment = fragment
                .environment
                .get_or_insert_with(|| Environment::Map(BTreeMap::new()));
            for (key, value) in &self.options.environment {
                environment.add_missing(key, value);
            }
        }
    }

    /// Named volumes get the project prefix so stacks on a shared machine
    /// do not collide. The rename map covers the topology's own volume
    /// keys; bare mount names outside it are prefixed directly.
    fn volume_renames(&self, topology: &Topology) -> BTreeMap<String, String> {
        let prefix = &self.options.volume_prefix;
        if prefix.is_empty() {
            return BTreeMap::new();
        }
        topology
            .volumes
            .iter()
            .filter(|(name, spec)| !is_external_spec(spec) && !name.starts_with(&format!("{prefix}_")))
            .map(|(name, _)| (name.clone(), format!("{prefix}_{name}")))
            .collect()
    }

    fn transform_volumes(&self, fragment: &mut ServiceFragment, renames: &BTreeMap<String, String>) {
        let prefix = &self.options.volume_prefix;
        for mount in &mut fragment.volumes {
            let VolumeMount::Text(text) = mount else {
                continue;
            };
            if let Some(idx) = text.find(':') {
                let name = &text[..idx];
                if let Some(new_name) = renames.get(name) {
                    *text = format!("{new_name}{}", &text[idx..]);
                }
            } else if !prefix.is_empty() && is_bare_volume_name(text) {
                *text = renames
                    .get(text.as_str())
                    .cloned()
                    .unwrap_or_else(|| format!("{prefix}_{text}"));
            }
        }
    }

    fn apply_profile(&self, topology: &mut Topology) {
        match self.options.profile.as_str() {
            "dev" | "development" => Self::apply_development_profile(topology),
            "test" => self.apply_test_profile(topology),
            "prod" | "production" => Self::apply_production_profile(topology),
            other => tracing::debug!(profile = other, "no profile transform registered"),
        }
    }

    fn apply_development_profile(topology: &mut Topology) {
        for (name, fragment) in &mut topology.services {
            if fragment.restart.is_none() {
                fragment.restart = Some("unless-stopped".to_owned());
            }
            let labels = fragment
                .labels
                .get_or_insert_with(|| LabelSet::Map(BTreeMap::new()));
            labels.insert(LABEL_PROFILE, "development");
            labels.insert(LABEL_SERVICE, name);
        }
    }

    /// Strips host port publication from everything but the retained set,
    /// so parallel test runs do not exhaust host ports.
    fn apply_test_profile(&self, topology: &mut Topology) {
        for (name, fragment) in &mut topology.services {
            let labels = fragment
                .labels
                .get_or_insert_with(|| LabelSet::Map(BTreeMap::new()));
            labels.insert(LABEL_PROFILE, "test");
            if self.options.retain_ports.contains(name) {
                continue;
            }
            for entry in &mut fragment.ports {
                if let PortEntry::Short(text) = entry {
                    if let Some(stripped) = ports::strip_host(text) {
                        *text = stripped;
                    }
                }
            }
        }
    }

    fn apply_production_profile(topology: &mut Topology) {
        for fragment in topology.services.values_mut() {
            let labels = fragment
                .labels
                .get_or_insert_with(|| LabelSet::Map(BTreeMap::new()));
            labels.insert(LABEL_PROFILE, "production");
            if fragment.deploy.is_none() {
                fragment.deploy = Some(default_deploy_limits());
            }
        }
    }

    fn ensure_default_network(&self, topology: &mut Topology) {
        if topology.networks.contains_key(&self.options.network_name) {
            return;
        }
        let mut spec = Mapping::new();
        let _ = spec.insert("driver".into(), "bridge".into());
        let _ = spec.insert("name".into(), self.options.network_name.as_str().into());
        let _ = topology
            .networks
            .insert(self.options.network_name.clone(), Value::Mapping(spec));
    }
}

fn is_external_spec(spec: &Value) -> bool {
    spec.get("external").and_then(Value::as_bool).unwrap_or(false)
}

fn is_bare_volume_name(text: &str) -> bool {
    !text.is_empty() && !text.starts_with('/') && !text.starts_with('.') && !text.starts_with('~')
}

fn default_deploy_limits() -> Value {
    let mut limits = Mapping::new();
    let _ = limits.insert("memory".into(), "512M".into());
    let mut reservations = Mapping::new();
    let _ = reservations.insert("memory".into(), "256M".into());
    let mut resources = Mapping::new();
    let _ = resources.insert("limits".into(), Value::Mapping(limits));
    let _ = resources.insert("reservations".into(), Value::Mapping(reservations));
    let mut deploy = Mapping::new();
    let _ = deploy.insert("resources".into(), Value::Mapping(resources));
    Value::Mapping(deploy)
}

fn apply_override(fragment: &mut ServiceFragment, record: &ServiceOverride) {
    if !record.environment.is_empty() {
        let environment = fragment
            .environment
            .get_or_insert_with(|| Environment::Map(BTreeMap::new()));
        for (key, value) in &record.environment {
            environment.set(key, value);
        }
    }
    for port in &record.ports {
        fragment.ports.push(PortEntry::Short(port.clone()));
    }
    for volume in &record.volumes {
        fragment.volumes.push(VolumeMount::Text(volume.clone()));
    }
    if !record.labels.is_empty() {
        let labels = fragment
            .labels
            .get_or_insert_with(|| LabelSet::Map(BTreeMap::new()));
        for (key, value) in &record.labels {
            labels.insert(key, value);
        }
    }
    if !record.networks.is_empty() {
        let networks = fragment
            .networks
            .get_or_insert_with(|| NetworkAttachments::List(Vec::new()));
        for name in &record.networks {
            networks.attach(name);
        }
    }
    if record.command.is_some() {
        fragment.command.clone_from(&record.command);
    }
    if record.entrypoint.is_some() {
        fragment.entrypoint.clone_from(&record.entrypoint);
    }
    for (key, value) in &record.custom {
        set_custom_key(fragment, key, value);
    }
}

/// Routes an override's custom key to the matching typed field, falling
/// back to the passthrough map for unrecognized keys. Routing keeps the
/// serialized document free of duplicate keys.
fn set_custom_key(fragment: &mut ServiceFragment, key: &str, value: &Value) {
    match key {
        "image" | "container_name" | "restart" => {
            let Some(text) = value.as_str() else {
                tracing::warn!(key, "ignoring non-string custom override value");
                return;
            };
            match key {
                "image" => fragment.image = Some(text.to_owned()),
                "container_name" => fragment.container_name = Some(text.to_owned()),
                _ => fragment.restart = Some(text.to_owned()),
            }
        }
        "command" | "entrypoint" => match serde_yaml::from_value::<CommandLine>(value.clone()) {
            Ok(command) => {
                if key == "command" {
                    fragment.command = Some(command);
                } else {
                    fragment.entrypoint = Some(command);
                }
            }
            Err(error) => tracing::warn!(key, %error, "ignoring malformed custom override value"),
        },
        "deploy" => fragment.deploy = Some(value.clone()),
        _ => {
            let _ = fragment.extra.insert(key.to_owned(), value.clone());
        }
    }
}

/// Rewrites every affected binding's host port in place per the plan.
/// Non-numeric port forms are never touched.
pub fn apply_resolution(topology: &mut Topology, plan: &ResolutionPlan) {
    for (service, mappings) in plan.iter() {
        let Some(fragment) = topology.services.get_mut(service) else {
            continue;
        };
        for entry in &mut fragment.ports {
            let PortEntry::Short(text) = entry else {
                continue;
            };
            if let Some(binding) = ports::parse_binding(text) {
                if let Some(&new_port) = mappings.get(&binding.host) {
                    if let Some(rewritten) = ports::rewrite_host(text, binding.host, new_port) {
                        *text = rewritten;
                    }
                }
            }
        }
    }
}

/// Serializes a topology to the compose document format, preceded by a
/// generated header comment.
///
/// # Errors
///
/// Fails when serialization fails (which only happens for non-string
/// passthrough keys that YAML cannot represent).
pub fn render_yaml(topology: &Topology) -> Result<String> {
    let body = serde_yaml::to_string(topology).map_err(StacksmithError::from)?;
    let meta = &topology.metadata;
    let header = format!(
        "# Generated by {} v{}\n# Project: {}\n# Services: {}\n# Profile: {}\n# Generated at: {}\n\n",
        meta.generated_by,
        meta.engine_version,
        meta.project_name,
        meta.services.join(", "),
        meta.profile,
        meta.generated_at.to_rfc3339(),
    );
    Ok(header + &body)
}

/// Writes a rendered topology to disk.
///
/// # Errors
///
/// Fails when the file exists and `overwrite` is false, or on I/O errors.
pub fn write_to_file(topology: &Topology, path: &Path, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        return Err(ComposeError::config(format!(
            "{} already exists; pass overwrite to replace it",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| StacksmithError::io(parent, e))?;
        }
    }
    let rendered = render_yaml(topology)?;
    std::fs::write(path, rendered).map_err(|e| StacksmithError::io(path, e))?;
    tracing::info!(path = %path.display(), "topology written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;
    use crate::conflict::FnProbe;

    fn catalog_entry(name: &str, yaml: &str, dependencies: &[&str]) -> ServiceDefinition {
        let mut definition: ServiceDefinition = serde_yaml::from_str(yaml).expect("valid yaml");
        definition.name = name.to_owned();
        definition
            .dependencies
            .extend(dependencies.iter().map(|d| (*d).to_owned()));
        definition
    }

    fn fixture_registry() -> ServiceRegistry {
        ServiceRegistry::from_definitions([
            catalog_entry(
                "postgres",
                r#"
services:
  postgres:
    image: postgres:16
    ports:
      - "5432:5432"
    environment:
      POSTGRES_DB: ${PROJECT_NAME}
    volumes:
      - postgres-data:/var/lib/postgresql/data
    networks:
      - default
volumes:
  postgres-data: {}
"#,
                &[],
            ),
            catalog_entry(
                "redis",
                r#"
services:
  redis:
    image: redis:7
    ports:
      - "6379:6379"
"#,
                &[],
            ),
            catalog_entry(
                "zookeeper",
                r#"
services:
  zookeeper:
    image: zookeeper:3.9
    ports:
      - "2181:2181"
"#,
                &[],
            ),
            catalog_entry(
                "kafka",
                r#"
services:
  kafka:
    image: kafka:3.7
    ports:
      - "9092:9092"
"#,
                &["zookeeper"],
            ),
        ])
        .expect("registry")
    }

    fn fixed_options() -> ComposeOptions {
        ComposeOptions {
            project_name: "acme".into(),
            network_name: "acme-network".into(),
            volume_prefix: "acme".into(),
            generated_at: Some(DateTime::UNIX_EPOCH),
            ..ComposeOptions::default()
        }
    }

    fn compose(
        registry: &ServiceRegistry,
        options: ComposeOptions,
        requested: &[&str],
        overrides: &BTreeMap<String, ServiceOverride>,
    ) -> Composition {
        let requested: Vec<String> = requested.iter().map(|s| (*s).to_owned()).collect();
        Composer::new(registry, options)
            .with_probe(Box::new(FnProbe(|_: u16| false)))
            .compose(&requested, overrides)
            .expect("compose")
    }

    #[test]
    fn empty_request_falls_back_to_default_services() {
        let registry = fixture_registry();
        let result = compose(&registry, fixed_options(), &[], &BTreeMap::new());
        assert!(result.topology.services.contains_key("postgres"));
        assert!(result.topology.services.contains_key("redis"));
    }

    #[test]
    fn dependencies_are_pulled_in_and_ordered() {
        let registry = fixture_registry();
        let result = compose(&registry, fixed_options(), &["kafka"], &BTreeMap::new());
        assert_eq!(
            result.topology.metadata.services,
            vec!["zookeeper".to_owned(), "kafka".to_owned()]
        );
    }

    #[test]
    fn container_names_are_derived_from_project() {
        let registry = fixture_registry();
        let result = compose(&registry, fixed_options(), &["redis"], &BTreeMap::new());
        let redis = result.topology.services.get("redis").expect("redis");
        assert_eq!(redis.container_name.as_deref(), Some("acme-redis"));
    }

    #[test]
    fn generic_network_alias_is_remapped() {
        let registry = fixture_registry();
        let result = compose(&registry, fixed_options(), &["postgres"], &BTreeMap::new());
        let postgres = result.topology.services.get("postgres").expect("postgres");
        assert_eq!(
            postgres.networks,
            Some(NetworkAttachments::List(vec!["acme-network".into()]))
        );
    }

    #[test]
    fn environment_placeholders_expand_and_unknown_stay_verbatim() {
        let registry = ServiceRegistry::from_definitions([catalog_entry(
            "webapp",
            r"
services:
  webapp:
    image: webapp:dev
    environment:
      - DATABASE=${PROJECT_NAME}
      - SECRET=${VAULT_TOKEN}
",
            &[],
        )])
        .expect("registry");

        let result = compose(&registry, fixed_options(), &["webapp"], &BTreeMap::new());
        let env = result
            .topology
            .services
            .get("webapp")
            .and_then(|f| f.environment.clone())
            .expect("environment");
        assert_eq!(env.get("DATABASE").as_deref(), Some("acme"));
        assert_eq!(env.get("SECRET").as_deref(), Some("${VAULT_TOKEN}"));
    }

    #[test]
    fn global_environment_added_without_clobbering() {
        let registry = fixture_registry();
        let mut options = fixed_options();
        let _ = options.environment.insert("LOG_LEVEL".into(), "DEBUG".into());
        let _ = options.environment.insert("POSTGRES_DB".into(), "other".into());

        let result = compose(&registry, options, &["postgres"], &BTreeMap::new());
        let env = result
            .topology
            .services
            .get("postgres")
            .and_then(|f| f.environment.clone())
            .expect("environment");
        assert_eq!(env.get("LOG_LEVEL").as_deref(), Some("DEBUG"));
        assert_eq!(env.get("POSTGRES_DB").as_deref(), Some("acme"), "fragment value wins");
    }

    #[test]
    fn named_volumes_get_project_prefix_consistently() {
        let registry = fixture_registry();
        let result = compose(&registry, fixed_options(), &["postgres"], &BTreeMap::new());
        assert!(result.topology.volumes.contains_key("acme_postgres-data"));
        assert!(!result.topology.volumes.contains_key("postgres-data"));
        let postgres = result.topology.services.get("postgres").expect("postgres");
        assert_eq!(
            postgres.volumes,
            vec![VolumeMount::Text(
                "acme_postgres-data:/var/lib/postgresql/data".into()
            )]
        );
    }

    #[test]
    fn override_replaces_command_and_appends_ports() {
        let registry = fixture_registry();
        let mut overrides = BTreeMap::new();
        let _ = overrides.insert(
            "redis".to_owned(),
            ServiceOverride {
                command: Some(CommandLine::Shell("redis-server --appendonly yes".into())),
                ports: vec!["16379:6379".into()],
                ..ServiceOverride::default()
            },
        );

        let result = compose(&registry, fixed_options(), &["redis"], &overrides);
        let redis = result.topology.services.get("redis").expect("redis");
        assert_eq!(
            redis.command,
            Some(CommandLine::Shell("redis-server --appendonly yes".into()))
        );
        assert_eq!(redis.ports.len(), 2);
    }

    #[test]
    fn override_for_unselected_service_is_a_diagnostic() {
        let registry = fixture_registry();
        let mut overrides = BTreeMap::new();
        let _ = overrides.insert("kafka".to_owned(), ServiceOverride::default());

        let result = compose(&registry, fixed_options(), &["redis"], &overrides);
        assert_eq!(
            result.diagnostics,
            vec![Diagnostic::OverrideTargetMissing { service: "kafka".into() }]
        );
    }

    #[test]
    fn duplicate_runtime_name_across_entries_fails_in_merge_stage() {
        let registry = ServiceRegistry::from_definitions([
            catalog_entry("postgres", "services:\n  db:\n    image: postgres:16\n", &[]),
            catalog_entry("timescale", "services:\n  db:\n    image: timescale:2\n", &[]),
        ])
        .expect("registry");

        let err = Composer::new(&registry, fixed_options())
            .compose(&["postgres".into(), "timescale".into()], &BTreeMap::new())
            .expect_err("duplicate");
        let msg = err.to_string();
        assert!(msg.contains("merge stage failed"), "got: {msg}");
        assert!(msg.contains("\"db\""), "got: {msg}");
    }

    #[test]
    fn development_profile_adds_restart_and_labels() {
        let registry = fixture_registry();
        let result = compose(&registry, fixed_options(), &["redis"], &BTreeMap::new());
        let redis = result.topology.services.get("redis").expect("redis");
        assert_eq!(redis.restart.as_deref(), Some("unless-stopped"));
        let labels = redis.labels.as_ref().expect("labels");
        assert_eq!(labels.get(LABEL_PROFILE).as_deref(), Some("development"));
        assert_eq!(labels.get(LABEL_SERVICE).as_deref(), Some("redis"));
    }

    #[test]
    fn test_profile_strips_ports_except_retained() {
        let registry = fixture_registry();
        let options = ComposeOptions {
            profile: "test".into(),
            ..fixed_options()
        };
        let result = compose(&registry, options, &["redis", "kafka"], &BTreeMap::new());

        let kafka = result.topology.services.get("kafka").expect("kafka");
        assert_eq!(kafka.ports, vec![PortEntry::Short("9092".into())]);
        let redis = result.topology.services.get("redis").expect("redis");
        assert_eq!(redis.ports, vec![PortEntry::Short("6379:6379".into())], "retained");
    }

    #[test]
    fn production_profile_adds_default_memory_limits() {
        let registry = fixture_registry();
        let options = ComposeOptions {
            profile: "prod".into(),
            ..fixed_options()
        };
        let result = compose(&registry, options, &["redis"], &BTreeMap::new());
        let redis = result.topology.services.get("redis").expect("redis");
        let deploy = redis.deploy.as_ref().expect("deploy block");
        assert!(deploy.get("resources").is_some());
    }

    #[test]
    fn unknown_profile_is_a_no_op() {
        let registry = fixture_registry();
        let options = ComposeOptions {
            profile: "staging".into(),
            ..fixed_options()
        };
        let result = compose(&registry, options, &["redis"], &BTreeMap::new());
        let redis = result.topology.services.get("redis").expect("redis");
        assert!(redis.restart.is_none());
        assert!(redis.labels.is_none());
    }

    #[test]
    fn default_network_is_synthesized() {
        let registry = fixture_registry();
        let result = compose(&registry, fixed_options(), &["redis"], &BTreeMap::new());
        let network = result.topology.networks.get("acme-network").expect("network");
        assert_eq!(
            network.get("driver").and_then(Value::as_str),
            Some("bridge")
        );
    }

    #[test]
    fn auto_fix_rewrites_conflicts_and_roundtrip_is_clean() {
        let registry = ServiceRegistry::from_definitions([
            catalog_entry(
                "postgres",
                "services:\n  postgres:\n    image: postgres:16\n    ports:\n      - \"5432:5432\"\n",
                &[],
            ),
            catalog_entry(
                "timescale",
                "services:\n  timescale:\n    image: timescale:2\n    ports:\n      - \"5432:5432\"\n",
                &[],
            ),
        ])
        .expect("registry");

        let options = ComposeOptions {
            auto_fix_ports: true,
            ..fixed_options()
        };
        let result = compose(
            &registry,
            options,
            &["postgres", "timescale"],
            &BTreeMap::new(),
        );

        assert_eq!(result.conflicts.len(), 1, "pre-fix report is returned");
        let plan = result.plan.expect("plan applied");
        assert_eq!(
            plan.for_service("timescale").and_then(|m| m.get(&5432)),
            Some(&5433)
        );

        let (after, _) = conflict::detect(&result.topology);
        assert!(after.is_empty(), "rewritten topology has no conflicts");
    }

    #[test]
    fn without_auto_fix_report_is_returned_unapplied() {
        let registry = ServiceRegistry::from_definitions([
            catalog_entry(
                "postgres",
                "services:\n  postgres:\n    image: postgres:16\n    ports:\n      - \"5432:5432\"\n",
                &[],
            ),
            catalog_entry(
                "timescale",
                "services:\n  timescale:\n    image: timescale:2\n    ports:\n      - \"5432:5432\"\n",
                &[],
            ),
        ])
        .expect("registry");

        let result = compose(
            &registry,
            fixed_options(),
            &["postgres", "timescale"],
            &BTreeMap::new(),
        );
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.plan.is_none());
        let postgres = result.topology.services.get("postgres").expect("postgres");
        assert_eq!(postgres.ports, vec![PortEntry::Short("5432:5432".into())]);
    }

    #[test]
    fn composing_twice_is_byte_identical() {
        let registry = fixture_registry();
        let first = compose(&registry, fixed_options(), &["kafka"], &BTreeMap::new());
        let second = compose(&registry, fixed_options(), &["kafka"], &BTreeMap::new());
        assert_eq!(
            render_yaml(&first.topology).expect("yaml"),
            render_yaml(&second.topology).expect("yaml")
        );
    }

    #[test]
    fn write_to_file_respects_overwrite_flag() {
        let registry = fixture_registry();
        let result = compose(&registry, fixed_options(), &["redis"], &BTreeMap::new());

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stack.generated.yaml");
        write_to_file(&result.topology, &path, false).expect("first write");
        assert!(write_to_file(&result.topology, &path, false).is_err());
        write_to_file(&result.topology, &path, true).expect("overwrite");

        let written = std::fs::read_to_string(&path).expect("read back");
        assert!(written.starts_with("# Generated by stacksmith"), "got: {written}");
    }
}
