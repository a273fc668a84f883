//! Data model for catalog entries and composed topologies.
//!
//! Service fragments are modeled as a constrained shape: the keys the
//! composition pipeline transforms are typed fields, everything else is
//! carried in a passthrough map so unrecognized configuration survives
//! merging untouched. All mappings are `BTreeMap` so serialized output is
//! deterministic.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_yaml::Value;

use crate::ports::{self, PortBinding, PortForm};

/// One catalog entry's contribution to a topology.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDefinition {
    /// Unique catalog key. Set from the catalog directory name on load.
    pub name: String,
    /// Container-service fragments contributed by this entry.
    pub services: BTreeMap<String, ServiceFragment>,
    /// Named volume specs contributed by this entry.
    pub volumes: BTreeMap<String, Value>,
    /// Network specs contributed by this entry.
    pub networks: BTreeMap<String, Value>,
    /// Other catalog entries that must be present whenever this one is.
    pub dependencies: Vec<String>,
}

impl ServiceDefinition {
    /// Creates an empty definition with the given catalog key.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// One container-service's configuration within a definition or topology.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceFragment {
    /// Container image reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Explicit container name; derived from the project when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    /// Command override, shell string or argv form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandLine>,
    /// Entrypoint override, shell string or argv form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandLine>,
    /// Environment variables, list or map form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    /// Published ports (short or long syntax).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortEntry>,
    /// Volume mounts.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    /// Network attachments, list or map form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworkAttachments>,
    /// Labels, list or map form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelSet>,
    /// Startup ordering hints, list or map form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOn>,
    /// Restart policy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    /// Deployment settings (resource limits and the like).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deploy: Option<Value>,
    /// Unrecognized keys, preserved verbatim through the pipeline.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// A command or entrypoint: shell string or argv list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    /// Single shell string form.
    Shell(String),
    /// Exec/argv form.
    Argv(Vec<String>),
}

/// Environment variables in either compose representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Environment {
    /// List form: `["KEY=value", ...]`.
    List(Vec<String>),
    /// Map form: `KEY: value`.
    Map(BTreeMap<String, Value>),
}

fn list_entry_key(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(key, _)| key)
}

impl Environment {
    /// Applies `expand` to every textual value (list entries in full, map
    /// values that are strings).
    pub fn expand_with(&mut self, expand: impl Fn(&str) -> String) {
        match self {
            Self::List(entries) => {
                for entry in entries {
                    *entry = expand(entry);
                }
            }
            Self::Map(map) => {
                for value in map.values_mut() {
                    if let Value::String(text) = value {
                        *text = expand(text);
                    }
                }
            }
        }
    }

    /// Adds a variable unless the fragment already sets the key.
    pub fn add_missing(&mut self, key: &str, value: &str) {
        match self {
            Self::List(entries) => {
                if !entries.iter().any(|e| list_entry_key(e) == key) {
                    entries.push(format!("{key}={value}"));
                }
            }
            Self::Map(map) => {
                let _ = map
                    .entry(key.to_owned())
                    .or_insert_with(|| Value::String(value.to_owned()));
            }
        }
    }

    /// Sets a variable, overriding any existing entry for the key.
    pub fn set(&mut self, key: &str, value: &str) {
        match self {
            Self::List(entries) => {
                entries.retain(|e| list_entry_key(e) != key);
                entries.push(format!("{key}={value}"));
            }
            Self::Map(map) => {
                let _ = map.insert(key.to_owned(), Value::String(value.to_owned()));
            }
        }
    }

    /// Looks up a variable's textual value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            Self::List(entries) => entries
                .iter()
                .rev()
                .find(|e| list_entry_key(e) == key)
                .and_then(|e| e.split_once('=').map(|(_, v)| v.to_owned())),
            Self::Map(map) => map.get(key).and_then(|v| match v {
                Value::String(text) => Some(text.clone()),
                Value::Number(num) => Some(num.to_string()),
                Value::Bool(flag) => Some(flag.to_string()),
                _ => None,
            }),
        }
    }
}

/// Labels in either compose representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelSet {
    /// List form: `["key=value", ...]`.
    List(Vec<String>),
    /// Map form: `key: value`.
    Map(BTreeMap<String, Value>),
}

impl LabelSet {
    /// Sets a label, replacing any existing entry for the key.
    pub fn insert(&mut self, key: &str, value: &str) {
        match self {
            Self::List(entries) => {
                entries.retain(|e| list_entry_key(e) != key);
                entries.push(format!("{key}={value}"));
            }
            Self::Map(map) => {
                let _ = map.insert(key.to_owned(), Value::String(value.to_owned()));
            }
        }
    }

    /// Looks up a label's textual value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        match self {
            Self::List(entries) => entries
                .iter()
                .find(|e| list_entry_key(e) == key)
                .and_then(|e| e.split_once('=').map(|(_, v)| v.to_owned())),
            Self::Map(map) => map.get(key).and_then(|v| match v {
                Value::String(text) => Some(text.clone()),
                _ => None,
            }),
        }
    }
}

/// Network attachments in either compose representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworkAttachments {
    /// List form: `["backend", ...]`.
    List(Vec<String>),
    /// Map form with per-network settings.
    Map(BTreeMap<String, Value>),
}

impl NetworkAttachments {
    /// Renames attachments for which `rename` returns a replacement.
    pub fn remap(&mut self, rename: impl Fn(&str) -> Option<String>) {
        match self {
            Self::List(names) => {
                for name in names {
                    if let Some(new_name) = rename(name) {
                        *name = new_name;
                    }
                }
            }
            Self::Map(map) => {
                let renamed: Vec<(String, String)> = map
                    .keys()
                    .filter_map(|key| rename(key).map(|new_key| (key.clone(), new_key)))
                    .collect();
                for (old_key, new_key) in renamed {
                    if let Some(spec) = map.remove(&old_key) {
                        let _ = map.insert(new_key, spec);
                    }
                }
            }
        }
    }

    /// Attaches a network unless already present.
    pub fn attach(&mut self, name: &str) {
        match self {
            Self::List(names) => {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_owned());
                }
            }
            Self::Map(map) => {
                let _ = map.entry(name.to_owned()).or_insert(Value::Null);
            }
        }
    }
}

/// Startup ordering hints in either compose representation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    /// List form: `["db", ...]`.
    List(Vec<String>),
    /// Map form with per-dependency conditions.
    Map(BTreeMap<String, Value>),
}

impl DependsOn {
    /// The referenced service names.
    #[must_use]
    pub fn service_names(&self) -> Vec<&str> {
        match self {
            Self::List(names) => names.iter().map(String::as_str).collect(),
            Self::Map(map) => map.keys().map(String::as_str).collect(),
        }
    }
}

/// A volume mount: short text syntax or a long-syntax mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short form: `"name:/path"`, `"/host:/path"`, or a bare name.
    Text(String),
    /// Long-syntax mapping, passed through untouched.
    Spec(Value),
}

/// A published-port entry: short text syntax or a long-syntax mapping.
///
/// Short entries keep their raw text; parsing into a [`PortBinding`]
/// happens on demand so non-numeric forms survive byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEntry {
    /// Short form, e.g. `"5432:5432"` or `"${PG_PORT}:5432"`.
    Short(String),
    /// Long-syntax mapping, excluded from conflict analysis.
    Long(Value),
}

impl PortEntry {
    /// Classifies a short entry; long-syntax entries are passthrough.
    #[must_use]
    pub fn classify(&self) -> PortForm {
        match self {
            Self::Short(text) => ports::classify(text),
            Self::Long(_) => PortForm::Passthrough,
        }
    }

    /// Parses the entry into a binding when it has the exact numeric form.
    #[must_use]
    pub fn binding(&self) -> Option<PortBinding> {
        match self.classify() {
            PortForm::Binding(parsed) => Some(parsed),
            _ => None,
        }
    }
}

impl fmt::Display for PortEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Short(text) => write!(f, "{text}"),
            Self::Long(_) => write!(f, "<long-syntax port>"),
        }
    }
}

impl Serialize for PortEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Short(text) => serializer.serialize_str(text),
            Self::Long(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for PortEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::String(text) => Self::Short(text),
            Value::Number(num) => Self::Short(num.to_string()),
            other => Self::Long(other),
        })
    }
}

/// The resolved, dependency-closed, duplicate-free selection of catalog
/// entries, dependencies before dependents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSelection {
    names: Vec<String>,
}

impl ResolvedSelection {
    /// Wraps an already-ordered name sequence.
    #[must_use]
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// The ordered catalog entry names.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Whether the selection contains a catalog entry.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    /// Number of selected catalog entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Whether the selection is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Generation metadata embedded in a topology under `x-metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyMetadata {
    /// Name of the generating engine.
    pub generated_by: String,
    /// Generation timestamp. Treated as an input so identical inputs
    /// serialize identically.
    pub generated_at: DateTime<Utc>,
    /// Project the topology was composed for.
    pub project_name: String,
    /// The resolved selection, in resolution order.
    pub services: Vec<String>,
    /// Profile the topology was composed with.
    pub profile: String,
    /// Version tag of the generating engine.
    pub engine_version: String,
}

/// A fully merged multi-service topology (the "compose file").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    /// Compose document version tag.
    pub version: String,
    /// Merged container-service fragments, keyed by runtime name.
    pub services: BTreeMap<String, ServiceFragment>,
    /// Merged network specs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, Value>,
    /// Merged named-volume specs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, Value>,
    /// Generation metadata.
    #[serde(rename = "x-metadata")]
    pub metadata: TopologyMetadata,
    /// Merge order of `services`, maintained by the composer. Not
    /// serialized; an empty or stale list falls back to name order.
    #[serde(skip)]
    pub service_order: Vec<String>,
}

impl Topology {
    /// Creates an empty topology with the given metadata.
    #[must_use]
    pub fn new(version: impl Into<String>, metadata: TopologyMetadata) -> Self {
        Self {
            version: version.into(),
            services: BTreeMap::new(),
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
            metadata,
            service_order: Vec::new(),
        }
    }

    /// Inserts a fragment, recording its merge position.
    pub fn insert_service(&mut self, name: impl Into<String>, fragment: ServiceFragment) {
        let name = name.into();
        self.service_order.push(name.clone());
        let _ = self.services.insert(name, fragment);
    }

    /// Service names in merge order, falling back to name order when the
    /// merge-order list does not cover the map (e.g. after deserializing).
    #[must_use]
    pub fn merge_order(&self) -> Vec<&str> {
        if self.service_order.len() == self.services.len()
            && self.service_order.iter().all(|n| self.services.contains_key(n))
        {
            self.service_order.iter().map(String::as_str).collect()
        } else {
            self.services.keys().map(String::as_str).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_roundtrips_unknown_keys() {
        let yaml = r"
image: postgres:16
shm_size: 256mb
ports:
  - 5432:5432
";
        let fragment: ServiceFragment = serde_yaml::from_str(yaml).expect("deserialize");
        assert_eq!(fragment.image.as_deref(), Some("postgres:16"));
        assert!(fragment.extra.contains_key("shm_size"));

        let out = serde_yaml::to_string(&fragment).expect("serialize");
        assert!(out.contains("shm_size"), "got: {out}");
        assert!(out.contains("'5432:5432'") || out.contains("5432:5432"), "got: {out}");
    }

    #[test]
    fn port_entry_accepts_numbers_and_strings() {
        let fragment: ServiceFragment =
            serde_yaml::from_str("ports:\n  - 6379\n  - \"8080:80\"\n").expect("deserialize");
        assert_eq!(fragment.ports.len(), 2);
        assert_eq!(fragment.ports[0], PortEntry::Short("6379".into()));
        assert_eq!(fragment.ports[1], PortEntry::Short("8080:80".into()));
    }

    #[test]
    fn port_entry_long_syntax_is_passthrough() {
        let fragment: ServiceFragment =
            serde_yaml::from_str("ports:\n  - target: 80\n    published: 8080\n")
                .expect("deserialize");
        assert!(matches!(fragment.ports[0], PortEntry::Long(_)));
        assert_eq!(fragment.ports[0].classify(), PortForm::Passthrough);
    }

    #[test]
    fn environment_map_and_list_forms() {
        let list: Environment =
            serde_yaml::from_str("- POSTGRES_USER=admin\n- POSTGRES_DB=app\n").expect("list");
        assert_eq!(list.get("POSTGRES_USER").as_deref(), Some("admin"));

        let map: Environment =
            serde_yaml::from_str("POSTGRES_USER: admin\nPOSTGRES_PORT: 5432\n").expect("map");
        assert_eq!(map.get("POSTGRES_PORT").as_deref(), Some("5432"));
    }

    #[test]
    fn environment_add_missing_does_not_clobber() {
        let mut env = Environment::List(vec!["LOG_LEVEL=debug".into()]);
        env.add_missing("LOG_LEVEL", "info");
        env.add_missing("EXTRA", "1");
        assert_eq!(env.get("LOG_LEVEL").as_deref(), Some("debug"));
        assert_eq!(env.get("EXTRA").as_deref(), Some("1"));
    }

    #[test]
    fn environment_set_replaces() {
        let mut env = Environment::List(vec!["LOG_LEVEL=debug".into()]);
        env.set("LOG_LEVEL", "warn");
        assert_eq!(env.get("LOG_LEVEL").as_deref(), Some("warn"));
    }

    #[test]
    fn label_set_insert_replaces_in_both_forms() {
        let mut list = LabelSet::List(vec!["tier=db".into()]);
        list.insert("tier", "cache");
        assert_eq!(list.get("tier").as_deref(), Some("cache"));

        let mut map = LabelSet::Map(BTreeMap::new());
        map.insert("tier", "db");
        map.insert("tier", "cache");
        assert_eq!(map.get("tier").as_deref(), Some("cache"));
    }

    #[test]
    fn network_attachments_remap_both_forms() {
        let rename = |name: &str| (name == "default").then(|| "acme-network".to_owned());

        let mut list = NetworkAttachments::List(vec!["default".into(), "backend".into()]);
        list.remap(rename);
        assert_eq!(
            list,
            NetworkAttachments::List(vec!["acme-network".into(), "backend".into()])
        );

        let mut map_form: BTreeMap<String, Value> = BTreeMap::new();
        let _ = map_form.insert("default".into(), Value::Null);
        let mut map = NetworkAttachments::Map(map_form);
        map.remap(rename);
        let NetworkAttachments::Map(inner) = map else {
            unreachable!()
        };
        assert!(inner.contains_key("acme-network"));
        assert!(!inner.contains_key("default"));
    }

    #[test]
    fn depends_on_names_from_both_forms() {
        let list: DependsOn = serde_yaml::from_str("- db\n- cache\n").expect("list");
        assert_eq!(list.service_names(), vec!["db", "cache"]);

        let map: DependsOn =
            serde_yaml::from_str("db:\n  condition: service_healthy\n").expect("map");
        assert_eq!(map.service_names(), vec!["db"]);
    }

    #[test]
    fn topology_merge_order_prefers_insertion_order() {
        let metadata = TopologyMetadata {
            generated_by: "stacksmith".into(),
            generated_at: DateTime::<Utc>::UNIX_EPOCH,
            project_name: "acme".into(),
            services: vec![],
            profile: "dev".into(),
            engine_version: "0.1.0".into(),
        };
        let mut topology = Topology::new("3.8", metadata);
        topology.insert_service("zookeeper", ServiceFragment::default());
        topology.insert_service("kafka", ServiceFragment::default());
        assert_eq!(topology.merge_order(), vec!["zookeeper", "kafka"]);
    }
}
