//! System-wide constants and default names.

/// Name of the engine, used in generated metadata and labels.
pub const ENGINE_NAME: &str = "stacksmith";

/// Compose document version tag written into generated topologies.
pub const COMPOSE_VERSION: &str = "3.8";

/// Services selected when neither the caller nor the project
/// configuration names any.
pub const DEFAULT_SERVICES: &[&str] = &["postgres", "redis"];

/// Per-catalog-entry fragment file name.
pub const FRAGMENT_FILE: &str = "service.yaml";

/// Candidate project configuration file names, checked in order.
pub const CONFIG_FILE_CANDIDATES: &[&str] = &[
    "stacksmith.yaml",
    "stacksmith.yml",
    ".stacksmith.yaml",
    ".stacksmith.yml",
];

/// Generic network aliases rewritten to the project network name.
pub const GENERIC_NETWORK_ALIASES: &[&str] = &["default", "local-dev", "stacksmith"];

/// Label key carrying the active profile on every composed service.
pub const LABEL_PROFILE: &str = "stacksmith.profile";

/// Label key carrying the service name on every composed service.
pub const LABEL_SERVICE: &str = "stacksmith.service";

/// How far above a conflicting port the planner searches for a
/// replacement before giving up.
pub const PORT_SEARCH_WINDOW: u16 = 1000;

/// Timeout for the TCP host-port liveness probe, in milliseconds.
pub const PROBE_TIMEOUT_MS: u64 = 250;

/// Returns the default network name for a project.
#[must_use]
pub fn default_network_name(project: &str) -> String {
    format!("{project}-network")
}
