//! Domain errors and non-fatal diagnostics for the composition engine.
//!
//! Structural errors abort a composition and carry enough context (service
//! name, cycle path, conflicting port) to fix the input without re-running
//! with verbose tracing. Non-structural anomalies are accumulated as
//! [`Diagnostic`] values alongside a still-valid topology.

use std::fmt;

use stacksmith_common::error::StacksmithError;
use thiserror::Error;

/// Errors produced by the composition engine.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// A requested or depended-upon service is not in the catalog.
    #[error("unknown service \"{name}\"")]
    UnknownService {
        /// The missing service name.
        name: String,
    },

    /// The dependency graph contains a cycle.
    #[error("cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency {
        /// The full cycle, first node repeated at the end.
        path: Vec<String>,
    },

    /// Two catalog entries claim the same runtime container name.
    #[error(
        "duplicate service name \"{name}\": defined by catalog entries \"{first}\" and \"{second}\""
    )]
    DuplicateServiceName {
        /// The colliding container-service name.
        name: String,
        /// Catalog entry that defined the name first.
        first: String,
        /// Catalog entry that defined the name again.
        second: String,
    },

    /// The conflict planner exhausted its search window.
    #[error("no free port within {window} ports above {port}")]
    NoFreePortInRange {
        /// The conflicting host port the search started from.
        port: u16,
        /// Size of the exhausted search window.
        window: u16,
    },

    /// A pipeline stage failed; wraps the underlying error with the stage
    /// name for diagnostics.
    #[error("{stage} stage failed: {source}")]
    Stage {
        /// Name of the failed pipeline stage.
        stage: &'static str,
        /// The underlying failure.
        #[source]
        source: Box<ComposeError>,
    },

    /// An infrastructure error from the common layer.
    #[error(transparent)]
    Common(#[from] StacksmithError),
}

impl ComposeError {
    /// Shorthand for a configuration error with the given message.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Common(StacksmithError::Config {
            message: message.into(),
        })
    }

    /// Wraps an error with the name of the pipeline stage it occurred in.
    #[must_use]
    pub fn in_stage(self, stage: &'static str) -> Self {
        Self::Stage {
            stage,
            source: Box::new(self),
        }
    }
}

/// Convenience alias for composition results.
pub type Result<T> = std::result::Result<T, ComposeError>;

/// A non-fatal anomaly observed during composition.
///
/// Diagnostics never abort the pipeline; they are logged and returned
/// alongside the finished topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A port entry could not be interpreted as any known form.
    MalformedPortBinding {
        /// Service whose fragment carries the entry.
        service: String,
        /// The offending port string.
        entry: String,
    },

    /// An override references a service absent from the resolved selection.
    ///
    /// Overrides may be written defensively for a superset of profiles, so
    /// this is a warning rather than a failure.
    OverrideTargetMissing {
        /// The service name the override targets.
        service: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedPortBinding { service, entry } => {
                write!(f, "service \"{service}\": malformed port entry \"{entry}\"")
            }
            Self::OverrideTargetMissing { service } => {
                write!(f, "override targets \"{service}\" which is not in the selection")
            }
        }
    }
}
