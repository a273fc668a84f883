//! Host-port conflict detection and resolution planning.
//!
//! Detection walks the merged topology's fragments in merge order, parses
//! every analyzable port entry, and groups host-port claims. Planning
//! keeps the first claimant of each conflicting port unchanged (so
//! already-working configurations are not churned) and reassigns every
//! other claimant to the nearest free port, consulting an injected
//! host-liveness probe.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use stacksmith_common::constants::{PORT_SEARCH_WINDOW, PROBE_TIMEOUT_MS};

use crate::error::{ComposeError, Diagnostic, Result};
use crate::model::Topology;
use crate::ports::{PortForm, Protocol};

/// Data services whose port conflicts are always error-level.
const CRITICAL_SERVICES: &[&str] = &["postgres", "redis", "mysql", "kafka"];

/// Answers whether a host port is already open on this machine's network
/// stack. Injected so planning is deterministic under test.
pub trait HostPortProbe {
    /// Returns true when the port is already in use on the host.
    fn is_in_use(&self, port: u16) -> bool;
}

/// Production probe: attempts a short-timeout TCP connect to
/// `127.0.0.1:port`.
///
/// Policy: a successful connect means the port is in use; a refused,
/// unreachable, or timed-out connect means the port is treated as free.
/// Callers behind unusual firewall setups that swallow loopback connects
/// should inject a stricter probe instead.
#[derive(Debug, Clone)]
pub struct TcpConnectProbe {
    timeout: Duration,
}

impl TcpConnectProbe {
    /// Creates a probe with an explicit connect timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnectProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(PROBE_TIMEOUT_MS))
    }
}

impl HostPortProbe for TcpConnectProbe {
    fn is_in_use(&self, port: u16) -> bool {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        TcpStream::connect_timeout(&addr, self.timeout).is_ok()
    }
}

/// Adapter turning a closure into a probe, mainly for tests.
#[derive(Debug, Clone)]
pub struct FnProbe<F>(pub F);

impl<F: Fn(u16) -> bool> HostPortProbe for FnProbe<F> {
    fn is_in_use(&self, port: u16) -> bool {
        (self.0)(port)
    }
}

/// How serious a conflict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Probably tolerable (well-known throwaway dev ports).
    Warning,
    /// Must be resolved before the stack can start.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One service's claim on a host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortClaim {
    /// Claiming container-service name.
    pub service: String,
    /// Container port behind the binding.
    pub container_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

/// All claims on one conflicting host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Claims in merge order; the first one keeps the port when planning.
    pub claims: Vec<PortClaim>,
    /// Informational severity; planning ignores it.
    pub severity: Severity,
}

/// Host-port conflicts found in a topology, keyed by port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictReport {
    conflicts: BTreeMap<u16, Conflict>,
}

impl ConflictReport {
    /// Whether any conflict was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Number of conflicting ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    /// The conflict on a specific port, if any.
    #[must_use]
    pub fn get(&self, port: u16) -> Option<&Conflict> {
        self.conflicts.get(&port)
    }

    /// Iterates conflicts in ascending port order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, &Conflict)> {
        self.conflicts.iter().map(|(port, conflict)| (*port, conflict))
    }

    /// Manual resolution suggestions, one block of lines per conflict.
    #[must_use]
    pub fn suggestions(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (port, conflict) in &self.conflicts {
            let services: Vec<&str> =
                conflict.claims.iter().map(|c| c.service.as_str()).collect();
            lines.push(format!("port {port} is used by: {}", services.join(", ")));
            for claim in conflict.claims.iter().skip(1) {
                lines.push(format!(
                    "  move \"{}\" to another host port or enable auto-fix",
                    claim.service
                ));
            }
        }
        lines
    }
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.conflicts.is_empty() {
            return write!(f, "no port conflicts detected");
        }
        writeln!(f, "found {} port conflict(s):", self.conflicts.len())?;
        for (port, conflict) in &self.conflicts {
            let services: Vec<&str> =
                conflict.claims.iter().map(|c| c.service.as_str()).collect();
            writeln!(
                f,
                "  port {port} ({}): claimed by {}",
                conflict.severity,
                services.join(", ")
            )?;
        }
        Ok(())
    }
}

/// Planned host-port reassignments: service name to old-port/new-port
/// pairs. Produced only for conflicting ports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolutionPlan {
    reassignments: BTreeMap<String, BTreeMap<u16, u16>>,
}

impl ResolutionPlan {
    /// Whether the plan contains any reassignment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reassignments.is_empty()
    }

    /// The reassignments for one service.
    #[must_use]
    pub fn for_service(&self, service: &str) -> Option<&BTreeMap<u16, u16>> {
        self.reassignments.get(service)
    }

    /// Iterates all reassignments.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeMap<u16, u16>)> {
        self.reassignments.iter()
    }
}

impl fmt::Display for ResolutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (service, mappings) in &self.reassignments {
            for (old, new) in mappings {
                writeln!(f, "{service}: {old} -> {new}")?;
            }
        }
        Ok(())
    }
}

fn severity_of(port: u16, claims: &[PortClaim]) -> Severity {
    if port < 1024 {
        return Severity::Error;
    }
    if claims
        .iter()
        .any(|c| CRITICAL_SERVICES.contains(&c.service.as_str()))
    {
        return Severity::Error;
    }
    if (3000..=3010).contains(&port) {
        return Severity::Warning;
    }
    Severity::Error
}

/// Finds host-port conflicts in a topology.
///
/// Fragments are walked in merge order; per service, duplicate claims on
/// the same port count once. Non-analyzable entries are excluded; truly
/// malformed ones are skipped and reported as diagnostics.
#[must_use]
pub fn detect(topology: &Topology) -> (ConflictReport, Vec<Diagnostic>) {
    let mut claims_by_port: BTreeMap<u16, Vec<PortClaim>> = BTreeMap::new();
    let mut diagnostics = Vec::new();

    for name in topology.merge_order() {
        let Some(fragment) = topology.services.get(name) else {
            continue;
        };
        let mut seen = BTreeSet::new();
        for entry in &fragment.ports {
            match entry.classify() {
                PortForm::Binding(binding) => {
                    if seen.insert(binding.host) {
                        claims_by_port.entry(binding.host).or_default().push(PortClaim {
                            service: name.to_owned(),
                            container_port: binding.container,
                            protocol: binding.protocol,
                        });
                    }
                }
                PortForm::Passthrough => {}
                PortForm::Malformed => {
                    tracing::warn!(service = %name, entry = %entry, "skipping malformed port entry");
                    diagnostics.push(Diagnostic::MalformedPortBinding {
                        service: name.to_owned(),
                        entry: entry.to_string(),
                    });
                }
            }
        }
    }

    let conflicts = claims_by_port
        .into_iter()
        .filter(|(_, claims)| claims.len() > 1)
        .map(|(port, claims)| {
            let severity = severity_of(port, &claims);
            (port, Conflict { claims, severity })
        })
        .collect();

    (ConflictReport { conflicts }, diagnostics)
}

/// Plans reassignments for a conflict report against a topology.
pub struct ResolutionPlanner<'a> {
    probe: &'a dyn HostPortProbe,
    window: u16,
}

impl std::fmt::Debug for ResolutionPlanner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionPlanner")
            .field("probe", &"<dyn HostPortProbe>")
            .field("window", &self.window)
            .finish()
    }
}

impl<'a> ResolutionPlanner<'a> {
    /// Creates a planner with the default search window.
    #[must_use]
    pub fn new(probe: &'a dyn HostPortProbe) -> Self {
        Self {
            probe,
            window: PORT_SEARCH_WINDOW,
        }
    }

    /// Overrides the search window.
    #[must_use]
    pub const fn with_window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    /// Computes a resolution plan.
    ///
    /// For each conflicting port, ascending, the first claimant keeps its
    /// binding; every other claimant gets the smallest port above the
    /// conflict that is unbound in the topology, unconsumed by an earlier
    /// reassignment, and free on the host. Deterministic for fixed inputs
    /// and probe answers.
    ///
    /// # Errors
    ///
    /// Returns [`ComposeError::NoFreePortInRange`] when the search window
    /// is exhausted for some claimant.
    pub fn plan(&self, report: &ConflictReport, topology: &Topology) -> Result<ResolutionPlan> {
        let mut taken = bound_host_ports(topology);
        let mut reassignments: BTreeMap<String, BTreeMap<u16, u16>> = BTreeMap::new();

        for (port, conflict) in report.iter() {
            for claim in conflict.claims.iter().skip(1) {
                let replacement = self.find_free(port, &taken)?;
                let _ = taken.insert(replacement);
                let _ = reassignments
                    .entry(claim.service.clone())
                    .or_default()
                    .insert(port, replacement);
                tracing::debug!(
                    service = %claim.service,
                    old = port,
                    new = replacement,
                    "planned port reassignment"
                );
            }
        }

        Ok(ResolutionPlan { reassignments })
    }

    fn find_free(&self, base: u16, taken: &BTreeSet<u16>) -> Result<u16> {
        let start = base.saturating_add(1);
        let end = base.saturating_add(self.window);
        for candidate in start..=end {
            if candidate == base || taken.contains(&candidate) {
                continue;
            }
            if self.probe.is_in_use(candidate) {
                continue;
            }
            return Ok(candidate);
        }
        Err(ComposeError::NoFreePortInRange {
            port: base,
            window: self.window,
        })
    }
}

fn bound_host_ports(topology: &Topology) -> BTreeSet<u16> {
    let mut bound = BTreeSet::new();
    for fragment in topology.services.values() {
        for entry in &fragment.ports {
            if let Some(binding) = entry.binding() {
                let _ = bound.insert(binding.host);
            }
        }
    }
    bound
}
