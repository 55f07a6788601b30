use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;

use crate::paths::valid_volume_name;
use crate::quadlet::{ParseResult, UnitType};

/// Ports, volumes, and service units already claimed by other installed
/// deployments, as `(value, owning deployment)` pairs.
#[derive(Debug, Clone, Default)]
pub struct HostState {
    pub ports: Vec<(u16, String, String)>,
    pub volumes: Vec<(String, String)>,
    pub services: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyntaxIssue {
    pub unit: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortConflict {
    pub host_port: u16,
    pub protocol: String,
    pub units: Vec<String>,
    /// Set when the port is already bound by another installed deployment.
    pub other_deployment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeConflict {
    pub volume: String,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceConflict {
    pub service: String,
    pub owner: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyReport {
    /// Each cycle lists its services sorted lexicographically; cycles are
    /// ordered smallest first.
    pub cycles: Vec<Vec<String>>,
    /// `(service, referenced unit)` pairs where the reference names a
    /// service unit that exists nowhere in the deployment.
    pub dangling: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub syntax: Vec<SyntaxIssue>,
    pub port_conflicts: Vec<PortConflict>,
    pub volume_conflicts: Vec<VolumeConflict>,
    pub service_conflicts: Vec<ServiceConflict>,
    pub dependency: DependencyReport,
}

impl ValidationResult {
    pub fn is_clean(&self) -> bool {
        self.syntax.is_empty()
            && self.port_conflicts.is_empty()
            && self.volume_conflicts.is_empty()
            && self.service_conflicts.is_empty()
            && self.dependency.cycles.is_empty()
            && self.dependency.dangling.is_empty()
    }

    pub fn has_cycles(&self) -> bool {
        !self.dependency.cycles.is_empty()
    }

    /// Whether this result should abort the flow. `force` downgrades
    /// conflicts to warnings; dependency cycles are always fatal.
    pub fn is_fatal(&self, force: bool) -> bool {
        if self.has_cycles() {
            return true;
        }
        !force && !self.is_clean()
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for issue in &self.syntax {
            writeln!(f, "syntax: {}: {}", issue.unit, issue.message)?;
        }
        for conflict in &self.port_conflicts {
            match &conflict.other_deployment {
                Some(owner) => writeln!(
                    f,
                    "port conflict: {}/{} already bound by deployment '{}' ({})",
                    conflict.host_port,
                    conflict.protocol,
                    owner,
                    conflict.units.join(", ")
                )?,
                None => writeln!(
                    f,
                    "port conflict: {}/{} published by multiple units: {}",
                    conflict.host_port,
                    conflict.protocol,
                    conflict.units.join(", ")
                )?,
            }
        }
        for conflict in &self.volume_conflicts {
            writeln!(
                f,
                "volume conflict: '{}' is owned by deployment '{}'",
                conflict.volume, conflict.owner
            )?;
        }
        for conflict in &self.service_conflicts {
            writeln!(
                f,
                "service conflict: '{}' is already installed by deployment '{}'",
                conflict.service, conflict.owner
            )?;
        }
        for cycle in &self.dependency.cycles {
            writeln!(f, "dependency cycle: {}", cycle.join(" -> "))?;
        }
        for (service, reference) in &self.dependency.dangling {
            writeln!(
                f,
                "dangling dependency: {} references unknown unit '{}'",
                service, reference
            )?;
        }
        Ok(())
    }
}

/// Run every check over a parsed unit directory. `deployment` is the name
/// being installed or updated; host-state entries owned by it are ignored
/// so that re-installs do not conflict with themselves.
pub fn validate(units: &ParseResult, host: &HostState, deployment: &str) -> ValidationResult {
    ValidationResult {
        syntax: check_syntax(units),
        port_conflicts: check_ports(units, host, deployment),
        volume_conflicts: check_volumes(units, host, deployment),
        service_conflicts: check_services(units, host, deployment),
        dependency: check_dependencies(units),
    }
}

fn check_syntax(units: &ParseResult) -> Vec<SyntaxIssue> {
    let mut issues = Vec::new();

    for (path, file_issues) in &units.errors {
        for issue in file_issues {
            issues.push(SyntaxIssue {
                unit: path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                message: format!("line {}: not a key=value pair: {}", issue.line, issue.text.trim()),
            });
        }
    }

    for unit in &units.units {
        let section = unit.unit_type.main_section();
        if !unit.has_section(section) {
            issues.push(SyntaxIssue {
                unit: unit.file_name(),
                message: format!("missing required [{section}] section"),
            });
            continue;
        }
        if unit.unit_type == UnitType::Container && unit.image().is_none() {
            issues.push(SyntaxIssue {
                unit: unit.file_name(),
                message: "container unit declares no Image=".into(),
            });
        }
        if unit.unit_type == UnitType::Image && unit.get_first("Image", "Image").is_none() {
            issues.push(SyntaxIssue {
                unit: unit.file_name(),
                message: "image unit declares no Image=".into(),
            });
        }
    }

    for unit in units.containers() {
        for vref in unit.volume_refs() {
            if let Some(name) = &vref.name {
                if !valid_volume_name(name) {
                    issues.push(SyntaxIssue {
                        unit: unit.file_name(),
                        message: format!("'{name}' is not a valid volume name"),
                    });
                }
            }
        }
    }

    issues
}

fn check_ports(units: &ParseResult, host: &HostState, deployment: &str) -> Vec<PortConflict> {
    let mut by_port: BTreeMap<(u16, String), Vec<String>> = BTreeMap::new();
    for unit in units.containers() {
        for port in unit.published_ports() {
            let Some(host_port) = port.host_port else {
                continue;
            };
            by_port
                .entry((host_port, port.protocol.clone()))
                .or_default()
                .push(unit.file_name());
        }
    }

    let mut conflicts = Vec::new();
    for ((host_port, protocol), unit_names) in by_port {
        if unit_names.len() > 1 {
            conflicts.push(PortConflict {
                host_port,
                protocol: protocol.clone(),
                units: unit_names.clone(),
                other_deployment: None,
            });
        }
        if let Some((_, _, owner)) = host
            .ports
            .iter()
            .find(|(p, proto, owner)| *p == host_port && *proto == protocol && owner != deployment)
        {
            conflicts.push(PortConflict {
                host_port,
                protocol,
                units: unit_names,
                other_deployment: Some(owner.clone()),
            });
        }
    }
    conflicts
}

fn check_volumes(units: &ParseResult, host: &HostState, deployment: &str) -> Vec<VolumeConflict> {
    let mut conflicts = Vec::new();
    for volume in units.volume_names() {
        if let Some((_, owner)) = host
            .volumes
            .iter()
            .find(|(name, owner)| *name == volume && owner != deployment)
        {
            conflicts.push(VolumeConflict {
                volume,
                owner: owner.clone(),
            });
        }
    }
    conflicts
}

fn check_services(units: &ParseResult, host: &HostState, deployment: &str) -> Vec<ServiceConflict> {
    let mut conflicts = Vec::new();
    for unit in units.containers() {
        let service = unit.service_unit_name();
        if let Some((_, owner)) = host
            .services
            .iter()
            .find(|(name, owner)| *name == service && owner != deployment)
        {
            conflicts.push(ServiceConflict {
                service,
                owner: owner.clone(),
            });
        }
    }
    conflicts
}

fn check_dependencies(units: &ParseResult) -> DependencyReport {
    let known_units: BTreeSet<String> = units
        .units
        .iter()
        .map(|unit| unit.service_unit_name())
        .collect();
    let services: BTreeSet<String> = units.containers().map(|u| u.name.clone()).collect();

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    for service in &services {
        nodes.insert(service.clone(), graph.add_node(service.clone()));
    }

    let mut dangling = Vec::new();
    for unit in units.containers() {
        for dep in unit.dependencies() {
            let Some(stem) = dep.strip_suffix(".service") else {
                // systemd targets and other unit kinds are external ordering
                // points, not deployment services.
                continue;
            };
            if services.contains(stem) {
                let from = nodes[&unit.name];
                let to = nodes[stem];
                graph.add_edge(from, to, ());
            } else if !known_units.contains(&dep) {
                dangling.push((unit.name.clone(), dep));
            }
        }
    }
    dangling.sort();
    dangling.dedup();

    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|scc| {
            scc.len() > 1
                || scc
                    .first()
                    .is_some_and(|&n| graph.contains_edge(n, n))
        })
        .map(|scc| {
            let mut members: Vec<String> =
                scc.into_iter().map(|n| graph[n].clone()).collect();
            members.sort();
            members
        })
        .collect();
    // smallest component first; ties break on the lexicographically first
    // member so reporting is deterministic
    cycles.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    DependencyReport { cycles, dangling }
}

/// Dependency-first start order for the deployment's services. Falls back to
/// lexicographic order if the graph is cyclic (the validator refuses cycles
/// before any flow reaches this point).
pub fn start_order(units: &ParseResult) -> Vec<String> {
    let services: BTreeSet<String> = units.containers().map(|u| u.name.clone()).collect();

    let mut graph: DiGraph<String, ()> = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    for service in &services {
        nodes.insert(service.clone(), graph.add_node(service.clone()));
    }
    for unit in units.containers() {
        for dep in unit.dependencies() {
            if let Some(stem) = dep.strip_suffix(".service") {
                if services.contains(stem) && stem != unit.name {
                    // edge dependency -> dependent, so toposort yields
                    // dependencies first
                    graph.add_edge(nodes[stem], nodes[&unit.name], ());
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => order.into_iter().map(|n| graph[n].clone()).collect(),
        Err(_) => services.into_iter().collect(),
    }
}
