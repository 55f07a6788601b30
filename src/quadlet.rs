use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Unit kinds the engine translates into service-manager units, keyed by
/// file extension. Files with other extensions are skipped by the scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Container,
    Volume,
    Network,
    Pod,
    Image,
}

impl UnitType {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "container" => Some(UnitType::Container),
            "volume" => Some(UnitType::Volume),
            "network" => Some(UnitType::Network),
            "pod" => Some(UnitType::Pod),
            "image" => Some(UnitType::Image),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            UnitType::Container => "container",
            UnitType::Volume => "volume",
            UnitType::Network => "network",
            UnitType::Pod => "pod",
            UnitType::Image => "image",
        }
    }

    /// The section a unit of this type must declare.
    pub fn main_section(&self) -> &'static str {
        match self {
            UnitType::Container => "Container",
            UnitType::Volume => "Volume",
            UnitType::Network => "Network",
            UnitType::Pod => "Pod",
            UnitType::Image => "Image",
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// How a secret is surfaced inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretKind {
    Env,
    Mount,
}

/// One `Secret=` declaration: the daemon-side logical name, how it is
/// exposed, and the in-container target (env var name or mount path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub kind: SecretKind,
    pub target: String,
}

/// A published host port. Container-only publishes (no fixed host port)
/// carry `host_port: None` and never conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: String,
    pub protocol: String,
}

/// A volume reference from a `Volume=` line. Host-path bind mounts carry no
/// volume name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    pub name: Option<String>,
    pub mount_path: Option<String>,
}

/// One `[Section]` with its entries in file order, duplicates preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    pub entries: Vec<(String, String)>,
}

/// A malformed line collected during parsing. Does not abort the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIssue {
    pub line: usize,
    pub text: String,
}

/// Structured view of one unit file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFile {
    pub name: String,
    pub unit_type: UnitType,
    pub path: PathBuf,
    pub sections: Vec<Section>,
}

impl UnitFile {
    pub fn parse_file(path: &Path) -> Result<(UnitFile, Vec<ParseIssue>)> {
        let content = fs::read_to_string(path)?;
        let unit_type = UnitType::from_path(path).unwrap_or(UnitType::Container);
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or_default()
            .to_string();
        let (sections, issues) = parse_sections(&content);
        Ok((
            UnitFile {
                name,
                unit_type,
                path: path.to_path_buf(),
                sections,
            },
            issues,
        ))
    }

    pub fn parse_str(name: &str, unit_type: UnitType, content: &str) -> (UnitFile, Vec<ParseIssue>) {
        let (sections, issues) = parse_sections(content);
        (
            UnitFile {
                name: name.to_string(),
                unit_type,
                path: PathBuf::from(format!("{name}.{}", unit_type.extension())),
                sections,
            },
            issues,
        )
    }

    pub fn file_name(&self) -> String {
        format!("{}.{}", self.name, self.unit_type.extension())
    }

    /// The service-manager unit this file translates to.
    pub fn service_unit_name(&self) -> String {
        match self.unit_type {
            UnitType::Container | UnitType::Pod => format!("{}.service", self.name),
            UnitType::Volume => format!("{}-volume.service", self.name),
            UnitType::Network => format!("{}-network.service", self.name),
            UnitType::Image => format!("{}-image.service", self.name),
        }
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections
            .iter()
            .any(|section| section.name.eq_ignore_ascii_case(name))
    }

    /// All values of `key` in `section`, both matched case-insensitively.
    pub fn get_all(&self, section: &str, key: &str) -> Vec<&str> {
        self.sections
            .iter()
            .filter(|s| s.name.eq_ignore_ascii_case(section))
            .flat_map(|s| s.entries.iter())
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn get_first(&self, section: &str, key: &str) -> Option<&str> {
        self.get_all(section, key).into_iter().next()
    }

    pub fn image(&self) -> Option<&str> {
        self.get_first("Container", "Image")
    }

    pub fn published_ports(&self) -> Vec<PublishedPort> {
        self.get_all("Container", "PublishPort")
            .into_iter()
            .filter_map(parse_publish_port)
            .collect()
    }

    pub fn volume_refs(&self) -> Vec<VolumeRef> {
        self.get_all("Container", "Volume")
            .into_iter()
            .map(parse_volume_ref)
            .collect()
    }

    pub fn secret_refs(&self) -> Vec<SecretRef> {
        self.get_all("Container", "Secret")
            .into_iter()
            .filter_map(extract_secret_from_value)
            .collect()
    }

    /// Service names this unit orders itself after, from the service-manager
    /// ordering keys. References to units outside the deployment (e.g.
    /// `network-online.target`) are kept verbatim; the validator decides
    /// which are dangling.
    pub fn dependencies(&self) -> Vec<String> {
        let mut deps = Vec::new();
        for key in ["After", "Requires", "Wants"] {
            for value in self.get_all("Unit", key) {
                for item in value.split_whitespace() {
                    deps.push(item.to_string());
                }
            }
        }
        deps
    }

    /// Render the unit back out. Comments are not preserved; every section
    /// and key-value pair is.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push('[');
            out.push_str(&section.name);
            out.push_str("]\n");
            for (key, value) in &section.entries {
                out.push_str(key);
                out.push('=');
                out.push_str(value);
                out.push('\n');
            }
        }
        out
    }
}

fn parse_sections(content: &str) -> (Vec<Section>, Vec<ParseIssue>) {
    let mut sections: Vec<Section> = Vec::new();
    let mut issues = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim().to_string();
            sections.push(Section {
                name,
                entries: Vec::new(),
            });
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            issues.push(ParseIssue {
                line: idx + 1,
                text: raw.to_string(),
            });
            continue;
        };
        match sections.last_mut() {
            Some(section) => section
                .entries
                .push((key.trim().to_string(), value.trim().to_string())),
            None => issues.push(ParseIssue {
                line: idx + 1,
                text: raw.to_string(),
            }),
        }
    }

    (sections, issues)
}

/// Parse one `Secret=` value: `name[,type=env|mount][,target=<t>]`.
/// The default matches the engine: mounted under the declared name.
pub fn extract_secret_from_value(value: &str) -> Option<SecretRef> {
    let mut parts = value.split(',');
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }

    let mut kind = SecretKind::Mount;
    let mut target = None;
    for part in parts {
        let mut kv = part.splitn(2, '=');
        match (kv.next().map(str::trim), kv.next().map(str::trim)) {
            (Some("type"), Some("env")) => kind = SecretKind::Env,
            (Some("type"), Some("mount")) => kind = SecretKind::Mount,
            (Some("target"), Some(t)) if !t.is_empty() => target = Some(t.to_string()),
            _ => continue,
        }
    }

    Some(SecretRef {
        name: name.to_string(),
        kind,
        target: target.unwrap_or_else(|| name.to_string()),
    })
}

/// Parse `PublishPort=[[ip:]hostPort:]containerPort[/protocol]`.
fn parse_publish_port(value: &str) -> Option<PublishedPort> {
    let (spec, protocol) = match value.rsplit_once('/') {
        Some((spec, proto)) => (spec, proto.to_ascii_lowercase()),
        None => (value, "tcp".to_string()),
    };

    let segments: Vec<&str> = spec.split(':').collect();
    let (host_ip, host_port, container_port) = match segments.as_slice() {
        [container] => (None, None, (*container).to_string()),
        [host, container] => (None, host.parse::<u16>().ok(), (*container).to_string()),
        [ip, host, container] => (
            Some((*ip).to_string()),
            host.parse::<u16>().ok(),
            (*container).to_string(),
        ),
        _ => return None,
    };

    if container_port.is_empty() {
        return None;
    }

    Some(PublishedPort {
        host_ip,
        host_port,
        container_port,
        protocol,
    })
}

/// Parse `Volume=source:dest[:options]`. A `.volume` suffix references a
/// co-located volume unit; a plain name is an engine-named volume; paths
/// are bind mounts and carry no name.
fn parse_volume_ref(value: &str) -> VolumeRef {
    let mut parts = value.splitn(3, ':');
    let source = parts.next().unwrap_or_default().trim();
    let mount_path = parts.next().map(|p| p.trim().to_string());

    let name = if let Some(stem) = source.strip_suffix(".volume") {
        Some(stem.to_string())
    } else if source.is_empty() || source.starts_with('/') || source.starts_with('.') || source.starts_with('%') {
        None
    } else {
        Some(source.to_string())
    };

    VolumeRef { name, mount_path }
}

/// Aggregated view of a directory of unit files.
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub units: Vec<UnitFile>,
    pub errors: Vec<(PathBuf, Vec<ParseIssue>)>,
}

impl ParseResult {
    pub fn containers(&self) -> impl Iterator<Item = &UnitFile> {
        self.units
            .iter()
            .filter(|unit| unit.unit_type == UnitType::Container)
    }

    pub fn unit(&self, name: &str) -> Option<&UnitFile> {
        self.units.iter().find(|unit| unit.name == name)
    }

    /// Every secret reference across the directory, deduplicated in first-use
    /// order.
    pub fn secret_refs(&self) -> Vec<SecretRef> {
        let mut seen = Vec::new();
        for unit in self.containers() {
            for secret in unit.secret_refs() {
                if !seen.contains(&secret) {
                    seen.push(secret);
                }
            }
        }
        seen
    }

    /// Volume names declared anywhere in the directory: `.volume` units plus
    /// named `Volume=` references.
    pub fn volume_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for unit in &self.units {
            if unit.unit_type == UnitType::Volume && !names.contains(&unit.name) {
                names.push(unit.name.clone());
            }
        }
        for unit in self.containers() {
            for vref in unit.volume_refs() {
                if let Some(name) = vref.name {
                    if !names.contains(&name) {
                        names.push(name);
                    }
                }
            }
        }
        names
    }
}

/// Parse every unit file directly under `dir`. Unknown extensions are
/// skipped; malformed lines are collected per file, never fatal.
pub fn parse_directory(dir: &Path) -> Result<ParseResult> {
    let mut result = ParseResult::default();

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && UnitType::from_path(path).is_some())
        .collect();
    paths.sort();

    for path in paths {
        let (unit, issues) = UnitFile::parse_file(&path)?;
        if !issues.is_empty() {
            result.errors.push((path, issues));
        }
        result.units.push(unit);
    }

    Ok(result)
}
