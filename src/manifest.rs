use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml_bw as serde_yaml;
use uuid::Uuid;

use crate::error::{LegerError, Result};
use crate::paths::valid_volume_name;
use crate::quadlet::{ParseResult, SecretKind, UnitType};

pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// Hosted-format manifest file name, stored alongside the unit files.
pub const MANIFEST_JSON: &str = "manifest.json";
/// Generic YAML manifest recognized in any source directory.
pub const MANIFEST_YAML: &str = ".leger.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_uuid: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub services: Vec<ServiceDef>,
    #[serde(default)]
    pub volumes: Vec<VolumeDef>,
    #[serde(default)]
    pub networks: Vec<NetworkDef>,
    #[serde(default)]
    pub secrets: Vec<SecretDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDef {
    pub name: String,
    #[serde(default = "default_service_kind")]
    pub kind: UnitType,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_service_kind() -> UnitType {
    UnitType::Container
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkDef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretDef {
    pub name: String,
    #[serde(default = "default_secret_kind")]
    pub kind: SecretKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
}

fn default_secret_kind() -> SecretKind {
    SecretKind::Mount
}

fn default_true() -> bool {
    true
}

impl Manifest {
    /// Produce the manifest for a unit directory: `manifest.json` if present,
    /// else `.leger.yaml`, else a generated one from the unit scan.
    pub fn resolve(dir: &Path, name: &str, units: &ParseResult) -> Result<Manifest> {
        let json_path = dir.join(MANIFEST_JSON);
        if json_path.exists() {
            let manifest = Self::load_json(&json_path)?;
            manifest.validate()?;
            return Ok(manifest);
        }

        let yaml_path = dir.join(MANIFEST_YAML);
        if yaml_path.exists() {
            let manifest = Self::load_yaml(&yaml_path)?;
            manifest.validate()?;
            return Ok(manifest);
        }

        Ok(Self::generate(name, units))
    }

    pub fn load_json(path: &Path) -> Result<Manifest> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|err| LegerError::SourceCorrupt(format!("{}: {err}", path.display())))
    }

    pub fn load_yaml(path: &Path) -> Result<Manifest> {
        let raw = fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|err| LegerError::SourceCorrupt(format!("{}: {err}", path.display())))
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Build a manifest from the unit scan alone: one service per container
    /// unit, ports from its `PublishPort=` lines, secrets and volumes from
    /// the whole directory.
    pub fn generate(name: &str, units: &ParseResult) -> Manifest {
        let service_names: BTreeSet<String> =
            units.containers().map(|unit| unit.name.clone()).collect();

        let services = units
            .containers()
            .map(|unit| {
                let depends_on = unit
                    .dependencies()
                    .iter()
                    .filter_map(|dep| dep.strip_suffix(".service"))
                    .filter(|dep| service_names.contains(*dep))
                    .map(str::to_string)
                    .collect();
                let env = unit
                    .get_all("Container", "Environment")
                    .iter()
                    .filter_map(|entry| entry.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                ServiceDef {
                    name: unit.name.clone(),
                    kind: UnitType::Container,
                    files: vec![unit.file_name()],
                    ports: unit
                        .get_all("Container", "PublishPort")
                        .iter()
                        .map(|p| p.to_string())
                        .collect(),
                    env,
                    depends_on,
                }
            })
            .collect();

        let volumes = units
            .volume_names()
            .into_iter()
            .map(|name| VolumeDef {
                name,
                mount_path: None,
                driver: None,
            })
            .collect();

        let networks = units
            .units
            .iter()
            .filter(|unit| unit.unit_type == UnitType::Network)
            .map(|unit| NetworkDef {
                name: unit.name.clone(),
            })
            .collect();

        let secrets = units
            .secret_refs()
            .into_iter()
            .map(|secret| SecretDef {
                name: secret.name,
                kind: secret.kind,
                target: Some(secret.target),
                required: true,
            })
            .collect();

        Manifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            created_at: Utc::now(),
            user_uuid: None,
            name: name.to_string(),
            description: None,
            services,
            volumes,
            networks,
            secrets,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(LegerError::SourceCorrupt(format!(
                "unsupported manifest schema version {} (supported: {})",
                self.schema_version, MANIFEST_SCHEMA_VERSION
            )));
        }
        if self.name.is_empty() {
            return Err(LegerError::SourceCorrupt("manifest name is empty".into()));
        }

        let mut seen = BTreeSet::new();
        for service in &self.services {
            if service.name.is_empty() {
                return Err(LegerError::SourceCorrupt(
                    "manifest contains a service without a name".into(),
                ));
            }
            if !seen.insert(&service.name) {
                return Err(LegerError::SourceCorrupt(format!(
                    "duplicate service name '{}' in manifest",
                    service.name
                )));
            }
        }

        let mut seen = BTreeSet::new();
        for secret in &self.secrets {
            if !seen.insert(&secret.name) {
                return Err(LegerError::SourceCorrupt(format!(
                    "duplicate secret name '{}' in manifest",
                    secret.name
                )));
            }
        }

        for volume in &self.volumes {
            if !valid_volume_name(&volume.name) {
                return Err(LegerError::UserInput(format!(
                    "'{}' is not a valid volume name",
                    volume.name
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quadlet;

    fn scan(dir: &Path) -> ParseResult {
        quadlet::parse_directory(dir).expect("scan")
    }

    fn write_unit(dir: &Path, name: &str, content: &str) {
        fs::write(dir.join(name), content).unwrap();
    }

    const WEB: &str = "\
[Unit]
After=cache.service

[Container]
Image=ghcr.io/acme/web:1.0
PublishPort=8080:80
Volume=web-data:/var/lib/web
Secret=api_key,type=env,target=API_KEY
Environment=MODE=production
";

    const CACHE: &str = "\
[Container]
Image=redis:7
";

    #[test]
    fn generates_manifest_from_scan() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(dir.path(), "web.container", WEB);
        write_unit(dir.path(), "cache.container", CACHE);
        write_unit(dir.path(), "web-data.volume", "[Volume]\n");

        let manifest = Manifest::generate("acme", &scan(dir.path()));
        assert_eq!(manifest.name, "acme");
        assert_eq!(manifest.services.len(), 2);

        let web = manifest
            .services
            .iter()
            .find(|s| s.name == "web")
            .expect("web service");
        assert_eq!(web.ports, vec!["8080:80"]);
        assert_eq!(web.depends_on, vec!["cache"]);
        assert_eq!(web.env.get("MODE").map(String::as_str), Some("production"));

        assert_eq!(manifest.volumes.len(), 1);
        assert_eq!(manifest.volumes[0].name, "web-data");
        assert_eq!(manifest.secrets.len(), 1);
        assert_eq!(manifest.secrets[0].name, "api_key");
    }

    #[test]
    fn manifest_json_takes_priority() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(dir.path(), "web.container", WEB);
        let manifest = Manifest::generate("from-json", &ParseResult::default());
        manifest.save_json(&dir.path().join(MANIFEST_JSON)).unwrap();

        let resolved = Manifest::resolve(dir.path(), "ignored", &scan(dir.path())).unwrap();
        assert_eq!(resolved.name, "from-json");
    }

    #[test]
    fn json_roundtrip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        write_unit(dir.path(), "web.container", WEB);
        let manifest = Manifest::generate("acme", &scan(dir.path()));

        let path = dir.path().join("out.json");
        manifest.save_json(&path).unwrap();
        let loaded = Manifest::load_json(&path).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let mut manifest = Manifest::generate("acme", &ParseResult::default());
        let service = ServiceDef {
            name: "web".into(),
            kind: UnitType::Container,
            files: vec![],
            ports: vec![],
            env: IndexMap::new(),
            depends_on: vec![],
        };
        manifest.services = vec![service.clone(), service];
        let err = manifest.validate().unwrap_err();
        assert!(format!("{err}").contains("duplicate service"));
    }

    #[test]
    fn rejects_invalid_volume_names() {
        let mut manifest = Manifest::generate("acme", &ParseResult::default());
        manifest.volumes = vec![VolumeDef {
            name: "../escape".into(),
            mount_path: None,
            driver: None,
        }];
        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, LegerError::UserInput(_)));
        assert!(format!("{err}").contains("volume name"));
    }

    #[test]
    fn rejects_unknown_schema_version() {
        let mut manifest = Manifest::generate("acme", &ParseResult::default());
        manifest.schema_version = 99;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn yaml_manifest_loads() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = "\
schema_version: 1
created_at: 2026-01-10T12:00:00Z
name: acme
services:
  - name: web
    files: [web.container]
    ports: [\"8080:80\"]
secrets:
  - name: api_key
    kind: env
    target: API_KEY
";
        fs::write(dir.path().join(MANIFEST_YAML), yaml).unwrap();
        let resolved = Manifest::resolve(dir.path(), "ignored", &ParseResult::default()).unwrap();
        assert_eq!(resolved.name, "acme");
        assert_eq!(resolved.services[0].name, "web");
        assert!(resolved.secrets[0].required);
    }
}
