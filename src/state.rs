use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::config::Scope;
use crate::error::{LegerError, Result};
use crate::quadlet::{self, PublishedPort, SecretRef};
use crate::source::Source;
use crate::validate::{HostState, ValidationResult, validate};

pub const STATE_SCHEMA_VERSION: u32 = 1;

pub const STAGING_METADATA: &str = ".staging-metadata.json";

/// One installed deployment as persisted in `deployments.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub name: String,
    pub source: Source,
    pub scope: Scope,
    pub installed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
    #[serde(default)]
    pub volumes: Vec<VolumeRecord>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub unit_file: String,
    pub unit_name: String,
    #[serde(default)]
    pub ports: Vec<PublishedPort>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeploymentsFile {
    version: u32,
    deployments: Vec<DeploymentRecord>,
}

/// Sidecar written into `staged/<name>/` when an update is staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingMetadata {
    pub deployment_name: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    pub staged_at: DateTime<Utc>,
    pub checksum: String,
}

/// A line diff for one modified file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileDiff {
    pub path: String,
    pub diff: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffResult {
    pub modified: Vec<FileDiff>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub affected_services: Vec<String>,
    pub new_conflicts: ValidationResult,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.modified.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

/// Advisory per-deployment lock. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// The one component that writes durable state, rooted at the state
/// directory described by the layout:
///
/// ```text
/// <root>/active/<deployment>/       unit files
/// <root>/staged/<deployment>/       unit files + .staging-metadata.json
/// <root>/backups/<id>/              snapshot dirs
/// <root>/deployments.json
/// <root>/.locks/<deployment>
/// ```
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for sub in ["active", "staged", "backups", ".locks"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn active_dir(&self, name: &str) -> PathBuf {
        self.root.join("active").join(name)
    }

    pub fn staged_dir(&self, name: &str) -> PathBuf {
        self.root.join("staged").join(name)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    /// Take the per-deployment mutation lock. Non-mutating reads skip this.
    pub fn lock(&self, name: &str) -> Result<LockGuard> {
        let path = self.root.join(".locks").join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(LockGuard { path })
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(LegerError::Locked(name.to_string()))
            }
            Err(err) => Err(LegerError::Io(err)),
        }
    }

    // ---- deployment records ----

    fn records_path(&self) -> PathBuf {
        self.root.join("deployments.json")
    }

    pub fn load_all(&self) -> Result<Vec<DeploymentRecord>> {
        let path = self.records_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&path)?;
        let file: DeploymentsFile = serde_json::from_str(&raw)?;
        if file.version != STATE_SCHEMA_VERSION {
            return Err(LegerError::StateInconsistent(format!(
                "deployments.json has schema version {} (supported: {})",
                file.version, STATE_SCHEMA_VERSION
            )));
        }
        Ok(file.deployments)
    }

    pub fn load(&self, name: &str) -> Result<Option<DeploymentRecord>> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|record| record.name == name))
    }

    /// Insert or replace the record for `record.name`.
    pub fn save(&self, record: DeploymentRecord) -> Result<()> {
        let mut records = self.load_all()?;
        match records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        self.write_records(records)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut records = self.load_all()?;
        records.retain(|record| record.name != name);
        self.write_records(records)
    }

    fn write_records(&self, deployments: Vec<DeploymentRecord>) -> Result<()> {
        let file = DeploymentsFile {
            version: STATE_SCHEMA_VERSION,
            deployments,
        };
        let json = serde_json::to_string_pretty(&file)?;
        atomic_write(&self.records_path(), json.as_bytes())
    }

    /// Ports, volumes, and service units claimed by installed deployments,
    /// for conflict checks against a candidate.
    pub fn host_state(&self) -> Result<HostState> {
        let mut host = HostState::default();
        for record in self.load_all()? {
            for service in &record.services {
                host.services
                    .push((service.unit_name.clone(), record.name.clone()));
                for port in &service.ports {
                    if let Some(host_port) = port.host_port {
                        host.ports
                            .push((host_port, port.protocol.clone(), record.name.clone()));
                    }
                }
            }
            for volume in &record.volumes {
                host.volumes.push((volume.name.clone(), record.name.clone()));
            }
        }
        Ok(host)
    }

    // ---- active tree ----

    pub fn active_exists(&self, name: &str) -> bool {
        self.active_dir(name).is_dir()
    }

    /// Replace (or create) `active/<name>` from a source directory.
    pub fn install_active(&self, name: &str, src: &Path) -> Result<()> {
        let target = self.active_dir(name);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        copy_tree(src, &target)
    }

    // ---- staging ----

    pub fn has_staged(&self, name: &str) -> bool {
        self.staged_dir(name).join(STAGING_METADATA).is_file()
    }

    /// Copy `src` into `staged/<name>` and write the staging sidecar. Any
    /// previous staged tree for the same name is replaced; at most one
    /// staged update exists per deployment.
    pub fn stage(&self, name: &str, src: &Path, mut meta: StagingMetadata) -> Result<String> {
        let target = self.staged_dir(name);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        copy_tree(src, &target)?;

        let checksum = tree_checksum(&target)?;
        meta.checksum = checksum.clone();
        let json = serde_json::to_string_pretty(&meta)?;
        atomic_write(&target.join(STAGING_METADATA), json.as_bytes())?;
        Ok(checksum)
    }

    pub fn staging_metadata(&self, name: &str) -> Result<StagingMetadata> {
        let path = self.staged_dir(name).join(STAGING_METADATA);
        let raw = fs::read_to_string(&path).map_err(|_| {
            LegerError::StateInconsistent(format!("no staged update for '{name}'"))
        })?;
        serde_json::from_str(&raw).map_err(|err| {
            LegerError::StateInconsistent(format!("staging metadata for '{name}' invalid: {err}"))
        })
    }

    pub fn list_staged(&self) -> Result<Vec<StagingMetadata>> {
        let mut staged = Vec::new();
        let dir = self.root.join("staged");
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if self.has_staged(&name) {
                staged.push(self.staging_metadata(&name)?);
            }
        }
        staged.sort_by(|a, b| a.deployment_name.cmp(&b.deployment_name));
        Ok(staged)
    }

    /// Remove the staged tree. Never touches `active/<name>`.
    pub fn discard(&self, name: &str) -> Result<()> {
        let target = self.staged_dir(name);
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        Ok(())
    }

    /// Swap `staged/<name>` into `active/<name>`. The caller has already
    /// snapshotted the active tree (the apply flow backs up before this).
    /// The swap goes through a sibling temp dir so a crash leaves either
    /// the old or the new tree, never a mix.
    pub fn promote(&self, name: &str) -> Result<()> {
        if !self.has_staged(name) {
            return Err(LegerError::StateInconsistent(format!(
                "no staged update for '{name}'"
            )));
        }
        let staged = self.staged_dir(name);
        let active = self.active_dir(name);
        fs::remove_file(staged.join(STAGING_METADATA))?;

        let retired = self.root.join("active").join(format!(".{name}.old"));
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        if active.exists() {
            fs::rename(&active, &retired)?;
        }
        fs::rename(&staged, &active)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        debug!(deployment = %name, "promoted staged tree to active");
        Ok(())
    }

    // ---- diff ----

    /// Compare `active/<name>` with `staged/<name>`.
    pub fn diff(&self, name: &str) -> Result<DiffResult> {
        if !self.has_staged(name) {
            return Err(LegerError::StateInconsistent(format!(
                "no staged update for '{name}'"
            )));
        }
        let active = self.active_dir(name);
        let staged = self.staged_dir(name);

        let active_files = list_files(&active)?;
        let staged_files: Vec<String> = list_files(&staged)?
            .into_iter()
            .filter(|file| file != STAGING_METADATA)
            .collect();

        let mut result = DiffResult::default();
        let mut affected = Vec::new();

        for file in &staged_files {
            let staged_path = staged.join(file);
            if active_files.contains(file) {
                let old = fs::read_to_string(active.join(file))?;
                let new = fs::read_to_string(&staged_path)?;
                if old != new {
                    result.modified.push(FileDiff {
                        path: file.clone(),
                        diff: unified_diff(&old, &new, file),
                    });
                    push_affected(&mut affected, file);
                }
            } else {
                result.added.push(file.clone());
                push_affected(&mut affected, file);
            }
        }
        for file in &active_files {
            if !staged_files.contains(file) {
                result.removed.push(file.clone());
                push_affected(&mut affected, file);
            }
        }

        affected.sort();
        affected.dedup();
        result.affected_services = affected;

        // conflicts the staged tree would introduce against the rest of the
        // host (the deployment's own claims are exempt)
        let staged_units = quadlet::parse_directory(&staged)?;
        result.new_conflicts = validate(&staged_units, &self.host_state()?, name);

        Ok(result)
    }
}

fn push_affected(affected: &mut Vec<String>, file: &str) {
    if let Some(stem) = file.strip_suffix(".container") {
        affected.push(stem.to_string());
    }
}

/// Write via a temp file in the same directory, then rename over the
/// target, so a mid-write crash never leaves a torn file.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| LegerError::Other(format!("{} has no parent", path.display())))?;
    fs::create_dir_all(parent)?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".into())
    ));
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Recursive copy of a directory tree.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|err| LegerError::Other(err.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|err| LegerError::Other(err.to_string()))?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Relative paths of all regular files under `dir`, sorted.
pub fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|err| LegerError::Other(err.to_string()))?;
        if entry.file_type().is_file() {
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|err| LegerError::Other(err.to_string()))?;
            files.push(rel.to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

/// Hex-encoded SHA-256 over file names and contents, in sorted order. The
/// staging sidecar is excluded so the checksum covers only unit content.
pub fn tree_checksum(dir: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for file in list_files(dir)? {
        if file == STAGING_METADATA {
            continue;
        }
        hasher.update(file.as_bytes());
        hasher.update([0]);
        hasher.update(fs::read(dir.join(&file))?);
        hasher.update([0]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Minimal unified diff: one hunk spanning both files, computed from the
/// longest common subsequence of lines.
pub fn unified_diff(old: &str, new: &str, path: &str) -> String {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();

    // LCS table; unit files are small so the quadratic table is fine
    let n = old_lines.len();
    let m = new_lines.len();
    let mut table = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if old_lines[i] == new_lines[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }

    let mut body = String::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old_lines[i] == new_lines[j] {
            body.push(' ');
            body.push_str(old_lines[i]);
            body.push('\n');
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            body.push('-');
            body.push_str(old_lines[i]);
            body.push('\n');
            i += 1;
        } else {
            body.push('+');
            body.push_str(new_lines[j]);
            body.push('\n');
            j += 1;
        }
    }
    for line in &old_lines[i..] {
        body.push('-');
        body.push_str(line);
        body.push('\n');
    }
    for line in &new_lines[j..] {
        body.push('+');
        body.push_str(line);
        body.push('\n');
    }

    format!(
        "--- a/{path}\n+++ b/{path}\n@@ -1,{n} +1,{m} @@\n{body}"
    )
}
