use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::Engine;
use crate::error::{LegerError, Result};
use crate::quadlet;
use crate::state::{StateStore, atomic_write, copy_tree, list_files};
use crate::systemd::ServiceManager;
use crate::validate::start_order;

pub const BACKUP_METADATA: &str = ".backup-metadata.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Manual,
    Automatic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeBackup {
    pub name: String,
    pub archive_path: String,
    pub size: u64,
}

/// Written last into every backup directory; its presence is the commit
/// marker. Directories without it are incomplete and ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub deployment_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: BackupKind,
    pub reason: String,
    pub size: u64,
    pub quadlet_files: Vec<String>,
    #[serde(default)]
    pub volumes: Vec<VolumeBackup>,
}

/// Timestamped, self-contained snapshots of a deployment's unit files and
/// volume contents, stored under `<state-root>/backups/`.
pub struct BackupStore<'a> {
    state: &'a StateStore,
    engine: &'a Engine,
}

impl<'a> BackupStore<'a> {
    pub fn new(state: &'a StateStore, engine: &'a Engine) -> Self {
        Self { state, engine }
    }

    pub fn backup_dir(&self, id: &str) -> PathBuf {
        self.state.backups_dir().join(id)
    }

    /// Snapshot `active/<name>` plus the named volumes. Unit files are
    /// copied as-is; each volume is exported through the engine and
    /// gzip-compressed. The metadata file is written last.
    pub fn create(
        &self,
        name: &str,
        volumes: &[String],
        kind: BackupKind,
        reason: &str,
    ) -> Result<String> {
        let active = self.state.active_dir(name);
        if !active.is_dir() {
            return Err(LegerError::StateInconsistent(format!(
                "deployment '{name}' has no active directory to back up"
            )));
        }

        let created_at = Utc::now();
        let id = self.fresh_id(name, created_at);
        let dir = self.backup_dir(&id);
        fs::create_dir_all(&dir)?;

        copy_tree(&active, &dir)?;
        let quadlet_files = list_files(&dir)?;
        let mut size: u64 = quadlet_files
            .iter()
            .map(|file| {
                fs::metadata(dir.join(file))
                    .map(|meta| meta.len())
                    .unwrap_or(0)
            })
            .sum();

        let mut volume_backups = Vec::new();
        if !volumes.is_empty() {
            let volume_dir = dir.join("volumes");
            fs::create_dir_all(&volume_dir)?;
            for volume in volumes {
                let tar = self.engine.volume_export(volume)?;
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&tar)?;
                let compressed = encoder.finish()?;

                let archive_rel = format!("volumes/{volume}.tar.gz");
                fs::write(dir.join(&archive_rel), &compressed)?;
                size += compressed.len() as u64;
                volume_backups.push(VolumeBackup {
                    name: volume.clone(),
                    archive_path: archive_rel,
                    size: compressed.len() as u64,
                });
            }
        }

        let metadata = BackupMetadata {
            id: id.clone(),
            deployment_name: name.to_string(),
            created_at,
            kind,
            reason: reason.to_string(),
            size,
            quadlet_files,
            volumes: volume_backups,
        };
        let json = serde_json::to_string_pretty(&metadata)?;
        atomic_write(&dir.join(BACKUP_METADATA), json.as_bytes())?;

        info!(backup = %id, deployment = %name, reason, "created backup");
        Ok(id)
    }

    fn fresh_id(&self, name: &str, created_at: DateTime<Utc>) -> String {
        let stamp = created_at.format("%Y%m%d-%H%M%S");
        let base = format!("{name}-{stamp}");
        if !self.backup_dir(&base).exists() {
            return base;
        }
        let mut counter = 2;
        loop {
            let candidate = format!("{base}-{counter}");
            if !self.backup_dir(&candidate).exists() {
                return candidate;
            }
            counter += 1;
        }
    }

    pub fn get(&self, id: &str) -> Result<BackupMetadata> {
        let path = self.backup_dir(id).join(BACKUP_METADATA);
        let raw = fs::read_to_string(&path).map_err(|_| LegerError::BackupCorrupt {
            id: id.to_string(),
            reason: "metadata file missing".into(),
        })?;
        serde_json::from_str(&raw).map_err(|err| LegerError::BackupCorrupt {
            id: id.to_string(),
            reason: format!("metadata invalid: {err}"),
        })
    }

    /// All complete backups, newest first. Incomplete directories (no
    /// metadata file yet, or a crashed create) are skipped.
    pub fn list(&self, name: Option<&str>) -> Result<Vec<BackupMetadata>> {
        let mut backups = Vec::new();
        for entry in fs::read_dir(self.state.backups_dir())? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();
            let Ok(metadata) = self.get(&id) else {
                continue;
            };
            if name.is_none_or(|n| metadata.deployment_name == n) {
                backups.push(metadata);
            }
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(backups)
    }

    /// Bring a deployment back to a backed-up state: safety snapshot, stop,
    /// replace unit files, re-import volumes, re-install, start. A failure
    /// after the safety snapshot rolls the replacement back and reports
    /// both outcomes.
    pub fn restore(&self, id: &str, sm: &ServiceManager) -> Result<String> {
        let metadata = self.get(id)?;
        let name = metadata.deployment_name.clone();

        // external damage may have taken the whole active tree; the safety
        // snapshot then captures an empty one
        let active = self.state.active_dir(&name);
        if !active.is_dir() {
            fs::create_dir_all(&active)?;
        }

        let volume_names: Vec<String> =
            metadata.volumes.iter().map(|v| v.name.clone()).collect();
        let safety_id = self.create(
            &name,
            &volume_names,
            BackupKind::Automatic,
            "pre-restore",
        )?;

        match self.restore_body(&metadata, sm) {
            Ok(()) => Ok(safety_id),
            Err(err) => {
                warn!(backup = %id, error = %err, "restore failed, rolling back");
                match self.rollback_restore(&safety_id, sm) {
                    Ok(()) => Err(err.compose(format!(
                        "rolled back to pre-restore snapshot '{safety_id}'"
                    ))),
                    Err(rollback_err) => Err(err.compose(format!(
                        "rollback from '{safety_id}' also failed: {rollback_err}"
                    ))),
                }
            }
        }
    }

    fn restore_body(&self, metadata: &BackupMetadata, sm: &ServiceManager) -> Result<()> {
        let name = &metadata.deployment_name;

        let services = self.active_services(name)?;
        for service in services.iter().rev() {
            sm.stop(service)?;
        }

        self.replace_active_from(metadata)?;
        self.import_volumes(metadata)?;

        let active = self.state.active_dir(name);
        self.engine.quadlet_install(&active)?;
        for service in self.active_services(name)? {
            sm.start(&service)?;
        }
        Ok(())
    }

    /// Reverse a failed restore from the safety snapshot: put the previous
    /// unit files back, re-install, and try to start services again.
    fn rollback_restore(&self, safety_id: &str, sm: &ServiceManager) -> Result<()> {
        let metadata = self.get(safety_id)?;
        self.replace_active_from(&metadata)?;
        let active = self.state.active_dir(&metadata.deployment_name);
        self.engine.quadlet_install(&active)?;
        for service in self.active_services(&metadata.deployment_name)? {
            if let Err(err) = sm.start(&service) {
                warn!(service = %service, error = %err, "restart during rollback failed");
            }
        }
        Ok(())
    }

    fn replace_active_from(&self, metadata: &BackupMetadata) -> Result<()> {
        let dir = self.backup_dir(&metadata.id);
        let active = self.state.active_dir(&metadata.deployment_name);
        if active.exists() {
            fs::remove_dir_all(&active)?;
        }
        fs::create_dir_all(&active)?;
        for file in &metadata.quadlet_files {
            let src = dir.join(file);
            let dst = active.join(file);
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dst).map_err(|err| LegerError::BackupCorrupt {
                id: metadata.id.clone(),
                reason: format!("captured file '{file}' unreadable: {err}"),
            })?;
        }
        Ok(())
    }

    fn import_volumes(&self, metadata: &BackupMetadata) -> Result<()> {
        let dir = self.backup_dir(&metadata.id);
        for volume in &metadata.volumes {
            let compressed =
                fs::read(dir.join(&volume.archive_path)).map_err(|err| {
                    LegerError::BackupCorrupt {
                        id: metadata.id.clone(),
                        reason: format!("volume archive '{}' unreadable: {err}", volume.archive_path),
                    }
                })?;
            let mut decoder = GzDecoder::new(compressed.as_slice());
            let mut tar = Vec::new();
            decoder
                .read_to_end(&mut tar)
                .map_err(|err| LegerError::BackupCorrupt {
                    id: metadata.id.clone(),
                    reason: format!("volume archive '{}' not gzip: {err}", volume.archive_path),
                })?;

            if let Err(err) = self.engine.volume_rm(&volume.name) {
                warn!(volume = %volume.name, error = %err, "volume removal before import failed");
            }
            self.engine.volume_create(&volume.name)?;
            self.engine.volume_import(&volume.name, &tar)?;
        }
        Ok(())
    }

    /// Service units of the deployment's current active tree, in start
    /// order.
    fn active_services(&self, name: &str) -> Result<Vec<String>> {
        let active = self.state.active_dir(name);
        if !active.is_dir() {
            return Ok(Vec::new());
        }
        let units = quadlet::parse_directory(&active)?;
        Ok(start_order(&units)
            .into_iter()
            .map(|service| format!("{service}.service"))
            .collect())
    }

    /// Remove all but the most recent `keep` backups of `name`, optionally
    /// restricted to one kind.
    pub fn prune(&self, name: &str, keep: usize, kind: Option<BackupKind>) -> Result<Vec<String>> {
        let backups: Vec<BackupMetadata> = self
            .list(Some(name))?
            .into_iter()
            .filter(|backup| kind.is_none_or(|k| backup.kind == k))
            .collect();

        let mut removed = Vec::new();
        for backup in backups.into_iter().skip(keep) {
            fs::remove_dir_all(self.backup_dir(&backup.id))?;
            removed.push(backup.id);
        }
        Ok(removed)
    }
}

/// Count the entries of a gzip-compressed tar archive, verifying it is
/// readable along the way.
pub fn count_archive_entries(path: &std::path::Path) -> Result<usize> {
    let file = fs::File::open(path)?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    let mut count = 0;
    for entry in archive.entries()? {
        entry?;
        count += 1;
    }
    Ok(count)
}
