use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde_yaml_bw as serde_yaml;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backup::{BackupKind, BackupStore, count_archive_entries};
use crate::config::{
    BackupCommand, Command, LegerConfig, OutputFormat, ServiceCommand, VolumePolicy,
};
use crate::engine::Engine;
use crate::error::{LegerError, Result};
use crate::exec::CommandRunner;
use crate::manifest::Manifest;
use crate::paths::valid_deployment_name;
use crate::quadlet::{self, ParseResult};
use crate::secrets::{
    DaemonClient, Provisioner, SecretIndex, qualified_name, restart_services_using,
};
use crate::source::{Source, SourceKind, SourceResolver, extract_user_identity};
use crate::state::{
    DeploymentRecord, ServiceRecord, StagingMetadata, StateStore, VolumeRecord, tree_checksum,
};
use crate::systemd::ServiceManager;
use crate::validate::{start_order, validate};

/// Composes the resolver, parser, validator, provisioner, state store, and
/// the external engine/service-manager processes into the lifecycle flows.
pub struct Orchestrator {
    config: LegerConfig,
    state: StateStore,
    engine: Engine,
    sm: ServiceManager,
    runner: Arc<dyn CommandRunner>,
}

impl Orchestrator {
    pub fn new(config: LegerConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let state = StateStore::open(&config.state_root)?;
        let engine = Engine::new(runner.clone(), config.engine_bin.clone(), config.scope);
        let sm = ServiceManager::new(runner.clone(), config.sm_bin.clone(), config.scope);
        Ok(Self {
            config,
            state,
            engine,
            sm,
            runner,
        })
    }

    pub async fn run(&self, command: Command) -> Result<()> {
        match command {
            Command::Install {
                source,
                name,
                version,
                subpath,
                force,
                no_start,
            } => {
                self.install(&source, name, version, subpath, force, no_start)
                    .await
            }
            Command::List { output } => self.list(output),
            Command::Remove {
                name,
                force,
                backup,
                volumes,
            } => self.remove(&name, force, backup, volumes),
            Command::Update { name, source } => self.update(&name, source).await,
            Command::Stage { name, source } => self.stage(&name, source).await.map(|_| ()),
            Command::Diff { name } => self.diff(&name),
            Command::Apply { name } => self.apply(&name),
            Command::Discard { name } => self.discard(&name),
            Command::Backup { command } => self.backup(command),
            Command::Restore { backup_id } => self.restore(&backup_id),
            Command::Validate { dir } => self.validate_dir(&dir),
            Command::CheckConflicts { dir } => self.check_conflicts(&dir),
            Command::RotateSecret {
                secret,
                value_file,
                no_restart,
                restart_mounts,
            } => {
                self.rotate_secret(&secret, value_file.as_deref(), no_restart, restart_mounts)
                    .await
            }
            Command::Service { command } => self.service(command),
        }
    }

    fn daemon_client(&self) -> Result<DaemonClient> {
        DaemonClient::new(
            self.config.daemon_url.clone(),
            self.config.read_token().ok(),
            self.config.session_timeout,
            self.config.lookup_timeout,
        )
    }

    fn backups(&self) -> BackupStore<'_> {
        BackupStore::new(&self.state, &self.engine)
    }

    /// The identity under which secrets are namespaced: extracted from a
    /// hosted source URL when possible, otherwise configured.
    fn secret_user(&self, source: &Source) -> Result<Uuid> {
        if source.kind == SourceKind::Hosted {
            if let Ok(uuid) = extract_user_identity(&source.location, &self.config.hosted_base) {
                return Ok(uuid);
            }
        }
        self.config.user_uuid.ok_or_else(|| {
            LegerError::UserInput(
                "units reference secrets but no user identity is configured; \
                 set hosted.user_uuid in leger.toml or LEGER_USER_UUID"
                    .into(),
            )
        })
    }

    // ---- install ----

    async fn install(
        &self,
        location: &str,
        name: Option<String>,
        version: Option<String>,
        subpath: Option<String>,
        force: bool,
        no_start: bool,
    ) -> Result<()> {
        let source = Source::new(location, subpath, version, &self.config.hosted_base);
        let name = match name {
            Some(name) => name,
            None => derive_name(&source)?,
        };
        if !valid_deployment_name(&name) {
            return Err(LegerError::UserInput(format!(
                "'{name}' is not a valid deployment name"
            )));
        }

        let _lock = self.state.lock(&name)?;

        self.daemon_client()?.health().await?;

        let resolver = SourceResolver::new(&self.config, self.runner.clone())?;
        let resolved = resolver.resolve(&source, &name).await?;
        let units = quadlet::parse_directory(&resolved.dir)?;
        if units.units.is_empty() {
            return Err(LegerError::UserInput(format!(
                "no unit files found in {}",
                resolved.dir.display()
            )));
        }
        let manifest = Manifest::resolve(&resolved.dir, &name, &units)?;

        let report = validate(&units, &self.state.host_state()?, &name);
        if report.is_fatal(force) {
            return Err(LegerError::ValidationFailed(report));
        }
        if !report.is_clean() {
            warn!("proceeding despite validation findings:\n{report}");
        }

        let existing = self.state.load(&name)?;
        if let Some(existing) = &existing {
            if self.state.active_exists(&name) {
                let incoming = tree_checksum(&resolved.dir)?;
                let current = tree_checksum(&self.state.active_dir(&name))?;
                if incoming == current {
                    info!(deployment = %name, "already installed and up to date");
                    println!("Deployment '{name}' is already up to date.");
                    return Ok(());
                }
            } else {
                warn!(
                    deployment = %name,
                    "record exists but active tree is missing; reinstalling"
                );
            }
        }

        // secrets first: a service must never start before its secrets
        // exist in the engine store
        let secret_refs = units.secret_refs();
        let mut prepared = Vec::new();
        if !secret_refs.is_empty() {
            let user = self.secret_user(&source)?;
            let client = self.daemon_client()?;
            let provisioner = Provisioner::new(&client, &self.engine);
            prepared = provisioner.prepare(&secret_refs, &user).await?;
        }

        let outcome = self.install_body(&name, &resolved.dir, &units, no_start);
        if let Err(err) = outcome {
            // best effort: take back the engine secrets and unit files this
            // flow created, then surface what happened
            if let Ok(client) = self.daemon_client() {
                Provisioner::new(&client, &self.engine).remove_prepared(&prepared);
            }
            for unit in &units.units {
                let _ = self.engine.quadlet_rm(&unit.file_name());
            }
            let active = self.state.active_dir(&name);
            if active.exists() {
                let _ = fs::remove_dir_all(&active);
            }
            return Err(err.compose("install aborted; partial changes were rolled back"));
        }

        let mut recorded_source = source;
        if resolved.version.is_some() {
            recorded_source.version = resolved.version.clone();
        }
        let record = self.build_record(&name, recorded_source, &units, &manifest, existing);
        self.state.save(record)?;

        println!("Installed deployment '{name}'.");
        Ok(())
    }

    fn install_body(
        &self,
        name: &str,
        src_dir: &Path,
        units: &ParseResult,
        no_start: bool,
    ) -> Result<()> {
        self.state.install_active(name, src_dir)?;
        self.engine.quadlet_install(&self.state.active_dir(name))?;

        // confirm the engine registered everything before starting anything
        let installed = self.engine.quadlet_list()?;
        for unit in &units.units {
            let file = unit.file_name();
            if !installed.iter().any(|entry| entry.name == file) {
                return Err(LegerError::StateInconsistent(format!(
                    "unit '{file}' did not register with the engine"
                )));
            }
        }

        if !no_start {
            for service in start_order(units) {
                self.sm.start(&format!("{service}.service"))?;
            }
        }
        Ok(())
    }

    fn build_record(
        &self,
        name: &str,
        source: Source,
        units: &ParseResult,
        manifest: &Manifest,
        existing: Option<DeploymentRecord>,
    ) -> DeploymentRecord {
        let now = Utc::now();

        let services = units
            .containers()
            .map(|unit| ServiceRecord {
                name: unit.name.clone(),
                unit_file: unit.file_name(),
                unit_name: unit.service_unit_name(),
                ports: unit.published_ports(),
                volumes: unit
                    .volume_refs()
                    .into_iter()
                    .filter_map(|vref| vref.name)
                    .collect(),
                secrets: unit.secret_refs(),
            })
            .collect();

        let volumes = units
            .volume_names()
            .into_iter()
            .map(|volume| {
                let def = manifest.volumes.iter().find(|v| v.name == volume);
                let previous = existing
                    .as_ref()
                    .and_then(|e| e.volumes.iter().find(|v| v.name == volume));
                VolumeRecord {
                    name: volume,
                    mount_path: def.and_then(|d| d.mount_path.clone()),
                    driver: def.and_then(|d| d.driver.clone()),
                    created_at: previous.map(|p| p.created_at).unwrap_or(now),
                }
            })
            .collect();

        let secrets = units
            .secret_refs()
            .into_iter()
            .map(|secret| secret.name)
            .collect();

        DeploymentRecord {
            name: name.to_string(),
            source,
            scope: self.config.scope,
            installed_at: existing.as_ref().map(|e| e.installed_at).unwrap_or(now),
            updated_at: now,
            services,
            volumes,
            secrets,
            metadata: existing.map(|e| e.metadata).unwrap_or_else(BTreeMap::new),
        }
    }

    // ---- staging ----

    async fn stage(&self, name: &str, source_override: Option<String>) -> Result<String> {
        let record = self.require_record(name)?;
        let source = match source_override {
            Some(location) => Source::new(&location, None, None, &self.config.hosted_base),
            None => record.source.clone(),
        };

        let _lock = self.state.lock(name)?;

        let resolver = SourceResolver::new(&self.config, self.runner.clone())?;
        let resolved = resolver.resolve(&source, name).await?;

        let meta = StagingMetadata {
            deployment_name: name.to_string(),
            source_url: source.location.clone(),
            staged_version: resolved.version.clone(),
            current_version: record.source.version.clone(),
            staged_at: Utc::now(),
            checksum: String::new(),
        };
        let checksum = self.state.stage(name, &resolved.dir, meta)?;

        println!("Staged update for '{name}' (checksum {checksum}).");
        println!("Review with `leger diff {name}`, then `leger apply {name}`.");
        Ok(checksum)
    }

    fn diff(&self, name: &str) -> Result<()> {
        self.require_record(name)?;
        let diff = self.state.diff(name)?;

        if diff.is_empty() {
            println!("Staged update for '{name}' matches the active version.");
        }
        for file in &diff.modified {
            println!("{}", file.diff);
        }
        for file in &diff.added {
            println!("added: {file}");
        }
        for file in &diff.removed {
            println!("removed: {file}");
        }
        if !diff.affected_services.is_empty() {
            println!("affected services: {}", diff.affected_services.join(", "));
        }
        if !diff.new_conflicts.is_clean() {
            println!("conflicts the staged version would introduce:");
            print!("{}", diff.new_conflicts);
        }
        Ok(())
    }

    fn apply(&self, name: &str) -> Result<()> {
        let record = self.require_record(name)?;
        let _lock = self.state.lock(name)?;
        if !self.state.has_staged(name) {
            return Err(LegerError::StateInconsistent(format!(
                "no staged update for '{name}'; run `leger stage {name}` first"
            )));
        }

        let diff = self.state.diff(name)?;
        let staged_meta = self.state.staging_metadata(name)?;

        let volume_names: Vec<String> = record.volumes.iter().map(|v| v.name.clone()).collect();
        let backups = self.backups();
        let safety_id = backups.create(name, &volume_names, BackupKind::Automatic, "before-apply")?;

        let outcome = self.apply_body(name, &diff.affected_services);
        if let Err(err) = outcome {
            warn!(deployment = %name, error = %err, "apply failed, restoring pre-apply snapshot");
            return match backups.restore(&safety_id, &self.sm) {
                Ok(_) => Err(err.compose(format!(
                    "active version was restored from backup '{safety_id}'"
                ))),
                Err(restore_err) => Err(err.compose(format!(
                    "restore from backup '{safety_id}' also failed: {restore_err}; \
                     run `leger restore {safety_id}` once the cause is fixed"
                ))),
            };
        }

        // refresh the record against the new active tree
        let units = quadlet::parse_directory(&self.state.active_dir(name))?;
        let manifest = Manifest::resolve(&self.state.active_dir(name), name, &units)?;
        let mut applied_source = record.source.clone();
        if staged_meta.staged_version.is_some() {
            applied_source.version = staged_meta.staged_version.clone();
        }
        let updated = self.build_record(name, applied_source, &units, &manifest, Some(record));
        self.state.save(updated)?;

        let removed = backups.prune(name, self.config.keep_automatic, Some(BackupKind::Automatic))?;
        if !removed.is_empty() {
            info!(deployment = %name, pruned = removed.len(), "pruned old automatic backups");
        }

        println!("Applied staged update to '{name}'.");
        Ok(())
    }

    fn apply_body(&self, name: &str, affected: &[String]) -> Result<()> {
        for service in affected.iter().rev() {
            self.sm.stop(&format!("{service}.service"))?;
        }

        self.state.promote(name)?;

        let active = self.state.active_dir(name);
        self.engine.quadlet_install(&active)?;

        let units = quadlet::parse_directory(&active)?;
        for service in start_order(&units) {
            self.sm.start(&format!("{service}.service"))?;
        }
        Ok(())
    }

    fn discard(&self, name: &str) -> Result<()> {
        self.require_record(name)?;
        let _lock = self.state.lock(name)?;
        if !self.state.has_staged(name) {
            println!("Nothing staged for '{name}'.");
            return Ok(());
        }
        self.state.discard(name)?;
        println!("Discarded staged update for '{name}'.");
        Ok(())
    }

    async fn update(&self, name: &str, source_override: Option<String>) -> Result<()> {
        self.stage(name, source_override).await?;
        self.diff(name)?;

        if !self.config.assume_yes && !confirm("apply this update")? {
            println!("Update left staged; apply later or discard.");
            return Err(LegerError::Cancelled("update not applied".into()));
        }
        self.apply(name)
    }

    // ---- remove ----

    fn remove(&self, name: &str, force: bool, backup: bool, volumes: VolumePolicy) -> Result<()> {
        let record = self.require_record(name)?;

        if !force && !self.config.assume_yes && !confirm(&format!("remove deployment '{name}'"))? {
            return Err(LegerError::Cancelled(format!("'{name}' not removed")));
        }

        let _lock = self.state.lock(name)?;

        let volume_names: Vec<String> = record.volumes.iter().map(|v| v.name.clone()).collect();
        if backup || volumes == VolumePolicy::BackupThenRemove {
            let captured = if volumes == VolumePolicy::BackupThenRemove {
                volume_names.as_slice()
            } else {
                &[]
            };
            let id = self
                .backups()
                .create(name, captured, BackupKind::Automatic, "before-remove")?;
            println!("Created backup '{id}'.");
        }

        let active = self.state.active_dir(name);
        if active.is_dir() {
            let units = quadlet::parse_directory(&active)?;
            for service in start_order(&units).iter().rev() {
                if let Err(err) = self.sm.stop(&format!("{service}.service")) {
                    warn!(service = %service, error = %err, "stop during remove failed");
                }
            }
            for unit in &units.units {
                self.engine.quadlet_rm(&unit.file_name())?;
            }
        }

        match volumes {
            VolumePolicy::Keep => {}
            VolumePolicy::Remove | VolumePolicy::BackupThenRemove => {
                for volume in &volume_names {
                    self.engine.volume_rm(volume)?;
                }
            }
        }

        self.state.discard(name)?;
        if active.exists() {
            fs::remove_dir_all(&active)?;
        }
        self.state.delete(name)?;

        println!("Removed deployment '{name}'.");
        Ok(())
    }

    // ---- backups ----

    fn backup(&self, command: BackupCommand) -> Result<()> {
        match command {
            BackupCommand::Create { name, reason } => {
                let record = self.require_record(&name)?;
                let _lock = self.state.lock(&name)?;
                let volume_names: Vec<String> =
                    record.volumes.iter().map(|v| v.name.clone()).collect();
                let backups = self.backups();
                let id = backups.create(&name, &volume_names, BackupKind::Manual, &reason)?;
                backups.prune(&name, self.config.keep_manual, Some(BackupKind::Manual))?;
                println!("Created backup '{id}'.");
                Ok(())
            }
            BackupCommand::List { name, output } => {
                let backups = self.backups().list(name.as_deref())?;
                match output {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&backups)?)
                    }
                    OutputFormat::Yaml => println!(
                        "{}",
                        serde_yaml::to_string(&backups)
                            .map_err(|err| LegerError::Other(err.to_string()))?
                    ),
                    OutputFormat::Text => {
                        for backup in backups {
                            println!(
                                "{}  {}  {:?}  {}  {} bytes",
                                backup.id,
                                backup.created_at.to_rfc3339(),
                                backup.kind,
                                backup.reason,
                                backup.size
                            );
                        }
                    }
                }
                Ok(())
            }
            BackupCommand::Info { backup_id } => self.backup_info(&backup_id),
            BackupCommand::Prune { name, keep } => {
                self.require_record(&name)?;
                let _lock = self.state.lock(&name)?;
                let removed = self.backups().prune(&name, keep, None)?;
                println!("Pruned {} backup(s).", removed.len());
                Ok(())
            }
        }
    }

    fn backup_info(&self, id: &str) -> Result<()> {
        let backups = self.backups();
        let metadata = backups.get(id)?;
        println!("id:         {}", metadata.id);
        println!("deployment: {}", metadata.deployment_name);
        println!("created:    {}", metadata.created_at.to_rfc3339());
        println!("kind:       {:?}", metadata.kind);
        println!("reason:     {}", metadata.reason);
        println!("size:       {} bytes", metadata.size);
        println!("unit files: {}", metadata.quadlet_files.join(", "));
        for volume in &metadata.volumes {
            let archive = backups.backup_dir(id).join(&volume.archive_path);
            let entries = count_archive_entries(&archive).map_err(|err| {
                LegerError::BackupCorrupt {
                    id: id.to_string(),
                    reason: format!("archive {}: {err}", volume.archive_path),
                }
            })?;
            println!(
                "volume:     {} ({} bytes compressed, {} entries)",
                volume.name, volume.size, entries
            );
        }
        Ok(())
    }

    fn restore(&self, backup_id: &str) -> Result<()> {
        let backups = self.backups();
        let metadata = backups.get(backup_id)?;
        let _lock = self.state.lock(&metadata.deployment_name)?;

        let safety_id = backups.restore(backup_id, &self.sm)?;
        info!(backup = %backup_id, safety = %safety_id, "restore complete");

        if let Some(mut record) = self.state.load(&metadata.deployment_name)? {
            record.updated_at = Utc::now();
            self.state.save(record)?;
        }
        backups.prune(
            &metadata.deployment_name,
            self.config.keep_automatic,
            Some(BackupKind::Automatic),
        )?;

        println!(
            "Restored '{}' from backup '{}'.",
            metadata.deployment_name, backup_id
        );
        Ok(())
    }

    // ---- validation commands ----

    fn validate_dir(&self, dir: &Path) -> Result<()> {
        let units = quadlet::parse_directory(dir)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let report = validate(&units, &self.state.host_state()?, &name);
        if report.is_clean() {
            println!("{} unit file(s) validated, no findings.", units.units.len());
            Ok(())
        } else {
            Err(LegerError::ValidationFailed(report))
        }
    }

    fn check_conflicts(&self, dir: &Path) -> Result<()> {
        let units = quadlet::parse_directory(dir)?;
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut report = validate(&units, &self.state.host_state()?, &name);
        // conflicts only; structural findings belong to `validate`
        report.syntax.clear();
        report.dependency.dangling.clear();
        if report.is_clean() {
            println!("No conflicts with installed deployments.");
            Ok(())
        } else {
            Err(LegerError::ValidationFailed(report))
        }
    }

    // ---- secrets ----

    async fn rotate_secret(
        &self,
        secret: &str,
        value_file: Option<&Path>,
        no_restart: bool,
        restart_mounts: bool,
    ) -> Result<()> {
        let client = self.daemon_client()?;
        client.health().await?;

        let user = self.config.user_uuid.ok_or_else(|| {
            LegerError::UserInput(
                "no user identity configured; set hosted.user_uuid in leger.toml".into(),
            )
        })?;
        let qualified = qualified_name(&user, secret);

        let value = match value_file {
            Some(path) => fs::read(path)?,
            None => {
                let mut buf = Vec::new();
                io::stdin().read_to_end(&mut buf)?;
                buf
            }
        };
        if value.is_empty() {
            return Err(LegerError::UserInput(
                "refusing to rotate to an empty secret value".into(),
            ));
        }

        let version = client.put(&qualified, &value).await?;
        println!("Rotated '{secret}' to version {version}.");

        // the engine copy must match the daemon before dependents restart
        self.engine.secret_create(&qualified, &value)?;

        if no_restart {
            return Ok(());
        }

        let mut index = SecretIndex::default();
        for record in self.state.load_all()? {
            let active = self.state.active_dir(&record.name);
            if active.is_dir() {
                index.add_deployment(&quadlet::parse_directory(&active)?);
            }
        }

        let outcome = restart_services_using(&self.sm, &index, secret, restart_mounts);
        for service in &outcome.restarted {
            println!("restarted {service}");
        }
        if !outcome.failed.is_empty() {
            let failures: Vec<String> = outcome
                .failed
                .iter()
                .map(|(service, err)| format!("{service}: {err}"))
                .collect();
            return Err(LegerError::Other(format!(
                "secret rotated, but {} service restart(s) failed: {}",
                outcome.failed.len(),
                failures.join("; ")
            )));
        }
        Ok(())
    }

    // ---- service passthrough ----

    fn service(&self, command: ServiceCommand) -> Result<()> {
        match command {
            ServiceCommand::Start { unit } => self.sm.start(&unit_name(&unit)),
            ServiceCommand::Stop { unit } => self.sm.stop(&unit_name(&unit)),
            ServiceCommand::Restart { unit } => self.sm.restart(&unit_name(&unit)),
            ServiceCommand::Status { unit } => {
                let status = self.sm.status(&unit_name(&unit))?;
                println!(
                    "{}: {} ({}){}",
                    status.unit,
                    status.active_state,
                    status.sub_state,
                    status
                        .main_pid
                        .map(|pid| format!(", pid {pid}"))
                        .unwrap_or_default()
                );
                Ok(())
            }
            ServiceCommand::Logs {
                unit,
                follow,
                lines,
            } => {
                self.sm.logs(&unit_name(&unit), follow, lines)?;
                Ok(())
            }
        }
    }

    // ---- listing ----

    fn list(&self, output: OutputFormat) -> Result<()> {
        let records = self.state.load_all()?;
        match output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
            OutputFormat::Yaml => println!(
                "{}",
                serde_yaml::to_string(&records)
                    .map_err(|err| LegerError::Other(err.to_string()))?
            ),
            OutputFormat::Text => {
                if records.is_empty() {
                    println!("No deployments installed.");
                    return Ok(());
                }
                for record in records {
                    let staged = if self.state.has_staged(&record.name) {
                        " [staged update]"
                    } else {
                        ""
                    };
                    println!(
                        "{}  {}  {}:{}  {}  {} service(s)  updated {}{}",
                        record.name,
                        record.scope.as_str(),
                        record.source.kind.as_str(),
                        record.source.location,
                        record.source.version.as_deref().unwrap_or("-"),
                        record.services.len(),
                        record.updated_at.to_rfc3339(),
                        staged
                    );
                }
            }
        }
        Ok(())
    }

    fn require_record(&self, name: &str) -> Result<DeploymentRecord> {
        let record = self.state.load(name)?.ok_or_else(|| {
            LegerError::UserInput(format!("no deployment named '{name}' is installed"))
        })?;
        if !self.state.active_exists(name) {
            return Err(LegerError::StateInconsistent(format!(
                "deployment '{name}' is recorded but active/{name} is missing; \
                 restore it with `leger backup list {name}` and `leger restore <id>`"
            )));
        }
        Ok(record)
    }
}

fn unit_name(unit: &str) -> String {
    if unit.ends_with(".service") {
        unit.to_string()
    } else {
        format!("{unit}.service")
    }
}

fn derive_name(source: &Source) -> Result<String> {
    let trimmed = source.location.trim_end_matches('/');
    let last = trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .trim_end_matches(".git");
    if last.is_empty() {
        return Err(LegerError::UserInput(format!(
            "cannot derive a deployment name from '{}'; pass --name",
            source.location
        )));
    }
    Ok(last.to_string())
}

fn confirm(action: &str) -> Result<bool> {
    print!("Confirm {}? [y/N]: ", action);
    io::stdout().flush()?;
    let mut buf = String::new();
    io::stdin().read_line(&mut buf)?;
    let response = buf.trim().to_ascii_lowercase();
    Ok(response == "y" || response == "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_names_from_sources() {
        let git = Source::new(
            "https://github.com/acme/web.git",
            None,
            None,
            "https://quadlet.leger.run",
        );
        assert_eq!(derive_name(&git).unwrap(), "web");

        let local = Source::new("/srv/units/blog/", None, None, "https://quadlet.leger.run");
        assert_eq!(derive_name(&local).unwrap(), "blog");
    }

    #[test]
    fn unit_names_get_service_suffix() {
        assert_eq!(unit_name("web"), "web.service");
        assert_eq!(unit_name("web.service"), "web.service");
    }
}
