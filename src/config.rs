use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LegerError, Result};

/// Whether units are managed for the invoking user or system-wide. Passed
/// through to the container engine and the service manager as `--user`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    User,
    System,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::User => "user",
            Scope::System => "system",
        }
    }

    pub fn is_user(&self) -> bool {
        matches!(self, Scope::User)
    }
}

/// Output format for listing commands.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

/// What to do with a deployment's volumes on `remove`.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumePolicy {
    /// Leave volumes in the engine untouched.
    #[default]
    Keep,
    /// Remove volumes from the engine.
    Remove,
    /// Export each volume into a backup, then remove it.
    BackupThenRemove,
}

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Manage system-wide units instead of per-user units.
    #[arg(long, global = true, default_value_t = false)]
    pub system: bool,

    /// Override the state directory (defaults per scope).
    #[arg(long, global = true, env = "LEGER_STATE_ROOT")]
    pub state_root: Option<PathBuf>,

    /// Base URL of the local secrets daemon.
    #[arg(long, global = true, env = "LEGER_DAEMON_URL")]
    pub daemon_url: Option<String>,

    /// Path to the bearer token file for the daemon and hosted sources.
    #[arg(long, global = true, env = "LEGER_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Path to leger.toml (defaults to the user config directory).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Skip interactive confirmations.
    #[arg(long, short = 'y', global = true, default_value_t = false)]
    pub yes: bool,
}

#[derive(Debug, Parser)]
#[command(
    name = "leger",
    version,
    about = "Deploy and manage quadlet-based container services.",
    long_about = "Installs quadlet unit files from git, hosted, or local sources, injects \
                  secrets from the local secrets daemon, and manages the deployment \
                  lifecycle: stage, diff, apply, rollback, backup, restore, rotate."
)]
pub struct CliArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install a deployment from a git URL, hosted reference, or local path.
    Install {
        /// Source location (git URL, hosted URL, or local directory).
        source: String,
        /// Deployment name (defaults to the last path segment of the source).
        #[arg(long)]
        name: Option<String>,
        /// Version tag to fetch (hosted sources; defaults to latest).
        #[arg(long)]
        version: Option<String>,
        /// Subdirectory within the source holding the unit files.
        #[arg(long)]
        subpath: Option<String>,
        /// Downgrade validation conflicts to warnings (cycles stay fatal).
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Install units without starting the services.
        #[arg(long, default_value_t = false)]
        no_start: bool,
    },
    /// List installed deployments.
    List {
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },
    /// Remove a deployment and its units.
    Remove {
        name: String,
        /// Skip the confirmation prompt.
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Create a backup before removal.
        #[arg(long, default_value_t = false)]
        backup: bool,
        /// What to do with the deployment's volumes.
        #[arg(long, value_enum, default_value = "keep")]
        volumes: VolumePolicy,
    },
    /// Stage, show, confirm, and apply a new version in one step.
    Update {
        name: String,
        /// Override the recorded source location.
        #[arg(long)]
        source: Option<String>,
    },
    /// Stage a new version without touching the active deployment.
    Stage {
        name: String,
        /// Source to stage from (defaults to the recorded source).
        #[arg(long)]
        source: Option<String>,
    },
    /// Show what applying the staged version would change.
    Diff { name: String },
    /// Promote the staged version to active.
    Apply { name: String },
    /// Drop the staged version.
    Discard { name: String },
    /// Backup management.
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    /// Restore a deployment from a backup.
    Restore { backup_id: String },
    /// Validate a directory of unit files without installing.
    Validate { dir: PathBuf },
    /// Report conflicts a directory of unit files would introduce.
    CheckConflicts { dir: PathBuf },
    /// Rotate a secret in the daemon and restart dependent services.
    RotateSecret {
        secret: String,
        /// Read the new value from a file instead of stdin.
        #[arg(long)]
        value_file: Option<PathBuf>,
        /// Rotate without restarting dependent services.
        #[arg(long, default_value_t = false)]
        no_restart: bool,
        /// Also restart services that only mount the secret as a file.
        #[arg(long, default_value_t = false)]
        restart_mounts: bool,
    },
    /// Control individual services of a deployment.
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum BackupCommand {
    /// Create a manual backup of a deployment.
    Create {
        name: String,
        /// Reason recorded in the backup metadata.
        #[arg(long, default_value = "manual backup")]
        reason: String,
    },
    /// List backups, optionally restricted to one deployment.
    List {
        name: Option<String>,
        #[arg(long, value_enum, default_value = "text")]
        output: OutputFormat,
    },
    /// Show metadata for one backup.
    Info { backup_id: String },
    /// Delete all but the most recent N backups of a deployment.
    Prune {
        name: String,
        #[arg(long)]
        keep: usize,
    },
}

#[derive(Subcommand, Debug)]
pub enum ServiceCommand {
    Start { unit: String },
    Stop { unit: String },
    Restart { unit: String },
    Status { unit: String },
    Logs {
        unit: String,
        /// Follow the log output.
        #[arg(long, short = 'f', default_value_t = false)]
        follow: bool,
        /// Number of recent lines to show.
        #[arg(long, short = 'n')]
        lines: Option<u32>,
    },
}

/// Optional leger.toml contents. Everything has a built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    pub state_root: Option<PathBuf>,
    pub daemon_url: Option<String>,
    pub token_file: Option<PathBuf>,
    pub log_level: Option<String>,
    #[serde(default)]
    pub hosted: HostedConfig,
    #[serde(default)]
    pub backups: BackupConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostedConfig {
    pub base_url: Option<String>,
    pub user_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupConfig {
    pub keep_automatic: Option<usize>,
    pub keep_manual: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ToolsConfig {
    pub engine: Option<String>,
    pub service_manager: Option<String>,
}

/// Complete process-wide configuration, read-only after startup.
#[derive(Debug, Clone)]
pub struct LegerConfig {
    pub scope: Scope,
    pub state_root: PathBuf,
    pub daemon_url: String,
    pub token_file: PathBuf,
    pub hosted_base: String,
    pub user_uuid: Option<Uuid>,
    pub engine_bin: String,
    pub sm_bin: String,
    pub keep_automatic: usize,
    pub keep_manual: usize,
    pub session_timeout: Duration,
    pub lookup_timeout: Duration,
    pub log_level: String,
    pub assume_yes: bool,
}

pub const DEFAULT_DAEMON_URL: &str = "http://127.0.0.1:8095";
pub const DEFAULT_HOSTED_BASE: &str = "https://quadlet.leger.run";
const DEFAULT_KEEP_AUTOMATIC: usize = 5;
const DEFAULT_KEEP_MANUAL: usize = 10;

impl LegerConfig {
    pub fn from_env_and_args(global: &GlobalArgs) -> Result<Self> {
        let file = load_file_config(global.config.as_deref())?;
        let scope = if global.system { Scope::System } else { Scope::User };

        let state_root = global
            .state_root
            .clone()
            .or_else(|| file.state_root.clone())
            .unwrap_or_else(|| default_state_root(scope));

        let daemon_url = global
            .daemon_url
            .clone()
            .or_else(|| file.daemon_url.clone())
            .unwrap_or_else(|| DEFAULT_DAEMON_URL.to_string());

        let token_file = global
            .token_file
            .clone()
            .or_else(|| file.token_file.clone())
            .unwrap_or_else(default_token_file);

        let hosted_base = env::var("LEGER_HOSTED_URL")
            .ok()
            .or_else(|| file.hosted.base_url.clone())
            .unwrap_or_else(|| DEFAULT_HOSTED_BASE.to_string());

        let user_uuid = match env::var("LEGER_USER_UUID") {
            Ok(raw) => Some(Uuid::parse_str(&raw).map_err(|err| {
                LegerError::UserInput(format!("invalid LEGER_USER_UUID '{raw}': {err}"))
            })?),
            Err(_) => file.hosted.user_uuid,
        };

        Ok(Self {
            scope,
            state_root,
            daemon_url,
            token_file,
            hosted_base,
            user_uuid,
            engine_bin: file.tools.engine.clone().unwrap_or_else(|| "podman".into()),
            sm_bin: file
                .tools
                .service_manager
                .clone()
                .unwrap_or_else(|| "systemctl".into()),
            keep_automatic: file.backups.keep_automatic.unwrap_or(DEFAULT_KEEP_AUTOMATIC),
            keep_manual: file.backups.keep_manual.unwrap_or(DEFAULT_KEEP_MANUAL),
            session_timeout: Duration::from_secs(30),
            lookup_timeout: Duration::from_secs(5),
            log_level: file.log_level.clone().unwrap_or_else(|| "info".into()),
            assume_yes: global.yes,
        })
    }

    /// Read the bearer token for the daemon and hosted sources. Acquisition
    /// is out of band; a missing file means the user never logged in.
    pub fn read_token(&self) -> Result<String> {
        match fs::read_to_string(&self.token_file) {
            Ok(raw) => {
                let token = raw.trim().to_string();
                if token.is_empty() {
                    Err(LegerError::Unauthenticated {
                        target: self.token_file.display().to_string(),
                    })
                } else {
                    Ok(token)
                }
            }
            Err(_) => Err(LegerError::Unauthenticated {
                target: self.token_file.display().to_string(),
            }),
        }
    }
}

fn load_file_config(explicit: Option<&std::path::Path>) -> Result<FileConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => {
            let Some(dir) = dirs::config_dir() else {
                return Ok(FileConfig::default());
            };
            dir.join("leger").join("leger.toml")
        }
    };

    if !path.exists() {
        if explicit.is_some() {
            return Err(LegerError::UserInput(format!(
                "config file {} does not exist",
                path.display()
            )));
        }
        return Ok(FileConfig::default());
    }

    let raw = fs::read_to_string(&path)?;
    toml::from_str(&raw).map_err(|err| {
        LegerError::UserInput(format!("invalid config file {}: {err}", path.display()))
    })
}

fn default_state_root(scope: Scope) -> PathBuf {
    match scope {
        Scope::User => dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("leger"),
        Scope::System => PathBuf::from("/var/lib/leger"),
    }
}

fn default_token_file() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("leger")
        .join("token")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_install_with_defaults() {
        let cli = CliArgs::parse_from(["leger", "install", "https://github.com/acme/web"]);
        match cli.command {
            Command::Install {
                source,
                name,
                force,
                no_start,
                ..
            } => {
                assert_eq!(source, "https://github.com/acme/web");
                assert!(name.is_none());
                assert!(!force);
                assert!(!no_start);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(!cli.global.system);
    }

    #[test]
    fn global_flags_reach_config() {
        let cli = CliArgs::parse_from([
            "leger",
            "--system",
            "--state-root",
            "/tmp/leger-test-state",
            "--yes",
            "list",
        ]);
        let config = LegerConfig::from_env_and_args(&cli.global).expect("config builds");
        assert_eq!(config.scope, Scope::System);
        assert_eq!(config.state_root, PathBuf::from("/tmp/leger-test-state"));
        assert!(config.assume_yes);
    }

    #[test]
    fn remove_volume_policy_defaults_to_keep() {
        let cli = CliArgs::parse_from(["leger", "remove", "web"]);
        match cli.command {
            Command::Remove { volumes, .. } => assert_eq!(volumes, VolumePolicy::Keep),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn backup_retention_defaults() {
        let cli = CliArgs::parse_from(["leger", "list"]);
        let config = LegerConfig::from_env_and_args(&cli.global).expect("config builds");
        assert_eq!(config.keep_automatic, DEFAULT_KEEP_AUTOMATIC);
        assert_eq!(config.keep_manual, DEFAULT_KEEP_MANUAL);
    }
}
