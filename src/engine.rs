use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::config::Scope;
use crate::error::{LegerError, Result};
use crate::exec::{CommandOutput, CommandRunner, args};

/// One installed unit as reported by `quadlet list --format json`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstalledUnit {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Type")]
    pub unit_type: String,
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "Ports", default)]
    pub ports: Vec<String>,
}

/// Container-engine subprocess contract: quadlet installation, the secret
/// store, and volume import/export. Quadlet commands carry the `--user`
/// flag in user scope; the secret and volume stores are scope-implicit.
#[derive(Clone)]
pub struct Engine {
    runner: Arc<dyn CommandRunner>,
    bin: String,
    scope: Scope,
}

impl Engine {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>, scope: Scope) -> Self {
        Self {
            runner,
            bin: bin.into(),
            scope,
        }
    }

    fn quadlet_args(&self, subcommand: &str) -> Vec<String> {
        let mut out = args(&["quadlet", subcommand]);
        if self.scope.is_user() {
            out.push("--user".to_string());
        }
        out
    }

    fn run(&self, argv: Vec<String>, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        debug!(engine = %self.bin, args = ?argv, "engine call");
        let output = self.runner.run(&self.bin, &argv, stdin)?;
        if output.success() {
            Ok(output)
        } else {
            Err(LegerError::EngineFailure {
                tool: self.bin.clone(),
                step: argv
                    .iter()
                    .take(2)
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(" "),
                status: output.status,
                stderr: output.stderr_tail(),
            })
        }
    }

    /// Install every unit file in `dir` and integrate with the service
    /// manager. Idempotent by file identity.
    pub fn quadlet_install(&self, dir: &Path) -> Result<()> {
        let mut argv = self.quadlet_args("install");
        argv.push(dir.display().to_string());
        self.run(argv, None).map(|_| ())
    }

    pub fn quadlet_list(&self) -> Result<Vec<InstalledUnit>> {
        let mut argv = self.quadlet_args("list");
        argv.push("--format".to_string());
        argv.push("json".to_string());
        let output = self.run(argv, None)?;
        serde_json::from_slice(&output.stdout).map_err(|err| LegerError::EngineFailure {
            tool: self.bin.clone(),
            step: "quadlet list".into(),
            status: Some(0),
            stderr: format!("unparseable JSON output: {err}"),
        })
    }

    pub fn quadlet_rm(&self, unit_name: &str) -> Result<()> {
        let mut argv = self.quadlet_args("rm");
        argv.push(unit_name.to_string());
        self.run(argv, None).map(|_| ())
    }

    /// Create a secret from a value piped to stdin. Any pre-existing secret
    /// of the same name is removed first so retries are safe.
    pub fn secret_create(&self, name: &str, value: &[u8]) -> Result<()> {
        if self.secret_exists(name)? {
            self.secret_rm(name)?;
        }
        self.run(args(&["secret", "create", name, "-"]), Some(value))
            .map(|_| ())
    }

    pub fn secret_rm(&self, name: &str) -> Result<()> {
        self.run(args(&["secret", "rm", name]), None).map(|_| ())
    }

    pub fn secret_exists(&self, name: &str) -> Result<bool> {
        let argv = args(&["secret", "inspect", name]);
        let output = self.runner.run(&self.bin, &argv, None)?;
        Ok(output.success())
    }

    /// Stream a volume's contents out as a tar archive.
    pub fn volume_export(&self, name: &str) -> Result<Vec<u8>> {
        self.run(args(&["volume", "export", name]), None)
            .map(|output| output.stdout)
    }

    /// Fill a volume from a tar archive piped to stdin.
    pub fn volume_import(&self, name: &str, data: &[u8]) -> Result<()> {
        self.run(args(&["volume", "import", name]), Some(data))
            .map(|_| ())
    }

    pub fn volume_create(&self, name: &str) -> Result<()> {
        self.run(args(&["volume", "create", name]), None).map(|_| ())
    }

    pub fn volume_rm(&self, name: &str) -> Result<()> {
        self.run(args(&["volume", "rm", name]), None).map(|_| ())
    }
}
