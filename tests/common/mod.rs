//! A fake engine/service-manager host for lifecycle tests: interprets the
//! same argv the real subprocesses would receive and keeps the resulting
//! secret store, volume store, and service states in memory.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use leger::config::{LegerConfig, Scope};
use leger::error::Result;
use leger::exec::{CommandOutput, CommandRunner};

#[derive(Debug, Default)]
pub struct HostState {
    pub secrets: BTreeMap<String, Vec<u8>>,
    pub volumes: BTreeMap<String, Vec<u8>>,
    pub installed_units: BTreeSet<String>,
    pub running: BTreeSet<String>,
    pub calls: Vec<Vec<String>>,
    pub fail_next_quadlet_install: bool,
    pub fail_start_of: Option<String>,
}

pub struct FakeHost {
    pub state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn with_volume(self, name: &str, tar: Vec<u8>) -> Self {
        self.state.lock().unwrap().volumes.insert(name.into(), tar);
        self
    }

    pub fn secret_names(&self) -> Vec<String> {
        self.state.lock().unwrap().secrets.keys().cloned().collect()
    }

    pub fn restarted_units(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|argv| argv.contains(&"restart".to_string()))
            .map(|argv| argv.last().cloned().unwrap_or_default())
            .collect()
    }

    fn ok() -> CommandOutput {
        CommandOutput {
            status: Some(0),
            stdout: Vec::new(),
            stderr: Vec::new(),
        }
    }

    fn fail(message: &str) -> CommandOutput {
        CommandOutput {
            status: Some(1),
            stdout: Vec::new(),
            stderr: message.as_bytes().to_vec(),
        }
    }

    fn engine(&self, args: &[String], stdin: Option<&[u8]>) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        match words.as_slice() {
            ["quadlet", "install", rest @ ..] => {
                if state.fail_next_quadlet_install {
                    state.fail_next_quadlet_install = false;
                    return Self::fail("simulated quadlet install failure");
                }
                let dir = rest.iter().rfind(|w| !w.starts_with("--")).unwrap();
                for entry in std::fs::read_dir(*dir).unwrap() {
                    let path = entry.unwrap().path();
                    if path.is_file() {
                        let file = path.file_name().unwrap().to_string_lossy().into_owned();
                        if !file.starts_with('.') {
                            state.installed_units.insert(file);
                        }
                    }
                }
                Self::ok()
            }
            ["quadlet", "list", ..] => {
                let entries: Vec<serde_json::Value> = state
                    .installed_units
                    .iter()
                    .map(|unit| {
                        let stem = unit.split('.').next().unwrap_or(unit);
                        serde_json::json!({
                            "Name": unit,
                            "Type": unit.rsplit('.').next().unwrap_or("container"),
                            "Path": format!("/run/quadlet/{unit}"),
                            "ServiceName": format!("{stem}.service"),
                            "Ports": [],
                        })
                    })
                    .collect();
                CommandOutput {
                    status: Some(0),
                    stdout: serde_json::to_vec(&entries).unwrap(),
                    stderr: Vec::new(),
                }
            }
            ["quadlet", "rm", rest @ ..] => {
                if let Some(unit) = rest.iter().rfind(|w| !w.starts_with("--")) {
                    state.installed_units.remove(*unit);
                }
                Self::ok()
            }
            ["secret", "inspect", name] => {
                if state.secrets.contains_key(*name) {
                    Self::ok()
                } else {
                    Self::fail("no such secret")
                }
            }
            ["secret", "create", name, "-"] => {
                state
                    .secrets
                    .insert((*name).to_string(), stdin.unwrap_or_default().to_vec());
                Self::ok()
            }
            ["secret", "rm", name] => {
                state.secrets.remove(*name);
                Self::ok()
            }
            ["volume", "export", name] => match state.volumes.get(*name) {
                Some(tar) => CommandOutput {
                    status: Some(0),
                    stdout: tar.clone(),
                    stderr: Vec::new(),
                },
                None => Self::fail("no such volume"),
            },
            ["volume", "import", name] => {
                state
                    .volumes
                    .insert((*name).to_string(), stdin.unwrap_or_default().to_vec());
                Self::ok()
            }
            ["volume", "create", name] => {
                state.volumes.entry((*name).to_string()).or_default();
                Self::ok()
            }
            ["volume", "rm", name] => {
                state.volumes.remove(*name);
                Self::ok()
            }
            _ => Self::fail("unknown engine command"),
        }
    }

    fn service_manager(&self, args: &[String]) -> CommandOutput {
        let mut state = self.state.lock().unwrap();
        let words: Vec<&str> = args
            .iter()
            .map(String::as_str)
            .filter(|w| *w != "--user")
            .collect();
        match words.as_slice() {
            ["start", unit] | ["restart", unit] => {
                if state.fail_start_of.as_deref() == Some(*unit) {
                    return Self::fail("simulated start failure");
                }
                state.running.insert((*unit).to_string());
                Self::ok()
            }
            ["stop", unit] => {
                state.running.remove(*unit);
                Self::ok()
            }
            ["status", unit] => {
                let body = if state.running.contains(*unit) {
                    format!("Active: active (running)\nMain PID: 100 ({unit})\n")
                } else {
                    "Active: inactive (dead)\n".to_string()
                };
                CommandOutput {
                    status: Some(0),
                    stdout: body.into_bytes(),
                    stderr: Vec::new(),
                }
            }
            ["logs", ..] => Self::ok(),
            _ => Self::fail("unknown service manager command"),
        }
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, binary: &str, args: &[String], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        self.state.lock().unwrap().calls.push(args.to_vec());
        Ok(match binary {
            "podman" => self.engine(args, stdin),
            "systemctl" => self.service_manager(args),
            other => FakeHost::fail(&format!("unexpected binary {other}")),
        })
    }
}

/// A config rooted in a temp state dir, pointing at a test daemon URL.
pub fn test_config(state_root: &Path, daemon_url: &str) -> LegerConfig {
    LegerConfig {
        scope: Scope::User,
        state_root: state_root.to_path_buf(),
        daemon_url: daemon_url.to_string(),
        token_file: state_root.join("token"),
        hosted_base: "https://quadlet.leger.run".to_string(),
        user_uuid: Some(
            uuid::Uuid::parse_str("9f1c6c42-6f3a-4f8e-9a2e-0d2c8f1b5a77").unwrap(),
        ),
        engine_bin: "podman".to_string(),
        sm_bin: "systemctl".to_string(),
        keep_automatic: 5,
        keep_manual: 10,
        session_timeout: Duration::from_secs(30),
        lookup_timeout: Duration::from_secs(5),
        log_level: "info".to_string(),
        assume_yes: true,
    }
}

/// Build a tar archive holding one file, as the engine's volume export
/// would stream it.
pub fn tar_with_file(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, contents)
        .expect("append tar entry");
    builder.into_inner().expect("finish tar")
}

pub fn write_unit(dir: &Path, file: &str, contents: &str) -> PathBuf {
    let path = dir.join(file);
    std::fs::write(&path, contents).expect("write unit file");
    path
}
