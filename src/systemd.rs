use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::Scope;
use crate::error::{LegerError, Result};
use crate::exec::CommandRunner;

/// Parsed `sm status <unit>` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceStatus {
    pub unit: String,
    pub active_state: String,
    pub sub_state: String,
    pub main_pid: Option<u32>,
}

impl ServiceStatus {
    pub fn is_running(&self) -> bool {
        self.active_state == "active"
    }
}

/// Service-manager subprocess contract: start/stop/restart/status/logs,
/// with the `--user` flag threaded in user scope.
#[derive(Clone)]
pub struct ServiceManager {
    runner: Arc<dyn CommandRunner>,
    bin: String,
    scope: Scope,
}

impl ServiceManager {
    pub fn new(runner: Arc<dyn CommandRunner>, bin: impl Into<String>, scope: Scope) -> Self {
        Self {
            runner,
            bin: bin.into(),
            scope,
        }
    }

    fn argv(&self, verb: &str, rest: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        if self.scope.is_user() {
            out.push("--user".to_string());
        }
        out.push(verb.to_string());
        out.extend(rest.iter().map(|part| part.to_string()));
        out
    }

    fn run_verb(&self, verb: &str, unit: &str) -> Result<()> {
        let argv = self.argv(verb, &[unit]);
        debug!(sm = %self.bin, args = ?argv, "service manager call");
        let output = self.runner.run(&self.bin, &argv, None)?;
        if output.success() {
            Ok(())
        } else {
            Err(LegerError::ServiceManagerFailure {
                step: verb.to_string(),
                unit: unit.to_string(),
                status: output.status,
                stderr: output.stderr_tail(),
            })
        }
    }

    pub fn start(&self, unit: &str) -> Result<()> {
        self.run_verb("start", unit)
    }

    pub fn stop(&self, unit: &str) -> Result<()> {
        self.run_verb("stop", unit)
    }

    pub fn restart(&self, unit: &str) -> Result<()> {
        self.run_verb("restart", unit)
    }

    /// `status` exits non-zero for inactive units; that is still a
    /// parseable answer, not a failure.
    pub fn status(&self, unit: &str) -> Result<ServiceStatus> {
        let argv = self.argv("status", &[unit]);
        let output = self.runner.run(&self.bin, &argv, None)?;
        Ok(parse_status(unit, &output.stdout_string()))
    }

    pub fn logs(&self, unit: &str, follow: bool, lines: Option<u32>) -> Result<i32> {
        let mut rest: Vec<String> = vec![unit.to_string()];
        if follow {
            rest.push("-f".to_string());
        }
        if let Some(n) = lines {
            rest.push("-n".to_string());
            rest.push(n.to_string());
        }
        let rest_refs: Vec<&str> = rest.iter().map(String::as_str).collect();
        let argv = self.argv("logs", &rest_refs);
        self.runner.run_streaming(&self.bin, &argv)
    }
}

/// Pull active state, sub-state, and main PID out of human-oriented status
/// output of the form `Active: active (running) ...` / `Main PID: 1234`.
fn parse_status(unit: &str, text: &str) -> ServiceStatus {
    let mut active_state = "unknown".to_string();
    let mut sub_state = "unknown".to_string();
    let mut main_pid = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("Active:") {
            let rest = rest.trim();
            let mut parts = rest.splitn(2, ' ');
            if let Some(state) = parts.next() {
                active_state = state.to_string();
            }
            if let Some(tail) = parts.next() {
                if let (Some(open), Some(close)) = (tail.find('('), tail.find(')')) {
                    if open < close {
                        sub_state = tail[open + 1..close].to_string();
                    }
                }
            }
        } else if let Some(rest) = line.strip_prefix("Main PID:") {
            main_pid = rest
                .trim()
                .split_whitespace()
                .next()
                .and_then(|pid| pid.parse().ok());
        }
    }

    ServiceStatus {
        unit: unit.to_string(),
        active_state,
        sub_state,
        main_pid,
    }
}
