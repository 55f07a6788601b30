use std::io::Write;
use std::process::{Command, Stdio};

use crate::error::{LegerError, Result};

/// Captured result of one external command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Last few lines of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        let text = String::from_utf8_lossy(&self.stderr);
        let lines: Vec<&str> = text.trim().lines().collect();
        let start = lines.len().saturating_sub(10);
        lines[start..].join("\n")
    }
}

/// Runner responsible for executing external commands. The default spawns
/// real processes; tests substitute recording or fake runners.
pub trait CommandRunner: Send + Sync {
    fn run(&self, binary: &str, args: &[String], stdin: Option<&[u8]>) -> Result<CommandOutput>;

    /// Run with stdout/stderr attached to the terminal (log following).
    fn run_streaming(&self, binary: &str, args: &[String]) -> Result<i32> {
        let output = self.run(binary, args, None)?;
        print!("{}", output.stdout_string());
        Ok(output.status.unwrap_or(1))
    }
}

pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, binary: &str, args: &[String], stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let mut command = Command::new(binary);
        command.args(args);
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                LegerError::ToolMissing {
                    binary: binary.to_string(),
                }
            } else {
                LegerError::Io(err)
            }
        })?;

        if let Some(input) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle.write_all(input)?;
            }
        }

        let output = child.wait_with_output()?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn run_streaming(&self, binary: &str, args: &[String]) -> Result<i32> {
        let status = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .status()
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::NotFound {
                    LegerError::ToolMissing {
                        binary: binary.to_string(),
                    }
                } else {
                    LegerError::Io(err)
                }
            })?;
        Ok(status.code().unwrap_or(1))
    }
}

/// Check a configured binary exists on PATH before a flow depends on it.
pub fn require_binary(binary: &str) -> Result<()> {
    which::which(binary)
        .map(|_| ())
        .map_err(|_| LegerError::ToolMissing {
            binary: binary.to_string(),
        })
}

pub fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}
