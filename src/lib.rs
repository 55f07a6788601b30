#![forbid(unsafe_code)]

pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub mod manifest;
pub mod orchestrator;
pub mod paths;
pub mod quadlet;
pub mod secrets;
pub mod source;
pub mod state;
pub mod systemd;
pub mod telemetry;
pub mod validate;

pub use config::{CliArgs, Command, LegerConfig, OutputFormat, Scope, VolumePolicy};
pub use error::{LegerError, Result};
pub use orchestrator::Orchestrator;
pub use quadlet::{SecretKind, SecretRef, UnitFile, UnitType};
pub use state::{DeploymentRecord, StateStore};
