use std::collections::BTreeMap;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{LegerError, Result};
use crate::quadlet::{ParseResult, SecretKind, SecretRef};
use crate::systemd::ServiceManager;

/// Fully qualify a logical secret name for the daemon and the engine store.
pub fn qualified_name(user: &Uuid, logical: &str) -> String {
    format!("leger/{user}/{logical}")
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretInfo {
    pub name: String,
    pub active_version: u64,
    #[serde(default)]
    pub versions: Vec<u64>,
}

#[derive(Debug, Clone)]
pub struct SecretValue {
    pub name: String,
    pub value: Vec<u8>,
    pub version: u64,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    name: String,
    value: String,
    version: u64,
}

#[derive(Debug, Serialize)]
struct PutRequest<'a> {
    name: &'a str,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PutResponse {
    version: u64,
}

#[derive(Debug, Serialize)]
struct ActivateRequest<'a> {
    name: &'a str,
    version: u64,
}

/// HTTP client for the local secrets daemon. Values are byte strings;
/// base64 is the on-wire encoding only.
pub struct DaemonClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
    lookup_timeout: Duration,
}

impl DaemonClient {
    pub fn new(
        base: impl Into<String>,
        token: Option<String>,
        session_timeout: Duration,
        lookup_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(session_timeout)
            .build()
            .map_err(|err| LegerError::Other(format!("http client: {err}")))?;
        let base: String = base.into();
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
            token,
            lookup_timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> LegerError {
        LegerError::DaemonUnavailable {
            url: self.base.clone(),
            reason: err.to_string(),
        }
    }

    pub async fn health(&self) -> Result<()> {
        let response = self
            .authed(self.http.get(self.url("/api/health")))
            .timeout(self.lookup_timeout)
            .send()
            .await
            .map_err(|err| self.unavailable(err))?;
        let health: HealthResponse = response
            .error_for_status()
            .map_err(|err| self.unavailable(err))?
            .json()
            .await
            .map_err(|err| self.unavailable(err))?;
        if health.ok {
            Ok(())
        } else {
            Err(self.unavailable("daemon reported not ok"))
        }
    }

    pub async fn list(&self) -> Result<Vec<SecretInfo>> {
        let response = self
            .authed(self.http.get(self.url("/api/list")))
            .send()
            .await
            .map_err(|err| self.unavailable(err))?;
        response
            .error_for_status()
            .map_err(|err| self.unavailable(err))?
            .json()
            .await
            .map_err(|err| self.unavailable(err))
    }

    pub async fn get(&self, name: &str) -> Result<SecretValue> {
        let response = self
            .authed(self.http.get(self.url("/api/get")).query(&[("name", name)]))
            .timeout(self.lookup_timeout)
            .send()
            .await
            .map_err(|err| LegerError::SecretUnavailable {
                name: name.to_string(),
                reason: err.to_string(),
            })?;
        let body: GetResponse = response
            .error_for_status()
            .map_err(|err| LegerError::SecretUnavailable {
                name: name.to_string(),
                reason: err.to_string(),
            })?
            .json()
            .await
            .map_err(|err| LegerError::SecretUnavailable {
                name: name.to_string(),
                reason: format!("malformed response: {err}"),
            })?;
        let value = general_purpose::STANDARD.decode(&body.value).map_err(|err| {
            LegerError::SecretUnavailable {
                name: name.to_string(),
                reason: format!("value is not valid base64: {err}"),
            }
        })?;
        Ok(SecretValue {
            name: body.name,
            value,
            version: body.version,
        })
    }

    pub async fn info(&self, name: &str) -> Result<SecretInfo> {
        let response = self
            .authed(self.http.get(self.url("/api/info")).query(&[("name", name)]))
            .timeout(self.lookup_timeout)
            .send()
            .await
            .map_err(|err| self.unavailable(err))?;
        response
            .error_for_status()
            .map_err(|err| LegerError::SecretUnavailable {
                name: name.to_string(),
                reason: err.to_string(),
            })?
            .json()
            .await
            .map_err(|err| self.unavailable(err))
    }

    /// Store a new version; the daemon makes it active and returns the
    /// version number.
    pub async fn put(&self, name: &str, value: &[u8]) -> Result<u64> {
        let request = PutRequest {
            name,
            value: general_purpose::STANDARD.encode(value),
        };
        let response = self
            .authed(self.http.post(self.url("/api/put")))
            .json(&request)
            .send()
            .await
            .map_err(|err| self.unavailable(err))?;
        let body: PutResponse = response
            .error_for_status()
            .map_err(|err| self.unavailable(err))?
            .json()
            .await
            .map_err(|err| self.unavailable(err))?;
        Ok(body.version)
    }

    pub async fn activate(&self, name: &str, version: u64) -> Result<()> {
        let request = ActivateRequest { name, version };
        let response = self
            .authed(self.http.post(self.url("/api/activate")))
            .json(&request)
            .send()
            .await
            .map_err(|err| self.unavailable(err))?;
        let health: HealthResponse = response
            .error_for_status()
            .map_err(|err| self.unavailable(err))?
            .json()
            .await
            .map_err(|err| self.unavailable(err))?;
        if health.ok {
            Ok(())
        } else {
            Err(self.unavailable(format!("activate {name} v{version} refused")))
        }
    }
}

/// A secret that has been fetched from the daemon and installed into the
/// engine's secret store.
#[derive(Debug, Clone)]
pub struct PreparedSecret {
    pub logical: String,
    pub qualified: String,
    pub version: u64,
}

/// Makes every secret reference concretely available to the engine before
/// a service starts.
pub struct Provisioner<'a> {
    client: &'a DaemonClient,
    engine: &'a Engine,
}

impl<'a> Provisioner<'a> {
    pub fn new(client: &'a DaemonClient, engine: &'a Engine) -> Self {
        Self { client, engine }
    }

    /// Fetch each referenced secret from the daemon and write it into the
    /// engine store (delete-then-create, so interrupted runs retry safely).
    /// A secret is never exposed to the engine before its value has been
    /// retrieved. On failure, engine secrets created by this call are
    /// removed again before the error is returned.
    pub async fn prepare(&self, refs: &[SecretRef], user: &Uuid) -> Result<Vec<PreparedSecret>> {
        let mut prepared: Vec<PreparedSecret> = Vec::with_capacity(refs.len());

        for secret_ref in refs {
            let qualified = qualified_name(user, &secret_ref.name);
            if prepared.iter().any(|p| p.qualified == qualified) {
                continue;
            }
            let outcome = self.fetch_and_install(&secret_ref.name, &qualified).await;
            match outcome {
                Ok(version) => {
                    info!(
                        secret = %secret_ref.name,
                        version,
                        "installed secret into engine store"
                    );
                    prepared.push(PreparedSecret {
                        logical: secret_ref.name.clone(),
                        qualified,
                        version,
                    });
                }
                Err(err) => {
                    self.remove_prepared(&prepared);
                    return Err(err);
                }
            }
        }

        Ok(prepared)
    }

    async fn fetch_and_install(&self, logical: &str, qualified: &str) -> Result<u64> {
        let value = self
            .client
            .get(qualified)
            .await
            .map_err(|err| match err {
                err @ LegerError::SecretUnavailable { .. } => err,
                other => LegerError::SecretUnavailable {
                    name: logical.to_string(),
                    reason: other.to_string(),
                },
            })?;
        self.engine.secret_create(qualified, &value.value)?;
        Ok(value.version)
    }

    /// Best-effort removal of engine secrets created in this flow.
    pub fn remove_prepared(&self, prepared: &[PreparedSecret]) {
        for secret in prepared {
            if let Err(err) = self.engine.secret_rm(&secret.qualified) {
                warn!(secret = %secret.qualified, error = %err, "failed to clean up engine secret");
            }
        }
    }
}

/// Reverse index from logical secret name to the service units that use it.
/// Derived from parsed units on demand, never persisted, so it cannot drift.
#[derive(Debug, Clone, Default)]
pub struct SecretIndex {
    map: BTreeMap<String, Vec<(String, SecretKind)>>,
}

impl SecretIndex {
    pub fn add_deployment(&mut self, units: &ParseResult) {
        for unit in units.containers() {
            let service = unit.service_unit_name();
            for secret_ref in unit.secret_refs() {
                let entry = self.map.entry(secret_ref.name.clone()).or_default();
                if !entry.iter().any(|(s, k)| *s == service && *k == secret_ref.kind) {
                    entry.push((service.clone(), secret_ref.kind));
                }
            }
        }
    }

    /// Service units to restart when `secret` rotates. Mount-only references
    /// are excluded unless `include_mounts`: the file is re-read on next
    /// container start anyway.
    pub fn services_using(&self, secret: &str, include_mounts: bool) -> Vec<String> {
        let Some(entries) = self.map.get(secret) else {
            return Vec::new();
        };
        let mut services = Vec::new();
        for (service, kind) in entries {
            if (*kind == SecretKind::Env || include_mounts) && !services.contains(service) {
                services.push(service.clone());
            }
        }
        services
    }

    pub fn secrets(&self) -> impl Iterator<Item = &String> {
        self.map.keys()
    }
}

/// Result of a rotation-triggered restart sweep. Not all-or-nothing: the
/// rotation has already happened in the daemon, so every service gets its
/// restart attempt and failures are reported together.
#[derive(Debug, Clone, Default)]
pub struct RestartOutcome {
    pub restarted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub fn restart_services_using(
    sm: &ServiceManager,
    index: &SecretIndex,
    secret: &str,
    include_mounts: bool,
) -> RestartOutcome {
    let mut outcome = RestartOutcome::default();
    for service in index.services_using(secret, include_mounts) {
        match sm.restart(&service) {
            Ok(()) => outcome.restarted.push(service),
            Err(err) => {
                warn!(service = %service, error = %err, "restart after rotation failed");
                outcome.failed.push((service, err.to_string()));
            }
        }
    }
    outcome
}
