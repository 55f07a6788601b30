use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::LegerConfig;
use crate::error::{LegerError, Result};
use crate::exec::{CommandRunner, args};
use crate::manifest::{MANIFEST_JSON, Manifest};
use crate::paths::normalize_under_root;

/// Where a deployment's unit files come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Hosted,
    Git,
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Hosted => "hosted",
            SourceKind::Git => "git",
            SourceKind::Local => "local",
        }
    }
}

/// A user-supplied source descriptor, recorded with the deployment so that
/// `update` can re-fetch without arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subpath: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Source {
    pub fn new(
        location: &str,
        subpath: Option<String>,
        version: Option<String>,
        hosted_base: &str,
    ) -> Source {
        Source {
            kind: detect_kind(location, hosted_base),
            location: location.to_string(),
            subpath,
            version,
        }
    }
}

const GIT_FORGES: [&str; 4] = ["github.com", "gitlab.com", "codeberg.org", "git.sr.ht"];

/// Classify a location: the hosted artifact host, well-known git forges and
/// any other http(s) URL, or a local path.
pub fn detect_kind(location: &str, hosted_base: &str) -> SourceKind {
    if location.starts_with(hosted_base) {
        return SourceKind::Hosted;
    }
    if let Some(host) = host_of(location) {
        if host == hosted_host(hosted_base) {
            return SourceKind::Hosted;
        }
        if GIT_FORGES.contains(&host.as_str()) {
            return SourceKind::Git;
        }
        return SourceKind::Git;
    }
    SourceKind::Local
}

fn host_of(location: &str) -> Option<String> {
    let rest = location
        .strip_prefix("https://")
        .or_else(|| location.strip_prefix("http://"))?;
    Some(rest.split('/').next().unwrap_or_default().to_string())
}

fn hosted_host(hosted_base: &str) -> String {
    host_of(hosted_base).unwrap_or_else(|| hosted_base.to_string())
}

/// Pull the user identity segment out of a hosted URL:
/// `<base>/<user-uuid>[/...]`.
pub fn extract_user_identity(hosted_url: &str, hosted_base: &str) -> Result<Uuid> {
    let malformed = |reason: &str| LegerError::MalformedSource {
        location: hosted_url.to_string(),
        reason: reason.to_string(),
    };

    let rest = hosted_url
        .strip_prefix(hosted_base)
        .ok_or_else(|| malformed("not a hosted artifact URL"))?
        .trim_start_matches('/');
    let segment = rest
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .ok_or_else(|| malformed("missing user identity segment"))?;
    Uuid::parse_str(segment)
        .map_err(|_| malformed("user identity segment is not a UUID"))
}

/// A resolved source: a local directory of unit files. The temp directory
/// (for fetched sources) lives as long as this value; the orchestrator
/// drops it after the flow.
#[derive(Debug)]
pub struct ResolvedSource {
    pub dir: PathBuf,
    pub version: Option<String>,
    _temp: Option<TempDir>,
}

pub struct SourceResolver<'a> {
    config: &'a LegerConfig,
    runner: Arc<dyn CommandRunner>,
    http: reqwest::Client,
}

impl<'a> SourceResolver<'a> {
    pub fn new(config: &'a LegerConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.session_timeout)
            .build()
            .map_err(|err| LegerError::Other(format!("http client: {err}")))?;
        Ok(Self {
            config,
            runner,
            http,
        })
    }

    /// Normalize a source into a local directory of unit files. Never
    /// mutates anything outside its own temp directory; no transport
    /// retries happen at this layer.
    pub async fn resolve(&self, source: &Source, name: &str) -> Result<ResolvedSource> {
        match source.kind {
            SourceKind::Local => self.resolve_local(source),
            SourceKind::Git => self.resolve_git(source, name),
            SourceKind::Hosted => self.resolve_hosted(source).await,
        }
    }

    fn resolve_local(&self, source: &Source) -> Result<ResolvedSource> {
        let path = Path::new(&source.location);
        let absolute = path
            .canonicalize()
            .map_err(|err| LegerError::UserInput(format!(
                "source path {} not accessible: {err}",
                path.display()
            )))?;
        if !absolute.is_dir() {
            return Err(LegerError::UserInput(format!(
                "source path {} is not a directory",
                absolute.display()
            )));
        }
        let dir = match &source.subpath {
            Some(sub) => {
                let joined = absolute.join(sub);
                if !joined.is_dir() {
                    return Err(LegerError::UserInput(format!(
                        "subpath {} does not exist under {}",
                        sub,
                        absolute.display()
                    )));
                }
                joined
            }
            None => absolute,
        };
        Ok(ResolvedSource {
            dir,
            version: source.version.clone(),
            _temp: None,
        })
    }

    fn resolve_git(&self, source: &Source, name: &str) -> Result<ResolvedSource> {
        let parsed = parse_git_url(&source.location)?;
        let temp = TempDir::with_prefix(format!("leger-{name}-"))
            .map_err(LegerError::Io)?;
        let checkout = temp.path().join("repo");

        let mut argv = args(&["clone", "--depth", "1"]);
        let branch = source.version.clone().or(parsed.branch);
        if let Some(branch) = &branch {
            argv.push("--branch".to_string());
            argv.push(branch.clone());
        }
        argv.push(parsed.clone_url.clone());
        argv.push(checkout.display().to_string());

        info!(url = %parsed.clone_url, "cloning source repository");
        let output = self.runner.run("git", &argv, None)?;
        if !output.success() {
            return Err(LegerError::SourceUnreachable(format!(
                "git clone of {} failed: {}",
                parsed.clone_url,
                output.stderr_tail()
            )));
        }

        let subpath = source.subpath.clone().or(parsed.subpath);
        let dir = match subpath {
            Some(sub) => {
                let joined = checkout.join(&sub);
                if !joined.is_dir() {
                    return Err(LegerError::MalformedSource {
                        location: source.location.clone(),
                        reason: format!("subpath '{sub}' not present in repository"),
                    });
                }
                joined
            }
            None => checkout,
        };

        Ok(ResolvedSource {
            dir,
            version: branch,
            _temp: Some(temp),
        })
    }

    async fn resolve_hosted(&self, source: &Source) -> Result<ResolvedSource> {
        let token = self.config.read_token()?;
        let base = self.config.hosted_base.trim_end_matches('/');
        let user = match extract_user_identity(&source.location, base) {
            Ok(uuid) => uuid,
            Err(err) => self.config.user_uuid.ok_or(err)?,
        };

        let version = match &source.version {
            Some(version) => version.clone(),
            None => self.latest_hosted_version(base, &user, &token).await?,
        };

        let manifest_url = format!("{base}/{user}/{version}/{MANIFEST_JSON}");
        debug!(url = %manifest_url, "fetching hosted manifest");
        let raw = self.fetch(&manifest_url, &token).await?;
        let manifest: Manifest = serde_json::from_slice(&raw)
            .map_err(|err| LegerError::SourceCorrupt(format!("{manifest_url}: {err}")))?;
        manifest.validate()?;

        let temp = TempDir::with_prefix("leger-hosted-").map_err(LegerError::Io)?;
        std::fs::write(temp.path().join(MANIFEST_JSON), &raw)?;

        for service in &manifest.services {
            for file in &service.files {
                let target = normalize_under_root(temp.path(), Path::new(file)).map_err(|err| {
                    LegerError::SourceCorrupt(format!(
                        "manifest lists unsafe file path '{file}': {err}"
                    ))
                })?;
                let file_url = format!("{base}/{user}/{version}/{file}");
                let contents = self.fetch(&file_url, &token).await?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, contents)?;
            }
        }

        let dir = temp.path().to_path_buf();
        Ok(ResolvedSource {
            dir,
            version: Some(version),
            _temp: Some(temp),
        })
    }

    /// Resolve `latest` from the per-user version listing, preferring
    /// semver ordering and falling back to lexicographic for loose tags.
    async fn latest_hosted_version(
        &self,
        base: &str,
        user: &Uuid,
        token: &str,
    ) -> Result<String> {
        let url = format!("{base}/{user}/versions.json");
        let raw = self.fetch(&url, token).await?;
        let versions: Vec<String> = serde_json::from_slice(&raw)
            .map_err(|err| LegerError::SourceCorrupt(format!("{url}: {err}")))?;
        versions
            .into_iter()
            .max_by(|a, b| {
                match (Version::parse(a), Version::parse(b)) {
                    (Ok(va), Ok(vb)) => va.cmp(&vb),
                    _ => a.cmp(b),
                }
            })
            .ok_or_else(|| LegerError::SourceCorrupt(format!("{url}: no versions published")))
    }

    async fn fetch(&self, url: &str, token: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| LegerError::SourceUnreachable(format!("{url}: {err}")))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LegerError::Unauthenticated {
                target: url.to_string(),
            });
        }
        let response = response
            .error_for_status()
            .map_err(|err| LegerError::SourceUnreachable(format!("{url}: {err}")))?;
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| LegerError::SourceUnreachable(format!("{url}: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GitUrl {
    clone_url: String,
    branch: Option<String>,
    subpath: Option<String>,
}

/// Split a forge URL of the form
/// `https://host/owner/repo[/tree/<branch>[/<subpath>]]` into its clone
/// URL, branch, and subtree. Plain clone URLs pass through unchanged.
fn parse_git_url(location: &str) -> Result<GitUrl> {
    let malformed = |reason: &str| LegerError::MalformedSource {
        location: location.to_string(),
        reason: reason.to_string(),
    };

    let rest = location
        .strip_prefix("https://")
        .or_else(|| location.strip_prefix("http://"))
        .ok_or_else(|| malformed("expected an http(s) URL"))?;

    let mut segments = rest.split('/');
    let host = segments.next().filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing host"))?;
    let owner = segments.next().filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing repository owner"))?;
    let repo = segments.next().filter(|s| !s.is_empty())
        .ok_or_else(|| malformed("missing repository name"))?;

    let scheme = if location.starts_with("http://") {
        "http"
    } else {
        "https"
    };
    let clone_url = format!("{scheme}://{host}/{owner}/{repo}");

    let tail: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    let (branch, subpath) = match tail.split_first() {
        Some((&"tree", rest)) => {
            let (branch, sub) = rest
                .split_first()
                .ok_or_else(|| malformed("'/tree/' without a branch"))?;
            let subpath = if sub.is_empty() {
                None
            } else {
                Some(sub.join("/"))
            };
            (Some((*branch).to_string()), subpath)
        }
        Some(_) => (None, Some(tail.join("/"))),
        None => (None, None),
    };

    Ok(GitUrl {
        clone_url,
        branch,
        subpath,
    })
}
