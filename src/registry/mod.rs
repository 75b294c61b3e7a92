use crate::error::ValidationError;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

pub const V2_REGISTRY_PATH: &str = "infra/telemetry-registry.v2.json";
pub const V1_REGISTRY_PATH: &str = "telemetry-registry.json";

/// Telemetry routing registry. One statically defined variant per schema
/// version, validated in one explicit pass before any field is read;
/// unknown or invalid shapes fail that pass.
#[derive(Debug, Clone, PartialEq)]
pub enum Registry {
    V2(RegistryV2),
    V1(RegistryV1),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryV2 {
    pub orgs: BTreeMap<String, OrgV2>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrgV2 {
    pub telemetry_repo: String,
    #[serde(default)]
    pub repos: BTreeMap<String, RepoEntryV2>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepoEntryV2 {
    pub state: RepoState,
    #[serde(default)]
    pub context: RepoContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoState {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoContext {
    Sandbox,
    Production,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryV1 {
    pub organizations: Vec<OrgV1>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OrgV1 {
    pub owner: String,
    pub telemetry_repo: String,
    #[serde(default)]
    pub repositories: Vec<RepoEntryV1>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RepoEntryV1 {
    pub name: String,
    pub enabled: bool,
}

/// Parse and validate registry bytes in a single pass. Every shape issue
/// is reported at once.
pub fn parse_registry(bytes: &[u8]) -> Result<Registry, ValidationError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| ValidationError::single(format!("registry is not valid JSON: {e}")))?;

    if value.get("orgs").is_some() {
        let registry: RegistryV2 = serde_json::from_value(value)
            .map_err(|e| ValidationError::single(format!("invalid v2 registry: {e}")))?;
        let mut issues = Vec::new();
        for (owner, org) in &registry.orgs {
            if org.telemetry_repo.trim().is_empty() {
                issues.push(format!("org {owner}: telemetry_repo missing"));
            }
        }
        if !issues.is_empty() {
            return Err(ValidationError::new(issues));
        }
        return Ok(Registry::V2(registry));
    }

    if value.get("organizations").is_some() {
        let registry: RegistryV1 = serde_json::from_value(value)
            .map_err(|e| ValidationError::single(format!("invalid v1 registry: {e}")))?;
        let mut issues = Vec::new();
        for org in &registry.organizations {
            if org.owner.trim().is_empty() {
                issues.push("v1 organization with empty owner".to_string());
            }
            if org.telemetry_repo.trim().is_empty() {
                issues.push(format!("org {}: telemetry_repo missing", org.owner));
            }
        }
        if !issues.is_empty() {
            return Err(ValidationError::new(issues));
        }
        return Ok(Registry::V1(registry));
    }

    Err(ValidationError::single(
        "unrecognized registry shape: expected `orgs` (v2) or `organizations` (v1)",
    ))
}

/// Where registry documents come from. `reference` is the published
/// revision the document is read at (a branch name for remote sources).
pub trait RegistrySource {
    /// Stable identifier, part of the cache key.
    fn id(&self) -> String;
    /// Raw bytes at `path` on `reference`; `None` when the document is
    /// absent (absence is a routing outcome, not an error).
    fn fetch(&self, reference: &str, path: &str) -> Result<Option<Vec<u8>>>;
}

/// Registry checkout on the local filesystem. A single checkout carries
/// one revision, so `reference` only participates in cache keying.
pub struct FileRegistrySource {
    root: PathBuf,
}

impl FileRegistrySource {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl RegistrySource for FileRegistrySource {
    fn id(&self) -> String {
        format!("file:{}", self.root.display())
    }

    fn fetch(&self, _reference: &str, path: &str) -> Result<Option<Vec<u8>>> {
        let target = self.root.join(path);
        if !target.exists() {
            return Ok(None);
        }
        std::fs::read(&target)
            .map(Some)
            .with_context(|| format!("read registry {}", target.display()))
    }
}

#[derive(Debug, Clone)]
pub struct CachedRegistry {
    pub registry: Registry,
    /// SHA-256 of the raw document bytes, reported in resolutions.
    pub sha: String,
}

/// Explicit cache of fetched registries, keyed by `(source, reference,
/// path)`. Passed through by callers; no module-level state.
#[derive(Default)]
pub struct RegistryCache {
    entries: HashMap<(String, String, String), Option<CachedRegistry>>,
}

impl RegistryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_fetch(
        &mut self,
        source: &dyn RegistrySource,
        reference: &str,
        path: &str,
    ) -> Result<Option<&CachedRegistry>> {
        let key = (source.id(), reference.to_string(), path.to_string());
        if !self.entries.contains_key(&key) {
            let cached = match source.fetch(reference, path)? {
                None => None,
                Some(bytes) => {
                    let registry = parse_registry(&bytes)
                        .with_context(|| format!("parse registry {path}"))?;
                    Some(CachedRegistry {
                        registry,
                        sha: hex_sha256(&bytes),
                    })
                }
            };
            self.entries.insert(key.clone(), cached);
        }
        Ok(self.entries.get(&key).and_then(|c| c.as_ref()))
    }

    pub fn invalidate(&mut self, source: &dyn RegistrySource, reference: &str, path: &str) {
        self.entries
            .remove(&(source.id(), reference.to_string(), path.to_string()));
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn hex_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionOutcome {
    Ok,
    RepoUnregistered,
    Unresolvable,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolution {
    pub org_owner: String,
    pub target_repo: String,
    pub telemetry_repo: Option<String>,
    pub outcome: ResolutionOutcome,
    pub repo_state: Option<RepoState>,
    pub repo_context: RepoContext,
    pub version_used: &'static str,
    pub registry_sha: String,
    pub warnings: Vec<String>,
    pub reasons: Vec<String>,
}

/// Resolve the telemetry repository records for `target` are routed to.
/// v2 is preferred, v1 is a legacy fallback; routing is not an execution
/// gate, so a repo missing from a v2 org still routes at the org level
/// with a warning.
pub fn resolve(
    cache: &mut RegistryCache,
    source: &dyn RegistrySource,
    reference: &str,
    target: &str,
) -> Result<Resolution> {
    let Some((owner, repo_name)) = target.split_once('/') else {
        bail!("invalid target repository (expected owner/repo): {target}");
    };
    if owner.is_empty() || repo_name.is_empty() {
        bail!("invalid target repository (expected owner/repo): {target}");
    }

    let mut warnings = Vec::new();

    let v2_sha = {
        let v2 = cache.get_or_fetch(source, reference, V2_REGISTRY_PATH)?;
        if let Some(cached) = v2
            && let Registry::V2(registry) = &cached.registry
            && let Some(org) = registry.orgs.get(owner)
        {
            if let Some(entry) = org.repos.get(repo_name) {
                return Ok(Resolution {
                    org_owner: owner.to_string(),
                    target_repo: repo_name.to_string(),
                    telemetry_repo: Some(org.telemetry_repo.clone()),
                    outcome: ResolutionOutcome::Ok,
                    repo_state: Some(entry.state),
                    repo_context: entry.context,
                    version_used: "v2",
                    registry_sha: cached.sha.clone(),
                    warnings,
                    reasons: Vec::new(),
                });
            }
            warnings.push(
                "repo not explicitly registered in registry v2; using org-level telemetry routing"
                    .to_string(),
            );
            return Ok(Resolution {
                org_owner: owner.to_string(),
                target_repo: repo_name.to_string(),
                telemetry_repo: Some(org.telemetry_repo.clone()),
                outcome: ResolutionOutcome::RepoUnregistered,
                repo_state: None,
                repo_context: RepoContext::Unknown,
                version_used: "v2",
                registry_sha: cached.sha.clone(),
                warnings,
                reasons: Vec::new(),
            });
        }
        v2.map(|c| c.sha.clone())
    };

    let v1_sha = {
        let v1 = cache.get_or_fetch(source, reference, V1_REGISTRY_PATH)?;
        if let Some(cached) = v1
            && let Registry::V1(registry) = &cached.registry
            && let Some(org) = registry.organizations.iter().find(|o| o.owner == owner)
            && org
                .repositories
                .iter()
                .any(|r| r.name == repo_name && r.enabled)
        {
            warnings.push("resolved via legacy v1 registry; migrate to v2".to_string());
            return Ok(Resolution {
                org_owner: owner.to_string(),
                target_repo: repo_name.to_string(),
                telemetry_repo: Some(org.telemetry_repo.clone()),
                outcome: ResolutionOutcome::Ok,
                repo_state: Some(RepoState::Enabled),
                repo_context: RepoContext::Unknown,
                version_used: "v1-fallback",
                registry_sha: cached.sha.clone(),
                warnings,
                reasons: Vec::new(),
            });
        }
        v1.map(|c| c.sha.clone())
    };

    Ok(Resolution {
        org_owner: owner.to_string(),
        target_repo: repo_name.to_string(),
        telemetry_repo: None,
        outcome: ResolutionOutcome::Unresolvable,
        repo_state: None,
        repo_context: RepoContext::Unknown,
        version_used: "v2",
        registry_sha: v2_sha.or(v1_sha).unwrap_or_default(),
        warnings,
        reasons: vec!["repository not registered in registry v1 or v2".to_string()],
    })
}
