use crate::store::{CommitIdentity, Layout};
use crate::writer::{DEFAULT_BACKOFF_BASE_MS, DEFAULT_MAX_RETRIES};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};

const CONFIG_RELATIVE_PATH: &str = ".opslog/config.toml";
const DEFAULT_LOG_ROOT: &str = "telemetry/v1/repos";
const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone)]
pub struct Config {
    pub version: u32,
    pub log: LogConfig,
    pub writer: WriterConfig,
    pub validator: ValidatorConfig,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub root: PathBuf,
    pub layout: Layout,
    /// `owner/repo` of the shared telemetry repository; absent means the
    /// writer runs unconfigured (skip in best-effort, fail in strict).
    pub remote: Option<String>,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub strict: bool,
    pub identity: CommitIdentity,
}

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub fail_on_invalid: bool,
    pub parse_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            log: LogConfig {
                root: PathBuf::from(DEFAULT_LOG_ROOT),
                layout: Layout::Hierarchical,
                remote: None,
                branch: DEFAULT_BRANCH.to_string(),
            },
            writer: WriterConfig {
                max_retries: DEFAULT_MAX_RETRIES,
                backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
                strict: false,
                identity: CommitIdentity::default(),
            },
            validator: ValidatorConfig {
                fail_on_invalid: true,
                parse_json: true,
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    version: Option<u32>,
    log: Option<RawLogConfig>,
    writer: Option<RawWriterConfig>,
    validator: Option<RawValidatorConfig>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawLogConfig {
    root: Option<String>,
    layout: Option<String>,
    remote: Option<String>,
    branch: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawWriterConfig {
    max_retries: Option<u32>,
    backoff_base_ms: Option<u64>,
    strict: Option<bool>,
    identity: Option<RawIdentity>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawIdentity {
    name: Option<String>,
    email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawValidatorConfig {
    fail_on_invalid: Option<bool>,
    parse_json: Option<bool>,
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_RELATIVE_PATH)
}

/// Load `.opslog/config.toml` from `dir`; `None` when absent. A present
/// but invalid config is an error, never silently defaulted.
pub fn load_config(dir: &Path) -> Result<Option<Config>> {
    let path = config_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Load a config from an explicit path; the file must exist.
pub fn load_config_file(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let parsed: RawConfig =
        toml::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    validate_config(parsed, path)
}

fn validate_config(raw: RawConfig, path: &Path) -> Result<Config> {
    let version = raw
        .version
        .ok_or_else(|| anyhow::anyhow!("{} missing required `version`", path.display()))?;
    if version != 1 {
        bail!(
            "{} has unsupported version {version}; expected version = 1",
            path.display()
        );
    }

    let defaults = Config::default();

    let log = match raw.log {
        None => defaults.log,
        Some(log) => {
            let layout = match sanitize_optional(log.layout) {
                None => Layout::Hierarchical,
                Some(raw_layout) => Layout::parse(&raw_layout).ok_or_else(|| {
                    anyhow::anyhow!(
                        "{} has unsupported `layout = \"{raw_layout}\"`; expected `hierarchical` or `flat`",
                        path.display()
                    )
                })?,
            };
            LogConfig {
                root: sanitize_optional(log.root)
                    .map(PathBuf::from)
                    .unwrap_or(defaults.log.root),
                layout,
                remote: sanitize_optional(log.remote),
                branch: sanitize_optional(log.branch).unwrap_or(defaults.log.branch),
            }
        }
    };

    let writer = match raw.writer {
        None => defaults.writer,
        Some(writer) => {
            let max_retries = writer.max_retries.unwrap_or(DEFAULT_MAX_RETRIES);
            if max_retries == 0 {
                bail!(
                    "{} has `max_retries = 0`; at least one attempt is required",
                    path.display()
                );
            }
            let identity = match writer.identity {
                None => CommitIdentity::default(),
                Some(identity) => {
                    let default_identity = CommitIdentity::default();
                    CommitIdentity {
                        name: sanitize_optional(identity.name).unwrap_or(default_identity.name),
                        email: sanitize_optional(identity.email).unwrap_or(default_identity.email),
                    }
                }
            };
            WriterConfig {
                max_retries,
                backoff_base_ms: writer.backoff_base_ms.unwrap_or(DEFAULT_BACKOFF_BASE_MS),
                strict: writer.strict.unwrap_or(false),
                identity,
            }
        }
    };

    let validator = match raw.validator {
        None => defaults.validator,
        Some(validator) => ValidatorConfig {
            fail_on_invalid: validator.fail_on_invalid.unwrap_or(true),
            parse_json: validator.parse_json.unwrap_or(true),
        },
    };

    Ok(Config {
        version,
        log,
        writer,
        validator,
    })
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
