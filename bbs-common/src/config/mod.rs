//! Configuration for the branch source daemon.
//!
//! Settings come from a TOML file (`bbs.toml`) with `BBS_*` environment
//! overrides applied on top. Loading validates the whole file and reports
//! every problem at once.

pub mod env;
pub mod source;

pub use env::{EnvError, EnvParser};
pub use source::{ConfigSource, Sourced};

use crate::discovery::DiscoveryTraits;
use crate::errors::ErrorCode;
use crate::source::BranchSource;
use crate::strategy::{CheckoutStrategy, ForkTrustPolicy, StrategyConfig};
use crate::types::{
    CLOUD_SERVER_URL, CredentialKind, HostVariant, Protocol, RepoRef, normalize_server_url,
    protocol_for_credential,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "bbs.toml";
pub const MAX_HOOK_DELAY_SECS: u32 = 300;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("invalid environment overrides: {}", format_env_errors(.0))]
    Env(Vec<EnvError>),
}

fn format_env_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConfigError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ConfigNotFound,
            Self::Read { .. } => ErrorCode::ConfigReadError,
            Self::Parse { .. } => ErrorCode::ConfigParseError,
            Self::Validation(_) => ErrorCode::ConfigValidationError,
            Self::Env(_) => ErrorCode::ConfigEnvError,
        }
    }
}

/// Default config location (`<config dir>/bbs/bbs.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "bbs", "bbs")
        .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}

// ── File model ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BbsConfig {
    pub general: GeneralConfig,
    pub endpoints: Vec<EndpointConfig>,
    pub defaults: DiscoveryConfig,
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Quiet period before a normalized update is dispatched.
    pub hook_delay_secs: u32,
    /// Native server pushes with an empty change list trigger a rescan.
    pub scan_on_empty_changes: bool,
    pub log_level: String,
    pub http_port: u16,
    /// Public base URL of this daemon, used when registering webhooks.
    pub root_url: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            hook_delay_secs: 5,
            scan_on_empty_changes: true,
            log_level: "info".to_string(),
            http_port: 8088,
            root_url: None,
        }
    }
}

/// A configured host endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub server_url: String,
    #[serde(default)]
    pub variant: HostVariant,
    #[serde(default)]
    pub signature_verification: bool,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub credential_kind: Option<CredentialKind>,
    #[serde(default)]
    pub manage_hooks: bool,
    #[serde(default)]
    pub mirror_id: Option<String>,
}

impl std::fmt::Debug for EndpointConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointConfig")
            .field("server_url", &self.server_url)
            .field("variant", &self.variant)
            .field("signature_verification", &self.signature_verification)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("credential_id", &self.credential_id)
            .field("credential_kind", &self.credential_kind)
            .field("manage_hooks", &self.manage_hooks)
            .field("mirror_id", &self.mirror_id)
            .finish()
    }
}

impl EndpointConfig {
    pub fn new(server_url: impl Into<String>, variant: HostVariant) -> Self {
        Self {
            server_url: server_url.into(),
            variant,
            signature_verification: false,
            secret: None,
            credential_id: None,
            credential_kind: None,
            manage_hooks: false,
            mirror_id: None,
        }
    }

    pub fn normalized_url(&self) -> Option<String> {
        normalize_server_url(&self.server_url)
    }

    pub fn protocol(&self) -> Protocol {
        protocol_for_credential(self.credential_kind)
    }

    /// Secret to verify signatures with, when verification is on.
    pub fn verification_secret(&self) -> Option<&str> {
        if self.signature_verification {
            self.secret.as_deref().filter(|s| !s.is_empty())
        } else {
            None
        }
    }
}

/// Discovery traits shared by all sources unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub branches: bool,
    pub tags: bool,
    pub origin_pull_requests: bool,
    pub fork_pull_requests: bool,
    pub skip_public_pull_requests: bool,
    pub origin_strategies: Vec<String>,
    pub fork_strategies: Vec<String>,
    pub fork_trust: ForkTrustPolicy,
    pub team_members: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            branches: true,
            tags: false,
            origin_pull_requests: true,
            fork_pull_requests: true,
            skip_public_pull_requests: false,
            origin_strategies: vec![CheckoutStrategy::Merge.name().to_string()],
            fork_strategies: vec![CheckoutStrategy::Head.name().to_string()],
            fork_trust: ForkTrustPolicy::default(),
            team_members: Vec::new(),
        }
    }
}

/// One repository to serve, with optional per-source overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_server_url")]
    pub server_url: String,
    pub owner: String,
    pub repository: String,
    #[serde(default)]
    pub branches: Option<bool>,
    #[serde(default)]
    pub tags: Option<bool>,
    #[serde(default)]
    pub origin_pull_requests: Option<bool>,
    #[serde(default)]
    pub fork_pull_requests: Option<bool>,
    #[serde(default)]
    pub skip_public_pull_requests: Option<bool>,
    #[serde(default)]
    pub origin_strategies: Option<Vec<String>>,
    #[serde(default)]
    pub fork_strategies: Option<Vec<String>>,
    #[serde(default)]
    pub fork_trust: Option<ForkTrustPolicy>,
    #[serde(default)]
    pub team_members: Option<Vec<String>>,
}

fn default_server_url() -> String {
    CLOUD_SERVER_URL.to_string()
}

impl SourceConfig {
    pub fn repo_ref(&self) -> RepoRef {
        RepoRef::new(&self.owner, &self.repository)
    }
}

fn parse_strategies(names: &[String]) -> Result<BTreeSet<CheckoutStrategy>, String> {
    names
        .iter()
        .map(|name| {
            name.parse::<CheckoutStrategy>()
                .map_err(|_| format!("unknown checkout strategy '{name}'"))
        })
        .collect()
}

// ── Loading ────────────────────────────────────────────────────────────────

impl BbsConfig {
    /// Read, parse and validate a config file. Environment overrides are
    /// applied separately with [`apply_env`](Self::apply_env).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&contents, path)?;
        config.validate()?;
        info!(
            path = %path.display(),
            endpoints = config.endpoints.len(),
            sources = config.sources.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Load from `path`, or from the default location when it exists, or
    /// fall back to built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                debug!("No config file; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn parse(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `BBS_*` overrides, failing if any variable is invalid.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        let mut parser = EnvParser::new();
        let delay = parser.get_u32_range(
            "HOOK_DELAY_SECS",
            self.general.hook_delay_secs,
            0,
            MAX_HOOK_DELAY_SECS,
        );
        let scan = parser.get_bool("SCAN_ON_EMPTY_CHANGES", self.general.scan_on_empty_changes);
        let level = parser.get_log_level("LOG_LEVEL", &self.general.log_level);
        let port = parser.get_port("HTTP_PORT", self.general.http_port);
        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }

        for (name, shown) in [
            ("hook_delay_secs", delay.to_string()),
            ("scan_on_empty_changes", scan.to_string()),
            ("log_level", level.to_string()),
            ("http_port", port.to_string()),
        ] {
            debug!(setting = name, value = %shown, "Effective setting");
        }
        self.general.hook_delay_secs = delay.value;
        self.general.scan_on_empty_changes = scan.value;
        self.general.log_level = level.value;
        self.general.http_port = port.value;
        Ok(())
    }

    /// Check the whole configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.general.hook_delay_secs > MAX_HOOK_DELAY_SECS {
            problems.push(format!(
                "general.hook_delay_secs must be within 0..={MAX_HOOK_DELAY_SECS}, got {}",
                self.general.hook_delay_secs
            ));
        }
        if !env::is_log_level(&self.general.log_level.to_lowercase()) {
            problems.push(format!("unknown log level '{}'", self.general.log_level));
        }
        if let Some(root) = &self.general.root_url
            && normalize_server_url(root).is_none()
        {
            problems.push(format!("general.root_url '{root}' is not an http(s) URL"));
        }

        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            match endpoint.normalized_url() {
                Some(url) => {
                    if !seen.insert(url.clone()) {
                        problems.push(format!("duplicate endpoint '{url}'"));
                    }
                }
                None => problems.push(format!(
                    "endpoint server_url '{}' is not an http(s) URL",
                    endpoint.server_url
                )),
            }
            if endpoint.signature_verification
                && endpoint.secret.as_deref().is_none_or(str::is_empty)
            {
                problems.push(format!(
                    "endpoint '{}' enables signature verification without a secret",
                    endpoint.server_url
                ));
            }
        }

        for names in [&self.defaults.origin_strategies, &self.defaults.fork_strategies] {
            if let Err(problem) = parse_strategies(names) {
                problems.push(format!("defaults: {problem}"));
            }
        }
        for source in &self.sources {
            let label = source.repo_ref();
            if source.owner.is_empty() || source.repository.is_empty() {
                problems.push("source with empty owner or repository".to_string());
            }
            if normalize_server_url(&source.server_url).is_none() {
                problems.push(format!("source {label}: invalid server_url"));
            }
            for names in [&source.origin_strategies, &source.fork_strategies]
                .into_iter()
                .flatten()
            {
                if let Err(problem) = parse_strategies(names) {
                    problems.push(format!("source {label}: {problem}"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    // ── Queries ────────────────────────────────────────────────────────────

    pub fn hook_delay(&self) -> Duration {
        Duration::from_secs(u64::from(
            self.general.hook_delay_secs.min(MAX_HOOK_DELAY_SECS),
        ))
    }

    /// Endpoint whose server URL matches `server_url` after normalization.
    pub fn endpoint(&self, server_url: &str) -> Option<&EndpointConfig> {
        let wanted = normalize_server_url(server_url)?;
        self.endpoints
            .iter()
            .find(|e| e.normalized_url().as_deref() == Some(wanted.as_str()))
    }

    /// Effective discovery traits of a source (defaults plus overrides).
    pub fn source_traits(&self, source: &SourceConfig) -> Result<DiscoveryTraits, ConfigError> {
        let defaults = &self.defaults;
        let origin = parse_strategies(
            source
                .origin_strategies
                .as_ref()
                .unwrap_or(&defaults.origin_strategies),
        )
        .map_err(|p| ConfigError::Validation(vec![p]))?;
        let fork = parse_strategies(
            source
                .fork_strategies
                .as_ref()
                .unwrap_or(&defaults.fork_strategies),
        )
        .map_err(|p| ConfigError::Validation(vec![p]))?;

        Ok(DiscoveryTraits {
            branches: source.branches.unwrap_or(defaults.branches),
            tags: source.tags.unwrap_or(defaults.tags),
            origin_pull_requests: source
                .origin_pull_requests
                .unwrap_or(defaults.origin_pull_requests),
            fork_pull_requests: source
                .fork_pull_requests
                .unwrap_or(defaults.fork_pull_requests),
            skip_public_pull_requests: source
                .skip_public_pull_requests
                .unwrap_or(defaults.skip_public_pull_requests),
            strategies: StrategyConfig { origin, fork },
        })
    }

    /// Build a [`BranchSource`] for every configured source.
    pub fn branch_sources(&self) -> Result<Vec<BranchSource>, ConfigError> {
        self.sources
            .iter()
            .map(|source| {
                let traits = self.source_traits(source)?;
                let policy = source.fork_trust.unwrap_or(self.defaults.fork_trust);
                let members = source
                    .team_members
                    .as_ref()
                    .unwrap_or(&self.defaults.team_members);
                let server_url = normalize_server_url(&source.server_url)
                    .unwrap_or_else(|| source.server_url.clone());
                let mirror = self
                    .endpoint(&server_url)
                    .and_then(|e| e.mirror_id.clone());
                let branch_source =
                    BranchSource::new(server_url, source.repo_ref(), traits, policy.build(members));
                Ok(match mirror {
                    Some(mirror_id) => branch_source.with_mirror(mirror_id),
                    None => branch_source,
                })
            })
            .collect()
    }
}
