//! Common types used across the branch source components.

use serde::{Deserialize, Serialize};
use url::Url;

/// Canonical server URL of the cloud variant.
pub const CLOUD_SERVER_URL: &str = "https://bitbucket.org";

/// Which flavour of repository host an endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HostVariant {
    /// Hosted cloud service (REST 2.0).
    #[default]
    Cloud,
    /// Self-managed server / data center installation (REST 1.0).
    Server,
}

impl std::fmt::Display for HostVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cloud => write!(f, "cloud"),
            Self::Server => write!(f, "server"),
        }
    }
}

/// Coordinates of a repository on a host.
///
/// `owner` is the workspace on cloud and the project key on server.
/// Comparisons are case-insensitive, matching how both hosts treat slugs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repository: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repository: repository.into(),
        }
    }

    /// Parse an `owner/repository` full name.
    pub fn from_full_name(full_name: &str) -> Option<Self> {
        let (owner, repository) = full_name.split_once('/')?;
        if owner.is_empty() || repository.is_empty() || repository.contains('/') {
            return None;
        }
        Some(Self::new(owner, repository))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repository)
    }

    pub fn same_owner(&self, other: &RepoRef) -> bool {
        self.owner.eq_ignore_ascii_case(&other.owner)
    }

    pub fn same_repository(&self, other: &RepoRef) -> bool {
        self.repository.eq_ignore_ascii_case(&other.repository)
    }
}

impl PartialEq for RepoRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_owner(other) && self.same_repository(other)
    }
}

impl Eq for RepoRef {}

impl std::hash::Hash for RepoRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.owner.to_ascii_lowercase().hash(state);
        self.repository.to_ascii_lowercase().hash(state);
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner, self.repository)
    }
}

/// Transport used to clone a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    #[default]
    Http,
    Ssh,
}

impl Protocol {
    /// Whether a clone link with the given declared name serves this protocol.
    pub fn matches_link_name(&self, name: &str) -> bool {
        match self {
            Self::Http => name.eq_ignore_ascii_case("http") || name.eq_ignore_ascii_case("https"),
            Self::Ssh => name.eq_ignore_ascii_case("ssh"),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Ssh => write!(f, "ssh"),
        }
    }
}

/// Shape of the credential configured for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    UsernamePassword,
    Token,
    SshPrivateKey,
}

/// Pick the clone protocol implied by the resolved credential.
///
/// No credential means anonymous HTTP; an SSH private key means SSH.
pub fn protocol_for_credential(kind: Option<CredentialKind>) -> Protocol {
    match kind {
        Some(CredentialKind::SshPrivateKey) => Protocol::Ssh,
        Some(CredentialKind::UsernamePassword) | Some(CredentialKind::Token) | None => {
            Protocol::Http
        }
    }
}

/// Normalize a server URL so that equivalent spellings compare equal.
///
/// Lower-cases scheme and host, drops default ports and trailing slashes.
/// Returns `None` for strings that are not absolute http(s) URLs.
pub fn normalize_server_url(raw: &str) -> Option<String> {
    let parsed = Url::parse(raw.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    let mut normalized = format!("{}://{}", parsed.scheme(), host);
    if let Some(port) = parsed.port() {
        normalized.push_str(&format!(":{port}"));
    }
    let path = parsed.path().trim_end_matches('/');
    normalized.push_str(path);
    Some(normalized)
}
