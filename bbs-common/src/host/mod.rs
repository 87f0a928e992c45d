//! Repository host API boundary.
//!
//! The HTTP client that talks to the host is an external collaborator; this
//! module fixes the operations the branch source needs and the shapes it
//! expects back. [`snapshot::SnapshotHost`] implements the trait from an
//! in-memory (JSON loadable) repository snapshot.

pub mod snapshot;

use crate::errors::ErrorCode;
use crate::head::CommitRevision;
use crate::types::{HostVariant, RepoRef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use snapshot::{RepositorySnapshot, SnapshotFile, SnapshotHost};

/// Errors reported by a repository host.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("host unavailable: {0}")]
    Unavailable(String),
    #[error("malformed host response: {0}")]
    Malformed(String),
}

impl HostError {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::HostNotFound,
            Self::Forbidden(_) => ErrorCode::HostForbidden,
            Self::Unauthorized(_) => ErrorCode::HostUnauthorized,
            Self::Unavailable(_) => ErrorCode::HostUnavailable,
            Self::Malformed(_) => ErrorCode::HostMalformedResponse,
        }
    }
}

pub type HostResult<T> = Result<T, HostError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneLink {
    /// Declared protocol name (`https`, `http`, `ssh`).
    pub name: String,
    pub href: String,
}

impl CloneLink {
    pub fn new(name: impl Into<String>, href: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            href: href.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Role filter when listing repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryRole {
    Owner,
    Admin,
    Contributor,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub owner: String,
    pub slug: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub clone_links: Vec<CloneLink>,
    /// Project key; always present on server, optional on cloud.
    #[serde(default)]
    pub project_key: Option<String>,
    #[serde(default)]
    pub main_branch: Option<String>,
    /// Roles the configured credential holds on this repository.
    #[serde(default)]
    pub roles: Vec<RepositoryRole>,
}

impl Repository {
    pub fn repo_ref(&self) -> RepoRef {
        RepoRef::new(&self.owner, &self.slug)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl Commit {
    pub fn bare(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            author: None,
            message: None,
            date: None,
        }
    }

    pub fn to_revision(&self) -> CommitRevision {
        CommitRevision {
            hash: self.hash.clone(),
            author: self.author.clone(),
            message: self.message.clone(),
            date: self.date,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    /// Head commit; older servers may omit it.
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

impl Branch {
    pub fn commit(&self) -> Option<Commit> {
        self.hash.as_ref().map(|hash| Commit {
            hash: hash.clone(),
            author: self.author.clone(),
            message: self.message.clone(),
            date: self.date,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    /// Target commit; older servers omit it for annotated tags.
    #[serde(default)]
    pub hash: Option<String>,
    /// Tag creation time (annotated) or commit time (lightweight).
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    #[default]
    Open,
    Merged,
    Declined,
}

/// Source or destination side of a pull request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestEndpoint {
    pub repository: RepoRef,
    pub branch: String,
    /// Latest commit on this side. Cloud may return an abbreviated hash.
    #[serde(default)]
    pub commit: Option<Commit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub state: PullRequestState,
    pub source: PullRequestEndpoint,
    pub destination: PullRequestEndpoint,
    /// Server listings need a follow-up call before the object is complete.
    #[serde(default = "default_true")]
    pub initialized: bool,
    #[serde(default)]
    pub changed_files: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorServer {
    pub id: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirroredRepository {
    pub mirror_id: String,
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default)]
    pub clone_links: Vec<CloneLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRegistration {
    #[serde(default)]
    pub id: Option<String>,
    pub url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Operations the branch source consumes from a repository host.
///
/// Calls are blocking; discovery runs on a dedicated worker thread.
pub trait HostApi: Send + Sync {
    fn variant(&self) -> HostVariant;

    fn server_url(&self) -> &str;

    fn get_team(&self, owner: &str) -> HostResult<Option<Team>>;

    fn get_repositories(
        &self,
        owner: &str,
        role: Option<RepositoryRole>,
    ) -> HostResult<Vec<Repository>>;

    fn get_repository(&self, repo: &RepoRef) -> HostResult<Repository>;

    fn get_branches(&self, repo: &RepoRef) -> HostResult<Vec<Branch>>;

    fn get_branch(&self, repo: &RepoRef, name: &str) -> HostResult<Option<Branch>>;

    fn get_tags(&self, repo: &RepoRef) -> HostResult<Vec<Tag>>;

    fn get_tag(&self, repo: &RepoRef, name: &str) -> HostResult<Option<Tag>>;

    fn get_pull_requests(&self, repo: &RepoRef) -> HostResult<Vec<PullRequest>>;

    fn get_pull_request(&self, repo: &RepoRef, id: u64) -> HostResult<Option<PullRequest>>;

    /// Populate diff/changed-files metadata on a listed pull request.
    fn initialize_pull_request(&self, repo: &RepoRef, pr: &mut PullRequest) -> HostResult<()>;

    /// Look up a commit by full or abbreviated hash.
    fn resolve_commit(&self, repo: &RepoRef, hash: &str) -> HostResult<Option<Commit>>;

    fn get_mirrors(&self, repo: &RepoRef) -> HostResult<Vec<MirrorServer>>;

    fn get_mirrored_repository(
        &self,
        repo: &RepoRef,
        mirror_id: &str,
    ) -> HostResult<Option<MirroredRepository>>;

    /// Open pull requests whose source is `ref_id`.
    fn get_outgoing_open_pull_requests(
        &self,
        repo: &RepoRef,
        ref_id: &str,
    ) -> HostResult<Vec<PullRequest>>;

    /// Open pull requests whose destination is `ref_id`.
    fn get_incoming_open_pull_requests(
        &self,
        repo: &RepoRef,
        ref_id: &str,
    ) -> HostResult<Vec<PullRequest>>;

    fn list_webhooks(&self, repo: &RepoRef) -> HostResult<Vec<WebhookRegistration>>;

    fn register_webhook(
        &self,
        repo: &RepoRef,
        hook: &WebhookRegistration,
    ) -> HostResult<WebhookRegistration>;

    fn update_webhook(&self, repo: &RepoRef, hook: &WebhookRegistration) -> HostResult<()>;

    fn remove_webhook(&self, repo: &RepoRef, id: &str) -> HostResult<()>;
}

/// Strip `refs/heads/` or `refs/tags/` from a fully qualified ref id.
pub fn display_ref_name(ref_id: &str) -> &str {
    ref_id
        .strip_prefix("refs/heads/")
        .or_else(|| ref_id.strip_prefix("refs/tags/"))
        .unwrap_or(ref_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_ref_name() {
        assert_eq!(display_ref_name("refs/heads/main"), "main");
        assert_eq!(display_ref_name("refs/tags/v1"), "v1");
        assert_eq!(display_ref_name("feature/x"), "feature/x");
    }

    #[test]
    fn test_branch_commit_requires_hash() {
        let branch = Branch {
            name: "main".into(),
            hash: None,
            author: None,
            message: None,
            date: None,
        };
        assert!(branch.commit().is_none());
    }

    #[test]
    fn test_pull_request_defaults_to_initialized() {
        let json = serde_json::json!({
            "id": 4,
            "source": {"repository": {"owner": "a", "repository": "r"}, "branch": "f"},
            "destination": {"repository": {"owner": "a", "repository": "r"}, "branch": "main"}
        });
        let pr: PullRequest = serde_json::from_value(json).unwrap();
        assert!(pr.initialized);
        assert_eq!(pr.state, PullRequestState::Open);
    }
}
