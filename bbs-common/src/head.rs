//! Buildable heads and their resolved revisions.
//!
//! Heads are immutable value objects. Identity is the name for branches and
//! tags and `(id, strategy)` for pull requests, so one pull request can map
//! to several distinct heads.

use crate::strategy::CheckoutStrategy;
use crate::types::RepoRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of a canonical (SHA-1) commit id.
pub const FULL_HASH_LEN: usize = 40;

/// Whether `hash` is a complete commit id rather than an abbreviation.
pub fn is_full_hash(hash: &str) -> bool {
    hash.len() >= FULL_HASH_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchHead {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagHead {
    pub name: String,
    /// Creation time of the tag, or of its commit for lightweight tags.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Whether a pull request comes from the scanned repository or a fork.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HeadOrigin {
    Origin,
    /// `trust_id` is `fork:<owner>` or `fork:<owner>/<repo>`.
    Fork { trust_id: String },
}

impl HeadOrigin {
    pub fn is_fork(&self) -> bool {
        matches!(self, Self::Fork { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestHead {
    pub id: u64,
    /// Display name: `PR-<id>` or `PR-<id>-<strategy>`.
    pub name: String,
    /// Repository holding the source branch.
    pub source: RepoRef,
    pub source_branch: String,
    pub target_branch: String,
    pub strategy: CheckoutStrategy,
    pub origin: HeadOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Head {
    Branch(BranchHead),
    Tag(TagHead),
    PullRequest(PullRequestHead),
}

/// Identity of a head, ignoring descriptive attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HeadKey {
    Branch(String),
    Tag(String),
    PullRequest(u64, CheckoutStrategy),
}

impl Head {
    pub fn branch(name: impl Into<String>) -> Self {
        Self::Branch(BranchHead { name: name.into() })
    }

    pub fn tag(name: impl Into<String>, timestamp: Option<DateTime<Utc>>) -> Self {
        Self::Tag(TagHead {
            name: name.into(),
            timestamp,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Branch(b) => &b.name,
            Self::Tag(t) => &t.name,
            Self::PullRequest(pr) => &pr.name,
        }
    }

    pub fn key(&self) -> HeadKey {
        match self {
            Self::Branch(b) => HeadKey::Branch(b.name.clone()),
            Self::Tag(t) => HeadKey::Tag(t.name.clone()),
            Self::PullRequest(pr) => HeadKey::PullRequest(pr.id, pr.strategy),
        }
    }

    pub fn as_pull_request(&self) -> Option<&PullRequestHead> {
        match self {
            Self::PullRequest(pr) => Some(pr),
            Self::Branch(_) | Self::Tag(_) => None,
        }
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Head {}

impl std::hash::Hash for Head {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl std::fmt::Display for Head {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A single commit with the metadata shown next to a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRevision {
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
}

impl CommitRevision {
    pub fn bare(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            author: None,
            message: None,
            date: None,
        }
    }
}

/// Resolved state of a head. `None` in an `Option<Revision>` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Revision {
    Commit(CommitRevision),
    PullRequest {
        source: CommitRevision,
        target: CommitRevision,
        strategy: CheckoutStrategy,
    },
}

impl Revision {
    /// The commit a build of this revision checks out first.
    pub fn hash(&self) -> &str {
        match self {
            Self::Commit(c) => &c.hash,
            Self::PullRequest { source, .. } => &source.hash,
        }
    }

    pub fn target_hash(&self) -> Option<&str> {
        match self {
            Self::Commit(_) => None,
            Self::PullRequest { target, .. } => Some(&target.hash),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Created,
    Updated,
    Removed,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// One head/revision change produced by webhook normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadUpdate {
    pub kind: UpdateKind,
    pub server_url: String,
    pub repository: RepoRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_id: Option<String>,
    pub head: Head,
    pub revision: Option<Revision>,
}

impl HeadUpdate {
    pub fn is_tombstone(&self) -> bool {
        self.revision.is_none()
    }
}
