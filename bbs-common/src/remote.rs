//! Remote endpoint resolution for the git checkout builder.
//!
//! Picks primary or mirror clone links, selects the link for the configured
//! protocol, and derives refspecs, extra remotes and the merge extension for
//! a head. Configuration problems fail hard; there is no silent fallback to
//! another endpoint.

use crate::errors::ErrorCode;
use crate::head::{Head, PullRequestHead, Revision};
use crate::host::{CloneLink, HostApi, HostError};
use crate::strategy::CheckoutStrategy;
use crate::types::{HostVariant, Protocol, RepoRef};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Name of the primary remote in the checkout.
pub const ORIGIN: &str = "origin";
/// Remote aliasing the primary repository when cloning from a mirror.
pub const PRIMARY: &str = "primary";
/// Remote holding the target branch when the head lives in a fork.
pub const UPSTREAM: &str = "upstream";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no {protocol} clone link for {repository} - is it disabled on this host?")]
    NoCloneLink {
        protocol: Protocol,
        repository: RepoRef,
    },

    #[error("mirror '{mirror_id}' not found for {repository}")]
    MirrorNotFound {
        mirror_id: String,
        repository: RepoRef,
    },

    #[error("mirror '{mirror_id}' is disabled")]
    MirrorDisabled { mirror_id: String },

    #[error("{repository} is not available on mirror '{mirror_id}'")]
    MirrorUnavailable {
        mirror_id: String,
        repository: RepoRef,
    },

    #[error("cannot derive fork clone link from {href}")]
    ForkLink { href: String },

    #[error("host error while resolving remote: {0}")]
    Host(#[from] HostError),
}

impl RemoteError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NoCloneLink { .. } => ErrorCode::RemoteNoCloneLink,
            Self::MirrorNotFound { .. } => ErrorCode::RemoteMirrorNotFound,
            Self::MirrorDisabled { .. } => ErrorCode::RemoteMirrorDisabled,
            Self::MirrorUnavailable { .. } => ErrorCode::RemoteMirrorUnavailable,
            Self::ForkLink { .. } => ErrorCode::RemoteNoCloneLink,
            Self::Host(_) => ErrorCode::HostUnavailable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorLinks {
    pub mirror_id: String,
    pub links: Vec<CloneLink>,
}

/// Clone-link candidates for a repository and the selected protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteDescriptor {
    pub variant: HostVariant,
    pub repository: RepoRef,
    pub primary_links: Vec<CloneLink>,
    pub mirror: Option<MirrorLinks>,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitRemote {
    pub name: String,
    pub url: String,
    pub refspecs: Vec<String>,
}

/// Merge-with-target instruction for the checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeExtension {
    /// Remote-qualified target branch, e.g. `origin/main`.
    pub base: String,
    /// Target commit to merge against, when known.
    pub base_hash: Option<String>,
}

/// What the checkout builder needs to fetch one head.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildRemote {
    pub url: String,
    pub refspecs: Vec<String>,
    pub extra_remotes: Vec<GitRemote>,
    pub merge: Option<MergeExtension>,
}

/// Select the link matching `protocol` from a link set.
pub fn select_link<'a>(
    links: &'a [CloneLink],
    protocol: Protocol,
    repository: &RepoRef,
) -> Result<&'a CloneLink, RemoteError> {
    links
        .iter()
        .find(|link| protocol.matches_link_name(&link.name))
        .ok_or_else(|| RemoteError::NoCloneLink {
            protocol,
            repository: repository.clone(),
        })
}

fn branch_refspec(remote: &str, branch: &str) -> String {
    format!("+refs/heads/{branch}:refs/remotes/{remote}/{branch}")
}

impl RemoteDescriptor {
    pub fn new(
        variant: HostVariant,
        repository: RepoRef,
        primary_links: Vec<CloneLink>,
        protocol: Protocol,
    ) -> Self {
        Self {
            variant,
            repository,
            primary_links,
            mirror: None,
            protocol,
        }
    }

    pub fn with_mirror(mut self, mirror_id: impl Into<String>, links: Vec<CloneLink>) -> Self {
        self.mirror = Some(MirrorLinks {
            mirror_id: mirror_id.into(),
            links,
        });
        self
    }

    /// Fetch clone links from the host, including the configured mirror.
    pub fn resolve(
        host: &dyn HostApi,
        repository: &RepoRef,
        protocol: Protocol,
        mirror_id: Option<&str>,
    ) -> Result<Self, RemoteError> {
        let repo = host.get_repository(repository)?;
        let mut descriptor = Self::new(host.variant(), repository.clone(), repo.clone_links, protocol);

        if let Some(mirror_id) = mirror_id {
            let mirrors = host.get_mirrors(repository)?;
            let mirror = mirrors
                .iter()
                .find(|m| m.id == mirror_id)
                .ok_or_else(|| RemoteError::MirrorNotFound {
                    mirror_id: mirror_id.to_string(),
                    repository: repository.clone(),
                })?;
            if !mirror.enabled {
                return Err(RemoteError::MirrorDisabled {
                    mirror_id: mirror_id.to_string(),
                });
            }
            let mirrored = host
                .get_mirrored_repository(repository, mirror_id)?
                .filter(|m| m.available)
                .ok_or_else(|| RemoteError::MirrorUnavailable {
                    mirror_id: mirror_id.to_string(),
                    repository: repository.clone(),
                })?;
            debug!(repo = %repository, mirror = mirror_id, "Using mirror clone links");
            descriptor = descriptor.with_mirror(mirror_id, mirrored.clone_links);
        }

        Ok(descriptor)
    }

    /// URL of the primary repository for the selected protocol.
    pub fn primary_url(&self) -> Result<String, RemoteError> {
        select_link(&self.primary_links, self.protocol, &self.repository).map(|l| l.href.clone())
    }

    /// URL the checkout clones from: mirror when configured, else primary.
    pub fn clone_url(&self) -> Result<String, RemoteError> {
        match &self.mirror {
            Some(mirror) => {
                select_link(&mirror.links, self.protocol, &self.repository).map(|l| l.href.clone())
            }
            None => self.primary_url(),
        }
    }

    /// Derive the clone URL of a fork by swapping the repository path.
    fn fork_url(&self, fork: &RepoRef) -> Result<String, RemoteError> {
        let primary = self.primary_url()?;
        let needle = format!("{}/{}", self.repository.owner, self.repository.repository);
        let lower = primary.to_ascii_lowercase();
        let at = lower
            .rfind(&needle.to_ascii_lowercase())
            .ok_or_else(|| RemoteError::ForkLink {
                href: primary.clone(),
            })?;
        Ok(format!(
            "{}{}/{}{}",
            &primary[..at],
            fork.owner,
            fork.repository,
            &primary[at + needle.len()..]
        ))
    }

    /// Build the remote configuration for checking out `head`.
    pub fn build_remote(
        &self,
        head: &Head,
        revision: Option<&Revision>,
    ) -> Result<BuildRemote, RemoteError> {
        match head {
            Head::Branch(branch) => Ok(BuildRemote {
                url: self.clone_url()?,
                refspecs: vec![branch_refspec(ORIGIN, &branch.name)],
                extra_remotes: Vec::new(),
                merge: None,
            }),
            Head::Tag(tag) => Ok(BuildRemote {
                url: self.clone_url()?,
                refspecs: vec![format!("+refs/tags/{0}:refs/tags/{0}", tag.name)],
                extra_remotes: Vec::new(),
                merge: None,
            }),
            Head::PullRequest(pr) => match self.variant {
                HostVariant::Server => self.server_pull_request(pr, revision),
                HostVariant::Cloud => self.cloud_pull_request(pr, revision),
            },
        }
    }

    fn server_pull_request(
        &self,
        pr: &PullRequestHead,
        revision: Option<&Revision>,
    ) -> Result<BuildRemote, RemoteError> {
        let pr_ref = |remote: &str| {
            format!(
                "+refs/pull-requests/{}/from:refs/remotes/{remote}/{}",
                pr.id, pr.name
            )
        };
        let mut refspecs = vec![pr_ref(ORIGIN)];
        let mut extra_remotes = Vec::new();
        let mut merge = None;

        if pr.strategy == CheckoutStrategy::Merge {
            refspecs.push(branch_refspec(ORIGIN, &pr.target_branch));
            merge = Some(MergeExtension {
                base: format!("{ORIGIN}/{}", pr.target_branch),
                base_hash: revision.and_then(|r| r.target_hash()).map(str::to_string),
            });
        }

        // A mirror may not have synchronized the pull request ref yet.
        if self.mirror.is_some() && revision.is_some() {
            extra_remotes.push(GitRemote {
                name: PRIMARY.to_string(),
                url: self.primary_url()?,
                refspecs: vec![pr_ref(PRIMARY)],
            });
        }

        Ok(BuildRemote {
            url: self.clone_url()?,
            refspecs,
            extra_remotes,
            merge,
        })
    }

    fn cloud_pull_request(
        &self,
        pr: &PullRequestHead,
        revision: Option<&Revision>,
    ) -> Result<BuildRemote, RemoteError> {
        let head_refspec = format!(
            "+refs/heads/{}:refs/remotes/{ORIGIN}/{}",
            pr.source_branch, pr.name
        );
        let target_hash = revision.and_then(|r| r.target_hash()).map(str::to_string);

        if !pr.origin.is_fork() {
            let mut refspecs = vec![head_refspec];
            let mut merge = None;
            if pr.strategy == CheckoutStrategy::Merge {
                refspecs.push(branch_refspec(ORIGIN, &pr.target_branch));
                merge = Some(MergeExtension {
                    base: format!("{ORIGIN}/{}", pr.target_branch),
                    base_hash: target_hash,
                });
            }
            return Ok(BuildRemote {
                url: self.clone_url()?,
                refspecs,
                extra_remotes: Vec::new(),
                merge,
            });
        }

        let mut extra_remotes = Vec::new();
        let mut merge = None;
        if pr.strategy == CheckoutStrategy::Merge {
            extra_remotes.push(GitRemote {
                name: UPSTREAM.to_string(),
                url: self.primary_url()?,
                refspecs: vec![branch_refspec(UPSTREAM, &pr.target_branch)],
            });
            merge = Some(MergeExtension {
                base: format!("{UPSTREAM}/{}", pr.target_branch),
                base_hash: target_hash,
            });
        }
        Ok(BuildRemote {
            url: self.fork_url(&pr.source)?,
            refspecs: vec![head_refspec],
            extra_remotes,
            merge,
        })
    }
}
