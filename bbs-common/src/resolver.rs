//! Head/revision resolution against the repository host.
//!
//! Missing refs and missing hashes resolve to `Ok(None)` ("do not build");
//! only host failures surface as errors, and callers skip the affected ref.

use crate::head::{CommitRevision, Head, PullRequestHead, Revision, is_full_hash};
use crate::host::{Commit, HostApi, HostResult, PullRequest};
use crate::strategy::CheckoutStrategy;
use crate::types::RepoRef;
use tracing::{debug, warn};

pub struct HeadResolver<'a> {
    host: &'a dyn HostApi,
    repo: &'a RepoRef,
}

impl<'a> HeadResolver<'a> {
    pub fn new(host: &'a dyn HostApi, repo: &'a RepoRef) -> Self {
        Self { host, repo }
    }

    /// Resolve any head to its current revision.
    pub fn resolve(&self, head: &Head) -> HostResult<Option<Revision>> {
        match head {
            Head::Branch(branch) => self.resolve_branch(&branch.name),
            Head::Tag(tag) => self.resolve_tag(&tag.name),
            Head::PullRequest(pr) => self.resolve_pull_request(pr),
        }
    }

    pub fn resolve_branch(&self, name: &str) -> HostResult<Option<Revision>> {
        let Some(branch) = self.host.get_branch(self.repo, name)? else {
            debug!(repo = %self.repo, branch = name, "No such branch");
            return Ok(None);
        };
        match branch.commit() {
            Some(commit) => Ok(Some(Revision::Commit(commit.to_revision()))),
            None => {
                warn!(repo = %self.repo, branch = name, "Branch has no commit hash");
                Ok(None)
            }
        }
    }

    pub fn resolve_tag(&self, name: &str) -> HostResult<Option<Revision>> {
        let Some(tag) = self.host.get_tag(self.repo, name)? else {
            debug!(repo = %self.repo, tag = name, "No such tag");
            return Ok(None);
        };
        match tag.hash {
            Some(hash) => Ok(Some(Revision::Commit(CommitRevision {
                hash,
                author: tag.author,
                message: tag.message,
                date: tag.date,
            }))),
            None => {
                warn!(
                    repo = %self.repo,
                    tag = name,
                    "Tag has no commit hash (older server versions omit it for annotated tags)"
                );
                Ok(None)
            }
        }
    }

    pub fn resolve_pull_request(&self, head: &PullRequestHead) -> HostResult<Option<Revision>> {
        let Some(pr) = self.host.get_pull_request(self.repo, head.id)? else {
            debug!(repo = %self.repo, pull_request = head.id, "No such pull request");
            return Ok(None);
        };
        self.pull_request_revision(&pr, head.strategy)
    }

    /// Build the composite revision of an already fetched pull request.
    pub fn pull_request_revision(
        &self,
        pr: &PullRequest,
        strategy: CheckoutStrategy,
    ) -> HostResult<Option<Revision>> {
        Ok(self
            .pull_request_commits(pr)?
            .map(|(source, target)| Revision::PullRequest {
                source,
                target,
                strategy,
            }))
    }

    /// Source and target commits of a pull request, shared by every strategy.
    ///
    /// Both sides must resolve to a full commit; otherwise there is no revision.
    pub fn pull_request_commits(
        &self,
        pr: &PullRequest,
    ) -> HostResult<Option<(CommitRevision, CommitRevision)>> {
        let Some(source) = self.full_commit(&pr.source.repository, pr.source.commit.as_ref(), pr.id)?
        else {
            debug!(repo = %self.repo, pull_request = pr.id, "Source commit unresolved");
            return Ok(None);
        };
        let Some(target) =
            self.full_commit(&pr.destination.repository, pr.destination.commit.as_ref(), pr.id)?
        else {
            debug!(repo = %self.repo, pull_request = pr.id, "Target commit unresolved");
            return Ok(None);
        };
        Ok(Some((source, target)))
    }

    fn full_commit(
        &self,
        repo: &RepoRef,
        commit: Option<&Commit>,
        pr_id: u64,
    ) -> HostResult<Option<CommitRevision>> {
        let Some(commit) = commit else {
            return Ok(None);
        };
        if is_full_hash(&commit.hash) {
            return Ok(Some(commit.to_revision()));
        }
        match self.host.resolve_commit(repo, &commit.hash)? {
            Some(resolved) if is_full_hash(&resolved.hash) => Ok(Some(resolved.to_revision())),
            Some(resolved) => {
                warn!(pull_request = pr_id, hash = %resolved.hash, "Resolved commit id is still abbreviated");
                Ok(None)
            }
            None => {
                debug!(pull_request = pr_id, hash = %commit.hash, "Abbreviated hash did not resolve");
                Ok(None)
            }
        }
    }
}
