//! Head discovery and reconciliation.
//!
//! Drives one scan through `init → branches → pull requests → tags → done`,
//! stopping as soon as the observer reports completion. Each ref class is
//! fetched at most once per [`DiscoveryRequest`]. Revisions are resolved
//! lazily: only when the caller's criteria asks for one, or when the head is
//! handed to the observer.

use crate::errors::ErrorCode;
use crate::head::{CommitRevision, Head, Revision};
use crate::host::{Branch, HostApi, HostError, PullRequest, Repository, Tag};
use crate::resolver::HeadResolver;
use crate::source::{PullRequestMetadata, PullRequestMetadataCache};
use crate::strategy::{
    ForkTrust, PullRequestRef, StrategyConfig, TrustCandidate, TrustSnapshot, classify_origin,
    fan_out,
};
use crate::types::RepoRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Request ────────────────────────────────────────────────────────────────

/// Which ref classes a scan fetches and how pull requests fan out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryTraits {
    pub branches: bool,
    pub tags: bool,
    pub origin_pull_requests: bool,
    pub fork_pull_requests: bool,
    /// Skip pull requests entirely when the repository is public.
    pub skip_public_pull_requests: bool,
    pub strategies: StrategyConfig,
}

impl Default for DiscoveryTraits {
    fn default() -> Self {
        Self {
            branches: true,
            tags: false,
            origin_pull_requests: true,
            fork_pull_requests: true,
            skip_public_pull_requests: false,
            strategies: StrategyConfig::default(),
        }
    }
}

/// Restriction of a scan to named refs, typically derived from a webhook.
///
/// An empty set means the class is not scanned at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestScope {
    #[serde(default)]
    pub branches: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub pull_requests: BTreeSet<u64>,
}

/// One scan. Fetched ref lists are cached for the lifetime of the request.
#[derive(Debug, Clone)]
pub struct DiscoveryRequest {
    pub repository: RepoRef,
    pub traits: DiscoveryTraits,
    pub scope: Option<RequestScope>,
    /// Fully detailed pull requests carried by a webhook event.
    pub event_pull_requests: Option<Vec<PullRequest>>,
    repository_info: Option<Repository>,
    branches: Option<Vec<Branch>>,
    tags: Option<Vec<Tag>>,
    pull_requests: Option<Vec<PullRequest>>,
}

impl DiscoveryRequest {
    pub fn new(repository: RepoRef, traits: DiscoveryTraits) -> Self {
        Self {
            repository,
            traits,
            scope: None,
            event_pull_requests: None,
            repository_info: None,
            branches: None,
            tags: None,
            pull_requests: None,
        }
    }

    pub fn with_scope(mut self, scope: RequestScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn with_event_pull_requests(mut self, prs: Vec<PullRequest>) -> Self {
        self.event_pull_requests = Some(prs);
        self
    }

    fn wants_branches(&self) -> bool {
        self.traits.branches && self.scope.as_ref().is_none_or(|s| !s.branches.is_empty())
    }

    fn wants_tags(&self) -> bool {
        self.traits.tags && self.scope.as_ref().is_none_or(|s| !s.tags.is_empty())
    }

    fn wants_pull_requests(&self) -> bool {
        (self.traits.origin_pull_requests || self.traits.fork_pull_requests)
            && self
                .scope
                .as_ref()
                .is_none_or(|s| !s.pull_requests.is_empty())
    }

    fn includes_branch(&self, name: &str) -> bool {
        self.scope.as_ref().is_none_or(|s| s.branches.contains(name))
    }

    fn includes_tag(&self, name: &str) -> bool {
        self.scope.as_ref().is_none_or(|s| s.tags.contains(name))
    }

    fn includes_pull_request(&self, id: u64) -> bool {
        self.scope
            .as_ref()
            .is_none_or(|s| s.pull_requests.contains(&id))
    }

    fn repository_info(&mut self, host: &dyn HostApi) -> Result<&Repository, DiscoveryError> {
        if self.repository_info.is_none() {
            let info = host.get_repository(&self.repository).map_err(|e| match e {
                HostError::NotFound(_) => DiscoveryError::RepositoryNotFound(self.repository.clone()),
                other => DiscoveryError::fetch(RefClass::Repository, &self.repository, other),
            })?;
            self.repository_info = Some(info);
        }
        self.repository_info
            .as_ref()
            .ok_or_else(|| DiscoveryError::RepositoryNotFound(self.repository.clone()))
    }

    fn branches(&mut self, host: &dyn HostApi) -> Result<&[Branch], DiscoveryError> {
        if self.branches.is_none() {
            let branches = host
                .get_branches(&self.repository)
                .map_err(|e| DiscoveryError::fetch(RefClass::Branches, &self.repository, e))?;
            self.branches = Some(branches);
        }
        Ok(self.branches.as_deref().unwrap_or_default())
    }

    fn tags(&mut self, host: &dyn HostApi) -> Result<&[Tag], DiscoveryError> {
        if self.tags.is_none() {
            let tags = host
                .get_tags(&self.repository)
                .map_err(|e| DiscoveryError::fetch(RefClass::Tags, &self.repository, e))?;
            self.tags = Some(tags);
        }
        Ok(self.tags.as_deref().unwrap_or_default())
    }

    fn pull_requests(&mut self, host: &dyn HostApi) -> Result<&[PullRequest], DiscoveryError> {
        if self.pull_requests.is_none() {
            let prs = match self.event_pull_requests.clone() {
                Some(prs) => prs,
                None => host.get_pull_requests(&self.repository).map_err(|e| {
                    DiscoveryError::fetch(RefClass::PullRequests, &self.repository, e)
                })?,
            };
            self.pull_requests = Some(prs);
        }
        Ok(self.pull_requests.as_deref().unwrap_or_default())
    }
}

// ── Observer contract ──────────────────────────────────────────────────────

/// Lazy view of a head handed to the criteria.
pub struct Probe<'a> {
    head: &'a Head,
    resolve: &'a mut dyn FnMut() -> Option<Revision>,
    revision: Option<Option<Revision>>,
}

impl<'a> Probe<'a> {
    pub fn new(head: &'a Head, resolve: &'a mut dyn FnMut() -> Option<Revision>) -> Self {
        Self {
            head,
            resolve,
            revision: None,
        }
    }

    pub fn head(&self) -> &Head {
        self.head
    }

    /// Resolve (once) and return the head's revision.
    pub fn revision(&mut self) -> Option<&Revision> {
        if self.revision.is_none() {
            self.revision = Some((self.resolve)());
        }
        self.revision.as_ref().and_then(Option::as_ref)
    }

    pub fn is_resolved(&self) -> bool {
        self.revision.is_some()
    }

    fn into_revision(mut self) -> Option<Revision> {
        self.revision();
        self.revision.take().flatten()
    }
}

/// Caller-supplied predicate deciding whether a head is interesting.
pub trait HeadCriteria {
    fn is_head(&self, probe: &mut Probe<'_>) -> bool;
}

impl<F> HeadCriteria for F
where
    F: Fn(&mut Probe<'_>) -> bool,
{
    fn is_head(&self, probe: &mut Probe<'_>) -> bool {
        self(probe)
    }
}

/// Receiver of discovered heads.
///
/// `record` is called exactly once per considered head; `process` is called
/// for matched heads with a resolved revision and returns `true` once the
/// observer needs nothing more.
pub trait HeadObserver {
    fn record(&mut self, head: &Head, matched: bool);
    fn process(&mut self, head: Head, revision: Revision) -> bool;
}

/// Observer that keeps everything it sees, optionally stopping after `limit`.
#[derive(Debug, Default)]
pub struct CollectingObserver {
    pub observed: Vec<(Head, Revision)>,
    pub recorded: Vec<(Head, bool)>,
    limit: Option<usize>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl HeadObserver for CollectingObserver {
    fn record(&mut self, head: &Head, matched: bool) {
        self.recorded.push((head.clone(), matched));
    }

    fn process(&mut self, head: Head, revision: Revision) -> bool {
        self.observed.push((head, revision));
        self.limit.is_some_and(|limit| self.observed.len() >= limit)
    }
}

// ── Errors & outcome ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefClass {
    Repository,
    Branches,
    Tags,
    PullRequests,
}

impl std::fmt::Display for RefClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Repository => write!(f, "repository"),
            Self::Branches => write!(f, "branches"),
            Self::Tags => write!(f, "tags"),
            Self::PullRequests => write!(f, "pull requests"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("repository {0} not found")]
    RepositoryNotFound(RepoRef),

    #[error("failed to fetch {class} for {repository}: {source}")]
    Fetch {
        class: RefClass,
        repository: RepoRef,
        #[source]
        source: HostError,
    },
}

impl DiscoveryError {
    fn fetch(class: RefClass, repository: &RepoRef, source: HostError) -> Self {
        Self::Fetch {
            class,
            repository: repository.clone(),
            source,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RepositoryNotFound(_) => ErrorCode::DiscoveryRepositoryNotFound,
            Self::Fetch { .. } => ErrorCode::DiscoveryFetchFailed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryState {
    Init,
    FetchBranches,
    FetchPullRequests,
    FetchTags,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryOutcome {
    /// Heads offered to the observer via `record`.
    pub considered: usize,
    /// Heads handed to `process`.
    pub processed: usize,
    /// Matched heads whose revision could not be resolved.
    pub unresolved: usize,
    /// Pull requests skipped because of host errors (forbidden forks included).
    pub skipped_pull_requests: usize,
    /// Observer reported completion before the scan ran out of refs.
    pub completed_early: bool,
    /// Fork trust decisions taken during this pass.
    pub trust: TrustSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Complete,
}

// ── Engine ─────────────────────────────────────────────────────────────────

pub struct DiscoveryEngine<'a> {
    host: &'a dyn HostApi,
    trust: &'a dyn ForkTrust,
    metadata: &'a PullRequestMetadataCache,
}

impl<'a> DiscoveryEngine<'a> {
    pub fn new(
        host: &'a dyn HostApi,
        trust: &'a dyn ForkTrust,
        metadata: &'a PullRequestMetadataCache,
    ) -> Self {
        Self {
            host,
            trust,
            metadata,
        }
    }

    /// Run a scan to completion or until the observer is satisfied.
    pub fn run(
        &self,
        request: &mut DiscoveryRequest,
        criteria: Option<&dyn HeadCriteria>,
        observer: &mut dyn HeadObserver,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        let mut outcome = DiscoveryOutcome::default();
        let mut state = DiscoveryState::Init;

        info!(repo = %request.repository, "Starting discovery");
        loop {
            let (flow, next) = match state {
                DiscoveryState::Init => (Flow::Continue, DiscoveryState::FetchBranches),
                DiscoveryState::FetchBranches => (
                    self.discover_branches(request, criteria, observer, &mut outcome)?,
                    DiscoveryState::FetchPullRequests,
                ),
                DiscoveryState::FetchPullRequests => (
                    self.discover_pull_requests(request, criteria, observer, &mut outcome)?,
                    DiscoveryState::FetchTags,
                ),
                DiscoveryState::FetchTags => (
                    self.discover_tags(request, criteria, observer, &mut outcome)?,
                    DiscoveryState::Done,
                ),
                DiscoveryState::Done => break,
            };
            state = match flow {
                Flow::Continue => next,
                Flow::Complete => {
                    debug!(repo = %request.repository, ?state, "Observer complete; stopping scan");
                    outcome.completed_early = true;
                    DiscoveryState::Done
                }
            };
        }

        info!(
            repo = %request.repository,
            considered = outcome.considered,
            processed = outcome.processed,
            unresolved = outcome.unresolved,
            skipped_pull_requests = outcome.skipped_pull_requests,
            "Discovery finished"
        );
        Ok(outcome)
    }

    fn offer(
        &self,
        head: Head,
        mut resolve: impl FnMut() -> Option<Revision>,
        criteria: Option<&dyn HeadCriteria>,
        observer: &mut dyn HeadObserver,
        outcome: &mut DiscoveryOutcome,
    ) -> Flow {
        outcome.considered += 1;
        let (matched, revision) = {
            let mut probe = Probe::new(&head, &mut resolve);
            let matched = criteria.is_none_or(|c| c.is_head(&mut probe));
            let revision = if matched { probe.into_revision() } else { None };
            (matched, revision)
        };
        observer.record(&head, matched);
        if !matched {
            return Flow::Continue;
        }
        let Some(revision) = revision else {
            debug!(head = %head, "No revision; not offering head");
            outcome.unresolved += 1;
            return Flow::Continue;
        };
        outcome.processed += 1;
        if observer.process(head, revision) {
            Flow::Complete
        } else {
            Flow::Continue
        }
    }

    fn discover_branches(
        &self,
        request: &mut DiscoveryRequest,
        criteria: Option<&dyn HeadCriteria>,
        observer: &mut dyn HeadObserver,
        outcome: &mut DiscoveryOutcome,
    ) -> Result<Flow, DiscoveryError> {
        if !request.wants_branches() {
            return Ok(Flow::Continue);
        }
        let branches = request.branches(self.host)?.to_vec();
        let repo = request.repository.clone();
        debug!(repo = %repo, count = branches.len(), "Fetched branches");

        for branch in branches.iter().filter(|b| request.includes_branch(&b.name)) {
            let head = Head::branch(&branch.name);
            let flow = self.offer(
                head,
                || self.branch_revision(&repo, branch),
                criteria,
                observer,
                outcome,
            );
            if flow == Flow::Complete {
                return Ok(Flow::Complete);
            }
        }
        Ok(Flow::Continue)
    }

    fn branch_revision(&self, repo: &RepoRef, branch: &Branch) -> Option<Revision> {
        let Some(commit) = branch.commit() else {
            warn!(repo = %repo, branch = %branch.name, "Branch has no commit hash");
            return None;
        };
        if commit.author.is_some() || commit.message.is_some() || commit.date.is_some() {
            return Some(Revision::Commit(commit.to_revision()));
        }
        // Listings without inline metadata need a commit lookup.
        match self.host.resolve_commit(repo, &commit.hash) {
            Ok(Some(full)) => Some(Revision::Commit(full.to_revision())),
            Ok(None) => Some(Revision::Commit(CommitRevision::bare(commit.hash))),
            Err(err) => {
                warn!(repo = %repo, branch = %branch.name, "Commit metadata lookup failed: {}", err);
                Some(Revision::Commit(CommitRevision::bare(commit.hash)))
            }
        }
    }

    fn discover_tags(
        &self,
        request: &mut DiscoveryRequest,
        criteria: Option<&dyn HeadCriteria>,
        observer: &mut dyn HeadObserver,
        outcome: &mut DiscoveryOutcome,
    ) -> Result<Flow, DiscoveryError> {
        if !request.wants_tags() {
            return Ok(Flow::Continue);
        }
        let tags = request.tags(self.host)?.to_vec();
        let repo = request.repository.clone();
        debug!(repo = %repo, count = tags.len(), "Fetched tags");

        for tag in tags.iter().filter(|t| request.includes_tag(&t.name)) {
            let head = Head::tag(&tag.name, tag.date);
            let resolve = || match &tag.hash {
                Some(hash) => Some(Revision::Commit(CommitRevision {
                    hash: hash.clone(),
                    author: tag.author.clone(),
                    message: tag.message.clone(),
                    date: tag.date,
                })),
                None => {
                    warn!(
                        repo = %repo,
                        tag = %tag.name,
                        "Tag has no commit hash (older server versions omit it)"
                    );
                    None
                }
            };
            if self.offer(head, resolve, criteria, observer, outcome) == Flow::Complete {
                return Ok(Flow::Complete);
            }
        }
        Ok(Flow::Continue)
    }

    fn discover_pull_requests(
        &self,
        request: &mut DiscoveryRequest,
        criteria: Option<&dyn HeadCriteria>,
        observer: &mut dyn HeadObserver,
        outcome: &mut DiscoveryOutcome,
    ) -> Result<Flow, DiscoveryError> {
        if !request.wants_pull_requests() {
            return Ok(Flow::Continue);
        }
        if request.traits.skip_public_pull_requests {
            let private = request.repository_info(self.host)?.private;
            if !private {
                info!(repo = %request.repository, "Skipping pull requests of public repository");
                return Ok(Flow::Continue);
            }
        }

        let from_event = request.event_pull_requests.is_some();
        let listed = request.pull_requests(self.host)?.to_vec();
        let repo = request.repository.clone();
        let traits = request.traits.clone();
        debug!(repo = %repo, count = listed.len(), from_event, "Fetched pull requests");

        let mut retained = Vec::new();
        for mut pr in listed
            .iter()
            .filter(|pr| request.includes_pull_request(pr.id))
            .cloned()
        {
            let origin = classify_origin(&repo, &pr.source.repository);
            let wanted = if origin.is_fork() {
                traits.fork_pull_requests
            } else {
                traits.origin_pull_requests
            };
            if !wanted {
                continue;
            }
            if !pr.initialized {
                if let Err(err) = self.host.initialize_pull_request(&repo, &mut pr) {
                    self.skip_pull_request(&repo, pr.id, &err, outcome);
                    continue;
                }
            }
            self.metadata.insert(
                pr.id,
                PullRequestMetadata {
                    title: pr.title.clone(),
                    contributor: pr.author.clone(),
                    link: pr.link.clone(),
                },
            );
            retained.push((pr, origin));
        }

        let trust = TrustSnapshot::evaluate(
            self.trust,
            retained.iter().map(|(pr, origin)| TrustCandidate {
                pull_request_id: pr.id,
                author: pr.author.as_deref(),
                source: &pr.source.repository,
                origin,
            }),
        );
        outcome.trust = trust;

        let resolver = HeadResolver::new(self.host, &repo);
        let mut flow = Flow::Continue;
        'prs: for (pr, _) in &retained {
            let heads = fan_out(
                &repo,
                PullRequestRef {
                    id: pr.id,
                    source: &pr.source.repository,
                    source_branch: &pr.source.branch,
                    target_branch: &pr.destination.branch,
                },
                &traits.strategies,
            );
            // Resolved on first use, then reused by every strategy.
            let mut commits: Option<Option<(CommitRevision, CommitRevision)>> = None;
            let mut failure: Option<HostError> = None;
            for pr_head in heads {
                let strategy = pr_head.strategy;
                let resolve = || {
                    commits
                        .get_or_insert_with(|| {
                            resolver.pull_request_commits(pr).unwrap_or_else(|err| {
                                failure = Some(err);
                                None
                            })
                        })
                        .clone()
                        .map(|(source, target)| Revision::PullRequest {
                            source,
                            target,
                            strategy,
                        })
                };
                if self.offer(Head::PullRequest(pr_head), resolve, criteria, observer, outcome)
                    == Flow::Complete
                {
                    flow = Flow::Complete;
                    break 'prs;
                }
                if let Some(err) = failure.take() {
                    self.skip_pull_request(&repo, pr.id, &err, outcome);
                    continue 'prs;
                }
            }
        }

        // Narrowed listings do not show every open pull request.
        if !from_event && request.scope.is_none() {
            let open: HashSet<u64> = listed.iter().map(|pr| pr.id).collect();
            self.metadata.prune(&open);
        }
        Ok(flow)
    }

    fn skip_pull_request(
        &self,
        repo: &RepoRef,
        id: u64,
        err: &HostError,
        outcome: &mut DiscoveryOutcome,
    ) {
        outcome.skipped_pull_requests += 1;
        if err.is_forbidden() {
            info!(repo = %repo, pull_request = id, "Access to pull request forbidden; skipping");
        } else {
            warn!(repo = %repo, pull_request = id, "Skipping pull request: {}", err);
        }
    }
}
