//! Long-lived per-repository branch source.

use crate::discovery::{
    DiscoveryEngine, DiscoveryError, DiscoveryOutcome, DiscoveryRequest, DiscoveryTraits,
    HeadCriteria, HeadObserver,
};
use crate::head::{Head, HeadUpdate, Revision};
use crate::host::HostApi;
use crate::remote::{BuildRemote, RemoteDescriptor, RemoteError};
use crate::strategy::{ForkTrust, TrustSnapshot};
use crate::types::{Protocol, RepoRef};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Display metadata remembered for a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestMetadata {
    pub title: String,
    pub contributor: Option<String>,
    pub link: Option<String>,
}

/// Pull-request metadata keyed by id, shared across discovery passes.
#[derive(Debug, Default)]
pub struct PullRequestMetadataCache {
    entries: RwLock<HashMap<u64, PullRequestMetadata>>,
}

impl PullRequestMetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: u64, metadata: PullRequestMetadata) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, metadata);
    }

    pub fn get(&self, id: u64) -> Option<PullRequestMetadata> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Drop entries for pull requests that are no longer open.
    pub fn prune(&self, open: &HashSet<u64>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|id, _| open.contains(id));
        let pruned = before - entries.len();
        if pruned > 0 {
            debug!(pruned, remaining = entries.len(), "Pruned pull request metadata");
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One configured repository on one host.
pub struct BranchSource {
    server_url: String,
    repository: RepoRef,
    mirror_id: Option<String>,
    traits: DiscoveryTraits,
    trust: Box<dyn ForkTrust>,
    metadata: PullRequestMetadataCache,
    last_trust: RwLock<TrustSnapshot>,
}

impl std::fmt::Debug for BranchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchSource")
            .field("server_url", &self.server_url)
            .field("repository", &self.repository)
            .field("mirror_id", &self.mirror_id)
            .field("traits", &self.traits)
            .field("trust", &self.trust.name())
            .finish()
    }
}

impl BranchSource {
    pub fn new(
        server_url: impl Into<String>,
        repository: RepoRef,
        traits: DiscoveryTraits,
        trust: Box<dyn ForkTrust>,
    ) -> Self {
        Self {
            server_url: server_url.into(),
            repository,
            mirror_id: None,
            traits,
            trust,
            metadata: PullRequestMetadataCache::new(),
            last_trust: RwLock::new(TrustSnapshot::default()),
        }
    }

    pub fn with_mirror(mut self, mirror_id: impl Into<String>) -> Self {
        self.mirror_id = Some(mirror_id.into());
        self
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn repository(&self) -> &RepoRef {
        &self.repository
    }

    pub fn mirror_id(&self) -> Option<&str> {
        self.mirror_id.as_deref()
    }

    pub fn traits(&self) -> &DiscoveryTraits {
        &self.traits
    }

    pub fn trust_policy(&self) -> &dyn ForkTrust {
        self.trust.as_ref()
    }

    pub fn metadata(&self) -> &PullRequestMetadataCache {
        &self.metadata
    }

    /// Whether a normalized update targets this source.
    pub fn accepts(&self, update: &HeadUpdate) -> bool {
        update.server_url == self.server_url && update.repository == self.repository
    }

    /// A fresh, unscoped request for this source.
    pub fn request(&self) -> DiscoveryRequest {
        DiscoveryRequest::new(self.repository.clone(), self.traits.clone())
    }

    /// Full scan of this source.
    pub fn discover(
        &self,
        host: &dyn HostApi,
        criteria: Option<&dyn HeadCriteria>,
        observer: &mut dyn HeadObserver,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        let mut request = self.request();
        self.discover_with(host, &mut request, criteria, observer)
    }

    /// Scan using a caller-built (possibly scoped) request.
    pub fn discover_with(
        &self,
        host: &dyn HostApi,
        request: &mut DiscoveryRequest,
        criteria: Option<&dyn HeadCriteria>,
        observer: &mut dyn HeadObserver,
    ) -> Result<DiscoveryOutcome, DiscoveryError> {
        let engine = DiscoveryEngine::new(host, self.trust.as_ref(), &self.metadata);
        let outcome = engine.run(request, criteria, observer)?;
        let complete = request.scope.is_none()
            && request.event_pull_requests.is_none()
            && !outcome.completed_early;
        let mut last = self.last_trust.write().unwrap_or_else(PoisonError::into_inner);
        if complete {
            *last = outcome.trust.clone();
        } else {
            last.merge(&outcome.trust);
        }
        Ok(outcome)
    }

    /// Fold trust decisions taken outside a scan (webhook normalization) in.
    pub fn merge_trust(&self, trust: &TrustSnapshot) {
        if trust.is_empty() {
            return;
        }
        self.last_trust
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .merge(trust);
    }

    /// Remote configuration for checking out `head` with `protocol`.
    ///
    /// Uses this source's mirror when one is configured.
    pub fn build_remote(
        &self,
        host: &dyn HostApi,
        protocol: Protocol,
        head: &Head,
        revision: Option<&Revision>,
    ) -> Result<BuildRemote, RemoteError> {
        RemoteDescriptor::resolve(host, &self.repository, protocol, self.mirror_id())?
            .build_remote(head, revision)
    }

    /// Whether the head's content may be trusted, per the latest pass.
    pub fn is_trusted(&self, head: &Head) -> bool {
        match head.as_pull_request() {
            Some(pr) => self
                .last_trust
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .is_trusted(pr),
            None => true,
        }
    }

    /// Revision to read pipeline definitions from.
    ///
    /// Untrusted fork pull requests fall back to the target branch commit.
    pub fn trusted_revision(&self, head: &Head, revision: &Revision) -> Revision {
        if self.is_trusted(head) {
            return revision.clone();
        }
        match revision {
            Revision::PullRequest { target, .. } => {
                debug!(head = %head, "Untrusted fork; using target revision");
                Revision::Commit(target.clone())
            }
            Revision::Commit(_) => revision.clone(),
        }
    }
}
