//! Webhook payload → head updates.

use super::payload::{
    MirrorSyncPayload, PullRequestPayload, PushChange, PushPayload, RefChange, RefsChangedPayload,
    ServerPullRequestPayload,
};
use super::{
    EventType, NormalizedEvent, PayloadError, PayloadFormat, PullRequestAction, RescanRequest,
    WebhookEvent,
};
use crate::discovery::{
    CollectingObserver, DiscoveryEngine, DiscoveryError, DiscoveryRequest, DiscoveryTraits,
    RequestScope,
};
use crate::head::{CommitRevision, Head, HeadKey, HeadUpdate, Revision, UpdateKind};
use crate::host::{HostApi, PullRequest};
use crate::resolver::HeadResolver;
use crate::source::{BranchSource, PullRequestMetadataCache};
use crate::strategy::{
    CheckoutStrategy, ForkTrust, PullRequestRef, TrustCandidate, TrustNobody, TrustSnapshot,
    classify_origin, fan_out,
};
use crate::types::RepoRef;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct NormalizerSettings {
    /// Native server pushes without changes trigger a rescan.
    pub scan_on_empty_changes: bool,
    /// Credential the host is queried with; part of the per-event lookup key.
    pub credential_id: Option<String>,
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            scan_on_empty_changes: true,
            credential_id: None,
        }
    }
}

/// Open pull requests touching one ref.
#[derive(Debug, Clone, Default)]
struct AffectedPullRequests {
    outgoing: Vec<PullRequest>,
    incoming: Vec<PullRequest>,
}

/// Per-event cache of pull-request lookups keyed by (ref, credential).
type LookupCache = HashMap<(String, Option<String>), AffectedPullRequests>;

pub struct EventNormalizer<'a> {
    host: &'a dyn HostApi,
    sources: &'a [BranchSource],
    settings: NormalizerSettings,
}

impl<'a> EventNormalizer<'a> {
    pub fn new(
        host: &'a dyn HostApi,
        sources: &'a [BranchSource],
        settings: NormalizerSettings,
    ) -> Self {
        Self {
            host,
            sources,
            settings,
        }
    }

    pub fn normalize(&self, event: &WebhookEvent) -> Result<NormalizedEvent, PayloadError> {
        match event.event_type {
            EventType::Ping => {
                debug!(origin = %event.origin, "Ping acknowledged");
                Ok(NormalizedEvent::Acknowledge)
            }
            EventType::Push => self.normalize_push(event),
            EventType::RefsChanged => {
                let payload: RefsChangedPayload = event.parse()?;
                let repo = payload
                    .repository
                    .repo_ref()
                    .ok_or_else(|| PayloadError::MissingRepository(event.key.clone()))?;
                Ok(self.normalize_ref_changes(event, repo, &payload.changes, None))
            }
            EventType::MirrorSynchronized => self.normalize_mirror_sync(event),
            EventType::PullRequest(action) => self.normalize_pull_request(event, action),
        }
    }

    fn source_for(&self, server_url: &str, repo: &RepoRef) -> Option<&'a BranchSource> {
        self.sources
            .iter()
            .find(|s| s.server_url() == server_url && s.repository() == repo)
    }

    fn traits_for(&self, source: Option<&BranchSource>) -> DiscoveryTraits {
        source.map(|s| s.traits().clone()).unwrap_or_default()
    }

    fn empty_changes(
        &self,
        event: &WebhookEvent,
        repo: RepoRef,
        mirror_id: Option<String>,
    ) -> NormalizedEvent {
        if event.format.is_cloud() || self.settings.scan_on_empty_changes {
            info!(repo = %repo, key = %event.key, "Push without changes; requesting rescan");
            NormalizedEvent::Rescan(RescanRequest {
                server_url: event.server_url.clone(),
                repository: repo,
                mirror_id,
                reason: format!("{} without enumerable changes", event.key),
            })
        } else {
            info!(repo = %repo, key = %event.key, "Push without changes; rescan disabled, skipping");
            NormalizedEvent::Skip("empty change list".to_string())
        }
    }

    fn update(
        &self,
        event: &WebhookEvent,
        repo: &RepoRef,
        mirror_id: Option<&str>,
        kind: UpdateKind,
        head: Head,
        revision: Option<Revision>,
    ) -> HeadUpdate {
        HeadUpdate {
            kind,
            server_url: event.server_url.clone(),
            repository: repo.clone(),
            mirror_id: mirror_id.map(str::to_string),
            head,
            revision,
        }
    }

    /// Tag creation time is not inline in push payloads; ask the host.
    fn tag_timestamp(
        &self,
        repo: &RepoRef,
        name: &str,
        fallback: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self.host.get_tag(repo, name) {
            Ok(Some(tag)) => tag.date.or(fallback),
            Ok(None) => {
                debug!(repo = %repo, tag = name, "Tag not visible yet; using commit date");
                fallback
            }
            Err(err) => {
                warn!(repo = %repo, tag = name, "Tag lookup failed: {}", err);
                fallback
            }
        }
    }

    // ── Cloud-style push ───────────────────────────────────────────────────

    fn normalize_push(&self, event: &WebhookEvent) -> Result<NormalizedEvent, PayloadError> {
        let payload: PushPayload = event.parse()?;
        let repo = payload
            .repository
            .repo_ref()
            .ok_or_else(|| PayloadError::MissingRepository(event.key.clone()))?;
        if payload.push.changes.is_empty() {
            return Ok(self.empty_changes(event, repo, None));
        }

        let updates = payload
            .push
            .changes
            .iter()
            .filter_map(|change| self.push_update(event, &repo, change))
            .collect();
        Ok(NormalizedEvent::Updates {
            updates,
            trust: TrustSnapshot::default(),
        })
    }

    fn push_update(
        &self,
        event: &WebhookEvent,
        repo: &RepoRef,
        change: &PushChange,
    ) -> Option<HeadUpdate> {
        let Some(subject) = change.subject() else {
            warn!(repo = %repo, "Push change names no ref; ignoring");
            return None;
        };
        let kind = change.kind();
        let revision = match (kind, &subject.target) {
            (UpdateKind::Removed, _) => None,
            (_, Some(target)) => Some(target.to_revision()),
            (_, None) => {
                warn!(repo = %repo, ref_name = %subject.name, "Push change without target commit");
                return None;
            }
        };
        let head = if subject.is_tag() {
            let fallback = subject.target.as_ref().and_then(|t| t.date);
            let timestamp = match kind {
                UpdateKind::Removed => fallback,
                UpdateKind::Created | UpdateKind::Updated => {
                    self.tag_timestamp(repo, &subject.name, fallback)
                }
            };
            Head::tag(&subject.name, timestamp)
        } else {
            Head::branch(&subject.name)
        };
        Some(self.update(
            event,
            repo,
            None,
            kind,
            head,
            revision.map(Revision::Commit),
        ))
    }

    // ── Native ref changes ─────────────────────────────────────────────────

    fn normalize_mirror_sync(&self, event: &WebhookEvent) -> Result<NormalizedEvent, PayloadError> {
        let payload: MirrorSyncPayload = event.parse()?;
        let repo = payload
            .repository
            .repo_ref()
            .ok_or_else(|| PayloadError::MissingRepository(event.key.clone()))?;
        let mirror_id = payload.mirror_server.map(|m| m.id);
        if payload.ref_limit_exceeded {
            info!(repo = %repo, mirror = ?mirror_id, "Mirror ref limit exceeded; requesting rescan");
            return Ok(NormalizedEvent::Rescan(RescanRequest {
                server_url: event.server_url.clone(),
                repository: repo,
                mirror_id,
                reason: "mirror ref limit exceeded".to_string(),
            }));
        }
        Ok(self.normalize_ref_changes(event, repo, &payload.changes, mirror_id))
    }

    fn normalize_ref_changes(
        &self,
        event: &WebhookEvent,
        repo: RepoRef,
        changes: &[RefChange],
        mirror_id: Option<String>,
    ) -> NormalizedEvent {
        if changes.is_empty() {
            return self.empty_changes(event, repo, mirror_id);
        }
        let source = self.source_for(&event.server_url, &repo);
        let traits = self.traits_for(source);
        let mut lookups = LookupCache::new();
        let mut updates = Vec::new();
        let mut affected: Vec<(PullRequest, bool)> = Vec::new();
        let mut seen_prs = HashSet::new();

        for change in changes {
            let Some(name) = change.display_name() else {
                warn!(repo = %repo, "Ref change without ref id; ignoring");
                continue;
            };
            let kind = change.update_kind();
            let revision = match (kind, change.to_hash.as_deref()) {
                (UpdateKind::Removed, _) => None,
                (_, Some(hash)) => Some(Revision::Commit(CommitRevision::bare(hash))),
                (_, None) => {
                    warn!(repo = %repo, ref_name = %name, "Ref change without target hash");
                    continue;
                }
            };
            let head = if change.is_tag() {
                let timestamp = match kind {
                    UpdateKind::Removed => None,
                    UpdateKind::Created | UpdateKind::Updated => {
                        self.tag_timestamp(&repo, &name, None)
                    }
                };
                Head::tag(name, timestamp)
            } else {
                Head::branch(name)
            };
            let is_branch = matches!(head, Head::Branch(_));
            updates.push(self.update(event, &repo, mirror_id.as_deref(), kind, head, revision));

            if is_branch
                && kind != UpdateKind::Removed
                && let Some(ref_id) = change.ref_id()
            {
                let found = self.affected_pull_requests(&repo, ref_id, &mut lookups);
                for (pr, incoming) in found
                    .outgoing
                    .into_iter()
                    .map(|pr| (pr, false))
                    .chain(found.incoming.into_iter().map(|pr| (pr, true)))
                {
                    if pr.destination.repository == repo && seen_prs.insert((pr.id, incoming)) {
                        affected.push((pr, incoming));
                    }
                }
            }
        }

        let policy = source.map_or(&TrustNobody as &dyn ForkTrust, |s| s.trust_policy());
        let (pr_updates, trust) = self.refresh_pull_requests(
            event,
            &repo,
            mirror_id.as_deref(),
            &traits,
            policy,
            &affected,
        );
        updates.extend(pr_updates);
        if let Some(source) = source {
            source.merge_trust(&trust);
        }
        NormalizedEvent::Updates { updates, trust }
    }

    fn affected_pull_requests(
        &self,
        repo: &RepoRef,
        ref_id: &str,
        cache: &mut LookupCache,
    ) -> AffectedPullRequests {
        let key = (ref_id.to_string(), self.settings.credential_id.clone());
        if let Some(hit) = cache.get(&key) {
            return hit.clone();
        }
        let outgoing = self
            .host
            .get_outgoing_open_pull_requests(repo, ref_id)
            .unwrap_or_else(|err| {
                warn!(repo = %repo, ref_id, "Outgoing pull request lookup failed: {}", err);
                Vec::new()
            });
        let incoming = self
            .host
            .get_incoming_open_pull_requests(repo, ref_id)
            .unwrap_or_else(|err| {
                warn!(repo = %repo, ref_id, "Incoming pull request lookup failed: {}", err);
                Vec::new()
            });
        let found = AffectedPullRequests { outgoing, incoming };
        cache.insert(key, found.clone());
        found
    }

    /// Updates for pull requests whose source (all strategies) or target
    /// (merge strategy only) moved.
    fn refresh_pull_requests(
        &self,
        event: &WebhookEvent,
        repo: &RepoRef,
        mirror_id: Option<&str>,
        traits: &DiscoveryTraits,
        policy: &dyn ForkTrust,
        affected: &[(PullRequest, bool)],
    ) -> (Vec<HeadUpdate>, TrustSnapshot) {
        let classified: Vec<_> = affected
            .iter()
            .map(|(pr, incoming)| (pr, *incoming, classify_origin(repo, &pr.source.repository)))
            .filter(|(_, _, origin)| {
                if origin.is_fork() {
                    traits.fork_pull_requests
                } else {
                    traits.origin_pull_requests
                }
            })
            .collect();
        let trust = TrustSnapshot::evaluate(
            policy,
            classified.iter().map(|(pr, _, origin)| TrustCandidate {
                pull_request_id: pr.id,
                author: pr.author.as_deref(),
                source: &pr.source.repository,
                origin,
            }),
        );

        let resolver = HeadResolver::new(self.host, repo);
        let mut emitted = HashSet::<HeadKey>::new();
        let mut updates = Vec::new();
        for (pr, incoming, _) in &classified {
            for pr_head in fan_out(repo, pull_request_ref(pr), &traits.strategies) {
                let strategy = pr_head.strategy;
                if *incoming && strategy != CheckoutStrategy::Merge {
                    continue;
                }
                let head = Head::PullRequest(pr_head);
                if !emitted.insert(head.key()) {
                    continue;
                }
                match resolver.pull_request_revision(pr, strategy) {
                    Ok(Some(revision)) => updates.push(self.update(
                        event,
                        repo,
                        mirror_id,
                        UpdateKind::Updated,
                        head,
                        Some(revision),
                    )),
                    Ok(None) => debug!(head = %head, "Pull request revision unresolved"),
                    Err(err) => warn!(head = %head, "Pull request revision lookup failed: {}", err),
                }
            }
        }
        (updates, trust)
    }

    // ── Pull request lifecycle ─────────────────────────────────────────────

    fn normalize_pull_request(
        &self,
        event: &WebhookEvent,
        action: PullRequestAction,
    ) -> Result<NormalizedEvent, PayloadError> {
        let (repo, pr) = match event.format {
            PayloadFormat::ServerNative => {
                let payload: ServerPullRequestPayload = event.parse()?;
                let pr = payload
                    .pull_request
                    .to_pull_request()
                    .ok_or_else(|| PayloadError::MissingRepository(event.key.clone()))?;
                (pr.destination.repository.clone(), pr)
            }
            PayloadFormat::Cloud | PayloadFormat::ServerPlugin => {
                let payload: PullRequestPayload = event.parse()?;
                let repo = payload
                    .repository
                    .as_ref()
                    .and_then(|r| r.repo_ref())
                    .or_else(|| {
                        payload
                            .pullrequest
                            .destination
                            .repository
                            .as_ref()
                            .and_then(|r| r.repo_ref())
                    })
                    .ok_or_else(|| PayloadError::MissingRepository(event.key.clone()))?;
                let pr = payload.pullrequest.to_pull_request(&repo);
                (repo, pr)
            }
        };

        let source = self.source_for(&event.server_url, &repo);
        let traits = self.traits_for(source);
        let origin = classify_origin(&repo, &pr.source.repository);
        let wanted = if origin.is_fork() {
            traits.fork_pull_requests
        } else {
            traits.origin_pull_requests
        };
        if !wanted {
            debug!(repo = %repo, pull_request = pr.id, "Pull request class not discovered; skipping");
            return Ok(NormalizedEvent::Skip(format!(
                "pull request {} not discovered by this source",
                pr.id
            )));
        }

        if action.is_closed() {
            debug!(repo = %repo, pull_request = pr.id, ?action, "Pull request closed");
            let policy = source.map_or(&TrustNobody as &dyn ForkTrust, |s| s.trust_policy());
            let trust = TrustSnapshot::evaluate(
                policy,
                [TrustCandidate {
                    pull_request_id: pr.id,
                    author: pr.author.as_deref(),
                    source: &pr.source.repository,
                    origin: &origin,
                }],
            );
            if let Some(source) = source {
                source.merge_trust(&trust);
            }
            let updates = fan_out(&repo, pull_request_ref(&pr), &traits.strategies)
                .into_iter()
                .map(|h| {
                    self.update(
                        event,
                        &repo,
                        None,
                        UpdateKind::Removed,
                        Head::PullRequest(h),
                        None,
                    )
                })
                .collect();
            return Ok(NormalizedEvent::Updates { updates, trust });
        }

        let kind = match action {
            PullRequestAction::Created => UpdateKind::Created,
            _ => UpdateKind::Updated,
        };
        let (observed, trust) = match self.discover_pull_request(source, &repo, traits, pr) {
            Ok(found) => found,
            Err(err) => {
                warn!(repo = %repo, code = %err.code().code_string(), "Pull request discovery failed: {}", err);
                return Ok(NormalizedEvent::Skip(format!(
                    "pull request discovery failed: {err}"
                )));
            }
        };
        let updates = observed
            .into_iter()
            .map(|(head, revision)| self.update(event, &repo, None, kind, head, Some(revision)))
            .collect();
        Ok(NormalizedEvent::Updates { updates, trust })
    }

    /// Discovery pass scoped to one pull request, fed from the payload.
    ///
    /// Trust decisions land in the source, alongside the metadata.
    fn discover_pull_request(
        &self,
        source: Option<&BranchSource>,
        repo: &RepoRef,
        traits: DiscoveryTraits,
        pr: PullRequest,
    ) -> Result<(Vec<(Head, Revision)>, TrustSnapshot), DiscoveryError> {
        let mut request = DiscoveryRequest::new(repo.clone(), traits)
            .with_scope(RequestScope {
                pull_requests: BTreeSet::from([pr.id]),
                ..RequestScope::default()
            })
            .with_event_pull_requests(vec![pr]);
        let mut observer = CollectingObserver::new();
        let outcome = match source {
            Some(source) => source.discover_with(self.host, &mut request, None, &mut observer)?,
            None => {
                let metadata = PullRequestMetadataCache::new();
                DiscoveryEngine::new(self.host, &TrustNobody, &metadata).run(
                    &mut request,
                    None,
                    &mut observer,
                )?
            }
        };
        Ok((observer.observed, outcome.trust))
    }
}

fn pull_request_ref(pr: &PullRequest) -> PullRequestRef<'_> {
    PullRequestRef {
        id: pr.id,
        source: &pr.source.repository,
        source_branch: &pr.source.branch,
        target_branch: &pr.destination.branch,
    }
}
