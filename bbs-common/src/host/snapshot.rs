//! In-memory repository host backed by a snapshot.
//!
//! Used by tests and by the daemon's offline mode. Every trait call is
//! counted per operation so callers can assert which host round trips a
//! code path made. Failures can be injected per pull request or per ref.

use super::{
    Branch, Commit, HostApi, HostError, HostResult, MirrorServer, MirroredRepository, PullRequest,
    PullRequestState, Repository, RepositoryRole, Tag, Team, WebhookRegistration,
    display_ref_name,
};
use crate::types::{HostVariant, RepoRef};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Everything the snapshot host knows about one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositorySnapshot {
    pub repository: Repository,
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub pull_requests: Vec<PullRequest>,
    /// Extra commits reachable through `resolve_commit`.
    #[serde(default)]
    pub commits: Vec<Commit>,
    #[serde(default)]
    pub mirrors: Vec<MirrorServer>,
    #[serde(default)]
    pub mirrored: Vec<MirroredRepository>,
    #[serde(default)]
    pub webhooks: Vec<WebhookRegistration>,
}

impl RepositorySnapshot {
    pub fn new(repository: Repository) -> Self {
        Self {
            repository,
            branches: Vec::new(),
            tags: Vec::new(),
            pull_requests: Vec::new(),
            commits: Vec::new(),
            mirrors: Vec::new(),
            mirrored: Vec::new(),
            webhooks: Vec::new(),
        }
    }
}

/// On-disk snapshot format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub variant: HostVariant,
    pub server_url: String,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub repositories: Vec<RepositorySnapshot>,
}

#[derive(Default)]
struct Failures {
    pull_requests: HashMap<u64, HostError>,
    refs: HashMap<String, HostError>,
    operations: HashMap<&'static str, HostError>,
}

pub struct SnapshotHost {
    variant: HostVariant,
    server_url: String,
    teams: Vec<Team>,
    repositories: Mutex<Vec<RepositorySnapshot>>,
    failures: Mutex<Failures>,
    calls: Mutex<HashMap<&'static str, usize>>,
    webhook_log: Mutex<Vec<String>>,
    next_hook_id: AtomicU64,
}

impl SnapshotHost {
    pub fn new(variant: HostVariant, server_url: impl Into<String>) -> Self {
        Self {
            variant,
            server_url: server_url.into(),
            teams: Vec::new(),
            repositories: Mutex::new(Vec::new()),
            failures: Mutex::new(Failures::default()),
            calls: Mutex::new(HashMap::new()),
            webhook_log: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
        }
    }

    pub fn from_file(file: SnapshotFile) -> Self {
        let mut host = Self::new(file.variant, file.server_url);
        host.teams = file.teams;
        host.repositories = Mutex::new(file.repositories);
        host
    }

    /// Load a snapshot from a JSON file.
    pub fn load(path: &Path) -> Result<Self, HostError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HostError::Unavailable(format!("{}: {e}", path.display())))?;
        let file: SnapshotFile = serde_json::from_str(&content)
            .map_err(|e| HostError::Malformed(format!("{}: {e}", path.display())))?;
        Ok(Self::from_file(file))
    }

    pub fn with_team(mut self, team: Team) -> Self {
        self.teams.push(team);
        self
    }

    pub fn with_repository(self, snapshot: RepositorySnapshot) -> Self {
        self.lock_repositories().push(snapshot);
        self
    }

    /// Replace the stored state of a repository (or add it).
    pub fn put_repository(&self, snapshot: RepositorySnapshot) {
        let mut repos = self.lock_repositories();
        let key = snapshot.repository.repo_ref();
        repos.retain(|r| r.repository.repo_ref() != key);
        repos.push(snapshot);
    }

    pub fn fail_pull_request(&self, id: u64, error: HostError) {
        self.lock_failures().pull_requests.insert(id, error);
    }

    pub fn fail_ref(&self, name: &str, error: HostError) {
        self.lock_failures().refs.insert(name.to_string(), error);
    }

    pub fn fail_operation(&self, operation: &'static str, error: HostError) {
        self.lock_failures().operations.insert(operation, error);
    }

    /// Number of calls made to `operation` so far.
    pub fn calls(&self, operation: &str) -> usize {
        self.lock_calls().get(operation).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock_calls().values().sum()
    }

    pub fn reset_calls(&self) {
        self.lock_calls().clear();
    }

    /// Ordered log of webhook mutations (`register:<repo>`, `remove:<repo>:<id>`).
    pub fn webhook_log(&self) -> Vec<String> {
        self.lock_webhook_log().clone()
    }

    pub fn webhooks(&self, repo: &RepoRef) -> Vec<WebhookRegistration> {
        self.lock_repositories()
            .iter()
            .find(|r| &r.repository.repo_ref() == repo)
            .map(|r| r.webhooks.clone())
            .unwrap_or_default()
    }

    fn lock_repositories(&self) -> std::sync::MutexGuard<'_, Vec<RepositorySnapshot>> {
        self.repositories
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, Failures> {
        self.failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_calls(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, usize>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_webhook_log(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.webhook_log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, operation: &'static str) -> HostResult<()> {
        *self.lock_calls().entry(operation).or_insert(0) += 1;
        match self.lock_failures().operations.get(operation) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_ref(&self, name: &str) -> HostResult<()> {
        match self.lock_failures().refs.get(name) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_pull_request(&self, id: u64) -> HostResult<()> {
        match self.lock_failures().pull_requests.get(&id) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn with_repo<T>(
        &self,
        repo: &RepoRef,
        f: impl FnOnce(&RepositorySnapshot) -> T,
    ) -> HostResult<T> {
        let repos = self.lock_repositories();
        repos
            .iter()
            .find(|r| &r.repository.repo_ref() == repo)
            .map(f)
            .ok_or_else(|| HostError::NotFound(format!("repository {repo}")))
    }

    fn with_repo_mut<T>(
        &self,
        repo: &RepoRef,
        f: impl FnOnce(&mut RepositorySnapshot) -> T,
    ) -> HostResult<T> {
        let mut repos = self.lock_repositories();
        repos
            .iter_mut()
            .find(|r| &r.repository.repo_ref() == repo)
            .map(f)
            .ok_or_else(|| HostError::NotFound(format!("repository {repo}")))
    }

    fn listed(&self, pr: &PullRequest) -> PullRequest {
        let mut listed = pr.clone();
        if self.variant == HostVariant::Server {
            listed.initialized = false;
            listed.changed_files = None;
        }
        listed
    }

    fn open_pull_requests_matching(
        &self,
        repo: &RepoRef,
        matches: impl Fn(&PullRequest) -> bool,
    ) -> HostResult<Vec<PullRequest>> {
        self.with_repo(repo, |r| {
            r.pull_requests
                .iter()
                .filter(|pr| pr.state == PullRequestState::Open && matches(pr))
                .cloned()
                .collect()
        })
    }
}

impl HostApi for SnapshotHost {
    fn variant(&self) -> HostVariant {
        self.variant
    }

    fn server_url(&self) -> &str {
        &self.server_url
    }

    fn get_team(&self, owner: &str) -> HostResult<Option<Team>> {
        self.enter("get_team")?;
        Ok(self
            .teams
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(owner))
            .cloned())
    }

    fn get_repositories(
        &self,
        owner: &str,
        role: Option<RepositoryRole>,
    ) -> HostResult<Vec<Repository>> {
        self.enter("get_repositories")?;
        Ok(self
            .lock_repositories()
            .iter()
            .map(|r| &r.repository)
            .filter(|r| r.owner.eq_ignore_ascii_case(owner))
            .filter(|r| role.is_none_or(|role| r.roles.contains(&role)))
            .cloned()
            .collect())
    }

    fn get_repository(&self, repo: &RepoRef) -> HostResult<Repository> {
        self.enter("get_repository")?;
        self.with_repo(repo, |r| r.repository.clone())
    }

    fn get_branches(&self, repo: &RepoRef) -> HostResult<Vec<Branch>> {
        self.enter("get_branches")?;
        self.with_repo(repo, |r| r.branches.clone())
    }

    fn get_branch(&self, repo: &RepoRef, name: &str) -> HostResult<Option<Branch>> {
        self.enter("get_branch")?;
        self.check_ref(name)?;
        self.with_repo(repo, |r| r.branches.iter().find(|b| b.name == name).cloned())
    }

    fn get_tags(&self, repo: &RepoRef) -> HostResult<Vec<Tag>> {
        self.enter("get_tags")?;
        self.with_repo(repo, |r| r.tags.clone())
    }

    fn get_tag(&self, repo: &RepoRef, name: &str) -> HostResult<Option<Tag>> {
        self.enter("get_tag")?;
        self.check_ref(name)?;
        self.with_repo(repo, |r| r.tags.iter().find(|t| t.name == name).cloned())
    }

    fn get_pull_requests(&self, repo: &RepoRef) -> HostResult<Vec<PullRequest>> {
        self.enter("get_pull_requests")?;
        self.with_repo(repo, |r| {
            r.pull_requests
                .iter()
                .filter(|pr| pr.state == PullRequestState::Open)
                .map(|pr| self.listed(pr))
                .collect()
        })
    }

    fn get_pull_request(&self, repo: &RepoRef, id: u64) -> HostResult<Option<PullRequest>> {
        self.enter("get_pull_request")?;
        self.check_pull_request(id)?;
        self.with_repo(repo, |r| r.pull_requests.iter().find(|pr| pr.id == id).cloned())
    }

    fn initialize_pull_request(&self, repo: &RepoRef, pr: &mut PullRequest) -> HostResult<()> {
        self.enter("initialize_pull_request")?;
        self.check_pull_request(pr.id)?;
        let full = self.with_repo(repo, |r| {
            r.pull_requests.iter().find(|p| p.id == pr.id).cloned()
        })?;
        let full = full.ok_or_else(|| HostError::NotFound(format!("pull request {}", pr.id)))?;
        pr.changed_files = Some(full.changed_files.unwrap_or_default());
        pr.initialized = true;
        Ok(())
    }

    fn resolve_commit(&self, repo: &RepoRef, hash: &str) -> HostResult<Option<Commit>> {
        self.enter("resolve_commit")?;
        if hash.is_empty() {
            return Ok(None);
        }
        self.with_repo(repo, |r| {
            r.commits
                .iter()
                .cloned()
                .chain(r.branches.iter().filter_map(Branch::commit))
                .find(|c| c.hash.starts_with(hash))
        })
    }

    fn get_mirrors(&self, repo: &RepoRef) -> HostResult<Vec<MirrorServer>> {
        self.enter("get_mirrors")?;
        self.with_repo(repo, |r| r.mirrors.clone())
    }

    fn get_mirrored_repository(
        &self,
        repo: &RepoRef,
        mirror_id: &str,
    ) -> HostResult<Option<MirroredRepository>> {
        self.enter("get_mirrored_repository")?;
        self.with_repo(repo, |r| {
            r.mirrored.iter().find(|m| m.mirror_id == mirror_id).cloned()
        })
    }

    fn get_outgoing_open_pull_requests(
        &self,
        repo: &RepoRef,
        ref_id: &str,
    ) -> HostResult<Vec<PullRequest>> {
        self.enter("get_outgoing_open_pull_requests")?;
        let branch = display_ref_name(ref_id);
        self.open_pull_requests_matching(repo, |pr| {
            &pr.source.repository == repo && pr.source.branch == branch
        })
    }

    fn get_incoming_open_pull_requests(
        &self,
        repo: &RepoRef,
        ref_id: &str,
    ) -> HostResult<Vec<PullRequest>> {
        self.enter("get_incoming_open_pull_requests")?;
        let branch = display_ref_name(ref_id);
        self.open_pull_requests_matching(repo, |pr| pr.destination.branch == branch)
    }

    fn list_webhooks(&self, repo: &RepoRef) -> HostResult<Vec<WebhookRegistration>> {
        self.enter("list_webhooks")?;
        self.with_repo(repo, |r| r.webhooks.clone())
    }

    fn register_webhook(
        &self,
        repo: &RepoRef,
        hook: &WebhookRegistration,
    ) -> HostResult<WebhookRegistration> {
        self.enter("register_webhook")?;
        let mut registered = hook.clone();
        registered.id = Some(self.next_hook_id.fetch_add(1, Ordering::SeqCst).to_string());
        self.with_repo_mut(repo, |r| r.webhooks.push(registered.clone()))?;
        self.lock_webhook_log().push(format!("register:{repo}"));
        Ok(registered)
    }

    fn update_webhook(&self, repo: &RepoRef, hook: &WebhookRegistration) -> HostResult<()> {
        self.enter("update_webhook")?;
        let updated = self.with_repo_mut(repo, |r| {
            match r.webhooks.iter_mut().find(|h| h.id.is_some() && h.id == hook.id) {
                Some(existing) => {
                    *existing = hook.clone();
                    true
                }
                None => false,
            }
        })?;
        if !updated {
            return Err(HostError::NotFound(format!("webhook {:?}", hook.id)));
        }
        self.lock_webhook_log().push(format!("update:{repo}"));
        Ok(())
    }

    fn remove_webhook(&self, repo: &RepoRef, id: &str) -> HostResult<()> {
        self.enter("remove_webhook")?;
        self.with_repo_mut(repo, |r| r.webhooks.retain(|h| h.id.as_deref() != Some(id)))?;
        self.lock_webhook_log().push(format!("remove:{repo}:{id}"));
        Ok(())
    }
}
