//! Wire shapes of webhook payloads.
//!
//! Cloud and plugin-managed server hooks share the cloud layout; native
//! server hooks use camelCase objects keyed by `fromRef`/`toRef`. Only the
//! fields the normalizer reads are modelled.

use crate::head::{CommitRevision, UpdateKind};
use crate::host::{Commit, PullRequest, PullRequestEndpoint, PullRequestState, display_ref_name};
use crate::types::RepoRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// RFC 3339 strings or epoch milliseconds; anything else is dropped.
fn lenient_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        Some(Value::Number(n)) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    })
}

// ── Shared ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadProject {
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadRepository {
    #[serde(default, alias = "fullName")]
    pub full_name: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub project: Option<PayloadProject>,
}

impl PayloadRepository {
    pub fn repo_ref(&self) -> Option<RepoRef> {
        if let Some(repo) = self.full_name.as_deref().and_then(RepoRef::from_full_name) {
            return Some(repo);
        }
        match (&self.project, &self.slug) {
            (Some(project), Some(slug)) => Some(RepoRef::new(&project.key, slug)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayloadUser {
    #[serde(default, alias = "displayName")]
    pub display_name: Option<String>,
    #[serde(default, alias = "name")]
    pub nickname: Option<String>,
}

impl PayloadUser {
    /// Login-ish identifier, falling back to the display name.
    pub fn identity(&self) -> Option<String> {
        self.nickname.clone().or_else(|| self.display_name.clone())
    }
}

fn link_href(links: Option<&Value>) -> Option<String> {
    let links = links?;
    links
        .pointer("/html/href")
        .or_else(|| links.pointer("/self/0/href"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn pull_request_state(state: Option<&str>) -> PullRequestState {
    match state.map(str::to_ascii_uppercase).as_deref() {
        Some("MERGED" | "FULFILLED") => PullRequestState::Merged,
        Some("DECLINED" | "REJECTED") => PullRequestState::Declined,
        _ => PullRequestState::Open,
    }
}

// ── Cloud / plugin push ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PushPayload {
    pub repository: PayloadRepository,
    pub push: PushBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushBody {
    #[serde(default)]
    pub changes: Vec<PushChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushChange {
    #[serde(default)]
    pub new: Option<RefState>,
    #[serde(default)]
    pub old: Option<RefState>,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub closed: bool,
}

impl PushChange {
    pub fn kind(&self) -> UpdateKind {
        if self.closed || self.new.is_none() {
            UpdateKind::Removed
        } else if self.created || self.old.is_none() {
            UpdateKind::Created
        } else {
            UpdateKind::Updated
        }
    }

    /// The ref state naming the change (new side unless removed).
    pub fn subject(&self) -> Option<&RefState> {
        self.new.as_ref().or(self.old.as_ref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefState {
    /// `branch`, `named_branch`, `bookmark` or `tag`.
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub target: Option<PushTarget>,
}

impl RefState {
    pub fn is_tag(&self) -> bool {
        self.kind.eq_ignore_ascii_case("tag")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushTarget {
    pub hash: String,
    #[serde(default, deserialize_with = "lenient_date")]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub author: Option<PushAuthor>,
}

impl PushTarget {
    pub fn to_revision(&self) -> CommitRevision {
        CommitRevision {
            hash: self.hash.clone(),
            author: self.author.as_ref().and_then(PushAuthor::name),
            message: self.message.clone(),
            date: self.date,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PushAuthor {
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub user: Option<PayloadUser>,
}

impl PushAuthor {
    fn name(&self) -> Option<String> {
        self.user
            .as_ref()
            .and_then(|u| u.display_name.clone())
            .or_else(|| self.raw.clone())
    }
}

// ── Cloud / plugin pull request ────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
    #[serde(default)]
    pub repository: Option<PayloadRepository>,
    pub pullrequest: CloudPullRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudPullRequest {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub author: Option<PayloadUser>,
    pub source: CloudPullRequestSide,
    pub destination: CloudPullRequestSide,
    #[serde(default)]
    pub links: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CloudPullRequestSide {
    pub branch: NamedBranch,
    #[serde(default)]
    pub commit: Option<CommitRef>,
    #[serde(default)]
    pub repository: Option<PayloadRepository>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedBranch {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitRef {
    pub hash: String,
}

impl CloudPullRequestSide {
    fn to_endpoint(&self, fallback: &RepoRef) -> PullRequestEndpoint {
        PullRequestEndpoint {
            repository: self
                .repository
                .as_ref()
                .and_then(PayloadRepository::repo_ref)
                .unwrap_or_else(|| fallback.clone()),
            branch: self.branch.name.clone(),
            commit: self.commit.as_ref().map(|c| Commit::bare(&c.hash)),
        }
    }
}

impl CloudPullRequest {
    /// `fallback` stands in for sides whose repository was omitted (deleted forks).
    pub fn to_pull_request(&self, fallback: &RepoRef) -> PullRequest {
        PullRequest {
            id: self.id,
            title: self.title.clone(),
            author: self.author.as_ref().and_then(PayloadUser::identity),
            link: link_href(self.links.as_ref()),
            state: pull_request_state(self.state.as_deref()),
            source: self.source.to_endpoint(fallback),
            destination: self.destination.to_endpoint(fallback),
            initialized: true,
            changed_files: None,
        }
    }
}

// ── Native server ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPullRequestPayload {
    pub pull_request: ServerPullRequest,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPullRequest {
    pub id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub author: Option<ServerParticipant>,
    pub from_ref: ServerPullRequestRef,
    pub to_ref: ServerPullRequestRef,
    #[serde(default)]
    pub links: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerParticipant {
    #[serde(default)]
    pub user: PayloadUser,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPullRequestRef {
    pub id: String,
    #[serde(default)]
    pub display_id: Option<String>,
    #[serde(default)]
    pub latest_commit: Option<String>,
    pub repository: PayloadRepository,
}

impl ServerPullRequestRef {
    fn to_endpoint(&self) -> Option<PullRequestEndpoint> {
        Some(PullRequestEndpoint {
            repository: self.repository.repo_ref()?,
            branch: self
                .display_id
                .clone()
                .unwrap_or_else(|| display_ref_name(&self.id).to_string()),
            commit: self.latest_commit.as_deref().map(Commit::bare),
        })
    }
}

impl ServerPullRequest {
    pub fn to_pull_request(&self) -> Option<PullRequest> {
        Some(PullRequest {
            id: self.id,
            title: self.title.clone(),
            author: self.author.as_ref().and_then(|a| a.user.identity()),
            link: link_href(self.links.as_ref()),
            state: pull_request_state(self.state.as_deref()),
            source: self.from_ref.to_endpoint()?,
            destination: self.to_ref.to_endpoint()?,
            initialized: true,
            changed_files: None,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefsChangedPayload {
    pub repository: PayloadRepository,
    #[serde(default)]
    pub changes: Vec<RefChange>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSyncPayload {
    #[serde(default)]
    pub mirror_server: Option<MirrorServerRef>,
    pub repository: PayloadRepository,
    #[serde(default)]
    pub ref_limit_exceeded: bool,
    #[serde(default)]
    pub changes: Vec<RefChange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorServerRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefChange {
    #[serde(default, rename = "ref")]
    pub reference: Option<ServerRef>,
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub from_hash: Option<String>,
    #[serde(default)]
    pub to_hash: Option<String>,
    /// `ADD`, `UPDATE` or `DELETE`.
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRef {
    pub id: String,
    #[serde(default)]
    pub display_id: Option<String>,
    /// `BRANCH` or `TAG`.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl RefChange {
    pub fn ref_id(&self) -> Option<&str> {
        self.reference
            .as_ref()
            .map(|r| r.id.as_str())
            .or(self.ref_id.as_deref())
    }

    pub fn display_name(&self) -> Option<String> {
        if let Some(display) = self.reference.as_ref().and_then(|r| r.display_id.clone()) {
            return Some(display);
        }
        self.ref_id().map(|id| display_ref_name(id).to_string())
    }

    pub fn is_tag(&self) -> bool {
        match self.reference.as_ref().and_then(|r| r.kind.as_deref()) {
            Some(kind) => kind.eq_ignore_ascii_case("tag"),
            None => self.ref_id().is_some_and(|id| id.starts_with("refs/tags/")),
        }
    }

    pub fn update_kind(&self) -> UpdateKind {
        match self.kind.to_ascii_uppercase().as_str() {
            "ADD" => UpdateKind::Created,
            "DELETE" => UpdateKind::Removed,
            _ => UpdateKind::Updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_repository_identification() {
        let cloud: PayloadRepository =
            serde_json::from_value(json!({"full_name": "acme/widgets", "project": {"key": "P"}}))
                .unwrap();
        assert_eq!(cloud.repo_ref(), Some(RepoRef::new("acme", "widgets")));

        let plugin: PayloadRepository =
            serde_json::from_value(json!({"fullName": "PROJ/core"})).unwrap();
        assert_eq!(plugin.repo_ref(), Some(RepoRef::new("PROJ", "core")));

        let native: PayloadRepository =
            serde_json::from_value(json!({"slug": "core", "project": {"key": "PROJ"}})).unwrap();
        assert_eq!(native.repo_ref(), Some(RepoRef::new("PROJ", "core")));

        let empty: PayloadRepository = serde_json::from_value(json!({})).unwrap();
        assert!(empty.repo_ref().is_none());
    }

    #[test]
    fn test_push_change_kinds() {
        let change: PushChange = serde_json::from_value(json!({
            "new": {"type": "branch", "name": "main", "target": {"hash": "abc"}},
            "old": null,
            "created": true,
            "closed": false
        }))
        .unwrap();
        assert_eq!(change.kind(), UpdateKind::Created);

        let removed: PushChange = serde_json::from_value(json!({
            "old": {"type": "tag", "name": "v1"},
            "closed": true
        }))
        .unwrap();
        assert_eq!(removed.kind(), UpdateKind::Removed);
        assert!(removed.subject().unwrap().is_tag());
    }

    #[test]
    fn test_lenient_dates() {
        let iso: PushTarget =
            serde_json::from_value(json!({"hash": "a", "date": "2024-03-01T10:00:00+00:00"}))
                .unwrap();
        assert!(iso.date.is_some());

        let millis: PushTarget =
            serde_json::from_value(json!({"hash": "a", "date": 1_709_287_200_000_i64})).unwrap();
        assert_eq!(millis.date, iso.date);

        let junk: PushTarget =
            serde_json::from_value(json!({"hash": "a", "date": "yesterday"})).unwrap();
        assert!(junk.date.is_none());
    }

    #[test]
    fn test_ref_change_names_and_kinds() {
        let change: RefChange = serde_json::from_value(json!({
            "ref": {"id": "refs/tags/v2", "displayId": "v2", "type": "TAG"},
            "refId": "refs/tags/v2",
            "fromHash": "0000000000000000000000000000000000000000",
            "toHash": "abc",
            "type": "ADD"
        }))
        .unwrap();
        assert_eq!(change.display_name().as_deref(), Some("v2"));
        assert!(change.is_tag());
        assert_eq!(change.update_kind(), UpdateKind::Created);

        let bare: RefChange = serde_json::from_value(json!({
            "refId": "refs/heads/feature/x",
            "type": "DELETE"
        }))
        .unwrap();
        assert_eq!(bare.display_name().as_deref(), Some("feature/x"));
        assert!(!bare.is_tag());
        assert_eq!(bare.update_kind(), UpdateKind::Removed);
    }

    #[test]
    fn test_server_pull_request_conversion() {
        let payload: ServerPullRequestPayload = serde_json::from_value(json!({
            "pullRequest": {
                "id": 12,
                "title": "Fix",
                "state": "OPEN",
                "author": {"user": {"name": "jdoe", "displayName": "J. Doe"}},
                "fromRef": {
                    "id": "refs/heads/fix",
                    "displayId": "fix",
                    "latestCommit": "abc",
                    "repository": {"slug": "core", "project": {"key": "~JDOE"}}
                },
                "toRef": {
                    "id": "refs/heads/main",
                    "latestCommit": "def",
                    "repository": {"slug": "core", "project": {"key": "PROJ"}}
                },
                "links": {"self": [{"href": "https://scm.example.com/pr/12"}]}
            }
        }))
        .unwrap();
        let pr = payload.pull_request.to_pull_request().unwrap();
        assert_eq!(pr.author.as_deref(), Some("jdoe"));
        assert_eq!(pr.source.repository, RepoRef::new("~jdoe", "core"));
        assert_eq!(pr.destination.branch, "main");
        assert_eq!(pr.link.as_deref(), Some("https://scm.example.com/pr/12"));
    }
}
