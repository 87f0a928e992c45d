//! Snapshot fixtures shared by the integration tests.

use bbs_common::host::{
    Branch, CloneLink, Commit, MirrorServer, MirroredRepository, PullRequest, PullRequestEndpoint,
    PullRequestState, Repository, RepositorySnapshot, SnapshotFile, Tag,
};
use bbs_common::{HostVariant, RepoRef, SnapshotHost};
use std::path::Path;

pub const SERVER_URL: &str = "https://scm.example.com";
pub const MAIN: &str = "1111111111111111111111111111111111111111";
pub const FEATURE: &str = "2222222222222222222222222222222222222222";
pub const FORK: &str = "3333333333333333333333333333333333333333";
pub const RELEASE: &str = "4444444444444444444444444444444444444444";

pub fn core_repo() -> RepoRef {
    RepoRef::new("PROJ", "core")
}

pub fn branch(name: &str, hash: &str) -> Branch {
    Branch {
        name: name.into(),
        hash: Some(hash.into()),
        author: Some("jdoe".into()),
        message: Some(format!("tip of {name}")),
        date: None,
    }
}

pub fn pull_request(id: u64, source: RepoRef, source_branch: &str, hash: &str) -> PullRequest {
    PullRequest {
        id,
        title: format!("Change #{id}"),
        author: Some("jdoe".into()),
        link: Some(format!("{SERVER_URL}/projects/PROJ/repos/core/pull-requests/{id}")),
        state: PullRequestState::Open,
        source: PullRequestEndpoint {
            repository: source,
            branch: source_branch.into(),
            commit: Some(Commit::bare(hash)),
        },
        destination: PullRequestEndpoint {
            repository: core_repo(),
            branch: "main".into(),
            commit: Some(Commit::bare(MAIN)),
        },
        initialized: false,
        changed_files: None,
    }
}

/// A server repository with two branches, a tag, an origin pull request,
/// a fork pull request and one enabled mirror.
pub fn core_snapshot() -> RepositorySnapshot {
    let mut snapshot = RepositorySnapshot::new(Repository {
        owner: "PROJ".into(),
        slug: "core".into(),
        private: true,
        clone_links: vec![
            CloneLink::new("http", format!("{SERVER_URL}/scm/proj/core.git")),
            CloneLink::new("ssh", "ssh://git@scm.example.com:7999/proj/core.git"),
        ],
        project_key: Some("PROJ".into()),
        main_branch: Some("main".into()),
        roles: vec![],
    });
    snapshot.branches = vec![branch("main", MAIN), branch("feature", FEATURE)];
    snapshot.tags = vec![Tag {
        name: "v2.0".into(),
        hash: Some(RELEASE.into()),
        date: None,
        author: None,
        message: None,
    }];
    snapshot.pull_requests = vec![
        pull_request(11, core_repo(), "feature", FEATURE),
        pull_request(12, RepoRef::new("~mallory", "core"), "patch", FORK),
    ];
    snapshot.mirrors = vec![MirrorServer {
        id: "mirror-eu".into(),
        name: "EU mirror".into(),
        enabled: true,
    }];
    snapshot.mirrored = vec![MirroredRepository {
        mirror_id: "mirror-eu".into(),
        available: true,
        clone_links: vec![CloneLink::new(
            "http",
            "https://mirror-eu.example.com/scm/proj/core.git",
        )],
    }];
    snapshot
}

pub fn snapshot_file() -> SnapshotFile {
    SnapshotFile {
        variant: HostVariant::Server,
        server_url: SERVER_URL.into(),
        teams: vec![],
        repositories: vec![core_snapshot()],
    }
}

/// Write the fixture to `dir` and load it back, the way the daemon does.
pub fn load_server_host(dir: &Path) -> SnapshotHost {
    let path = dir.join("snapshot.json");
    std::fs::write(&path, serde_json::to_string_pretty(&snapshot_file()).unwrap()).unwrap();
    SnapshotHost::load(&path).unwrap()
}
