//! Full scans of a snapshot-backed server repository.

use super::common::fixtures::{self, FEATURE, FORK, MAIN, RELEASE};
use super::common::init_test_logging;
use bbs_common::host::HostApi;
use bbs_common::{
    BbsConfig, CollectingObserver, DiscoveryTraits, ForkTrustPolicy, Head, Probe, Protocol,
    RemoteDescriptor, RequestScope, Revision,
};
use std::collections::BTreeSet;

fn config(tags: bool, fork_trust: &str) -> BbsConfig {
    let toml = format!(
        r#"
[[endpoints]]
server_url = "{url}"
variant = "server"
mirror_id = "mirror-eu"

[defaults]
tags = {tags}
fork_trust = "{fork_trust}"

[[sources]]
server_url = "{url}"
owner = "PROJ"
repository = "core"
"#,
        url = fixtures::SERVER_URL
    );
    BbsConfig::parse(&toml, std::path::Path::new("test.toml")).unwrap()
}

fn at_feature_tip(probe: &mut Probe<'_>) -> bool {
    probe
        .revision()
        .is_some_and(|revision| revision.hash() == FEATURE)
}

fn names(observer: &CollectingObserver) -> Vec<String> {
    observer
        .observed
        .iter()
        .map(|(head, _)| head.name().to_string())
        .collect()
}

#[test]
fn test_configured_source_scans_loaded_snapshot() {
    init_test_logging();
    crate::test_log!("TEST START: test_configured_source_scans_loaded_snapshot");

    let dir = tempfile::tempdir().unwrap();
    let host = fixtures::load_server_host(dir.path());
    let sources = config(true, "nobody").branch_sources().unwrap();
    assert_eq!(sources.len(), 1);
    let source = &sources[0];
    assert_eq!(source.mirror_id(), Some("mirror-eu"));

    let mut observer = CollectingObserver::new();
    let outcome = source.discover(&host, None, &mut observer).unwrap();

    assert_eq!(names(&observer), vec!["main", "feature", "PR-11", "PR-12", "v2.0"]);
    assert_eq!(outcome.processed, 5);
    assert!(!outcome.completed_early);
    // Server listings arrive uninitialized.
    assert_eq!(host.calls("initialize_pull_request"), 2);
    assert_eq!(source.metadata().len(), 2);

    let (_, tag_revision) = &observer.observed[4];
    assert_eq!(tag_revision.hash(), RELEASE);

    crate::test_log!("TEST PASS: test_configured_source_scans_loaded_snapshot");
}

#[test]
fn test_untrusted_fork_reads_target_revision() {
    init_test_logging();
    crate::test_log!("TEST START: test_untrusted_fork_reads_target_revision");

    let dir = tempfile::tempdir().unwrap();
    let host = fixtures::load_server_host(dir.path());
    let source = config(false, "nobody").branch_sources().unwrap().remove(0);

    let mut observer = CollectingObserver::new();
    source.discover(&host, None, &mut observer).unwrap();

    let (origin_head, origin_revision) = observer
        .observed
        .iter()
        .find(|(head, _)| head.name() == "PR-11")
        .unwrap();
    let (fork_head, fork_revision) = observer
        .observed
        .iter()
        .find(|(head, _)| head.name() == "PR-12")
        .unwrap();

    assert_eq!(fork_revision.hash(), FORK);
    assert!(source.is_trusted(origin_head));
    assert!(!source.is_trusted(fork_head));
    assert_eq!(
        source.trusted_revision(origin_head, origin_revision).hash(),
        FEATURE
    );
    assert_eq!(source.trusted_revision(fork_head, fork_revision).hash(), MAIN);

    let trusting = config(false, "everyone").branch_sources().unwrap().remove(0);
    let mut observer = CollectingObserver::new();
    trusting.discover(&host, None, &mut observer).unwrap();
    let (fork_head, fork_revision) = &observer.observed[3];
    assert_eq!(trusting.trusted_revision(fork_head, fork_revision).hash(), FORK);

    crate::test_log!("TEST PASS: test_untrusted_fork_reads_target_revision");
}

#[test]
fn test_scoped_request_with_criteria_only_touches_wanted_refs() {
    init_test_logging();
    crate::test_log!("TEST START: test_scoped_request_with_criteria_only_touches_wanted_refs");

    let dir = tempfile::tempdir().unwrap();
    let host = fixtures::load_server_host(dir.path());
    let source = config(true, "nobody").branch_sources().unwrap().remove(0);

    let mut request = source.request().with_scope(RequestScope {
        branches: BTreeSet::from(["feature".to_string()]),
        tags: BTreeSet::new(),
        pull_requests: BTreeSet::new(),
    });
    let mut observer = CollectingObserver::new();
    source
        .discover_with(&host, &mut request, Some(&at_feature_tip), &mut observer)
        .unwrap();

    assert_eq!(names(&observer), vec!["feature"]);
    assert_eq!(host.calls("get_pull_requests"), 0);
    assert_eq!(host.calls("get_tags"), 0);
    // A scoped pass keeps previously cached metadata.
    assert!(source.metadata().is_empty());

    crate::test_log!("TEST PASS: test_scoped_request_with_criteria_only_touches_wanted_refs");
}

#[test]
fn test_discovered_heads_map_to_mirror_remotes() {
    init_test_logging();
    crate::test_log!("TEST START: test_discovered_heads_map_to_mirror_remotes");

    let dir = tempfile::tempdir().unwrap();
    let host = fixtures::load_server_host(dir.path());
    let repo = fixtures::core_repo();

    let descriptor =
        RemoteDescriptor::resolve(&host, &repo, Protocol::Http, Some("mirror-eu")).unwrap();
    assert_eq!(
        descriptor.clone_url().unwrap(),
        "https://mirror-eu.example.com/scm/proj/core.git"
    );
    assert_eq!(
        descriptor.primary_url().unwrap(),
        "https://scm.example.com/scm/proj/core.git"
    );

    let branch = descriptor.build_remote(&Head::branch("main"), None).unwrap();
    assert_eq!(
        branch.refspecs,
        vec!["+refs/heads/main:refs/remotes/origin/main".to_string()]
    );

    let traits = DiscoveryTraits {
        branches: false,
        ..DiscoveryTraits::default()
    };
    let source = bbs_common::BranchSource::new(
        fixtures::SERVER_URL,
        repo.clone(),
        traits,
        ForkTrustPolicy::Nobody.build(&[]),
    );
    let mut observer = CollectingObserver::new();
    source.discover(&host, None, &mut observer).unwrap();
    let (head, revision) = &observer.observed[0];
    assert!(matches!(revision, Revision::PullRequest { .. }));

    let remote = descriptor.build_remote(head, Some(revision)).unwrap();
    let merge = remote.merge.expect("origin pull requests build with merge");
    assert_eq!(merge.base, "origin/main");
    assert_eq!(merge.base_hash.as_deref(), Some(MAIN));
    // The primary is kept as a fallback for refs the mirror lacks.
    assert_eq!(remote.extra_remotes.len(), 1);

    let ssh = RemoteDescriptor::resolve(&host, &repo, Protocol::Ssh, None).unwrap();
    assert!(ssh.clone_url().unwrap().starts_with("ssh://"));
    assert!(host.get_mirrors(&repo).unwrap()[0].enabled);

    crate::test_log!("TEST PASS: test_discovered_heads_map_to_mirror_remotes");
}
