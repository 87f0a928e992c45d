//! Webhook deliveries normalized against configured sources.

use super::common::fixtures::{self, FEATURE, FORK, MAIN};
use super::common::init_test_logging;
use bbs_common::{
    BbsConfig, EventNormalizer, HostVariant, NormalizedEvent, NormalizerSettings, Revision,
    UpdateKind, WebhookEvent,
};
use serde_json::{Value, json};

const CONFIG: &str = r#"
[[endpoints]]
server_url = "https://scm.example.com"
variant = "server"
credential_id = "svc-ci"

[defaults]
fork_trust = "nobody"

[[sources]]
server_url = "https://scm.example.com"
owner = "PROJ"
repository = "core"
"#;

fn server_event(key: &str, body: Value) -> WebhookEvent {
    WebhookEvent::new(
        Some(key),
        HostVariant::Server,
        fixtures::SERVER_URL,
        "127.0.0.1",
        serde_json::to_vec(&body).unwrap(),
    )
    .unwrap()
}

fn repository() -> Value {
    json!({"slug": "core", "project": {"key": "PROJ"}})
}

fn settings(config: &BbsConfig) -> NormalizerSettings {
    NormalizerSettings {
        scan_on_empty_changes: config.general.scan_on_empty_changes,
        credential_id: config
            .endpoint(fixtures::SERVER_URL)
            .and_then(|e| e.credential_id.clone()),
    }
}

#[test]
fn test_branch_push_refreshes_outgoing_pull_request() {
    init_test_logging();
    crate::test_log!("TEST START: test_branch_push_refreshes_outgoing_pull_request");

    let dir = tempfile::tempdir().unwrap();
    let host = fixtures::load_server_host(dir.path());
    let config = BbsConfig::parse(CONFIG, std::path::Path::new("bbs.toml")).unwrap();
    let sources = config.branch_sources().unwrap();
    let normalizer = EventNormalizer::new(&host, &sources, settings(&config));

    let body = json!({
        "repository": repository(),
        "changes": [{
            "ref": {"id": "refs/heads/feature", "displayId": "feature", "type": "BRANCH"},
            "refId": "refs/heads/feature",
            "fromHash": MAIN,
            "toHash": FEATURE,
            "type": "UPDATE"
        }]
    });
    let normalized = normalizer
        .normalize(&server_event("repo:refs_changed", body))
        .unwrap();

    let names: Vec<&str> = normalized.updates().iter().map(|u| u.head.name()).collect();
    assert_eq!(names, vec!["feature", "PR-11"]);
    let pr_update = &normalized.updates()[1];
    assert_eq!(pr_update.kind, UpdateKind::Updated);
    assert!(matches!(
        pr_update.revision,
        Some(Revision::PullRequest { .. })
    ));
    assert!(sources.iter().all(|s| normalized.updates().iter().all(|u| s.accepts(u))));

    crate::test_log!("TEST PASS: test_branch_push_refreshes_outgoing_pull_request");
}

#[test]
fn test_native_pull_request_lifecycle() {
    init_test_logging();
    crate::test_log!("TEST START: test_native_pull_request_lifecycle");

    let dir = tempfile::tempdir().unwrap();
    let host = fixtures::load_server_host(dir.path());
    let config = BbsConfig::parse(CONFIG, std::path::Path::new("bbs.toml")).unwrap();
    let sources = config.branch_sources().unwrap();
    let normalizer = EventNormalizer::new(&host, &sources, settings(&config));

    let pull_request = |state: &str| {
        json!({
            "pullRequest": {
                "id": 11,
                "title": "Change #11",
                "state": state,
                "author": {"user": {"displayName": "J. Doe", "name": "jdoe"}},
                "fromRef": {
                    "id": "refs/heads/feature",
                    "displayId": "feature",
                    "latestCommit": FEATURE,
                    "repository": repository()
                },
                "toRef": {
                    "id": "refs/heads/main",
                    "displayId": "main",
                    "latestCommit": MAIN,
                    "repository": repository()
                }
            }
        })
    };

    let opened = normalizer
        .normalize(&server_event("pr:opened", pull_request("OPEN")))
        .unwrap();
    let update = &opened.updates()[0];
    assert_eq!(update.head.name(), "PR-11");
    assert_eq!(update.kind, UpdateKind::Created);
    assert_eq!(update.revision.as_ref().unwrap().hash(), FEATURE);
    assert_eq!(
        sources[0].metadata().get(11).unwrap().title,
        "Change #11"
    );

    host.reset_calls();
    let merged = normalizer
        .normalize(&server_event("pr:merged", pull_request("MERGED")))
        .unwrap();
    assert!(merged.updates().iter().all(|u| u.is_tombstone()));
    assert_eq!(host.total_calls(), 0);

    crate::test_log!("TEST PASS: test_native_pull_request_lifecycle");
}

#[test]
fn test_ping_and_limit_exceeded_mirror_sync() {
    init_test_logging();
    crate::test_log!("TEST START: test_ping_and_limit_exceeded_mirror_sync");

    let dir = tempfile::tempdir().unwrap();
    let host = fixtures::load_server_host(dir.path());
    let normalizer = EventNormalizer::new(&host, &[], NormalizerSettings::default());

    let ping = normalizer
        .normalize(&server_event("diagnostics:ping", json!({"test": true})))
        .unwrap();
    assert!(matches!(ping, NormalizedEvent::Acknowledge));

    let sync = normalizer
        .normalize(&server_event(
            "mirror:repo_synchronized",
            json!({
                "mirrorServer": {"id": "mirror-eu", "name": "EU mirror"},
                "repository": repository(),
                "refLimitExceeded": true,
                "changes": []
            }),
        ))
        .unwrap();
    let rescan = sync.rescan().unwrap();
    assert_eq!(rescan.mirror_id.as_deref(), Some("mirror-eu"));
    assert_eq!(rescan.repository, fixtures::core_repo());

    crate::test_log!("TEST PASS: test_ping_and_limit_exceeded_mirror_sync");
}

fn fork_opened() -> Value {
    json!({
        "pullRequest": {
            "id": 12,
            "title": "Change #12",
            "state": "OPEN",
            "author": {"user": {"displayName": "Mallory", "name": "mallory"}},
            "fromRef": {
                "id": "refs/heads/patch",
                "displayId": "patch",
                "latestCommit": FORK,
                "repository": {"slug": "core", "project": {"key": "~mallory"}}
            },
            "toRef": {
                "id": "refs/heads/main",
                "displayId": "main",
                "latestCommit": MAIN,
                "repository": repository()
            }
        }
    })
}

#[test]
fn test_fork_pull_request_event_updates_source_trust() {
    init_test_logging();
    crate::test_log!("TEST START: test_fork_pull_request_event_updates_source_trust");

    let dir = tempfile::tempdir().unwrap();
    let host = fixtures::load_server_host(dir.path());
    let trusting = CONFIG.replace("fork_trust = \"nobody\"", "fork_trust = \"everyone\"");

    for (config_text, trusted) in [(CONFIG.to_string(), false), (trusting, true)] {
        let config = BbsConfig::parse(&config_text, std::path::Path::new("bbs.toml")).unwrap();
        let sources = config.branch_sources().unwrap();
        let normalizer = EventNormalizer::new(&host, &sources, settings(&config));

        let opened = normalizer
            .normalize(&server_event("pr:opened", fork_opened()))
            .unwrap();
        let update = &opened.updates()[0];
        assert_eq!(update.head.name(), "PR-12");
        assert_eq!(sources[0].is_trusted(&update.head), trusted);

        let revision = update.revision.as_ref().unwrap();
        let expected = if trusted { FORK } else { MAIN };
        assert_eq!(
            sources[0].trusted_revision(&update.head, revision).hash(),
            expected
        );
    }

    crate::test_log!("TEST PASS: test_fork_pull_request_event_updates_source_trust");
}
