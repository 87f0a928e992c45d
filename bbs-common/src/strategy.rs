//! Checkout-strategy fan-out and fork trust classification.
//!
//! A pull request becomes one head per configured checkout strategy. The
//! strategy set depends on whether the pull request comes from the scanned
//! repository (origin) or from a fork.

use crate::head::{HeadOrigin, PullRequestHead};
use crate::types::RepoRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

/// How a pull request is checked out for a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStrategy {
    /// Build the source branch head as-is.
    Head,
    /// Build the result of merging the source into the target branch.
    Merge,
}

impl CheckoutStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Head => "head",
            Self::Merge => "merge",
        }
    }
}

impl std::fmt::Display for CheckoutStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CheckoutStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "head" | "head_only" | "head-only" => Ok(Self::Head),
            "merge" | "merge_with_target" | "merge-with-target" => Ok(Self::Merge),
            other => Err(format!("unknown checkout strategy '{other}'")),
        }
    }
}

/// Strategy sets for origin and fork pull requests, configured independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub origin: BTreeSet<CheckoutStrategy>,
    pub fork: BTreeSet<CheckoutStrategy>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            origin: BTreeSet::from([CheckoutStrategy::Merge]),
            fork: BTreeSet::from([CheckoutStrategy::Head]),
        }
    }
}

impl StrategyConfig {
    pub fn for_origin(&self, origin: &HeadOrigin) -> &BTreeSet<CheckoutStrategy> {
        match origin {
            HeadOrigin::Origin => &self.origin,
            HeadOrigin::Fork { .. } => &self.fork,
        }
    }
}

/// Classify a pull request source against the scanned repository.
pub fn classify_origin(scanned: &RepoRef, source: &RepoRef) -> HeadOrigin {
    if scanned == source {
        return HeadOrigin::Origin;
    }
    let trust_id = if scanned.same_repository(source) {
        format!("fork:{}", source.owner)
    } else {
        format!("fork:{}/{}", source.owner, source.repository)
    };
    HeadOrigin::Fork { trust_id }
}

/// Head name for a pull request given the size of its strategy set.
pub fn pull_request_head_name(id: u64, strategy: CheckoutStrategy, strategy_count: usize) -> String {
    if strategy_count > 1 {
        format!("PR-{id}-{}", strategy.name())
    } else {
        format!("PR-{id}")
    }
}

/// The parts of a pull request needed to build its heads.
#[derive(Debug, Clone, Copy)]
pub struct PullRequestRef<'a> {
    pub id: u64,
    pub source: &'a RepoRef,
    pub source_branch: &'a str,
    pub target_branch: &'a str,
}

/// Expand one pull request into one head per applicable strategy.
pub fn fan_out(
    scanned: &RepoRef,
    pr: PullRequestRef<'_>,
    config: &StrategyConfig,
) -> Vec<PullRequestHead> {
    let origin = classify_origin(scanned, pr.source);
    let strategies = config.for_origin(&origin);
    strategies
        .iter()
        .map(|strategy| PullRequestHead {
            id: pr.id,
            name: pull_request_head_name(pr.id, *strategy, strategies.len()),
            source: pr.source.clone(),
            source_branch: pr.source_branch.to_string(),
            target_branch: pr.target_branch.to_string(),
            strategy: *strategy,
            origin: origin.clone(),
        })
        .collect()
}

// ── Fork trust ─────────────────────────────────────────────────────────────

/// What a trust policy gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct TrustCandidate<'a> {
    pub pull_request_id: u64,
    pub author: Option<&'a str>,
    pub source: &'a RepoRef,
    pub origin: &'a HeadOrigin,
}

/// Pluggable decision on whether a fork's content may be trusted.
pub trait ForkTrust: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_trusted(&self, candidate: &TrustCandidate<'_>) -> bool;
}

pub struct TrustNobody;

impl ForkTrust for TrustNobody {
    fn name(&self) -> &'static str {
        "nobody"
    }

    fn is_trusted(&self, candidate: &TrustCandidate<'_>) -> bool {
        !candidate.origin.is_fork()
    }
}

pub struct TrustEveryone;

impl ForkTrust for TrustEveryone {
    fn name(&self) -> &'static str {
        "everyone"
    }

    fn is_trusted(&self, _candidate: &TrustCandidate<'_>) -> bool {
        true
    }
}

/// Trust forks whose owner or pull request author is a team member.
pub struct TrustTeamMembers {
    members: HashSet<String>,
}

impl TrustTeamMembers {
    pub fn new<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            members: members
                .into_iter()
                .map(|m| m.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }
}

impl ForkTrust for TrustTeamMembers {
    fn name(&self) -> &'static str {
        "team_members"
    }

    fn is_trusted(&self, candidate: &TrustCandidate<'_>) -> bool {
        if !candidate.origin.is_fork() {
            return true;
        }
        let owner = candidate.source.owner.to_ascii_lowercase();
        if self.members.contains(&owner) {
            return true;
        }
        candidate
            .author
            .map(|a| self.members.contains(&a.to_ascii_lowercase()))
            .unwrap_or(false)
    }
}

/// Configured fork trust policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForkTrustPolicy {
    Nobody,
    #[default]
    TeamMembers,
    Everyone,
}

impl ForkTrustPolicy {
    pub fn build(&self, team_members: &[String]) -> Box<dyn ForkTrust> {
        match self {
            Self::Nobody => Box::new(TrustNobody),
            Self::TeamMembers => Box::new(TrustTeamMembers::new(team_members)),
            Self::Everyone => Box::new(TrustEveryone),
        }
    }
}

/// Trust decisions taken once for a discovery or normalization pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustSnapshot {
    evaluated: HashSet<u64>,
    trusted_forks: HashSet<u64>,
}

impl TrustSnapshot {
    pub fn evaluate<'a>(
        policy: &dyn ForkTrust,
        candidates: impl IntoIterator<Item = TrustCandidate<'a>>,
    ) -> Self {
        let mut snapshot = Self::default();
        for candidate in candidates {
            snapshot.evaluated.insert(candidate.pull_request_id);
            if candidate.origin.is_fork() && policy.is_trusted(&candidate) {
                snapshot.trusted_forks.insert(candidate.pull_request_id);
            }
        }
        snapshot
    }

    /// Origin pull requests are always trusted; forks only when evaluated so.
    pub fn is_trusted(&self, head: &PullRequestHead) -> bool {
        match head.origin {
            HeadOrigin::Origin => true,
            HeadOrigin::Fork { .. } => self.trusted_forks.contains(&head.id),
        }
    }

    /// Take over the decisions of a later, partial pass.
    ///
    /// Pull requests `newer` evaluated follow its verdict; all others keep theirs.
    pub fn merge(&mut self, newer: &TrustSnapshot) {
        for id in &newer.evaluated {
            self.evaluated.insert(*id);
            if newer.trusted_forks.contains(id) {
                self.trusted_forks.insert(*id);
            } else {
                self.trusted_forks.remove(id);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.evaluated.is_empty()
    }

    pub fn trusted_fork_count(&self) -> usize {
        self.trusted_forks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn scanned() -> RepoRef {
        RepoRef::new("acme", "widgets")
    }

    #[test]
    fn test_classify_origin_case_insensitive() {
        let source = RepoRef::new("ACME", "Widgets");
        assert_eq!(classify_origin(&scanned(), &source), HeadOrigin::Origin);
    }

    #[test]
    fn test_classify_fork_trust_ids() {
        let same_name = RepoRef::new("alice", "widgets");
        assert_eq!(
            classify_origin(&scanned(), &same_name),
            HeadOrigin::Fork {
                trust_id: "fork:alice".to_string()
            }
        );
        let renamed = RepoRef::new("alice", "gadgets");
        assert_eq!(
            classify_origin(&scanned(), &renamed),
            HeadOrigin::Fork {
                trust_id: "fork:alice/gadgets".to_string()
            }
        );
    }

    #[test]
    fn test_single_strategy_uses_bare_name() {
        let source = scanned();
        let pr = PullRequestRef {
            id: 12,
            source: &source,
            source_branch: "feature",
            target_branch: "main",
        };
        let heads = fan_out(&scanned(), pr, &StrategyConfig::default());
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].name, "PR-12");
        assert_eq!(heads[0].strategy, CheckoutStrategy::Merge);
    }

    #[test]
    fn test_fork_uses_fork_strategies() {
        let fork = RepoRef::new("mallory", "widgets");
        let pr = PullRequestRef {
            id: 3,
            source: &fork,
            source_branch: "feature",
            target_branch: "main",
        };
        let heads = fan_out(&scanned(), pr, &StrategyConfig::default());
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].strategy, CheckoutStrategy::Head);
        assert!(heads[0].origin.is_fork());
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!("HEAD".parse::<CheckoutStrategy>(), Ok(CheckoutStrategy::Head));
        assert_eq!(
            "merge-with-target".parse::<CheckoutStrategy>(),
            Ok(CheckoutStrategy::Merge)
        );
        assert!("rebase".parse::<CheckoutStrategy>().is_err());
    }

    #[test]
    fn test_trust_policies() {
        let fork_source = RepoRef::new("alice", "widgets");
        let origin = classify_origin(&scanned(), &fork_source);
        let candidate = TrustCandidate {
            pull_request_id: 1,
            author: Some("Bob"),
            source: &fork_source,
            origin: &origin,
        };
        assert!(!TrustNobody.is_trusted(&candidate));
        assert!(TrustEveryone.is_trusted(&candidate));
        assert!(TrustTeamMembers::new(["bob"]).is_trusted(&candidate));
        assert!(TrustTeamMembers::new(["ALICE"]).is_trusted(&candidate));
        assert!(!TrustTeamMembers::new(["carol"]).is_trusted(&candidate));
    }

    #[test]
    fn test_trust_snapshot_only_records_forks() {
        let fork_source = RepoRef::new("alice", "widgets");
        let fork = classify_origin(&scanned(), &fork_source);
        let own = scanned();
        let candidates = vec![
            TrustCandidate {
                pull_request_id: 1,
                author: None,
                source: &fork_source,
                origin: &fork,
            },
            TrustCandidate {
                pull_request_id: 2,
                author: None,
                source: &own,
                origin: &HeadOrigin::Origin,
            },
        ];
        let snapshot = TrustSnapshot::evaluate(&TrustEveryone, candidates);
        assert_eq!(snapshot.trusted_fork_count(), 1);

        let heads = fan_out(
            &scanned(),
            PullRequestRef {
                id: 1,
                source: &fork_source,
                source_branch: "f",
                target_branch: "main",
            },
            &StrategyConfig::default(),
        );
        assert!(snapshot.is_trusted(&heads[0]));
        assert!(!TrustSnapshot::default().is_trusted(&heads[0]));
    }

    #[test]
    fn test_trust_merge_keeps_unvisited_decisions() {
        let alice = RepoRef::new("alice", "widgets");
        let bob = RepoRef::new("bob", "widgets");
        let alice_origin = classify_origin(&scanned(), &alice);
        let bob_origin = classify_origin(&scanned(), &bob);
        let candidate = |id, source, origin| TrustCandidate {
            pull_request_id: id,
            author: None,
            source,
            origin,
        };
        let mut current = TrustSnapshot::evaluate(
            &TrustEveryone,
            [candidate(1, &alice, &alice_origin), candidate(2, &bob, &bob_origin)],
        );

        // A later pass that only saw PR 2 and no longer trusts it.
        let partial = TrustSnapshot::evaluate(&TrustNobody, [candidate(2, &bob, &bob_origin)]);
        current.merge(&partial);

        let head = |id, source: &RepoRef| {
            fan_out(
                &scanned(),
                PullRequestRef {
                    id,
                    source,
                    source_branch: "f",
                    target_branch: "main",
                },
                &StrategyConfig::default(),
            )
            .remove(0)
        };
        assert!(current.is_trusted(&head(1, &alice)));
        assert!(!current.is_trusted(&head(2, &bob)));
        assert_eq!(current.trusted_fork_count(), 1);
    }

    proptest! {
        #[test]
        fn prop_fan_out_names_are_distinct(id in 1u64..100_000, both in any::<bool>()) {
            let strategies = if both {
                BTreeSet::from([CheckoutStrategy::Head, CheckoutStrategy::Merge])
            } else {
                BTreeSet::from([CheckoutStrategy::Head])
            };
            let config = StrategyConfig { origin: strategies.clone(), fork: strategies.clone() };
            let source = scanned();
            let heads = fan_out(&scanned(), PullRequestRef {
                id,
                source: &source,
                source_branch: "feature",
                target_branch: "main",
            }, &config);

            prop_assert_eq!(heads.len(), strategies.len());
            let names: HashSet<_> = heads.iter().map(|h| h.name.clone()).collect();
            prop_assert_eq!(names.len(), heads.len());
            if heads.len() == 1 {
                prop_assert_eq!(&heads[0].name, &format!("PR-{id}"));
            } else {
                for head in &heads {
                    prop_assert_eq!(&head.name, &format!("PR-{id}-{}", head.strategy.name()));
                }
            }
        }
    }
}
