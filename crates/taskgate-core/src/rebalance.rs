// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Perpetual task placement planning.
//!
//! [`plan_rebalance`] is a pure function from the current assignment and the
//! live delegate set to a list of [`Move`]s. The scheduler applies each move
//! as a compare-and-swap on the previous assignment, so a plan computed from
//! stale data simply fails to apply.
//!
//! Placement rules, in order:
//!
//! 1. Paused tasks are never moved.
//! 2. A task on a live delegate that is still eligible stays there.
//! 3. Remaining tasks go to the least-loaded eligible delegate (ties by id),
//!    or become unassigned when no delegate is eligible.
//! 4. While the most- and least-loaded delegates differ by more than the skew
//!    threshold, one task the receiver is eligible for moves across.

use std::collections::{BTreeMap, BTreeSet};

use crate::capability::CapabilityMatcher;
use crate::delegate::DelegateRecord;
use crate::perpetual::PerpetualTask;

/// One assignment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Move {
    pub task_id: String,
    /// Assignment the plan was computed against.
    pub from: Option<String>,
    pub to: Option<String>,
}

struct Candidate<'a> {
    task: &'a PerpetualTask,
    eligible: BTreeSet<&'a str>,
    target: Option<&'a str>,
}

/// Plan moves for one account.
pub fn plan_rebalance(
    tasks: &[PerpetualTask],
    live_delegates: &[DelegateRecord],
    skew_threshold: usize,
) -> Vec<Move> {
    let matcher = CapabilityMatcher;
    let mut load: BTreeMap<&str, usize> = live_delegates
        .iter()
        .map(|d| (d.delegate_id.as_str(), 0))
        .collect();

    let mut candidates: Vec<Candidate<'_>> = tasks
        .iter()
        .filter(|t| !t.paused)
        .map(|task| {
            let setup = task.context.setup_abstractions();
            let eligible = matcher
                .eligible_delegates(task.context.capabilities(), &setup, live_delegates)
                .into_iter()
                .map(|d| d.delegate_id.as_str())
                .collect();
            Candidate {
                task,
                eligible,
                target: None,
            }
        })
        .collect();

    // Sticky pass.
    for candidate in &mut candidates {
        if let Some(current) = candidate.task.delegate_id.as_deref()
            && let Some(&kept) = candidate.eligible.get(current)
        {
            candidate.target = Some(kept);
            *load.entry(kept).or_default() += 1;
        }
    }

    // Placement pass.
    for candidate in candidates.iter_mut().filter(|c| c.target.is_none()) {
        let least = candidate
            .eligible
            .iter()
            .min_by_key(|id| (load.get(*id).copied().unwrap_or(0), **id))
            .copied();
        if let Some(delegate_id) = least {
            candidate.target = Some(delegate_id);
            *load.entry(delegate_id).or_default() += 1;
        }
    }

    // Skew pass. A move needs a gap of at least two so it strictly improves
    // balance and the loop terminates.
    let gap = skew_threshold.max(1);
    for _ in 0..candidates.len() {
        let Some(moved) = move_one(&mut candidates, &mut load, gap) else {
            break;
        };
        if !moved {
            break;
        }
    }

    candidates
        .into_iter()
        .filter(|c| c.target != c.task.delegate_id.as_deref())
        .map(|c| Move {
            task_id: c.task.id.clone(),
            from: c.task.delegate_id.clone(),
            to: c.target.map(str::to_string),
        })
        .collect()
}

/// Moves one task from the most- to the least-loaded delegate pair that
/// exceeds `gap`. `Some(false)` when no pair has a movable task.
fn move_one<'a>(
    candidates: &mut [Candidate<'a>],
    load: &mut BTreeMap<&'a str, usize>,
    gap: usize,
) -> Option<bool> {
    let mut by_load: Vec<(&'a str, usize)> = load.iter().map(|(id, n)| (*id, *n)).collect();
    by_load.sort_by_key(|(id, n)| (*n, *id));
    let (_, min_load) = *by_load.first()?;
    let (_, max_load) = *by_load.last()?;
    if max_load - min_load <= gap {
        return Some(false);
    }

    for &(donor, donor_load) in by_load.iter().rev() {
        for &(receiver, receiver_load) in &by_load {
            if donor_load <= receiver_load + gap {
                break;
            }
            // Prefer moving tasks that were not sticky in this plan.
            let movable = candidates
                .iter_mut()
                .filter(|c| c.target == Some(donor) && c.eligible.contains(receiver))
                .min_by_key(|c| (c.task.delegate_id.as_deref() == Some(donor), c.task.id.as_str()));
            if let Some(candidate) = movable {
                candidate.target = Some(receiver);
                *load.entry(donor).or_default() -= 1;
                *load.entry(receiver).or_default() += 1;
                return Some(true);
            }
        }
    }
    Some(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use chrono::Utc;

    use crate::capability::{Capability, DelegateFacts, ScopingRules};
    use crate::perpetual::{ExecutionBundle, PerpetualTaskContext, PerpetualTaskSchedule};

    fn delegate(id: &str, tags: &[&str]) -> DelegateRecord {
        let now = Utc::now();
        DelegateRecord {
            delegate_id: id.to_string(),
            account_id: "acct".to_string(),
            host_name: id.to_string(),
            facts: DelegateFacts {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            },
            scoping_rules: ScopingRules::new(),
            registered_at: now,
            last_heartbeat_at: now,
        }
    }

    fn task(id: &str, assigned: Option<&str>) -> PerpetualTask {
        task_with_context(
            id,
            assigned,
            PerpetualTaskContext::ClientContext {
                parameters: BTreeMap::from([("resource".to_string(), id.to_string())]),
            },
        )
    }

    fn task_with_context(
        id: &str,
        assigned: Option<&str>,
        context: PerpetualTaskContext,
    ) -> PerpetualTask {
        let now = Utc::now();
        PerpetualTask {
            id: id.to_string(),
            account_id: "acct".to_string(),
            task_type: "K8S_WATCH".to_string(),
            context_fingerprint: String::new(),
            context,
            schedule: PerpetualTaskSchedule {
                interval: Duration::from_secs(60),
                timeout: Duration::from_secs(30),
            },
            delegate_id: assigned.map(str::to_string),
            paused: false,
            allow_stale_task_id: false,
            description: String::new(),
            created_at: now,
            context_updated_at: now,
            assigned_at: None,
            last_heartbeat_at: None,
        }
    }

    fn gpu_only(id: &str, assigned: Option<&str>) -> PerpetualTask {
        task_with_context(
            id,
            assigned,
            PerpetualTaskContext::ExecutionBundle {
                bundle: ExecutionBundle {
                    capabilities: vec![Capability::selectors(["gpu"], None)],
                    ..Default::default()
                },
            },
        )
    }

    fn loads(tasks: &[PerpetualTask], moves: &[Move]) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for t in tasks {
            let target = moves
                .iter()
                .find(|m| m.task_id == t.id)
                .map(|m| m.to.clone())
                .unwrap_or_else(|| t.delegate_id.clone());
            if let Some(d) = target {
                *out.entry(d).or_default() += 1;
            }
        }
        out
    }

    #[test]
    fn test_unassigned_tasks_spread_evenly() {
        let delegates = vec![delegate("d1", &[]), delegate("d2", &[]), delegate("d3", &[])];
        let tasks: Vec<_> = (0..6).map(|i| task(&format!("p{i}"), None)).collect();

        let moves = plan_rebalance(&tasks, &delegates, 1);
        assert_eq!(moves.len(), 6);
        let loads = loads(&tasks, &moves);
        assert!(loads.values().all(|n| *n == 2), "{loads:?}");
    }

    #[test]
    fn test_healthy_assignments_are_sticky() {
        let delegates = vec![delegate("d1", &[]), delegate("d2", &[])];
        let tasks = vec![
            task("p1", Some("d1")),
            task("p2", Some("d1")),
            task("p3", Some("d2")),
        ];
        assert!(plan_rebalance(&tasks, &delegates, 2).is_empty());
    }

    #[test]
    fn test_tasks_leave_lost_delegate() {
        let delegates = vec![delegate("d1", &[]), delegate("d2", &[])];
        let tasks = vec![
            task("p1", Some("gone")),
            task("p2", Some("gone")),
            task("p3", Some("d1")),
        ];

        let moves = plan_rebalance(&tasks, &delegates, 2);
        let moved: BTreeSet<_> = moves.iter().map(|m| m.task_id.as_str()).collect();
        assert_eq!(moved, BTreeSet::from(["p1", "p2"]));
        assert!(moves.iter().all(|m| m.from.as_deref() == Some("gone")));
        // p1 fills the empty d2, then the tie goes to the lower id.
        let loads = loads(&tasks, &moves);
        assert_eq!(loads.get("d1"), Some(&2));
        assert_eq!(loads.get("d2"), Some(&1));
    }

    #[test]
    fn test_skew_beyond_threshold_moves_tasks() {
        let delegates = vec![delegate("d1", &[]), delegate("d2", &[])];
        let tasks: Vec<_> = (0..6).map(|i| task(&format!("p{i}"), Some("d1"))).collect();

        let moves = plan_rebalance(&tasks, &delegates, 2);
        let loads = loads(&tasks, &moves);
        let d1 = loads.get("d1").copied().unwrap_or(0);
        let d2 = loads.get("d2").copied().unwrap_or(0);
        assert!(d1.abs_diff(d2) <= 2, "{loads:?}");
        assert!(moves.iter().all(|m| m.to.as_deref() == Some("d2")));
    }

    #[test]
    fn test_skew_within_threshold_is_tolerated() {
        let delegates = vec![delegate("d1", &[]), delegate("d2", &[])];
        let tasks = vec![task("p1", Some("d1")), task("p2", Some("d1"))];
        assert!(plan_rebalance(&tasks, &delegates, 2).is_empty());
    }

    #[test]
    fn test_paused_tasks_untouched() {
        let delegates = vec![delegate("d1", &[])];
        let mut paused = task("p1", Some("gone"));
        paused.paused = true;
        assert!(plan_rebalance(&[paused], &delegates, 2).is_empty());
    }

    #[test]
    fn test_no_eligible_delegate_unassigns() {
        let delegates = vec![delegate("d1", &["linux"])];
        let tasks = vec![gpu_only("p1", Some("gone")), gpu_only("p2", None)];

        let moves = plan_rebalance(&tasks, &delegates, 2);
        assert_eq!(
            moves,
            vec![Move {
                task_id: "p1".to_string(),
                from: Some("gone".to_string()),
                to: None,
            }]
        );
    }

    #[test]
    fn test_ineligible_receiver_not_used_for_skew() {
        let delegates = vec![delegate("d1", &["gpu"]), delegate("d2", &[])];
        let tasks: Vec<_> = (0..5).map(|i| gpu_only(&format!("p{i}"), Some("d1"))).collect();
        assert!(plan_rebalance(&tasks, &delegates, 1).is_empty());
    }

    #[test]
    fn test_zero_threshold_terminates() {
        let delegates = vec![delegate("d1", &[]), delegate("d2", &[])];
        let tasks: Vec<_> = (0..3).map(|i| task(&format!("p{i}"), Some("d1"))).collect();

        let moves = plan_rebalance(&tasks, &delegates, 0);
        let loads = loads(&tasks, &moves);
        assert_eq!(loads.get("d1"), Some(&2));
        assert_eq!(loads.get("d2"), Some(&1));
    }
}
