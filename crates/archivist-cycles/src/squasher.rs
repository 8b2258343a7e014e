// Change squashing
//
// Folds per-cycle membership changes, newest record first, into the single
// net change that brings an empty directory up to date with the newest
// record in the window.
//
// INVARIANTS:
// 1. An id removed by any folded record never reaches `added` or `updated`.
// 2. `added` is ordered oldest join first.
// 3. Each id appears at most once in `added` and at most once in `updated`.

use std::collections::{HashMap, HashSet, VecDeque};

use archivist_core::{JoinedConsensor, NodeId, NodeUpdate};

use crate::change::Change;

#[derive(Debug, Default)]
pub struct ChangeSquasher {
    added: VecDeque<JoinedConsensor>,
    updated_order: VecDeque<NodeId>,
    updated: HashMap<NodeId, NodeUpdate>,
    removed: Vec<NodeId>,

    added_ids: HashSet<NodeId>,
    removed_ids: HashSet<NodeId>,
    /// Updates whose node has not been seen in an `added` list yet.
    pending_updates: HashMap<NodeId, NodeUpdate>,
}

impl ChangeSquasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in the change of a record older than every record folded so far.
    pub fn add_change(&mut self, change: &Change) {
        for id in &change.removed {
            if self.removed_ids.insert(id.clone()) {
                self.removed.push(id.clone());
            }
        }

        for update in &change.updated {
            if self.removed_ids.contains(&update.id) {
                continue;
            }
            // Newer information wins; an older update only fills gaps.
            if let Some(newer) = self.updated.get_mut(&update.id) {
                newer.absorb_older(update);
            } else if let Some(newer) = self.pending_updates.get_mut(&update.id) {
                newer.absorb_older(update);
            } else {
                self.pending_updates.insert(update.id.clone(), update.clone());
            }
        }

        for joined in change.added.iter().rev() {
            if self.added_ids.contains(&joined.id) || self.removed_ids.contains(&joined.id) {
                continue;
            }
            if let Some(update) = self.pending_updates.remove(&joined.id) {
                self.updated_order.push_front(update.id.clone());
                self.updated.insert(update.id.clone(), update);
            }
            self.added.push_front(joined.clone());
            self.added_ids.insert(joined.id.clone());
        }
    }

    pub fn added_len(&self) -> usize {
        self.added.len()
    }

    pub fn updated_len(&self) -> usize {
        self.updated_order.len()
    }

    /// Snapshot of the net change so far.
    pub fn final_change(&self) -> Change {
        Change {
            added: self.added.iter().cloned().collect(),
            removed: self.removed.clone(),
            updated: self
                .updated_order
                .iter()
                .filter_map(|id| self.updated.get(id).cloned())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::consensor;
    use archivist_core::NodeStatus;
    use proptest::prelude::*;

    fn joined(ids: &[(&str, u64)]) -> Change {
        Change {
            added: ids.iter().map(|(id, at)| consensor(id, *at)).collect(),
            ..Change::default()
        }
    }

    fn ids(change: &Change) -> Vec<&str> {
        change.added.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn test_oldest_join_first_across_records() {
        let mut squasher = ChangeSquasher::new();
        // Newest record first: B joined at cycle 7, A at cycle 5.
        squasher.add_change(&joined(&[("B", 7)]));
        squasher.add_change(&joined(&[("A", 5)]));
        assert_eq!(ids(&squasher.final_change()), vec!["A", "B"]);
    }

    #[test]
    fn test_order_within_one_record_is_kept() {
        let mut squasher = ChangeSquasher::new();
        squasher.add_change(&joined(&[("C", 9)]));
        squasher.add_change(&joined(&[("A", 3), ("B", 4)]));
        assert_eq!(ids(&squasher.final_change()), vec!["A", "B", "C"]);
    }

    #[test]
    fn test_added_then_removed_vanishes() {
        let mut squasher = ChangeSquasher::new();
        squasher.add_change(&Change {
            removed: vec!["A".into()],
            ..Change::default()
        });
        squasher.add_change(&Change {
            updated: vec![NodeUpdate {
                status: Some(NodeStatus::Active),
                ..NodeUpdate::new("A")
            }],
            ..Change::default()
        });
        squasher.add_change(&joined(&[("A", 1), ("B", 2)]));
        let change = squasher.final_change();
        assert_eq!(ids(&change), vec!["B"]);
        assert!(change.updated.is_empty());
        assert_eq!(change.removed, vec!["A".to_string()]);
    }

    #[test]
    fn test_update_moves_to_final_when_node_found() {
        let mut squasher = ChangeSquasher::new();
        squasher.add_change(&Change {
            updated: vec![NodeUpdate {
                counter_refreshed: Some(40),
                ..NodeUpdate::new("A")
            }],
            ..Change::default()
        });
        assert_eq!(squasher.updated_len(), 0);
        squasher.add_change(&Change {
            updated: vec![NodeUpdate {
                status: Some(NodeStatus::Active),
                counter_refreshed: Some(10),
                ..NodeUpdate::new("A")
            }],
            ..Change::default()
        });
        squasher.add_change(&joined(&[("A", 1)]));

        let change = squasher.final_change();
        assert_eq!(
            change.updated,
            vec![NodeUpdate {
                status: Some(NodeStatus::Active),
                counter_refreshed: Some(40),
                ..NodeUpdate::new("A")
            }]
        );
    }

    #[test]
    fn test_first_occurrence_wins() {
        let mut squasher = ChangeSquasher::new();
        let mut refreshed = consensor("A", 1);
        refreshed.counter_refreshed = 50;
        squasher.add_change(&Change {
            added: vec![refreshed],
            ..Change::default()
        });
        squasher.add_change(&joined(&[("A", 1)]));
        let change = squasher.final_change();
        assert_eq!(change.added.len(), 1);
        assert_eq!(change.added[0].counter_refreshed, 50);
    }

    /// One record in a random history: which node ids it adds, updates and removes.
    #[derive(Debug, Clone)]
    struct Step {
        added: Vec<u8>,
        updated: Vec<u8>,
        removed: Vec<u8>,
    }

    fn step() -> impl Strategy<Value = Step> {
        let ids = || prop::collection::vec(0u8..16, 0..4);
        (ids(), ids(), ids()).prop_map(|(added, updated, removed)| Step {
            added,
            updated,
            removed,
        })
    }

    fn to_change(cycle: usize, step: &Step) -> Change {
        Change {
            added: step
                .added
                .iter()
                .map(|n| consensor(&format!("n{}", n), cycle as u64))
                .collect(),
            updated: step
                .updated
                .iter()
                .map(|n| NodeUpdate {
                    counter_refreshed: Some(cycle as u64),
                    ..NodeUpdate::new(format!("n{}", n))
                })
                .collect(),
            removed: step.removed.iter().map(|n| format!("n{}", n)).collect(),
        }
    }

    fn squash(history: &[Step]) -> Change {
        let mut squasher = ChangeSquasher::new();
        for (cycle, step) in history.iter().enumerate().rev() {
            squasher.add_change(&to_change(cycle, step));
        }
        squasher.final_change()
    }

    proptest! {
        #[test]
        fn test_removed_after_added_never_survives(history in prop::collection::vec(step(), 1..12)) {
            let change = squash(&history);
            for n in 0u8..16 {
                let Some(last_add) = history.iter().rposition(|s| s.added.contains(&n)) else {
                    continue;
                };
                if history[last_add..].iter().any(|s| s.removed.contains(&n)) {
                    let id = format!("n{}", n);
                    prop_assert!(change.added.iter().all(|c| c.id != id));
                    prop_assert!(change.updated.iter().all(|u| u.id != id));
                }
            }
        }

        #[test]
        fn test_added_sorted_by_first_join(history in prop::collection::vec(step(), 1..12)) {
            let change = squash(&history);
            let joined_at: Vec<u64> = change.added.iter().map(|c| c.join_request_timestamp).collect();
            let mut sorted = joined_at.clone();
            sorted.sort();
            prop_assert_eq!(joined_at, sorted);

            let mut seen = HashSet::new();
            prop_assert!(change.added.iter().all(|c| seen.insert(c.id.clone())));
            let mut seen = HashSet::new();
            prop_assert!(change.updated.iter().all(|u| seen.insert(u.id.clone())));
            for update in &change.updated {
                prop_assert!(change.added.iter().any(|c| c.id == update.id));
            }
        }
    }
}
