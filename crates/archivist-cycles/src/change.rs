use archivist_core::{CycleRecord, JoinedConsensor, NodeId, NodeStatus, NodeUpdate};
use archivist_p2p::NodeRegistry;

/// Net effect of one or more cycle records on node membership.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Change {
    /// Ordered by join time, oldest first.
    pub added: Vec<JoinedConsensor>,
    pub removed: Vec<NodeId>,
    pub updated: Vec<NodeUpdate>,
}

impl Change {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }
}

/// Reads the membership change carried by a single record.
///
/// `registry` is the directory as currently known; refreshed consensors it
/// does not know are treated as additions that are already active. During
/// bootstrap the registry is empty, which is how long-lived nodes that joined
/// before the fetched window are discovered.
pub fn parse_record(record: &CycleRecord, registry: &NodeRegistry) -> Change {
    let mut change = Change {
        added: record.joined_consensors.clone(),
        removed: Vec::with_capacity(record.removed.len() + record.apoptosized.len()),
        updated: Vec::new(),
    };

    for id in &record.activated {
        change.updated.push(NodeUpdate {
            status: Some(NodeStatus::Active),
            active_timestamp: Some(record.start),
            ..NodeUpdate::new(id.clone())
        });
    }

    for refreshed in &record.refreshed_consensors {
        match registry.get_entry_by_id(&refreshed.id) {
            Some(entry) => {
                if entry.counter_refreshed.map_or(true, |c| c < record.counter) {
                    change.updated.push(NodeUpdate {
                        counter_refreshed: Some(record.counter),
                        ..NodeUpdate::new(refreshed.id.clone())
                    });
                }
            }
            None => {
                change.added.push(refreshed.clone());
                change.updated.push(NodeUpdate {
                    status: Some(NodeStatus::Active),
                    counter_refreshed: Some(record.counter),
                    ..NodeUpdate::new(refreshed.id.clone())
                });
            }
        }
    }

    change.removed.extend(record.removed.iter().cloned());
    change.removed.extend(record.apoptosized.iter().cloned());
    change
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::consensor;
    use archivist_core::ConsensusNodeInfo;

    #[test]
    fn test_activation_becomes_update() {
        let mut record = CycleRecord::empty(4);
        record.start = 1_700_000_000;
        record.activated = vec!["a".into()];
        let change = parse_record(&record, &NodeRegistry::new());
        assert_eq!(
            change.updated,
            vec![NodeUpdate {
                status: Some(NodeStatus::Active),
                active_timestamp: Some(1_700_000_000),
                ..NodeUpdate::new("a")
            }]
        );
    }

    #[test]
    fn test_unknown_refresh_is_added_as_active() {
        let mut record = CycleRecord::empty(12);
        record.refreshed_consensors = vec![consensor("r", 1)];
        let change = parse_record(&record, &NodeRegistry::new());
        assert_eq!(change.added.len(), 1);
        assert_eq!(change.updated[0].status, Some(NodeStatus::Active));
        assert_eq!(change.updated[0].counter_refreshed, Some(12));
    }

    #[test]
    fn test_known_refresh_only_updates_when_newer() {
        let mut registry = NodeRegistry::new();
        let known = consensor("k", 1);
        registry.add_nodes(NodeStatus::Active, "m1", &[known.to_node_info()]);
        registry.set_counter_refreshed("k", 20);

        let mut older = CycleRecord::empty(15);
        older.refreshed_consensors = vec![known.clone()];
        assert!(parse_record(&older, &registry).is_empty());

        let mut newer = CycleRecord::empty(25);
        newer.refreshed_consensors = vec![known];
        let change = parse_record(&newer, &registry);
        assert!(change.added.is_empty());
        assert_eq!(change.updated[0].counter_refreshed, Some(25));
        assert_eq!(change.updated[0].status, None);
    }

    #[test]
    fn test_removed_and_apoptosized_are_removed() {
        let mut record = CycleRecord::empty(3);
        record.removed = vec!["x".into()];
        record.apoptosized = vec!["y".into()];
        record.lost = vec!["z".into()];
        record.standby_add = vec![ConsensusNodeInfo {
            ip: "1.1.1.1".into(),
            port: 1,
            public_key: "s".into(),
            id: None,
        }];
        let change = parse_record(&record, &NodeRegistry::new());
        assert_eq!(change.removed, vec!["x".to_string(), "y".to_string()]);
        assert!(change.added.is_empty());
    }
}
