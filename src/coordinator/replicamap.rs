//! Replica-map builder: combines the backups' `StartReadingData` replies
//! for a crashed master into the segment -> backups multimap and the ordered
//! replica list recovery masters fetch from.

use std::collections::BTreeMap;

use crate::master::ReplicaSource;
use crate::utils::{SegmentId, ServerId};

/// The segment -> backups multimap for one crashed master. Iteration order
/// is deterministic: segment IDs ascending, backup IDs ascending within a
/// segment (deterministic for testing; the contiguity of each segment's
/// replicas is what the recovery master's scoreboard relies on to spread
/// fetch load).
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct ReplicaMap {
    map: BTreeMap<SegmentId, Vec<ServerId>>,
}

impl ReplicaMap {
    /// Builds the map from per-backup segment ID lists. Backups that did
    /// not respond in time simply do not appear in `responses`; duplicate
    /// reports of the same `(segment, backup)` pair collapse.
    pub fn build(responses: &[(ServerId, Vec<SegmentId>)]) -> Self {
        let mut map: BTreeMap<SegmentId, Vec<ServerId>> = BTreeMap::new();
        for (backup, segment_ids) in responses {
            for &segment_id in segment_ids {
                let backups = map.entry(segment_id).or_default();
                if !backups.contains(backup) {
                    backups.push(*backup);
                }
            }
        }
        for backups in map.values_mut() {
            backups.sort_unstable();
        }
        ReplicaMap { map }
    }

    /// Whether no backup holds any segment of the crashed master.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Number of distinct segment IDs.
    pub fn num_segments(&self) -> usize {
        self.map.len()
    }

    /// Iterates `(segment_id, backup)` pairs in dispatch order.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (SegmentId, ServerId)> + '_ {
        self.map.iter().flat_map(|(&segment_id, backups)| {
            backups.iter().map(move |&backup| (segment_id, backup))
        })
    }

    /// Flattens the map into the ordered replica list carried by `Recover`
    /// RPCs: all replicas of each segment contiguous, segments ascending.
    pub fn dispatch_list(&self) -> Vec<ReplicaSource> {
        self.iter()
            .map(|(segment_id, backup)| ReplicaSource { backup, segment_id })
            .collect()
    }
}

#[cfg(test)]
mod replicamap_tests {
    use super::*;

    fn backup(index: u32) -> ServerId {
        ServerId::new(index, 1)
    }

    /// Three backups host segments for the crashed master: backup1 holds
    /// {88, 89}, backup2 holds {88}, backup3 holds nothing.
    fn three_backup_responses() -> Vec<(ServerId, Vec<SegmentId>)> {
        vec![
            (backup(1), vec![88, 89]),
            (backup(2), vec![88]),
            (backup(3), vec![]),
        ]
    }

    #[test]
    fn map_iterates_segments_then_backups_ascending() {
        let map = ReplicaMap::build(&three_backup_responses());
        let pairs: Vec<_> = map.iter().collect();
        assert_eq!(
            pairs,
            vec![(88, backup(1)), (88, backup(2)), (89, backup(1))]
        );
        assert_eq!(map.num_segments(), 2);
        assert!(!map.is_empty());
    }

    #[test]
    fn dispatch_list_matches_map_order() {
        let map = ReplicaMap::build(&three_backup_responses());
        let list = map.dispatch_list();
        assert_eq!(list.len(), 3);
        assert_eq!(
            list,
            vec![
                ReplicaSource {
                    backup: backup(1),
                    segment_id: 88
                },
                ReplicaSource {
                    backup: backup(2),
                    segment_id: 88
                },
                ReplicaSource {
                    backup: backup(1),
                    segment_id: 89
                },
            ]
        );
    }

    #[test]
    fn ordering_independent_of_reply_arrival() {
        let mut shuffled = three_backup_responses();
        shuffled.reverse();
        assert_eq!(
            ReplicaMap::build(&shuffled),
            ReplicaMap::build(&three_backup_responses())
        );
    }

    #[test]
    fn duplicate_reports_collapse() {
        let map = ReplicaMap::build(&[
            (backup(1), vec![88, 88]),
            (backup(1), vec![88]),
        ]);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(88, backup(1))]);
    }

    #[test]
    fn unresponsive_backups_contribute_nothing() {
        // only backup2 answered in time
        let map = ReplicaMap::build(&[(backup(2), vec![88])]);
        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(88, backup(2))]);
    }
}
