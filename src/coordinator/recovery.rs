//! Recovery dispatcher: groups a crashed master's tablets into recovery
//! partitions, assigns one partition per available recovery master, tallies
//! asynchronous completions, drives per-partition retries, and finalizes the
//! cluster-wide outcome.

use std::collections::{HashMap, HashSet};

use crate::master::tablets::{IndexletRange, RecoveryPartition, TabletRange};
use crate::master::ReplicaSource;
use crate::utils::{EmberError, RecoveryId, ServerId};

/// Groups a crashed master's tablets and indexlets by their precomputed
/// partition IDs. The partitioner does not itself decide the partitioning.
/// The union of the returned partitions equals the input set; overlapping
/// tablets within one crashed master would be a bookkeeping bug upstream
/// and are rejected.
pub fn partition_tablets(
    tablets: &[(TabletRange, u64)],
    indexlets: &[(IndexletRange, u64)],
) -> Result<Vec<RecoveryPartition>, EmberError> {
    let mut by_id: HashMap<u64, RecoveryPartition> = HashMap::new();
    for &(range, partition_id) in tablets {
        by_id
            .entry(partition_id)
            .or_insert_with(|| RecoveryPartition {
                partition_id,
                ..Default::default()
            })
            .tablets
            .push(range);
    }
    for (range, partition_id) in indexlets {
        by_id
            .entry(*partition_id)
            .or_insert_with(|| RecoveryPartition {
                partition_id: *partition_id,
                ..Default::default()
            })
            .indexlets
            .push(range.clone());
    }

    let mut partitions: Vec<RecoveryPartition> = by_id.into_values().collect();
    partitions.sort_by_key(|p| p.partition_id);

    // partitions must be disjoint in (table, key-hash range)
    for (i, a) in partitions.iter().enumerate() {
        for b in &partitions[i + 1..] {
            for ta in &a.tablets {
                for tb in &b.tablets {
                    if ta.table_id == tb.table_id
                        && ta.start_key_hash <= tb.end_key_hash
                        && tb.start_key_hash <= ta.end_key_hash
                    {
                        return Err(EmberError(format!(
                            "partitions {} and {} overlap in table {}",
                            a.partition_id, b.partition_id, ta.table_id
                        )));
                    }
                }
            }
        }
    }
    Ok(partitions)
}

/// One `Recover` RPC the dispatcher wants issued.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RecoverOrder {
    pub master: ServerId,
    pub partition: RecoveryPartition,
    pub replicas: Vec<ReplicaSource>,
}

/// Answer to one `RecoveryMasterFinished` report, plus whatever follow-up
/// the dispatcher decided on.
#[derive(Debug, Default)]
pub struct Finished {
    /// Whether the reporting master must abandon its recovered partition.
    pub cancel: bool,

    /// A retry of the failed partition on another master, if one is spare.
    pub retry: Option<RecoverOrder>,

    /// Set once every partition has settled.
    pub outcome: Option<RecoveryOutcome>,
}

/// Terminal result of one crash recovery.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RecoveryOutcome {
    /// Partition ID -> recovery master now owning it.
    pub recovered: HashMap<u64, ServerId>,

    /// Partitions that no recovery master could (or was available to)
    /// recover. Non-empty means the crashed master's data is partially
    /// lost until an operator intervenes: the cluster is busted.
    pub unrecovered: Vec<u64>,
}

impl RecoveryOutcome {
    pub fn fully_recovered(&self) -> bool {
        self.unrecovered.is_empty()
    }
}

/// The dispatcher state machine for recovering one crashed master.
#[derive(Debug)]
pub struct Recovery {
    pub recovery_id: RecoveryId,
    pub crashed: ServerId,
    replicas: Vec<ReplicaSource>,
    partitions: Vec<RecoveryPartition>,
    /// candidate recovery masters, fixed at `start`
    masters: Vec<ServerId>,
    /// active assignments: recovery master -> partition id
    assignments: HashMap<ServerId, u64>,
    /// partition id -> masters that already failed it
    failed_on: HashMap<u64, HashSet<ServerId>>,
    /// partitions successfully recovered so far
    recovered: HashMap<u64, ServerId>,
    /// partitions given up on
    unrecovered: Vec<u64>,
    started: bool,
}

impl Recovery {
    /// Creates the dispatcher for one crashed master from the partitioned
    /// tablet set and the ordered replica list.
    pub fn new(
        recovery_id: RecoveryId,
        crashed: ServerId,
        partitions: Vec<RecoveryPartition>,
        replicas: Vec<ReplicaSource>,
    ) -> Self {
        Recovery {
            recovery_id,
            crashed,
            replicas,
            partitions,
            masters: Vec::new(),
            assignments: HashMap::new(),
            failed_on: HashMap::new(),
            recovered: HashMap::new(),
            unrecovered: Vec::new(),
            started: false,
        }
    }

    /// Assigns one partition to each available recovery master and returns
    /// the `Recover` orders to issue. Surplus partitions (fewer masters
    /// than partitions) are declared unrecovered up front: the dispatcher
    /// still collects completions for the assigned ones, reports partial
    /// success, and the terminal diagnostic marks the cluster busted.
    pub fn start(&mut self, masters: &[ServerId]) -> Vec<RecoverOrder> {
        debug_assert!(!self.started);
        self.started = true;
        self.masters = masters.to_vec();

        let mut orders = Vec::new();
        let mut master_pool = masters.iter();
        for partition in &self.partitions {
            match master_pool.next() {
                Some(&master) => {
                    pf_info!("c";
                             "trying partition {} recovery on {} with {} \
                              tablets and {} replicas",
                             partition.partition_id, master,
                             partition.tablets.len(), self.replicas.len());
                    self.assignments
                        .insert(master, partition.partition_id);
                    orders.push(RecoverOrder {
                        master,
                        partition: partition.clone(),
                        replicas: self.replicas.clone(),
                    });
                }
                None => {
                    pf_warn!("c";
                             "no recovery master left for partition {}",
                             partition.partition_id);
                    self.unrecovered.push(partition.partition_id);
                }
            }
        }
        orders
    }

    /// Tallies one `RecoveryMasterFinished` report. Returns the cancel
    /// decision for the reporting master, a retry order if its partition
    /// should move to a spare master, and the terminal outcome once all
    /// partitions settle.
    pub fn master_finished(
        &mut self,
        master: ServerId,
        success: bool,
    ) -> Finished {
        let Some(partition_id) = self.assignments.remove(&master) else {
            // unknown or superseded reporter: whatever it recovered must
            // not be served
            pf_warn!("c"; "stale recovery report from {}; cancelling", master);
            return Finished {
                cancel: true,
                ..Default::default()
            };
        };

        let mut finished = Finished::default();
        if success {
            self.recovered.insert(partition_id, master);
        } else {
            self.failed_on
                .entry(partition_id)
                .or_default()
                .insert(master);
            finished.cancel = true;

            // retry on a spare master that has not failed this partition
            let failed = &self.failed_on[&partition_id];
            let spare = self.masters.iter().find(|m| {
                !self.assignments.contains_key(*m) && !failed.contains(*m)
            });
            match spare {
                Some(&spare) => {
                    let partition = self
                        .partitions
                        .iter()
                        .find(|p| p.partition_id == partition_id)
                        .cloned()
                        .unwrap();
                    pf_info!("c";
                             "retrying partition {} recovery on {}",
                             partition_id, spare);
                    self.assignments.insert(spare, partition_id);
                    finished.retry = Some(RecoverOrder {
                        master: spare,
                        partition,
                        replicas: self.replicas.clone(),
                    });
                }
                None => {
                    pf_warn!("c";
                             "no spare recovery master for partition {}",
                             partition_id);
                    self.unrecovered.push(partition_id);
                }
            }
        }

        if self.assignments.is_empty() {
            let outcome = RecoveryOutcome {
                recovered: self.recovered.clone(),
                unrecovered: {
                    let mut failed = self.unrecovered.clone();
                    failed.sort_unstable();
                    failed
                },
            };
            if !outcome.fully_recovered() {
                pf_error!("c";
                          "failed to recover all partitions of crashed \
                           master {}; the cluster is now busted",
                          self.crashed);
            }
            finished.outcome = Some(outcome);
        }
        finished
    }
}

#[cfg(test)]
mod dispatcher_tests {
    use super::*;
    use crate::backup::BackupStore;
    use crate::coordinator::ReplicaMap;
    use crate::master::objmgr::{LogEntry, Object, ObjectManager};
    use crate::master::recovery::RecoverySession;
    use crate::master::segment::{EntryType, SegmentBuf};
    use crate::utils::SegmentId;

    fn backup(index: u32) -> ServerId {
        ServerId::new(index, 1)
    }

    fn master(index: u32) -> ServerId {
        ServerId::new(10 + index, 1)
    }

    fn crashed() -> ServerId {
        ServerId::new(99, 1)
    }

    /// Tablets [0,9] -> partition 0 and [10,19] -> partition 1 of table 123.
    fn two_partitions() -> Vec<RecoveryPartition> {
        partition_tablets(
            &[
                (TabletRange::new(123, 0, 9), 0),
                (TabletRange::new(123, 10, 19), 1),
            ],
            &[],
        )
        .unwrap()
    }

    /// Builds the reference backup population: backup1 = {88, 89},
    /// backup2 = {88}, backup3 = {}.
    fn populate_backups() -> HashMap<ServerId, BackupStore> {
        let mut stores = HashMap::new();
        for b in 1..=3u32 {
            stores.insert(backup(b), BackupStore::new(backup(b)));
        }
        for &(b, segment_id) in &[(1u32, 88u64), (1, 89), (2, 88)] {
            // a filler object per segment; the per-partition filter on the
            // backup strips whatever the tiny test tablets do not own
            let mut seg = SegmentBuf::new(4096);
            let payload = LogEntry::Object(Object {
                table_id: 123,
                key: format!("seg{}", segment_id).into_bytes(),
                version: 1,
                timestamp: 0,
                value: segment_id.to_be_bytes().to_vec(),
                rpc_tag: None,
            })
            .encode()
            .unwrap();
            assert!(seg.append(EntryType::Object, &payload));
            let (bytes, cert) = seg.close();
            stores
                .get_mut(&backup(b))
                .unwrap()
                .install_replica(crashed(), segment_id, bytes, cert, false);
        }
        stores
    }

    /// Fans `StartReadingData` over the backups and builds the replica map.
    fn build_map(stores: &HashMap<ServerId, BackupStore>) -> ReplicaMap {
        let mut responses: Vec<_> = stores
            .iter()
            .map(|(&id, store)| {
                (id, store.segment_ids_for(crashed()).0)
            })
            .collect();
        responses.sort_by_key(|(id, _)| *id);
        ReplicaMap::build(&responses)
    }

    /// Runs one recovery master's partition recovery against synchronous
    /// in-test backups, recording the event log.
    fn run_recovery_master(
        order: &RecoverOrder,
        stores: &HashMap<ServerId, BackupStore>,
        events: &mut Vec<String>,
    ) -> bool {
        events.push(format!(
            "start: partition {} on {}",
            order.partition.partition_id, order.master
        ));
        let mut objmgr = ObjectManager::new(order.master, 4096, 64);
        let mut session = RecoverySession::new(
            order.master,
            1,
            crashed(),
            order.partition.clone(),
            &order.replicas,
            &objmgr,
        );

        // backups answer synchronously, so fetches complete in issue order
        let mut pending = std::collections::VecDeque::new();
        pending.extend(session.start());
        while let Some(fetch) = pending.pop_front() {
            events.push(format!(
                "getRecoveryData: segment {}",
                fetch.source.segment_id
            ));
            let (bytes, cert) = stores[&fetch.source.backup]
                .build_recovery_segment(
                    crashed(),
                    fetch.source.segment_id,
                    &order.partition,
                )
                .unwrap();
            let more = session.on_fetch_ok(
                &mut objmgr,
                fetch.replica_idx,
                &bytes,
                &cert,
            );
            events.push(format!(
                "getRecoveryData: segment {} complete",
                fetch.source.segment_id
            ));
            pending.extend(more);
        }
        assert!(session.drained());
        session.finish(&mut objmgr).is_ok()
    }

    #[test]
    fn partitioner_groups_by_id() -> Result<(), EmberError> {
        let partitions = two_partitions();
        assert_eq!(partitions.len(), 2);
        assert_eq!(partitions[0].partition_id, 0);
        assert_eq!(partitions[0].tablets, vec![TabletRange::new(123, 0, 9)]);
        assert_eq!(partitions[1].partition_id, 1);
        assert_eq!(
            partitions[1].tablets,
            vec![TabletRange::new(123, 10, 19)]
        );
        Ok(())
    }

    #[test]
    fn partitioner_rejects_overlap() {
        assert!(partition_tablets(
            &[
                (TabletRange::new(123, 0, 9), 0),
                (TabletRange::new(123, 5, 19), 1),
            ],
            &[],
        )
        .is_err());
    }

    #[test]
    fn two_partition_recovery_on_two_masters() {
        // partition 0 goes to master1 and partition 1 to master2; each
        // recovery master fetches segment 88, replays it, then segment 89.
        let stores = populate_backups();
        let map = build_map(&stores);
        let mut recovery = Recovery::new(
            1,
            crashed(),
            two_partitions(),
            map.dispatch_list(),
        );

        let orders = recovery.start(&[master(1), master(2)]);
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].master, master(1));
        assert_eq!(orders[0].partition.partition_id, 0);
        assert_eq!(orders[1].master, master(2));
        assert_eq!(orders[1].partition.partition_id, 1);

        let mut events = Vec::new();
        let mut last = None;
        for order in &orders {
            let success = run_recovery_master(order, &stores, &mut events);
            last = Some(recovery.master_finished(order.master, success));
        }

        let expected: Vec<String> = vec![
            format!("start: partition 0 on {}", master(1)),
            "getRecoveryData: segment 88".into(),
            "getRecoveryData: segment 88 complete".into(),
            "getRecoveryData: segment 89".into(),
            "getRecoveryData: segment 89 complete".into(),
            format!("start: partition 1 on {}", master(2)),
            "getRecoveryData: segment 88".into(),
            "getRecoveryData: segment 88 complete".into(),
            "getRecoveryData: segment 89".into(),
            "getRecoveryData: segment 89 complete".into(),
        ];
        assert_eq!(events, expected);

        let outcome = last.unwrap().outcome.unwrap();
        assert!(outcome.fully_recovered());
        assert_eq!(outcome.recovered[&0], master(1));
        assert_eq!(outcome.recovered[&1], master(2));
    }

    #[test]
    fn insufficient_recovery_masters_bust_the_cluster() {
        // three partitions, two masters; the third partition is never
        // attempted and the outcome is partial.
        let stores = populate_backups();
        let map = build_map(&stores);
        let partitions = partition_tablets(
            &[
                (TabletRange::new(123, 0, 9), 0),
                (TabletRange::new(123, 10, 19), 1),
                (TabletRange::new(123, 20, 29), 2),
            ],
            &[],
        )
        .unwrap();
        let mut recovery =
            Recovery::new(2, crashed(), partitions, map.dispatch_list());

        let orders = recovery.start(&[master(1), master(2)]);
        assert_eq!(orders.len(), 2); // partition 2 never attempted

        let mut events = Vec::new();
        let mut last = None;
        for order in &orders {
            let success = run_recovery_master(order, &stores, &mut events);
            last = Some(recovery.master_finished(order.master, success));
        }

        let outcome = last.unwrap().outcome.unwrap();
        assert!(!outcome.fully_recovered());
        assert_eq!(outcome.unrecovered, vec![2]);
        assert_eq!(outcome.recovered.len(), 2);
    }

    #[test]
    fn failed_partition_retries_on_spare_master() {
        let stores = populate_backups();
        let map = build_map(&stores);
        let mut recovery = Recovery::new(
            3,
            crashed(),
            two_partitions(),
            map.dispatch_list(),
        );

        // three masters available for two partitions: master3 is spare
        let orders = recovery.start(&[master(1), master(2), master(3)]);
        assert_eq!(orders.len(), 2);

        // master1 fails its partition; it must cancel, and the partition
        // moves to master3
        let finished = recovery.master_finished(master(1), false);
        assert!(finished.cancel);
        let retry = finished.retry.expect("expected a retry order");
        assert_eq!(retry.master, master(3));
        assert_eq!(retry.partition.partition_id, 0);
        assert!(finished.outcome.is_none());

        // master2 and master3 succeed
        let finished = recovery.master_finished(master(2), true);
        assert!(!finished.cancel);
        assert!(finished.outcome.is_none());
        let finished = recovery.master_finished(master(3), true);
        assert!(!finished.cancel);
        let outcome = finished.outcome.unwrap();
        assert!(outcome.fully_recovered());
        assert_eq!(outcome.recovered[&0], master(3));
        assert_eq!(outcome.recovered[&1], master(2));
    }

    #[test]
    fn exhausted_retries_leave_partition_unrecovered() {
        let stores = populate_backups();
        let map = build_map(&stores);
        let mut recovery = Recovery::new(
            4,
            crashed(),
            two_partitions(),
            map.dispatch_list(),
        );
        recovery.start(&[master(1), master(2)]);

        let finished = recovery.master_finished(master(2), true);
        assert!(finished.outcome.is_none());
        // master1 fails partition 0 and no spare exists
        let finished = recovery.master_finished(master(1), false);
        assert!(finished.cancel);
        assert!(finished.retry.is_none());
        let outcome = finished.outcome.unwrap();
        assert_eq!(outcome.unrecovered, vec![0]);
        assert_eq!(outcome.recovered[&1], master(2));
    }

    #[test]
    fn stale_report_is_cancelled() {
        let stores = populate_backups();
        let map = build_map(&stores);
        let mut recovery = Recovery::new(
            5,
            crashed(),
            two_partitions(),
            map.dispatch_list(),
        );
        recovery.start(&[master(1), master(2)]);
        let finished = recovery.master_finished(master(7), true);
        assert!(finished.cancel);
        assert!(finished.outcome.is_none());
    }

    /// Every segment of the dispatch list must land in every partition's
    /// replica list: a partition cannot know up front which segments hold
    /// its keys.
    #[test]
    fn orders_carry_the_full_replica_list() {
        let stores = populate_backups();
        let map = build_map(&stores);
        let mut recovery = Recovery::new(
            6,
            crashed(),
            two_partitions(),
            map.dispatch_list(),
        );
        let orders = recovery.start(&[master(1), master(2)]);
        let segs: Vec<SegmentId> = orders[1]
            .replicas
            .iter()
            .map(|r| r.segment_id)
            .collect();
        assert_eq!(segs, vec![88, 88, 89]);
    }
}
