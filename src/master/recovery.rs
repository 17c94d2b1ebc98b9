//! Partition recovery engine: fetches filtered recovery segments from
//! backups with bounded concurrency, replays them into a side-log, and
//! commits the side-log to take ownership of the recovered tablets.
//!
//! The per-replica fetch state is kept as a scoreboard: one array of
//! replicas in dispatch order, a `segment_id -> [replica index]` side index
//! for marking siblings, a running set of in-flight segment IDs, and a
//! cursor bounding the not-yet-started suffix. Up to `RECOVERY_FETCH_SLOTS`
//! fetches are in flight at once; completions may arrive in any order.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::master::objmgr::{ObjectManager, SideLog, SideLogCommit, TableId};
use crate::master::segment::{Certificate, SegmentIter};
use crate::master::tablets::RecoveryPartition;
use crate::utils::{EmberError, RecoveryId, SegmentId, ServerId};

/// Bounded fetch concurrency per partition recovery.
pub const RECOVERY_FETCH_SLOTS: usize = 4;

/// Fetch state of one replica in the scoreboard.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ReplicaState {
    NotStarted,
    Waiting,
    Ok,
    Failed,
}

/// One entry of the replica list handed out by the coordinator: a backup
/// that can serve a filtered copy of one segment.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub struct ReplicaSource {
    pub backup: ServerId,
    pub segment_id: SegmentId,
}

#[derive(Debug)]
struct ReplicaSlot {
    source: ReplicaSource,
    state: ReplicaState,
}

/// The scoreboard over one partition's replica list.
#[derive(Debug)]
pub struct Scoreboard {
    replicas: Vec<ReplicaSlot>,
    by_segment: HashMap<SegmentId, Vec<usize>>,
    running: HashSet<SegmentId>,
    not_started: usize,
    in_flight: usize,
}

impl Scoreboard {
    pub fn new(sources: &[ReplicaSource]) -> Self {
        let mut by_segment: HashMap<SegmentId, Vec<usize>> = HashMap::new();
        for (idx, source) in sources.iter().enumerate() {
            by_segment.entry(source.segment_id).or_default().push(idx);
        }
        Scoreboard {
            replicas: sources
                .iter()
                .map(|&source| ReplicaSlot {
                    source,
                    state: ReplicaState::NotStarted,
                })
                .collect(),
            by_segment,
            running: HashSet::new(),
            not_started: 0,
            in_flight: 0,
        }
    }

    /// Picks the next replica to fetch: the first NotStarted entry at or
    /// after the cursor whose segment is not already in flight. Marks it
    /// Waiting and registers its segment as running.
    pub fn next_fetch(&mut self) -> Option<usize> {
        // move the cursor up past everything already settled or in flight
        while self.not_started < self.replicas.len()
            && self.replicas[self.not_started].state != ReplicaState::NotStarted
        {
            self.not_started += 1;
        }

        let mut idx = self.not_started;
        while idx < self.replicas.len() {
            let slot = &self.replicas[idx];
            if slot.state == ReplicaState::NotStarted
                && !self.running.contains(&slot.source.segment_id)
            {
                self.replicas[idx].state = ReplicaState::Waiting;
                self.running.insert(self.replicas[idx].source.segment_id);
                self.in_flight += 1;
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    /// Fills fetch slots up to the concurrency bound, returning the picked
    /// replica indices.
    pub fn fill_slots(&mut self) -> Vec<usize> {
        let mut picked = Vec::new();
        while self.in_flight < RECOVERY_FETCH_SLOTS {
            match self.next_fetch() {
                Some(idx) => picked.push(idx),
                None => break,
            }
        }
        picked
    }

    /// Marks the fetched replica and every sibling with the same segment ID
    /// as Ok (any one copy suffices), and retires the segment from the
    /// running set.
    pub fn segment_ok(&mut self, idx: usize) {
        debug_assert_eq!(self.replicas[idx].state, ReplicaState::Waiting);
        self.in_flight -= 1;
        let segment_id = self.replicas[idx].source.segment_id;
        self.running.remove(&segment_id);
        for &sibling in &self.by_segment[&segment_id] {
            self.replicas[sibling].state = ReplicaState::Ok;
        }
    }

    /// Marks only the fetched replica as Failed; siblings stay eligible.
    pub fn fetch_failed(&mut self, idx: usize) {
        debug_assert_eq!(self.replicas[idx].state, ReplicaState::Waiting);
        self.in_flight -= 1;
        self.replicas[idx].state = ReplicaState::Failed;
        self.running.remove(&self.replicas[idx].source.segment_id);
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Whether no fetch is in flight and no candidate remains.
    pub fn drained(&self) -> bool {
        self.in_flight == 0
            && self.replicas[self.not_started..]
                .iter()
                .all(|slot| slot.state != ReplicaState::NotStarted)
    }

    /// The source of replica `idx`.
    pub fn source(&self, idx: usize) -> ReplicaSource {
        self.replicas[idx].source
    }

    /// The state of replica `idx`.
    pub fn state(&self, idx: usize) -> ReplicaState {
        self.replicas[idx].state
    }

    /// Segment IDs for which no replica reached Ok. Recovery of the
    /// partition succeeded iff this is empty once the scoreboard drains.
    pub fn unrecovered_segments(&self) -> Vec<SegmentId> {
        let mut failed: Vec<SegmentId> = self
            .by_segment
            .iter()
            .filter(|(_, idxs)| {
                !idxs
                    .iter()
                    .any(|&i| self.replicas[i].state == ReplicaState::Ok)
            })
            .map(|(&segment_id, _)| segment_id)
            .collect();
        failed.sort_unstable();
        failed
    }
}

/// A fetch the session wants issued: `GetRecoveryData` to `source.backup`
/// for `source.segment_id`, correlated by replica index.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FetchRequest {
    pub replica_idx: usize,
    pub source: ReplicaSource,
}

/// The in-progress recovery of one partition on a recovery master. Owns the
/// scoreboard and the side-log; the server event loop feeds it fetch
/// replies and issues the requests it returns.
#[derive(Debug)]
pub struct RecoverySession {
    me: ServerId,
    pub recovery_id: RecoveryId,
    pub crashed: ServerId,
    pub partition: RecoveryPartition,
    scoreboard: Scoreboard,
    side: SideLog,
    next_node_ids: HashMap<TableId, u64>,
    replay_error: Option<EmberError>,
}

impl RecoverySession {
    /// Opens a session: a fresh side-log plus next-node-id tracking for
    /// every indexlet backing table in the partition.
    pub fn new(
        me: ServerId,
        recovery_id: RecoveryId,
        crashed: ServerId,
        partition: RecoveryPartition,
        sources: &[ReplicaSource],
        objmgr: &ObjectManager,
    ) -> Self {
        let next_node_ids = partition
            .indexlets
            .iter()
            .map(|idx| (idx.backing_table_id, 0u64))
            .collect();
        RecoverySession {
            me,
            recovery_id,
            crashed,
            partition,
            scoreboard: Scoreboard::new(sources),
            side: objmgr.new_side_log(),
            next_node_ids,
            replay_error: None,
        }
    }

    /// Issues the initial round of fetches.
    pub fn start(&mut self) -> Vec<FetchRequest> {
        self.fill()
    }

    fn fill(&mut self) -> Vec<FetchRequest> {
        if self.replay_error.is_some() {
            // a doomed session stops requesting new data
            return Vec::new();
        }
        self.scoreboard
            .fill_slots()
            .into_iter()
            .map(|idx| FetchRequest {
                replica_idx: idx,
                source: self.scoreboard.source(idx),
            })
            .collect()
    }

    /// Handles a successful `GetRecoveryData` reply: verifies the segment
    /// against its certificate, replays it into the side-log, marks the
    /// replica (and its siblings) Ok. A corrupt segment counts as a fetch
    /// failure for this replica only. Returns the follow-up fetches to
    /// issue.
    pub fn on_fetch_ok(
        &mut self,
        objmgr: &mut ObjectManager,
        replica_idx: usize,
        segment: &[u8],
        certificate: &Certificate,
    ) -> Vec<FetchRequest> {
        let source = self.scoreboard.source(replica_idx);
        match SegmentIter::new(segment, certificate) {
            Ok(iter) => {
                match objmgr.replay_segment(
                    &mut self.side,
                    iter,
                    &mut self.next_node_ids,
                ) {
                    Ok(_) => {
                        pf_debug!(self.me;
                                  "segment {} replay complete (from {})",
                                  source.segment_id, source.backup);
                        self.scoreboard.segment_ok(replica_idx);
                    }
                    Err(e) => {
                        // replay itself failed (e.g. log out of space): the
                        // whole partition recovery is doomed, not just this
                        // replica
                        pf_error!(self.me;
                                  "error replaying segment {}: {}",
                                  source.segment_id, e);
                        self.scoreboard.fetch_failed(replica_idx);
                        self.replay_error = Some(e);
                    }
                }
            }
            Err(e) => {
                pf_warn!(self.me;
                         "recovery segment {} from {} corrupted, trying \
                          next replica: {}",
                         source.segment_id, source.backup, e);
                self.scoreboard.fetch_failed(replica_idx);
            }
        }
        self.fill()
    }

    /// Handles a failed fetch (backup absent, RPC error, non-Ok status, or
    /// timeout): marks this replica Failed and refills slots.
    pub fn on_fetch_failed(&mut self, replica_idx: usize) -> Vec<FetchRequest> {
        let source = self.scoreboard.source(replica_idx);
        pf_warn!(self.me;
                 "getRecoveryData for segment {} failed on {}, trying \
                  next replica",
                 source.segment_id, source.backup);
        self.scoreboard.fetch_failed(replica_idx);
        self.fill()
    }

    /// Whether every slot has emptied with no candidate remaining.
    pub fn drained(&self) -> bool {
        self.scoreboard.drained()
    }

    /// State of one replica, for completion accounting and tests.
    pub fn replica_state(&self, idx: usize) -> ReplicaState {
        self.scoreboard.state(idx)
    }

    /// Recovered next-node-ids per indexlet backing table.
    pub fn next_node_ids(&self) -> &HashMap<TableId, u64> {
        &self.next_node_ids
    }

    /// Finishes the session: checks that every segment in the replica list
    /// was replayed from at least one copy, then commits the side-log,
    /// making the recovered data ready for backup durability sync. On any
    /// unrecovered segment (or an earlier replay error) the side-log is
    /// abandoned uncommitted.
    pub fn finish(
        self,
        objmgr: &mut ObjectManager,
    ) -> Result<SideLogCommit, EmberError> {
        debug_assert!(self.scoreboard.drained());
        if let Some(e) = self.replay_error {
            return Err(e);
        }
        let unrecovered = self.scoreboard.unrecovered_segments();
        if !unrecovered.is_empty() {
            for segment_id in &unrecovered {
                pf_error!(self.me;
                          "unable to recover segment {}", segment_id);
            }
            return Err(EmberError(format!(
                "segment recovery failed for partition {} of master {}: \
                 {} segments unrecovered",
                self.partition.partition_id,
                self.crashed,
                unrecovered.len()
            )));
        }
        objmgr.commit_side_log(self.side)
    }
}

#[cfg(test)]
mod recovery_tests {
    use super::*;
    use crate::master::objmgr::{LogEntry, Object};
    use crate::master::segment::{EntryType, SegmentBuf};
    use crate::master::tablets::TabletRange;
    use bytes::Bytes;

    fn source(backup_idx: u32, segment_id: SegmentId) -> ReplicaSource {
        ReplicaSource {
            backup: ServerId::new(backup_idx, 1),
            segment_id,
        }
    }

    fn full_partition() -> RecoveryPartition {
        RecoveryPartition {
            partition_id: 0,
            tablets: vec![TabletRange::new(1, 0, u64::MAX)],
            indexlets: vec![],
        }
    }

    fn object_segment(key: &[u8], version: u64) -> (Bytes, Certificate) {
        let mut seg = SegmentBuf::new(1024);
        let payload = LogEntry::Object(Object {
            table_id: 1,
            key: key.to_vec(),
            version,
            timestamp: 0,
            value: b"value".to_vec(),
            rpc_tag: None,
        })
        .encode()
        .unwrap();
        assert!(seg.append(EntryType::Object, &payload));
        seg.close()
    }

    fn new_mgr() -> ObjectManager {
        ObjectManager::new(ServerId::new(2, 1), 1024, 64)
    }

    #[test]
    fn scoreboard_skips_running_segments() {
        // replicas: (b1, 88), (b2, 88), (b1, 89)
        let sources = [source(1, 88), source(2, 88), source(1, 89)];
        let mut board = Scoreboard::new(&sources);

        let picked = board.fill_slots();
        // segment 88 from b1 and segment 89 from b1; (b2, 88) skipped while
        // 88 is in flight
        assert_eq!(picked, vec![0, 2]);
        assert_eq!(board.in_flight(), 2);
        assert!(!board.drained());

        board.segment_ok(0);
        // sibling (b2, 88) became Ok without a fetch
        assert_eq!(board.state(1), ReplicaState::Ok);
        assert!(board.fill_slots().is_empty());

        board.segment_ok(2);
        assert!(board.drained());
        assert!(board.unrecovered_segments().is_empty());
    }

    #[test]
    fn scoreboard_bounds_concurrency() {
        let sources: Vec<_> = (0..10).map(|i| source(1, 100 + i)).collect();
        let mut board = Scoreboard::new(&sources);
        let picked = board.fill_slots();
        assert_eq!(picked.len(), RECOVERY_FETCH_SLOTS);
        assert_eq!(board.in_flight(), RECOVERY_FETCH_SLOTS);

        // one completion frees exactly one slot
        board.segment_ok(picked[0]);
        let refill = board.fill_slots();
        assert_eq!(refill.len(), 1);
        assert_eq!(board.in_flight(), RECOVERY_FETCH_SLOTS);
    }

    #[test]
    fn scoreboard_failed_replica_leaves_siblings() {
        let sources = [source(1, 42), source(2, 42)];
        let mut board = Scoreboard::new(&sources);
        assert_eq!(board.fill_slots(), vec![0]);

        board.fetch_failed(0);
        assert_eq!(board.state(0), ReplicaState::Failed);
        // sibling becomes fetchable now that 42 left the running set
        assert_eq!(board.fill_slots(), vec![1]);
        board.segment_ok(1);
        assert!(board.drained());
        assert!(board.unrecovered_segments().is_empty());
    }

    #[test]
    fn scoreboard_reports_unrecovered() {
        let sources = [source(1, 7), source(2, 7), source(1, 8)];
        let mut board = Scoreboard::new(&sources);
        for idx in board.fill_slots() {
            board.fetch_failed(idx);
        }
        for idx in board.fill_slots() {
            board.fetch_failed(idx);
        }
        assert!(board.drained());
        assert_eq!(board.unrecovered_segments(), vec![7, 8]);
    }

    #[test]
    fn replica_failover_replays_exactly_once() -> Result<(), EmberError> {
        // segment 42 has two replicas; the first returns a corrupt
        // segment, the second succeeds.
        let sources = [source(1, 42), source(2, 42)];
        let mut mgr = new_mgr();
        let mut session = RecoverySession::new(
            ServerId::new(2, 1),
            9,
            ServerId::new(5, 1),
            full_partition(),
            &sources,
            &mgr,
        );

        let fetches = session.start();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].replica_idx, 0);

        let (bytes, cert) = object_segment(b"k", 3);
        let mut corrupt = bytes.to_vec();
        corrupt[8] ^= 0xFF;
        let retry = session.on_fetch_ok(&mut mgr, 0, &corrupt, &cert);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].replica_idx, 1);
        assert_eq!(session.replica_state(0), ReplicaState::Failed);

        let more = session.on_fetch_ok(&mut mgr, 1, &bytes, &cert);
        assert!(more.is_empty());
        assert_eq!(session.replica_state(1), ReplicaState::Ok);
        assert!(session.drained());

        let commit = session.finish(&mut mgr)?;
        assert_eq!(commit.segments.len(), 1);
        // exactly one replay happened: one live version present
        assert_eq!(mgr.read_object(1, b"k"), Some((3, b"value".to_vec())));
        Ok(())
    }

    #[test]
    fn all_replicas_failed_surfaces_error() {
        let sources = [source(1, 42), source(2, 42)];
        let mut mgr = new_mgr();
        let mut session = RecoverySession::new(
            ServerId::new(2, 1),
            9,
            ServerId::new(5, 1),
            full_partition(),
            &sources,
            &mgr,
        );
        let fetches = session.start();
        let retry = session.on_fetch_failed(fetches[0].replica_idx);
        session.on_fetch_failed(retry[0].replica_idx);
        assert!(session.drained());
        assert!(session.finish(&mut mgr).is_err());
        // nothing committed
        assert_eq!(mgr.tracked_keys(), 0);
    }

    #[test]
    fn one_live_replica_per_segment_suffices() -> Result<(), EmberError> {
        // Invariant: if each segment id has at least one replica that does
        // not fail, partition recovery reports success.
        use rand::prelude::*;
        let mut rng = rand::rngs::StdRng::seed_from_u64(20260802);

        for _ in 0..20 {
            let num_segments = rng.gen_range(1..6u64);
            let mut sources = Vec::new();
            let mut lucky = HashMap::new(); // segment -> surviving backup idx
            for seg in 0..num_segments {
                let copies = rng.gen_range(1..4u32);
                let survivor = rng.gen_range(0..copies);
                lucky.insert(100 + seg, survivor);
                for b in 0..copies {
                    sources.push(source(b + 1, 100 + seg));
                }
            }
            sources.shuffle(&mut rng);

            let mut mgr = new_mgr();
            let mut session = RecoverySession::new(
                ServerId::new(2, 1),
                1,
                ServerId::new(5, 1),
                full_partition(),
                &sources,
                &mgr,
            );
            let mut pending = session.start();
            while let Some(fetch) = pending.pop() {
                let survives = lucky[&fetch.source.segment_id] + 1
                    == fetch.source.backup.index();
                let more = if survives {
                    let (bytes, cert) = object_segment(
                        &fetch.source.segment_id.to_be_bytes(),
                        1,
                    );
                    session.on_fetch_ok(
                        &mut mgr,
                        fetch.replica_idx,
                        &bytes,
                        &cert,
                    )
                } else {
                    session.on_fetch_failed(fetch.replica_idx)
                };
                pending.extend(more);
            }
            assert!(session.drained());
            session.finish(&mut mgr)?;
            assert_eq!(mgr.tracked_keys(), num_segments as usize);
        }
        Ok(())
    }
}
