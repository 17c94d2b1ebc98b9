//! In-memory replica store of one backup server: closed log segments
//! replicated by masters, and the filtering that turns a stored replica
//! into a per-partition recovery segment.

use std::collections::HashMap;

use bytes::Bytes;

use crate::master::objmgr::LogEntry;
use crate::master::segment::{Certificate, SegmentBuf, SegmentIter};
use crate::master::tablets::RecoveryPartition;
use crate::utils::{EmberError, SegmentId, ServerId};

/// One stored segment replica.
#[derive(Debug, Clone)]
struct StoredReplica {
    bytes: Bytes,
    certificate: Certificate,
    primary: bool,
}

/// The replica store of one backup.
#[derive(Debug)]
pub struct BackupStore {
    me: ServerId,
    replicas: HashMap<(ServerId, SegmentId), StoredReplica>,
}

impl BackupStore {
    pub fn new(me: ServerId) -> Self {
        BackupStore {
            me,
            replicas: HashMap::new(),
        }
    }

    /// Installs (or overwrites) a replica of a master's closed segment.
    pub fn install_replica(
        &mut self,
        master: ServerId,
        segment_id: SegmentId,
        bytes: Bytes,
        certificate: Certificate,
        primary: bool,
    ) {
        pf_trace!(self.me; "stored replica of segment {} for master {}",
                           segment_id, master);
        self.replicas.insert(
            (master, segment_id),
            StoredReplica {
                bytes,
                certificate,
                primary,
            },
        );
    }

    /// Discards one replica, typically after the owning master answered
    /// `IsReplicaNeeded` with `false`.
    pub fn discard_replica(&mut self, master: ServerId, segment_id: SegmentId) {
        self.replicas.remove(&(master, segment_id));
    }

    /// All `(master, segment_id)` pairs currently stored, for the replica
    /// garbage-collection sweep.
    pub fn replica_ids(&self) -> Vec<(ServerId, SegmentId)> {
        let mut ids: Vec<_> = self.replicas.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Answers `StartReadingData`: the segment IDs held for `master`, plus
    /// the subset stored as primary replicas. Both sorted ascending.
    pub fn segment_ids_for(
        &self,
        master: ServerId,
    ) -> (Vec<SegmentId>, Vec<SegmentId>) {
        let mut all = Vec::new();
        let mut primaries = Vec::new();
        for ((owner, segment_id), replica) in &self.replicas {
            if *owner == master {
                all.push(*segment_id);
                if replica.primary {
                    primaries.push(*segment_id);
                }
            }
        }
        all.sort_unstable();
        primaries.sort_unstable();
        (all, primaries)
    }

    /// Answers `GetRecoveryData`: rebuilds the stored replica of
    /// `(master, segment_id)` filtered down to the entries owned by
    /// `partition`, with a fresh certificate. Fails if the replica is
    /// missing or its stored bytes no longer verify.
    pub fn build_recovery_segment(
        &self,
        master: ServerId,
        segment_id: SegmentId,
        partition: &RecoveryPartition,
    ) -> Result<(Bytes, Certificate), EmberError> {
        let Some(replica) = self.replicas.get(&(master, segment_id)) else {
            return logged_err!(self.me;
                               "no replica of segment {} for master {}",
                               segment_id, master);
        };
        let iter = SegmentIter::new(&replica.bytes, &replica.certificate)?;

        let mut filtered = SegmentBuf::new(replica.bytes.len().max(64));
        for entry in iter {
            let decoded = LogEntry::decode(entry.ty, entry.payload)?;
            let (table_id, hash) = decoded.locator();
            if !partition.owns(table_id, hash) {
                continue;
            }
            if !filtered.append(entry.ty, entry.payload) {
                return logged_err!(self.me;
                                   "filtered segment {} overflowed its \
                                    source size", segment_id);
            }
        }
        Ok(filtered.close())
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use crate::master::objmgr::Object;
    use crate::master::segment::EntryType;
    use crate::master::tablets::TabletRange;

    fn master() -> ServerId {
        ServerId::new(9, 1)
    }

    /// A closed segment holding one object per given `(table, key_hash
    /// stand-in)` pair. Keys are chosen so their hash is irrelevant: the
    /// partition filter in these tests spans either everything or nothing
    /// of a table.
    fn segment_with_tables(tables: &[u64]) -> (Bytes, Certificate) {
        let mut seg = SegmentBuf::new(4096);
        for (i, &table_id) in tables.iter().enumerate() {
            let payload = LogEntry::Object(Object {
                table_id,
                key: vec![i as u8],
                version: 1,
                timestamp: 0,
                value: b"v".to_vec(),
                rpc_tag: None,
            })
            .encode()
            .unwrap();
            assert!(seg.append(EntryType::Object, &payload));
        }
        seg.close()
    }

    fn whole_table(table_id: u64) -> RecoveryPartition {
        RecoveryPartition {
            partition_id: 0,
            tablets: vec![TabletRange::new(table_id, 0, u64::MAX)],
            indexlets: vec![],
        }
    }

    #[test]
    fn segment_ids_sorted_with_primaries() {
        let mut store = BackupStore::new(ServerId::new(1, 1));
        let (bytes, cert) = segment_with_tables(&[1]);
        store.install_replica(master(), 89, bytes.clone(), cert, false);
        store.install_replica(master(), 88, bytes.clone(), cert, true);
        // another master's replica does not leak in
        store.install_replica(ServerId::new(8, 1), 77, bytes, cert, true);

        let (all, primaries) = store.segment_ids_for(master());
        assert_eq!(all, vec![88, 89]);
        assert_eq!(primaries, vec![88]);

        let (none, _) = store.segment_ids_for(ServerId::new(2, 1));
        assert!(none.is_empty());
    }

    #[test]
    fn recovery_segment_filters_by_partition() -> Result<(), EmberError> {
        let mut store = BackupStore::new(ServerId::new(1, 1));
        let (bytes, cert) = segment_with_tables(&[5, 6, 5]);
        store.install_replica(master(), 88, bytes, cert, false);

        let (seg, seg_cert) =
            store.build_recovery_segment(master(), 88, &whole_table(5))?;
        let entries: Vec<_> = SegmentIter::new(&seg, &seg_cert)?.collect();
        assert_eq!(entries.len(), 2);
        for entry in entries {
            let LogEntry::Object(obj) =
                LogEntry::decode(entry.ty, entry.payload)?
            else {
                panic!("expected object entry");
            };
            assert_eq!(obj.table_id, 5);
        }
        Ok(())
    }

    #[test]
    fn missing_or_corrupt_replica_fails() {
        let mut store = BackupStore::new(ServerId::new(1, 1));
        assert!(store
            .build_recovery_segment(master(), 88, &whole_table(1))
            .is_err());

        let (bytes, cert) = segment_with_tables(&[1]);
        let mut rotten = bytes.to_vec();
        rotten[6] ^= 0x55;
        store.install_replica(
            master(),
            88,
            Bytes::from(rotten),
            cert,
            false,
        );
        assert!(store
            .build_recovery_segment(master(), 88, &whole_table(1))
            .is_err());
    }

    #[test]
    fn discard_replica_forgets() {
        let mut store = BackupStore::new(ServerId::new(1, 1));
        let (bytes, cert) = segment_with_tables(&[1]);
        store.install_replica(master(), 88, bytes, cert, false);
        assert_eq!(store.replica_ids(), vec![(master(), 88)]);
        store.discard_replica(master(), 88);
        assert!(store.replica_ids().is_empty());
    }
}
