//! Live migration engine: moves a tablet range (or the upper half of a
//! split indexlet) from this master to another live master without downtime,
//! reusing the segment transport and replay machinery of crash recovery.
//!
//! Phase 1 iterates the log from tail toward head in the background, copying
//! matching live entries into transfer segments and shipping each one as it
//! fills. Phase 2 locks the tablet against writes, waits out the RPC epoch
//! barrier, copies the delta appended during phase 1, and hands ownership to
//! the coordinator.

use bytes::Bytes;

use crate::master::objmgr::{LogEntry, ObjectManager, TableId};
use crate::master::segment::{Certificate, EntryType, SegmentBuf};
use crate::master::tablets::TabletRange;
use crate::utils::{EmberError, LogPosition, ServerId};

/// Entry totals accumulated over one migration.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct MigrationStats {
    pub objects: u64,
    pub tombstones: u64,
    pub decisions: u64,
    pub bytes: u64,
}

/// What is being migrated.
#[derive(Debug, Clone)]
enum MigrationKind {
    /// A key-hash range of one table.
    Tablet { range: TabletRange },

    /// The `[split_key, ..)` half of an indexlet: entries of the current
    /// backing table are rewritten to the destination's backing table.
    IndexletSplit {
        table_id: TableId,
        index_id: u8,
        current_backing: TableId,
        new_backing: TableId,
        split_key: Vec<u8>,
    },
}

/// Source-side state of one in-progress migration. The server event loop
/// drives it: `copy_up_to` yields full transfer segments to ship between the
/// cursor and a log position snapshot, `take_final_segment` flushes the
/// trailing partial one after phase 2.
#[derive(Debug)]
pub struct TabletMigration {
    me: ServerId,
    pub dest: ServerId,
    kind: MigrationKind,
    cursor: LogPosition,
    transfer: SegmentBuf,
    seg_capacity: usize,
    stats: MigrationStats,
}

impl TabletMigration {
    /// Begins a tablet-range migration to `dest`.
    pub fn tablet(
        me: ServerId,
        dest: ServerId,
        range: TabletRange,
        seg_capacity: usize,
    ) -> Self {
        TabletMigration {
            me,
            dest,
            kind: MigrationKind::Tablet { range },
            cursor: LogPosition::default(),
            transfer: SegmentBuf::new(seg_capacity),
            seg_capacity,
            stats: MigrationStats::default(),
        }
    }

    /// Begins an indexlet split-and-migrate to `dest`.
    #[allow(clippy::too_many_arguments)]
    pub fn indexlet_split(
        me: ServerId,
        dest: ServerId,
        table_id: TableId,
        index_id: u8,
        current_backing: TableId,
        new_backing: TableId,
        split_key: Vec<u8>,
        seg_capacity: usize,
    ) -> Self {
        TabletMigration {
            me,
            dest,
            kind: MigrationKind::IndexletSplit {
                table_id,
                index_id,
                current_backing,
                new_backing,
                split_key,
            },
            cursor: LogPosition::default(),
            transfer: SegmentBuf::new(seg_capacity),
            seg_capacity,
            stats: MigrationStats::default(),
        }
    }

    /// The `(table_id, first_key_hash)` the destination expects on
    /// `ReceiveMigrationData` for this migration's segments. Indexlet data
    /// targets the new backing table, whose destination tablet spans the
    /// whole hash range.
    pub fn dest_locator(&self) -> (TableId, u64) {
        match &self.kind {
            MigrationKind::Tablet { range } => {
                (range.table_id, range.start_key_hash)
            }
            MigrationKind::IndexletSplit { new_backing, .. } => {
                (*new_backing, 0)
            }
        }
    }

    /// Indexlet locator for next-node-id recovery on the destination, if
    /// this is an indexlet migration.
    pub fn indexlet_locator(&self) -> Option<(TableId, u8, Vec<u8>)> {
        match &self.kind {
            MigrationKind::Tablet { .. } => None,
            MigrationKind::IndexletSplit {
                table_id,
                index_id,
                split_key,
                ..
            } => Some((*table_id, *index_id, split_key.clone())),
        }
    }

    /// Totals shipped so far.
    pub fn stats(&self) -> MigrationStats {
        self.stats
    }

    /// Decides whether the log entry at `pos` must travel, returning the
    /// payload to ship (possibly rewritten for indexlet migration).
    fn filter(
        &self,
        objmgr: &ObjectManager,
        pos: LogPosition,
        ty: EntryType,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, EmberError> {
        let entry = LogEntry::decode(ty, payload)?;
        match &self.kind {
            MigrationKind::Tablet { range } => {
                let (table_id, hash) = entry.locator();
                if !range.contains(table_id, hash) {
                    return Ok(None);
                }
                match entry {
                    LogEntry::Object(obj) => {
                        // only send objects the hash table still points at;
                        // anything else is a dead version
                        if !objmgr.key_points_at(table_id, &obj.key, pos) {
                            return Ok(None);
                        }
                        Ok(Some(payload.to_vec()))
                    }
                    // tombstones always travel: an object shipped earlier in
                    // this migration may have been deleted since
                    LogEntry::Tombstone(_) => Ok(Some(payload.to_vec())),
                    LogEntry::TxDecision(_) => Ok(Some(payload.to_vec())),
                }
            }

            MigrationKind::IndexletSplit {
                current_backing,
                new_backing,
                split_key,
                ..
            } => {
                match entry {
                    LogEntry::Object(mut obj) => {
                        if obj.table_id != *current_backing
                            || obj.key.as_slice() < split_key.as_slice()
                        {
                            return Ok(None);
                        }
                        if !objmgr.key_points_at(obj.table_id, &obj.key, pos)
                        {
                            return Ok(None);
                        }
                        obj.table_id = *new_backing;
                        Ok(Some(LogEntry::Object(obj).encode()?))
                    }
                    LogEntry::Tombstone(mut tomb) => {
                        if tomb.table_id != *current_backing
                            || tomb.key.as_slice() < split_key.as_slice()
                        {
                            return Ok(None);
                        }
                        tomb.table_id = *new_backing;
                        Ok(Some(LogEntry::Tombstone(tomb).encode()?))
                    }
                    // decisions stay with the source indexlet half
                    LogEntry::TxDecision(_) => Ok(None),
                }
            }
        }
    }

    /// Scans log entries in `[cursor, upto)`, appending matching ones to the
    /// transfer segment and returning every segment that filled up, closed
    /// and certified, ready to ship in order. The trailing partial segment
    /// stays buffered for the next call or `take_final_segment`. An entry
    /// that cannot fit even in an empty segment aborts the migration.
    pub fn copy_up_to(
        &mut self,
        objmgr: &ObjectManager,
        upto: LogPosition,
    ) -> Result<Vec<(Bytes, Certificate)>, EmberError> {
        let mut shipped = Vec::new();
        let from = self.cursor;
        for (pos, ty, payload) in objmgr.log().iter_range(from, upto) {
            let Some(out) = self.filter(objmgr, pos, ty, payload)? else {
                continue;
            };

            match ty {
                EntryType::Object => self.stats.objects += 1,
                EntryType::Tombstone => self.stats.tombstones += 1,
                EntryType::TxDecision => self.stats.decisions += 1,
            }
            self.stats.bytes += out.len() as u64;

            if !self.transfer.append(ty, &out) {
                // current transfer segment is full; ship it and retry
                let full = std::mem::replace(
                    &mut self.transfer,
                    SegmentBuf::new(self.seg_capacity),
                );
                shipped.push(full.close());
                if !self.transfer.append(ty, &out) {
                    pf_error!(self.me;
                              "migration failed: entry of {} bytes cannot \
                               fit into an empty segment",
                              out.len());
                    return Err(EmberError::msg(
                        "migration entry too large for empty segment",
                    ));
                }
            }
        }
        self.cursor = upto;
        Ok(shipped)
    }

    /// Closes and returns the trailing partial transfer segment, or `None`
    /// if nothing is buffered.
    pub fn take_final_segment(&mut self) -> Option<(Bytes, Certificate)> {
        if self.transfer.is_empty() {
            return None;
        }
        let last = std::mem::replace(
            &mut self.transfer,
            SegmentBuf::new(self.seg_capacity),
        );
        Some(last.close())
    }
}
