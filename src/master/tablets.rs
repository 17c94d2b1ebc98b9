//! Tablet and indexlet tables of one master, including the small ownership
//! state machine that gates which operations each tablet admits.
//!
//! The tables are guarded by a lock that serializes state transitions;
//! readers may observe stale snapshots and must re-check under the lock
//! (`change_state` takes the expected source state) before committing a
//! mutation.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::master::objmgr::{KeyHash, TableId};
use crate::utils::LogPosition;

/// Ownership state of a tablet (or an indexlet).
///
/// Allowed transitions: `Normal <-> Recovering`,
/// `Normal -> LockedForMigration -> (deleted)`.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum TabletState {
    /// Owned and serving client operations.
    Normal,

    /// Being constructed by recovery or migration; no client traffic.
    Recovering,

    /// Write-quiesced for the final phase of an outbound migration.
    LockedForMigration,
}

impl TabletState {
    fn can_become(self, to: TabletState) -> bool {
        use TabletState::*;
        matches!(
            (self, to),
            (Normal, Recovering)
                | (Recovering, Normal)
                | (Normal, LockedForMigration)
        )
    }
}

/// A contiguous key-hash range of one table, as carried on the wire.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize,
)]
pub struct TabletRange {
    pub table_id: TableId,
    pub start_key_hash: KeyHash,
    pub end_key_hash: KeyHash, // inclusive
}

impl TabletRange {
    pub fn new(table_id: TableId, start: KeyHash, end: KeyHash) -> Self {
        TabletRange {
            table_id,
            start_key_hash: start,
            end_key_hash: end,
        }
    }

    #[inline]
    pub fn contains(&self, table_id: TableId, hash: KeyHash) -> bool {
        self.table_id == table_id
            && hash >= self.start_key_hash
            && hash <= self.end_key_hash
    }

    fn overlaps(&self, other: &TabletRange) -> bool {
        self.table_id == other.table_id
            && self.start_key_hash <= other.end_key_hash
            && other.start_key_hash <= self.end_key_hash
    }
}

/// One tablet owned (or being constructed) by this master.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct Tablet {
    pub range: TabletRange,
    pub state: TabletState,
    /// Log position fencing this tablet's creation: entries of the previous
    /// owner before this position can never resurface as live data here.
    pub ctime: LogPosition,
}

/// A contiguous key-range fragment of a secondary index, backed by a regular
/// tablet spanning the full hash range of `backing_table_id`. Keys are
/// compared lexicographically; an empty `first_not_owned_key` means the
/// range extends to the end of the index.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct IndexletRange {
    pub table_id: TableId,
    pub index_id: u8,
    pub first_key: Vec<u8>,
    pub first_not_owned_key: Vec<u8>,
    pub backing_table_id: TableId,
}

impl IndexletRange {
    #[inline]
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.first_key.as_slice()
            && (self.first_not_owned_key.is_empty()
                || key < self.first_not_owned_key.as_slice())
    }

    fn overlaps(&self, other: &IndexletRange) -> bool {
        if self.table_id != other.table_id || self.index_id != other.index_id
        {
            return false;
        }
        let self_unbounded = self.first_not_owned_key.is_empty();
        let other_unbounded = other.first_not_owned_key.is_empty();
        (self_unbounded || other.first_key < self.first_not_owned_key)
            && (other_unbounded || self.first_key < other.first_not_owned_key)
    }
}

/// One indexlet hosted by this master.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Indexlet {
    pub range: IndexletRange,
    pub state: TabletState,
    /// Next B-tree node ID to allocate in the backing table; recovered from
    /// replayed node objects.
    pub next_node_id: u64,
}

/// A disjoint slice of a crashed master's tablets and indexlets assigned to
/// one recovery master.
#[derive(Debug, Default, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct RecoveryPartition {
    pub partition_id: u64,
    pub tablets: Vec<TabletRange>,
    pub indexlets: Vec<IndexletRange>,
}

impl RecoveryPartition {
    /// Whether an entry with this locator belongs to the partition.
    pub fn owns(&self, table_id: TableId, hash: KeyHash) -> bool {
        self.tablets.iter().any(|t| t.contains(table_id, hash))
            || self
                .indexlets
                .iter()
                .any(|i| i.backing_table_id == table_id)
    }
}

/// The tablet and indexlet tables of one master.
#[derive(Debug, Default)]
pub struct TabletManager {
    inner: Mutex<Tables>,
}

#[derive(Debug, Default)]
struct Tables {
    tablets: Vec<Tablet>,
    indexlets: Vec<Indexlet>,
}

impl Tables {
    /// Ensures a tablet exists whose range is exactly `range`, carving it
    /// out of a covering tablet if needed: the covering tablet shrinks to
    /// `range` and the left-over pieces stay behind with their state and
    /// ctime unchanged. `from` restricts which state the covering tablet
    /// must be in. Returns the index of the exact-range tablet.
    fn carve_exact(
        &mut self,
        range: &TabletRange,
        from: Option<TabletState>,
    ) -> Option<usize> {
        let idx = self.tablets.iter().position(|t| {
            t.range.table_id == range.table_id
                && t.range.start_key_hash <= range.start_key_hash
                && t.range.end_key_hash >= range.end_key_hash
                && from.map_or(true, |state| t.state == state)
        })?;
        let covering = self.tablets[idx];
        if covering.range == *range {
            return Some(idx);
        }
        if covering.range.start_key_hash < range.start_key_hash {
            self.tablets.push(Tablet {
                range: TabletRange::new(
                    range.table_id,
                    covering.range.start_key_hash,
                    range.start_key_hash - 1,
                ),
                ..covering
            });
        }
        if covering.range.end_key_hash > range.end_key_hash {
            self.tablets.push(Tablet {
                range: TabletRange::new(
                    range.table_id,
                    range.end_key_hash + 1,
                    covering.range.end_key_hash,
                ),
                ..covering
            });
        }
        self.tablets[idx].range = *range;
        Some(idx)
    }
}

impl TabletManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tablet in the given state. Fails (returning `false`) if the
    /// range overlaps any existing tablet.
    pub fn add_tablet(
        &self,
        range: TabletRange,
        state: TabletState,
        ctime: LogPosition,
    ) -> bool {
        let mut tables = self.inner.lock().unwrap();
        if tables.tablets.iter().any(|t| t.range.overlaps(&range)) {
            return false;
        }
        tables.tablets.push(Tablet {
            range,
            state,
            ctime,
        });
        true
    }

    /// Looks up the tablet covering `(table_id, hash)`, if any.
    pub fn tablet_covering(
        &self,
        table_id: TableId,
        hash: KeyHash,
    ) -> Option<Tablet> {
        let tables = self.inner.lock().unwrap();
        tables
            .tablets
            .iter()
            .find(|t| t.range.contains(table_id, hash))
            .copied()
    }

    /// Whether a single owned tablet contains the whole `[start, end]` range.
    pub fn covers_range(&self, range: &TabletRange) -> Option<Tablet> {
        let tables = self.inner.lock().unwrap();
        tables
            .tablets
            .iter()
            .find(|t| {
                t.range.table_id == range.table_id
                    && t.range.start_key_hash <= range.start_key_hash
                    && t.range.end_key_hash >= range.end_key_hash
            })
            .copied()
    }

    /// Transitions the tablet covering `range` from state `from` to state
    /// `to`, carving `range` out of a larger tablet first when the match is
    /// not exact (the remainder pieces keep state `from`). This is how a
    /// sub-range of a bigger tablet gets locked for migration on its own.
    /// The expected source state is re-checked under the lock; illegal
    /// edges are refused.
    pub fn change_state(
        &self,
        range: &TabletRange,
        from: TabletState,
        to: TabletState,
    ) -> bool {
        if !from.can_become(to) {
            return false;
        }
        let mut tables = self.inner.lock().unwrap();
        match tables.carve_exact(range, Some(from)) {
            Some(idx) => {
                tables.tablets[idx].state = to;
                true
            }
            None => false,
        }
    }

    /// Overwrites the ctime of the tablet covering `range`, carving it out
    /// of a larger tablet first when the match is not exact.
    pub fn set_ctime(&self, range: &TabletRange, ctime: LogPosition) -> bool {
        let mut tables = self.inner.lock().unwrap();
        match tables.carve_exact(range, None) {
            Some(idx) => {
                tables.tablets[idx].ctime = ctime;
                true
            }
            None => false,
        }
    }

    /// Removes the tablet covering `range`, carving it out of a larger
    /// tablet first when the match is not exact (the remainder pieces stay
    /// owned). Idempotent: an uncovered range is a no-op.
    pub fn delete_tablet(&self, range: &TabletRange) -> bool {
        let mut tables = self.inner.lock().unwrap();
        match tables.carve_exact(range, None) {
            Some(idx) => {
                tables.tablets.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Splits the Normal tablet containing `split_hash` into
    /// `[start, split_hash - 1]` and `[split_hash, end]`. Returns `false` if
    /// no such tablet exists or the split point is degenerate.
    pub fn split_tablet(&self, table_id: TableId, split_hash: KeyHash) -> bool {
        let mut tables = self.inner.lock().unwrap();
        let Some(tablet) = tables.tablets.iter_mut().find(|t| {
            t.range.contains(table_id, split_hash)
                && t.state == TabletState::Normal
        }) else {
            return false;
        };
        if split_hash == tablet.range.start_key_hash {
            return false;
        }
        let upper = Tablet {
            range: TabletRange::new(
                table_id,
                split_hash,
                tablet.range.end_key_hash,
            ),
            state: TabletState::Normal,
            ctime: tablet.ctime,
        };
        tablet.range.end_key_hash = split_hash - 1;
        tables.tablets.push(upper);
        true
    }

    /// Whether client reads/writes are admitted for `(table_id, hash)`:
    /// requires an owning tablet in the Normal state.
    pub fn serving(&self, table_id: TableId, hash: KeyHash) -> bool {
        matches!(
            self.tablet_covering(table_id, hash),
            Some(Tablet {
                state: TabletState::Normal,
                ..
            })
        )
    }

    /// Whether `(table_id, hash)` falls in any owned tablet or any hosted
    /// indexlet's backing table, regardless of state. Orphan purging keeps
    /// exactly the keys for which this holds.
    pub fn owns(&self, table_id: TableId, hash: KeyHash) -> bool {
        let tables = self.inner.lock().unwrap();
        tables
            .tablets
            .iter()
            .any(|t| t.range.contains(table_id, hash))
            || tables
                .indexlets
                .iter()
                .any(|i| i.range.backing_table_id == table_id)
    }

    /// Snapshot of all tablets.
    pub fn tablets(&self) -> Vec<Tablet> {
        self.inner.lock().unwrap().tablets.clone()
    }

    // ---- indexlets ----

    /// Adds an indexlet in the given state. Fails if its key range overlaps
    /// an existing indexlet of the same `(table, index)`.
    pub fn add_indexlet(
        &self,
        range: IndexletRange,
        state: TabletState,
        next_node_id: u64,
    ) -> bool {
        let mut tables = self.inner.lock().unwrap();
        if tables.indexlets.iter().any(|i| i.range.overlaps(&range)) {
            return false;
        }
        tables.indexlets.push(Indexlet {
            range,
            state,
            next_node_id,
        });
        true
    }

    /// Looks up the indexlet of `(table, index)` owning `key`.
    pub fn indexlet_covering(
        &self,
        table_id: TableId,
        index_id: u8,
        key: &[u8],
    ) -> Option<Indexlet> {
        let tables = self.inner.lock().unwrap();
        tables
            .indexlets
            .iter()
            .find(|i| {
                i.range.table_id == table_id
                    && i.range.index_id == index_id
                    && i.range.contains_key(key)
            })
            .cloned()
    }

    /// Transitions the exact indexlet `range` between states, with the same
    /// rules as tablets.
    pub fn change_indexlet_state(
        &self,
        range: &IndexletRange,
        from: TabletState,
        to: TabletState,
    ) -> bool {
        if !from.can_become(to) {
            return false;
        }
        let mut tables = self.inner.lock().unwrap();
        match tables.indexlets.iter_mut().find(|i| i.range == *range) {
            Some(indexlet) if indexlet.state == from => {
                indexlet.state = to;
                true
            }
            _ => false,
        }
    }

    /// Truncates the indexlet owning `split_key` so that it no longer owns
    /// `[split_key, ..)`. Used by indexlet split-and-migrate right before
    /// the write quiesce, so no new inserts reach the migrating half.
    pub fn truncate_indexlet(
        &self,
        table_id: TableId,
        index_id: u8,
        split_key: &[u8],
    ) -> bool {
        let mut tables = self.inner.lock().unwrap();
        match tables.indexlets.iter_mut().find(|i| {
            i.range.table_id == table_id
                && i.range.index_id == index_id
                && i.range.contains_key(split_key)
        }) {
            Some(indexlet) => {
                indexlet.range.first_not_owned_key = split_key.to_vec();
                true
            }
            None => false,
        }
    }

    /// Removes the exact indexlet `range`. Idempotent.
    pub fn delete_indexlet(&self, range: &IndexletRange) -> bool {
        let mut tables = self.inner.lock().unwrap();
        let before = tables.indexlets.len();
        tables.indexlets.retain(|i| i.range != *range);
        tables.indexlets.len() != before
    }

    /// Raises the recorded next node ID of the indexlet owning `key` if the
    /// observed value is higher.
    pub fn set_next_node_id_if_higher(
        &self,
        table_id: TableId,
        index_id: u8,
        key: &[u8],
        observed: u64,
    ) -> bool {
        let mut tables = self.inner.lock().unwrap();
        match tables.indexlets.iter_mut().find(|i| {
            i.range.table_id == table_id
                && i.range.index_id == index_id
                && i.range.contains_key(key)
        }) {
            Some(indexlet) => {
                if observed > indexlet.next_node_id {
                    indexlet.next_node_id = observed;
                }
                true
            }
            None => false,
        }
    }

    /// Snapshot of all indexlets.
    pub fn indexlets(&self) -> Vec<Indexlet> {
        self.inner.lock().unwrap().indexlets.clone()
    }
}

#[cfg(test)]
mod tablets_tests {
    use super::*;

    fn range(table: TableId, start: KeyHash, end: KeyHash) -> TabletRange {
        TabletRange::new(table, start, end)
    }

    #[test]
    fn add_rejects_overlap() {
        let tm = TabletManager::new();
        assert!(tm.add_tablet(
            range(1, 0, 99),
            TabletState::Normal,
            LogPosition::default()
        ));
        assert!(!tm.add_tablet(
            range(1, 50, 150),
            TabletState::Normal,
            LogPosition::default()
        ));
        // different table is fine
        assert!(tm.add_tablet(
            range(2, 50, 150),
            TabletState::Normal,
            LogPosition::default()
        ));
        // adjacent non-overlapping range is fine
        assert!(tm.add_tablet(
            range(1, 100, 199),
            TabletState::Recovering,
            LogPosition::default()
        ));
    }

    #[test]
    fn state_machine_allowed_edges() {
        let r = range(1, 0, u64::MAX);
        let tm = TabletManager::new();
        assert!(tm.add_tablet(r, TabletState::Recovering, LogPosition::default()));

        // Recovering -> Normal ok
        assert!(tm.change_state(&r, TabletState::Recovering, TabletState::Normal));
        // Normal -> LockedForMigration ok
        assert!(tm.change_state(
            &r,
            TabletState::Normal,
            TabletState::LockedForMigration
        ));
        // LockedForMigration -> anything is not allowed; only deletion
        assert!(!tm.change_state(
            &r,
            TabletState::LockedForMigration,
            TabletState::Normal
        ));
        assert!(!tm.change_state(
            &r,
            TabletState::LockedForMigration,
            TabletState::Recovering
        ));
        assert!(tm.delete_tablet(&r));
        assert!(!tm.delete_tablet(&r)); // idempotent
    }

    #[test]
    fn change_state_carves_sub_range() {
        let tm = TabletManager::new();
        assert!(tm.add_tablet(
            range(1, 0, 99),
            TabletState::Normal,
            LogPosition::new(3, 8)
        ));
        assert!(tm.change_state(
            &range(1, 40, 59),
            TabletState::Normal,
            TabletState::LockedForMigration
        ));

        let left = tm.tablet_covering(1, 39).unwrap();
        let locked = tm.tablet_covering(1, 50).unwrap();
        let right = tm.tablet_covering(1, 60).unwrap();
        assert_eq!(left.range, range(1, 0, 39));
        assert_eq!(left.state, TabletState::Normal);
        assert_eq!(locked.range, range(1, 40, 59));
        assert_eq!(locked.state, TabletState::LockedForMigration);
        assert_eq!(right.range, range(1, 60, 99));
        assert_eq!(right.state, TabletState::Normal);
        // every carved piece keeps the parent's ctime
        for piece in [left, locked, right] {
            assert_eq!(piece.ctime, LogPosition::new(3, 8));
        }
    }

    #[test]
    fn change_state_carves_prefix() {
        let tm = TabletManager::new();
        assert!(tm.add_tablet(
            range(1, 0, 99),
            TabletState::Normal,
            LogPosition::default()
        ));
        assert!(tm.change_state(
            &range(1, 0, 49),
            TabletState::Normal,
            TabletState::LockedForMigration
        ));
        assert_eq!(
            tm.tablet_covering(1, 0).unwrap().range,
            range(1, 0, 49)
        );
        let rest = tm.tablet_covering(1, 50).unwrap();
        assert_eq!(rest.range, range(1, 50, 99));
        assert_eq!(rest.state, TabletState::Normal);
    }

    #[test]
    fn delete_tablet_carves_sub_range() {
        let tm = TabletManager::new();
        assert!(tm.add_tablet(
            range(1, 0, 99),
            TabletState::Normal,
            LogPosition::default()
        ));
        assert!(tm.delete_tablet(&range(1, 40, 59)));
        assert!(tm.tablet_covering(1, 50).is_none());
        // the remainder pieces stay owned and serving
        assert!(tm.serving(1, 39));
        assert!(tm.serving(1, 60));
        // already carved away
        assert!(!tm.delete_tablet(&range(1, 40, 59)));
    }

    #[test]
    fn change_state_rechecks_source() {
        let r = range(1, 0, 9);
        let tm = TabletManager::new();
        assert!(tm.add_tablet(r, TabletState::Normal, LogPosition::default()));
        // stale reader thought it was Recovering; refused under the lock
        assert!(!tm.change_state(&r, TabletState::Recovering, TabletState::Normal));
        assert_eq!(
            tm.tablet_covering(1, 5).unwrap().state,
            TabletState::Normal
        );
    }

    #[test]
    fn serving_requires_normal() {
        let tm = TabletManager::new();
        assert!(tm.add_tablet(
            range(1, 0, 9),
            TabletState::Recovering,
            LogPosition::default()
        ));
        assert!(!tm.serving(1, 5));
        assert!(tm.change_state(
            &range(1, 0, 9),
            TabletState::Recovering,
            TabletState::Normal
        ));
        assert!(tm.serving(1, 5));
        assert!(!tm.serving(1, 10));
    }

    #[test]
    fn split_tablet_in_place() {
        let tm = TabletManager::new();
        assert!(tm.add_tablet(
            range(1, 0, 99),
            TabletState::Normal,
            LogPosition::new(2, 16)
        ));
        assert!(tm.split_tablet(1, 50));
        let low = tm.tablet_covering(1, 49).unwrap();
        let high = tm.tablet_covering(1, 50).unwrap();
        assert_eq!(low.range, range(1, 0, 49));
        assert_eq!(high.range, range(1, 50, 99));
        // both halves keep the parent's ctime
        assert_eq!(low.ctime, LogPosition::new(2, 16));
        assert_eq!(high.ctime, LogPosition::new(2, 16));
        // splitting at an unknown point fails
        assert!(!tm.split_tablet(1, 200));
        assert!(!tm.split_tablet(2, 50));
    }

    #[test]
    fn indexlet_ranges_and_truncate() {
        let tm = TabletManager::new();
        let idx = IndexletRange {
            table_id: 9,
            index_id: 1,
            first_key: b"a".to_vec(),
            first_not_owned_key: vec![], // unbounded
            backing_table_id: 90,
        };
        assert!(tm.add_indexlet(idx.clone(), TabletState::Normal, 0));
        // overlapping add refused
        let overlap = IndexletRange {
            first_key: b"m".to_vec(),
            ..idx.clone()
        };
        assert!(!tm.add_indexlet(overlap, TabletState::Normal, 0));

        assert!(tm.indexlet_covering(9, 1, b"zebra").is_some());
        assert!(tm.truncate_indexlet(9, 1, b"m"));
        assert!(tm.indexlet_covering(9, 1, b"lion").is_some());
        assert!(tm.indexlet_covering(9, 1, b"zebra").is_none());

        // truncated half can now be added elsewhere without overlap
        let upper = IndexletRange {
            table_id: 9,
            index_id: 1,
            first_key: b"m".to_vec(),
            first_not_owned_key: vec![],
            backing_table_id: 91,
        };
        assert!(tm.add_indexlet(upper, TabletState::Recovering, 0));
    }

    #[test]
    fn next_node_id_only_raises() {
        let tm = TabletManager::new();
        let idx = IndexletRange {
            table_id: 9,
            index_id: 1,
            first_key: vec![],
            first_not_owned_key: vec![],
            backing_table_id: 90,
        };
        assert!(tm.add_indexlet(idx, TabletState::Normal, 5));
        assert!(tm.set_next_node_id_if_higher(9, 1, b"k", 9));
        assert!(tm.set_next_node_id_if_higher(9, 1, b"k", 3));
        assert_eq!(tm.indexlets()[0].next_node_id, 9);
    }

    #[test]
    fn recovery_partition_owns() {
        let part = RecoveryPartition {
            partition_id: 0,
            tablets: vec![range(1, 0, 9)],
            indexlets: vec![IndexletRange {
                table_id: 9,
                index_id: 1,
                first_key: vec![],
                first_not_owned_key: vec![],
                backing_table_id: 90,
            }],
        };
        assert!(part.owns(1, 5));
        assert!(!part.owns(1, 10));
        assert!(part.owns(90, 12345)); // via indexlet backing table
        assert!(!part.owns(91, 0));
    }
}
