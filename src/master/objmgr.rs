//! Object manager: the in-memory log-structured object store of one master.
//!
//! All live data sits in RAM: an append-only log of fixed-capacity segments
//! plus a hash table mapping each key to its live log entry (or to the
//! version of its latest tombstone). Crash recovery and migration replay
//! foreign log entries through a transactional `SideLog`, whose contents
//! become visible to readers only at `commit()`.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::master::segment::{
    Certificate, EntryType, SegmentBuf, SegmentIter, ENTRY_HEADER_LEN,
};
use crate::utils::{EmberError, LogPosition, SegmentId, ServerId};

/// Table identifier type.
pub type TableId = u64;

/// 64-bit hash of an object key; tablets partition the hash space.
pub type KeyHash = u64;

/// Hashes a key into the tablet hash space. Deterministic across servers.
pub fn key_hash(key: &[u8]) -> KeyHash {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Tag identifying the client RPC that produced a write, used to suppress
/// duplicate linearizable RPCs after recovery.
pub type RpcTag = (u64, u64); // (client lease id, rpc id)

/// A stored object value, as serialized into log entries.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Object {
    pub table_id: TableId,
    pub key: Vec<u8>,
    pub version: u64,
    pub timestamp: u64,
    pub value: Vec<u8>,
    pub rpc_tag: Option<RpcTag>,
}

/// A deletion marker for an object version.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    pub table_id: TableId,
    pub key: Vec<u8>,
    /// Version of the object this tombstone kills.
    pub version: u64,
    pub timestamp: u64,
}

/// Commit/abort outcome of a distributed transaction.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum TxOutcome {
    Commit,
    Abort,
}

/// A transaction decision record; replayed so that the new owner of a tablet
/// can re-establish the locks of still-pending operations.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TxDecision {
    pub tx_id: u64,
    pub table_id: TableId,
    pub key_hash: KeyHash,
    pub outcome: TxOutcome,
}

/// One decoded log entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    Object(Object),
    Tombstone(Tombstone),
    TxDecision(TxDecision),
}

impl LogEntry {
    /// The segment entry type tag for this entry.
    pub fn entry_type(&self) -> EntryType {
        match self {
            LogEntry::Object(_) => EntryType::Object,
            LogEntry::Tombstone(_) => EntryType::Tombstone,
            LogEntry::TxDecision(_) => EntryType::TxDecision,
        }
    }

    /// Serializes the entry payload.
    pub fn encode(&self) -> Result<Vec<u8>, EmberError> {
        Ok(rmp_serde::encode::to_vec(self)?)
    }

    /// Deserializes an entry payload; the decoded variant must agree with
    /// the segment's type tag.
    pub fn decode(ty: EntryType, payload: &[u8]) -> Result<Self, EmberError> {
        let entry: LogEntry = rmp_serde::decode::from_slice(payload)?;
        if entry.entry_type() != ty {
            return Err(EmberError::msg(
                "entry type tag disagrees with payload",
            ));
        }
        Ok(entry)
    }

    /// `(table_id, key_hash)` of the entry, for tablet-range filtering.
    pub fn locator(&self) -> (TableId, KeyHash) {
        match self {
            LogEntry::Object(o) => (o.table_id, key_hash(&o.key)),
            LogEntry::Tombstone(t) => (t.table_id, key_hash(&t.key)),
            LogEntry::TxDecision(d) => (d.table_id, d.key_hash),
        }
    }
}

/// What the hash table knows about one key.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum KeySlot {
    /// Key is live; its current entry is at `pos`.
    Live { version: u64, pos: LogPosition },

    /// Key was deleted; remembers the tombstone's version so stale object
    /// versions replayed later cannot resurrect it.
    Dead { version: u64 },
}

impl KeySlot {
    fn version(&self) -> u64 {
        match self {
            KeySlot::Live { version, .. } | KeySlot::Dead { version } => {
                *version
            }
        }
    }
}

/// One segment of the in-memory log.
#[derive(Debug)]
struct LogSegment {
    buf: SegmentBuf,
    closed: bool,
}

/// The master's in-memory log: an ordered collection of segments with one
/// open head. Also the allocator of segment IDs, including the IDs that
/// side-logs write under.
#[derive(Debug)]
pub struct Log {
    segments: BTreeMap<SegmentId, LogSegment>,
    head_id: SegmentId,
    next_seg_id: SegmentId,
    seg_capacity: usize,
    max_segments: usize,
}

impl Log {
    fn new(seg_capacity: usize, max_segments: usize) -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(
            1,
            LogSegment {
                buf: SegmentBuf::new(seg_capacity),
                closed: false,
            },
        );
        Log {
            segments,
            head_id: 1,
            next_seg_id: 2,
            seg_capacity,
            max_segments,
        }
    }

    /// Current head position: where the next entry will be appended.
    pub fn head(&self) -> LogPosition {
        LogPosition::new(
            self.head_id,
            self.segments[&self.head_id].buf.tail_offset(),
        )
    }

    /// Closes the current head segment and opens a fresh one, returning the
    /// new head position. The returned position fences everything appended
    /// before the roll.
    pub fn roll_head_over(&mut self) -> Result<LogPosition, EmberError> {
        self.segments.get_mut(&self.head_id).unwrap().closed = true;
        let new_id = self.alloc_segment_id();
        self.install_segment(
            new_id,
            SegmentBuf::new(self.seg_capacity),
            false,
        )?;
        self.head_id = new_id;
        Ok(LogPosition::new(new_id, 0))
    }

    /// Appends an encoded entry to the head, rolling the head when full.
    fn append(
        &mut self,
        ty: EntryType,
        payload: &[u8],
    ) -> Result<LogPosition, EmberError> {
        let head = self.segments.get_mut(&self.head_id).unwrap();
        if !head.buf.could_ever_fit(payload.len()) {
            return Err(EmberError(format!(
                "entry of {} bytes cannot fit in any segment",
                payload.len()
            )));
        }
        let offset = head.buf.tail_offset();
        if head.buf.append(ty, payload) {
            return Ok(LogPosition::new(self.head_id, offset));
        }
        // head full; roll over and retry on the fresh segment
        self.roll_head_over()?;
        let head = self.segments.get_mut(&self.head_id).unwrap();
        let offset = head.buf.tail_offset();
        if !head.buf.append(ty, payload) {
            return Err(EmberError::msg("fresh head rejected entry"));
        }
        Ok(LogPosition::new(self.head_id, offset))
    }

    fn alloc_segment_id(&mut self) -> SegmentId {
        let id = self.next_seg_id;
        self.next_seg_id += 1;
        id
    }

    fn install_segment(
        &mut self,
        id: SegmentId,
        buf: SegmentBuf,
        closed: bool,
    ) -> Result<(), EmberError> {
        if self.segments.len() >= self.max_segments {
            return Err(EmberError::msg("log out of space"));
        }
        self.segments.insert(id, LogSegment { buf, closed });
        Ok(())
    }

    /// Resolves a log position to the entry stored there.
    pub fn entry_at(&self, pos: LogPosition) -> Option<(EntryType, &[u8])> {
        self.segments.get(&pos.segment_id)?.buf.entry_at(pos.offset)
    }

    /// Iterates entries in `[from, upto)` position order (oldest first).
    pub fn iter_range(
        &self,
        from: LogPosition,
        upto: LogPosition,
    ) -> impl Iterator<Item = (LogPosition, EntryType, &[u8])> + '_ {
        self.segments
            .range(from.segment_id..=upto.segment_id)
            .flat_map(move |(&seg_id, seg)| {
                let mut entries = Vec::new();
                let mut off = if seg_id == from.segment_id {
                    from.offset
                } else {
                    0
                };
                while let Some((ty, payload)) = seg.buf.entry_at(off) {
                    let pos = LogPosition::new(seg_id, off);
                    if pos >= upto {
                        break;
                    }
                    entries.push((pos, ty, payload));
                    off += (ENTRY_HEADER_LEN + payload.len()) as u32;
                }
                entries
            })
    }
}

/// Statistics returned by one `replay_segment` call.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct ReplayStats {
    pub objects_kept: u64,
    pub objects_skipped: u64,
    pub tombstones: u64,
    pub decisions: u64,
}

/// A transactional append region against the main log. Entries and
/// hash-table updates buffered here become visible to readers only after
/// `ObjectManager::commit_side_log`; dropping the side-log discards them.
#[derive(Debug)]
pub struct SideLog {
    segs: Vec<(SegmentId, SegmentBuf)>,
    delta: HashMap<(TableId, Vec<u8>), KeySlot>,
    decisions: Vec<TxDecision>,
    rpc_tags: Vec<(RpcTag, u64)>,
    seg_capacity: usize,
}

impl SideLog {
    fn append(
        &mut self,
        log: &mut Log,
        ty: EntryType,
        payload: &[u8],
    ) -> Result<LogPosition, EmberError> {
        if let Some((id, buf)) = self.segs.last_mut() {
            let offset = buf.tail_offset();
            if buf.append(ty, payload) {
                return Ok(LogPosition::new(*id, offset));
            }
        }
        // need a fresh side segment
        let mut buf = SegmentBuf::new(self.seg_capacity);
        if !buf.could_ever_fit(payload.len()) {
            return Err(EmberError(format!(
                "entry of {} bytes cannot fit in any segment",
                payload.len()
            )));
        }
        if log.segments.len() + self.segs.len() >= log.max_segments {
            return Err(EmberError::msg("log out of space"));
        }
        let id = log.alloc_segment_id();
        let offset = buf.tail_offset();
        if !buf.append(ty, payload) {
            return Err(EmberError::msg("fresh side segment rejected entry"));
        }
        self.segs.push((id, buf));
        Ok(LogPosition::new(id, offset))
    }
}

/// Everything a committed side-log hands back to the server glue: the closed
/// segments that must reach backup durability, plus the recovered state that
/// lives outside the object manager.
#[derive(Debug)]
pub struct SideLogCommit {
    pub segments: Vec<(SegmentId, Bytes, Certificate)>,
    pub decisions: Vec<TxDecision>,
    pub rpc_tags: Vec<(RpcTag, u64)>,
}

/// The object manager of one master. Methods take `&mut self`; callers
/// (the server event loop) serialize access.
#[derive(Debug)]
pub struct ObjectManager {
    me: ServerId,
    log: Log,
    table: HashMap<(TableId, Vec<u8>), KeySlot>,
}

impl ObjectManager {
    /// Creates an empty object manager with the given segment geometry.
    pub fn new(me: ServerId, seg_capacity: usize, max_segments: usize) -> Self {
        ObjectManager {
            me,
            log: Log::new(seg_capacity, max_segments),
            table: HashMap::new(),
        }
    }

    /// Read-only access to the log (migration iterates it directly).
    pub fn log(&self) -> &Log {
        &self.log
    }

    /// Closes the head segment and opens a fresh one; see `Log::roll_head_over`.
    pub fn roll_head_over(&mut self) -> Result<LogPosition, EmberError> {
        self.log.roll_head_over()
    }

    /// Writes (or overwrites) an object, assigning the next version for its
    /// key. Returns the new version.
    pub fn write_object(
        &mut self,
        table_id: TableId,
        key: &[u8],
        value: Vec<u8>,
        timestamp: u64,
        rpc_tag: Option<RpcTag>,
    ) -> Result<u64, EmberError> {
        let slot_key = (table_id, key.to_vec());
        let version = self
            .table
            .get(&slot_key)
            .map(|slot| slot.version() + 1)
            .unwrap_or(1);
        let entry = LogEntry::Object(Object {
            table_id,
            key: key.to_vec(),
            version,
            timestamp,
            value,
            rpc_tag,
        });
        let payload = entry.encode()?;
        let pos = self.log.append(EntryType::Object, &payload)?;
        self.table.insert(slot_key, KeySlot::Live { version, pos });
        Ok(version)
    }

    /// Reads the live version and value of a key, if any.
    pub fn read_object(
        &self,
        table_id: TableId,
        key: &[u8],
    ) -> Option<(u64, Vec<u8>)> {
        match self.table.get(&(table_id, key.to_vec()))? {
            KeySlot::Live { pos, .. } => {
                let (ty, payload) = self.log.entry_at(*pos)?;
                match LogEntry::decode(ty, payload).ok()? {
                    LogEntry::Object(o) => Some((o.version, o.value)),
                    _ => None,
                }
            }
            KeySlot::Dead { .. } => None,
        }
    }

    /// Deletes a key by appending a tombstone for its live version. Returns
    /// the deleted version, or `None` if the key was not live.
    pub fn delete_object(
        &mut self,
        table_id: TableId,
        key: &[u8],
        timestamp: u64,
    ) -> Result<Option<u64>, EmberError> {
        let slot_key = (table_id, key.to_vec());
        let version = match self.table.get(&slot_key) {
            Some(KeySlot::Live { version, .. }) => *version,
            _ => return Ok(None),
        };
        let entry = LogEntry::Tombstone(Tombstone {
            table_id,
            key: key.to_vec(),
            version,
            timestamp,
        });
        let payload = entry.encode()?;
        self.log.append(EntryType::Tombstone, &payload)?;
        self.table.insert(slot_key, KeySlot::Dead { version });
        Ok(Some(version))
    }

    /// Appends a transaction decision record to the log.
    pub fn log_tx_decision(
        &mut self,
        decision: TxDecision,
    ) -> Result<LogPosition, EmberError> {
        let payload = LogEntry::TxDecision(decision).encode()?;
        self.log.append(EntryType::TxDecision, &payload)
    }

    /// Whether the hash table still points at the log entry at `pos` for
    /// this key, i.e. whether that entry is the live version.
    pub fn key_points_at(
        &self,
        table_id: TableId,
        key: &[u8],
        pos: LogPosition,
    ) -> bool {
        matches!(
            self.table.get(&(table_id, key.to_vec())),
            Some(KeySlot::Live { pos: live_pos, .. }) if *live_pos == pos
        )
    }

    /// Opens a new side-log against this manager's log.
    pub fn new_side_log(&self) -> SideLog {
        SideLog {
            segs: Vec::new(),
            delta: HashMap::new(),
            decisions: Vec::new(),
            rpc_tags: Vec::new(),
            seg_capacity: self.log.seg_capacity,
        }
    }

    /// Replays one recovery segment into a side-log. Replay order across
    /// segments is unconstrained: duplicates are resolved by `(key, version)`,
    /// keeping the highest object version or the latest tombstone. For
    /// tables listed in `next_node_ids` (indexlet backing tables), tracks one
    /// past the highest node ID seen among replayed objects.
    pub fn replay_segment(
        &mut self,
        side: &mut SideLog,
        iter: SegmentIter<'_>,
        next_node_ids: &mut HashMap<TableId, u64>,
    ) -> Result<ReplayStats, EmberError> {
        let mut stats = ReplayStats::default();
        for seg_entry in iter {
            let entry = LogEntry::decode(seg_entry.ty, seg_entry.payload)?;
            match entry {
                LogEntry::Object(obj) => {
                    let slot_key = (obj.table_id, obj.key.clone());
                    let superseded = side
                        .delta
                        .get(&slot_key)
                        .is_some_and(|slot| slot.version() >= obj.version);
                    if superseded {
                        stats.objects_skipped += 1;
                        continue;
                    }
                    if let Some(next_id) =
                        next_node_ids.get_mut(&obj.table_id)
                    {
                        if let Ok(node) =
                            <[u8; 8]>::try_from(obj.key.as_slice())
                        {
                            let node = u64::from_be_bytes(node);
                            if node + 1 > *next_id {
                                *next_id = node + 1;
                            }
                        }
                    }
                    if let Some(tag) = obj.rpc_tag {
                        side.rpc_tags.push((tag, obj.version));
                    }
                    let version = obj.version;
                    let pos = side.append(
                        &mut self.log,
                        EntryType::Object,
                        seg_entry.payload,
                    )?;
                    side.delta
                        .insert(slot_key, KeySlot::Live { version, pos });
                    stats.objects_kept += 1;
                }

                LogEntry::Tombstone(tomb) => {
                    let slot_key = (tomb.table_id, tomb.key.clone());
                    let superseded = side
                        .delta
                        .get(&slot_key)
                        .is_some_and(|slot| slot.version() > tomb.version);
                    if !superseded {
                        side.append(
                            &mut self.log,
                            EntryType::Tombstone,
                            seg_entry.payload,
                        )?;
                        side.delta.insert(
                            slot_key,
                            KeySlot::Dead {
                                version: tomb.version,
                            },
                        );
                    }
                    stats.tombstones += 1;
                }

                LogEntry::TxDecision(dec) => {
                    side.append(
                        &mut self.log,
                        EntryType::TxDecision,
                        seg_entry.payload,
                    )?;
                    side.decisions.push(dec);
                    stats.decisions += 1;
                }
            }
        }
        pf_trace!(self.me; "replayed segment: {} objects kept, {} skipped, \
                            {} tombstones, {} decisions",
                           stats.objects_kept, stats.objects_skipped,
                           stats.tombstones, stats.decisions);
        Ok(stats)
    }

    /// Commits a side-log: installs its segments into the log and merges its
    /// hash-table delta, in one atomic step with respect to readers (the
    /// event loop never observes a partial merge). Returns the closed
    /// segments for backup durability sync plus the recovered side state.
    pub fn commit_side_log(
        &mut self,
        side: SideLog,
    ) -> Result<SideLogCommit, EmberError> {
        let mut segments = Vec::with_capacity(side.segs.len());
        for (id, buf) in side.segs {
            let (bytes, cert) = buf.clone().close();
            self.log.install_segment(id, buf, true)?;
            segments.push((id, bytes, cert));
        }
        for (slot_key, slot) in side.delta {
            self.table.insert(slot_key, slot);
        }
        pf_debug!(self.me; "side-log committed: {} segments now durable-bound",
                           segments.len());
        Ok(SideLogCommit {
            segments,
            decisions: side.decisions,
            rpc_tags: side.rpc_tags,
        })
    }

    /// Drops every hash-table entry whose `(table_id, key_hash)` the given
    /// predicate disowns. Called after tablet deletion or a cancelled
    /// recovery; the log entries themselves stay behind as garbage.
    pub fn remove_orphans(
        &mut self,
        owned: impl Fn(TableId, KeyHash) -> bool,
    ) -> usize {
        let before = self.table.len();
        self.table
            .retain(|(table_id, key), _| owned(*table_id, key_hash(key)));
        before - self.table.len()
    }

    /// Number of keys currently tracked (live or dead).
    pub fn tracked_keys(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod objmgr_tests {
    use super::*;

    fn new_mgr() -> ObjectManager {
        ObjectManager::new(ServerId::new(1, 1), 1024, 64)
    }

    fn encode_object(
        table_id: TableId,
        key: &[u8],
        version: u64,
        value: &[u8],
    ) -> Vec<u8> {
        LogEntry::Object(Object {
            table_id,
            key: key.to_vec(),
            version,
            timestamp: 0,
            value: value.to_vec(),
            rpc_tag: None,
        })
        .encode()
        .unwrap()
    }

    fn encode_tombstone(table_id: TableId, key: &[u8], version: u64) -> Vec<u8> {
        LogEntry::Tombstone(Tombstone {
            table_id,
            key: key.to_vec(),
            version,
            timestamp: 0,
        })
        .encode()
        .unwrap()
    }

    /// Builds a closed recovery segment from encoded payloads.
    fn build_segment(
        entries: &[(EntryType, Vec<u8>)],
    ) -> (Bytes, Certificate) {
        let mut seg = SegmentBuf::new(4096);
        for (ty, payload) in entries {
            assert!(seg.append(*ty, payload));
        }
        seg.close()
    }

    #[test]
    fn write_read_delete_cycle() -> Result<(), EmberError> {
        let mut mgr = new_mgr();
        assert_eq!(mgr.write_object(5, b"alpha", b"v1".to_vec(), 1, None)?, 1);
        assert_eq!(mgr.write_object(5, b"alpha", b"v2".to_vec(), 2, None)?, 2);
        assert_eq!(mgr.read_object(5, b"alpha"), Some((2, b"v2".to_vec())));

        assert_eq!(mgr.delete_object(5, b"alpha", 3)?, Some(2));
        assert_eq!(mgr.read_object(5, b"alpha"), None);
        // next write resumes above the tombstone's version
        assert_eq!(mgr.write_object(5, b"alpha", b"v3".to_vec(), 4, None)?, 3);
        Ok(())
    }

    #[test]
    fn versions_roll_across_head_segments() -> Result<(), EmberError> {
        let mut mgr = ObjectManager::new(ServerId::new(1, 1), 128, 64);
        for i in 0..32u64 {
            mgr.write_object(1, b"k", vec![i as u8; 16], i, None)?;
        }
        assert_eq!(mgr.read_object(1, b"k").unwrap().0, 32);
        Ok(())
    }

    #[test]
    fn replay_keeps_highest_version() -> Result<(), EmberError> {
        let mut mgr = new_mgr();
        let (bytes, cert) = build_segment(&[
            (EntryType::Object, encode_object(7, b"k", 2, b"new")),
            (EntryType::Object, encode_object(7, b"k", 1, b"old")),
        ]);
        let mut side = mgr.new_side_log();
        let stats = mgr.replay_segment(
            &mut side,
            SegmentIter::new(&bytes, &cert)?,
            &mut HashMap::new(),
        )?;
        assert_eq!(stats.objects_kept, 1);
        assert_eq!(stats.objects_skipped, 1);

        mgr.commit_side_log(side)?;
        assert_eq!(mgr.read_object(7, b"k"), Some((2, b"new".to_vec())));
        Ok(())
    }

    #[test]
    fn replay_tombstone_wins_over_equal_version() -> Result<(), EmberError> {
        let mut mgr = new_mgr();
        let (bytes, cert) = build_segment(&[
            (EntryType::Object, encode_object(7, b"k", 3, b"doomed")),
            (EntryType::Tombstone, encode_tombstone(7, b"k", 3)),
            (EntryType::Object, encode_object(7, b"k", 2, b"stale")),
        ]);
        let mut side = mgr.new_side_log();
        mgr.replay_segment(
            &mut side,
            SegmentIter::new(&bytes, &cert)?,
            &mut HashMap::new(),
        )?;
        mgr.commit_side_log(side)?;
        assert_eq!(mgr.read_object(7, b"k"), None);
        Ok(())
    }

    #[test]
    fn replay_across_segments_any_order() -> Result<(), EmberError> {
        // same key versions scattered over two segments, replayed new-first
        let (seg_a, cert_a) = build_segment(&[(
            EntryType::Object,
            encode_object(9, b"x", 5, b"latest"),
        )]);
        let (seg_b, cert_b) = build_segment(&[
            (EntryType::Object, encode_object(9, b"x", 4, b"older")),
            (EntryType::Object, encode_object(9, b"y", 1, b"other")),
        ]);

        let mut mgr = new_mgr();
        let mut side = mgr.new_side_log();
        let mut node_ids = HashMap::new();
        mgr.replay_segment(
            &mut side,
            SegmentIter::new(&seg_a, &cert_a)?,
            &mut node_ids,
        )?;
        mgr.replay_segment(
            &mut side,
            SegmentIter::new(&seg_b, &cert_b)?,
            &mut node_ids,
        )?;
        mgr.commit_side_log(side)?;

        assert_eq!(mgr.read_object(9, b"x"), Some((5, b"latest".to_vec())));
        assert_eq!(mgr.read_object(9, b"y"), Some((1, b"other".to_vec())));
        Ok(())
    }

    #[test]
    fn side_log_invisible_until_commit() -> Result<(), EmberError> {
        let mut mgr = new_mgr();
        let (bytes, cert) = build_segment(&[(
            EntryType::Object,
            encode_object(3, b"ghost", 1, b"boo"),
        )]);
        let mut side = mgr.new_side_log();
        mgr.replay_segment(
            &mut side,
            SegmentIter::new(&bytes, &cert)?,
            &mut HashMap::new(),
        )?;

        // nothing visible before commit
        assert_eq!(mgr.read_object(3, b"ghost"), None);
        assert_eq!(mgr.tracked_keys(), 0);

        mgr.commit_side_log(side)?;
        assert_eq!(mgr.read_object(3, b"ghost"), Some((1, b"boo".to_vec())));
        Ok(())
    }

    #[test]
    fn side_log_abort_discards_everything() -> Result<(), EmberError> {
        let mut mgr = new_mgr();
        let (bytes, cert) = build_segment(&[(
            EntryType::Object,
            encode_object(3, b"ghost", 1, b"boo"),
        )]);
        let mut side = mgr.new_side_log();
        mgr.replay_segment(
            &mut side,
            SegmentIter::new(&bytes, &cert)?,
            &mut HashMap::new(),
        )?;
        drop(side); // abort

        assert_eq!(mgr.read_object(3, b"ghost"), None);
        assert_eq!(mgr.tracked_keys(), 0);
        Ok(())
    }

    #[test]
    fn replay_tracks_next_node_id() -> Result<(), EmberError> {
        let mut mgr = new_mgr();
        let (bytes, cert) = build_segment(&[
            (
                EntryType::Object,
                encode_object(40, &7u64.to_be_bytes(), 1, b"node7"),
            ),
            (
                EntryType::Object,
                encode_object(40, &3u64.to_be_bytes(), 1, b"node3"),
            ),
            (EntryType::Object, encode_object(41, b"plain", 1, b"kv")),
        ]);
        let mut side = mgr.new_side_log();
        let mut node_ids = HashMap::from([(40u64, 0u64)]);
        mgr.replay_segment(
            &mut side,
            SegmentIter::new(&bytes, &cert)?,
            &mut node_ids,
        )?;
        assert_eq!(node_ids[&40], 8); // one past the highest node seen
        assert_eq!(node_ids.len(), 1); // table 41 not tracked
        Ok(())
    }

    #[test]
    fn commit_returns_durable_segments() -> Result<(), EmberError> {
        let mut mgr = new_mgr();
        let (bytes, cert) = build_segment(&[(
            EntryType::Object,
            encode_object(3, b"k", 1, b"v"),
        )]);
        let mut side = mgr.new_side_log();
        mgr.replay_segment(
            &mut side,
            SegmentIter::new(&bytes, &cert)?,
            &mut HashMap::new(),
        )?;
        let commit = mgr.commit_side_log(side)?;
        assert_eq!(commit.segments.len(), 1);
        let (_, seg_bytes, seg_cert) = &commit.segments[0];
        // returned segments carry valid certificates
        assert_eq!(SegmentIter::new(seg_bytes, seg_cert)?.count(), 1);
        Ok(())
    }

    #[test]
    fn remove_orphans_drops_disowned_keys() -> Result<(), EmberError> {
        let mut mgr = new_mgr();
        mgr.write_object(1, b"keep", b"v".to_vec(), 0, None)?;
        mgr.write_object(2, b"drop", b"v".to_vec(), 0, None)?;
        let purged = mgr.remove_orphans(|table_id, _| table_id == 1);
        assert_eq!(purged, 1);
        assert!(mgr.read_object(1, b"keep").is_some());
        assert!(mgr.read_object(2, b"drop").is_none());
        Ok(())
    }

    #[test]
    fn log_out_of_space_surfaces() {
        let mut mgr = ObjectManager::new(ServerId::new(1, 1), 64, 2);
        let mut failed = false;
        for i in 0..64u64 {
            if mgr
                .write_object(1, &i.to_be_bytes(), vec![0u8; 24], i, None)
                .is_err()
            {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    #[test]
    fn oversized_entry_rejected() {
        let mut mgr = ObjectManager::new(ServerId::new(1, 1), 64, 8);
        assert!(mgr
            .write_object(1, b"k", vec![0u8; 512], 0, None)
            .is_err());
    }
}
