//! Core identifier types shared by the coordinator, masters, and backups.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Monotonically allocated identifier of a log segment on one master.
pub type SegmentId = u64;

/// Identifier of one coordinator-driven crash recovery.
pub type RecoveryId = u64;

/// Opaque 64-bit server identifier carrying an embedded generation number,
/// so that a restarted server is distinguishable from its previous life.
/// The low 32 bits are the server's slot index; the high 32 bits count how
/// many times that slot has been (re-)enlisted. Value 0 is invalid.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub struct ServerId(pub u64);

impl ServerId {
    /// The all-zeroes ID that no live server ever carries.
    pub const INVALID: ServerId = ServerId(0);

    /// Composes an ID from slot index and generation.
    pub fn new(index: u32, generation: u32) -> Self {
        ServerId(((generation as u64) << 32) | (index as u64))
    }

    /// The server's slot index within the cluster.
    #[inline]
    pub fn index(&self) -> u32 {
        (self.0 & 0xFFFF_FFFF) as u32
    }

    /// How many times this slot has been enlisted.
    #[inline]
    pub fn generation(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Whether this is a valid (non-zero) ID.
    #[inline]
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.index(), self.generation())
    }
}

// SAFETY: `ServerId` wraps a plain `u64` with derived `Hash`/`Eq`, which are
// deterministic.
unsafe impl flashmap::TrustedHashEq for ServerId {}

/// Position of an entry in a master's log. Totally ordered lexicographically
/// on `(segment_id, offset)`; doubles as the fencing token handed to the
/// coordinator during ownership changes and as the creation-time of tablets.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
pub struct LogPosition {
    /// ID of the segment the entry lives in.
    pub segment_id: SegmentId,

    /// Byte offset of the entry within that segment.
    pub offset: u32,
}

impl LogPosition {
    /// Composes a position from segment ID and offset.
    pub fn new(segment_id: SegmentId, offset: u32) -> Self {
        LogPosition { segment_id, offset }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.segment_id, self.offset)
    }
}

/// Monotonically non-decreasing 64-bit logical timestamp maintained by every
/// master. Advanced to the max of the current value and any observed value;
/// concurrent observers never see it go backwards.
#[derive(Debug, Default)]
pub struct ClusterTime(AtomicU64);

impl ClusterTime {
    /// Creates a clock starting at the given value.
    pub fn new(initial: u64) -> Self {
        ClusterTime(AtomicU64::new(initial))
    }

    /// Reads the current timestamp.
    #[inline]
    pub fn read(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Advances the clock to at least `observed`. Returns the value of the
    /// clock after the call, which is `>= observed`.
    pub fn advance_to(&self, observed: u64) -> u64 {
        let mut current = self.0.load(Ordering::Acquire);
        while current < observed {
            match self.0.compare_exchange_weak(
                current,
                observed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return observed,
                Err(seen) => current = seen,
            }
        }
        current
    }
}

#[cfg(test)]
mod ids_tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn server_id_pack_unpack() {
        let id = ServerId::new(7, 3);
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), 3);
        assert_eq!(format!("{}", id), "7.3");
        assert!(id.is_valid());
        assert!(!ServerId::INVALID.is_valid());
    }

    #[test]
    fn server_id_generations_differ() {
        assert_ne!(ServerId::new(4, 1), ServerId::new(4, 2));
    }

    #[test]
    fn log_position_ordering() {
        assert!(LogPosition::new(3, 900) < LogPosition::new(4, 0));
        assert!(LogPosition::new(4, 16) < LogPosition::new(4, 32));
        assert_eq!(LogPosition::new(5, 5), LogPosition::new(5, 5));
    }

    #[test]
    fn cluster_time_monotonic() {
        let clock = ClusterTime::new(10);
        assert_eq!(clock.advance_to(5), 10); // no rewind
        assert_eq!(clock.read(), 10);
        assert_eq!(clock.advance_to(42), 42);
        assert_eq!(clock.read(), 42);
    }

    #[test]
    fn cluster_time_concurrent_advance() {
        let clock = Arc::new(ClusterTime::new(0));
        let mut handles = Vec::new();
        for t in 1..=8u64 {
            let clock = clock.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..1000 {
                    clock.advance_to(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(clock.read(), 8999);
    }
}
