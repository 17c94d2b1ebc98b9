//! Server-to-server peer message types and the RPC status taxonomy.

use serde::{Deserialize, Serialize};

use crate::master::objmgr::TableId;
use crate::master::segment::Certificate;
use crate::master::tablets::{IndexletRange, RecoveryPartition, TabletRange};
use crate::utils::{LogPosition, RecoveryId, SegmentId, ServerId};

/// Correlation ID pairing a reply with its request; allocated by the sender.
pub type TaskId = u64;

/// RPC status codes shared across the wire protocol.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum Status {
    Ok,
    UnknownTablet,
    UnknownIndexlet,
    ObjectExists,
    ObjectDoesntExist,
    WrongVersion,
    RequestFormatError,
    InternalError,
    Retry,
    NoTableSpace,
}

impl Status {
    #[inline]
    pub fn is_ok(&self) -> bool {
        *self == Status::Ok
    }
}

/// Messages exchanged between servers (masters and backups) over the peer
/// transport. Every request carries a `task` correlation ID echoed by its
/// reply; replies may arrive in any order.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ServerMsg {
    /// Master -> backup: fetch the recovery segment for `segment_id` of
    /// crashed master `crashed`, filtered down to `partition`.
    GetRecoveryData {
        task: TaskId,
        recovery_id: RecoveryId,
        crashed: ServerId,
        segment_id: SegmentId,
        partition: RecoveryPartition,
    },

    /// Backup -> master: the filtered segment plus its certificate, or a
    /// non-Ok status if the backup cannot serve it.
    GetRecoveryDataReply {
        task: TaskId,
        segment_id: SegmentId,
        status: Status,
        segment: Option<(Vec<u8>, Certificate)>,
    },

    /// Source master -> destination master: install a Recovering tablet in
    /// preparation for migration. Answered `ObjectExists` on a genuine
    /// overlap, `Retry` on an innocuous add race.
    PrepForMigration {
        task: TaskId,
        range: TabletRange,
    },

    /// Reply to `PrepForMigration`.
    PrepForMigrationReply {
        task: TaskId,
        status: Status,
    },

    /// Source master -> destination master: install a Recovering indexlet
    /// (and its backing tablet) for an indexlet split-and-migrate.
    PrepForIndexletMigration {
        task: TaskId,
        range: IndexletRange,
    },

    /// Reply to `PrepForIndexletMigration`.
    PrepForIndexletMigrationReply {
        task: TaskId,
        status: Status,
    },

    /// Source master -> destination master: ask for the destination's
    /// pre-migration log head, the fencing ctime of the migrated tablet.
    GetHeadOfLog {
        task: TaskId,
    },

    /// Reply to `GetHeadOfLog`.
    GetHeadOfLogReply {
        task: TaskId,
        head: LogPosition,
    },

    /// Source master -> destination master: one transfer segment of
    /// migration data for the tablet prepped earlier. For indexlet data,
    /// `data_table_id`/`index_id`/`first_key` locate the indexlet whose
    /// next-node-id must absorb the replayed maximum.
    ReceiveMigrationData {
        task: TaskId,
        table_id: TableId,
        first_key_hash: u64,
        segment: Vec<u8>,
        certificate: Certificate,
        is_indexlet_data: bool,
        data_table_id: TableId,
        index_id: u8,
        first_key: Vec<u8>,
    },

    /// Reply to `ReceiveMigrationData`; the segment has been replayed and
    /// committed on the destination when `status` is Ok.
    ReceiveMigrationDataReply {
        task: TaskId,
        status: Status,
    },

    /// Backup -> master: may the backup discard its replica of
    /// `(backup_id, segment_id)`?
    IsReplicaNeeded {
        task: TaskId,
        backup_id: ServerId,
        segment_id: SegmentId,
    },

    /// Reply to `IsReplicaNeeded`.
    IsReplicaNeededReply {
        task: TaskId,
        segment_id: SegmentId,
        needed: bool,
    },

    /// Master -> backup: store a replica of a closed segment. This is the
    /// durability sync path that side-log commit and head rolls drive.
    ReplicateSegment {
        task: TaskId,
        master: ServerId,
        segment_id: SegmentId,
        segment: Vec<u8>,
        certificate: Certificate,
        primary: bool,
    },

    /// Reply to `ReplicateSegment`.
    ReplicateSegmentReply {
        task: TaskId,
        segment_id: SegmentId,
        status: Status,
    },
}

#[cfg(test)]
mod messages_tests {
    use super::*;

    #[test]
    fn server_msg_round_trip() {
        let msg = ServerMsg::GetRecoveryData {
            task: 42,
            recovery_id: 7,
            crashed: ServerId::new(9, 1),
            segment_id: 88,
            partition: RecoveryPartition {
                partition_id: 0,
                tablets: vec![TabletRange::new(123, 0, 9)],
                indexlets: vec![],
            },
        };
        let bytes = rmp_serde::encode::to_vec(&msg).unwrap();
        let back: ServerMsg = rmp_serde::decode::from_slice(&bytes).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn status_is_ok() {
        assert!(Status::Ok.is_ok());
        assert!(!Status::Retry.is_ok());
    }
}
