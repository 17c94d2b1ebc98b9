//! Coordinator functionality modules: the server-facing controller, the
//! replica-map builder, the recovery dispatcher, and the event loop that
//! owns the cluster's tablet directory.

mod recovery;
mod reigner;
mod replicamap;

pub use recovery::{
    partition_tablets, Finished, RecoverOrder, Recovery, RecoveryOutcome,
};
pub use reigner::{CtrlMsg, ServerReigner, ServerRole};
pub use replicamap::ReplicaMap;

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};

use crate::master::objmgr::TableId;
use crate::master::tablets::IndexletRange;
use crate::master::{RecoveryPartition, Status, TabletRange};
use crate::utils::{
    EmberError, LogPosition, RecoveryId, SegmentId, ServerId, Timer,
};

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConfigCoordinator {
    /// How long to wait for backups' StartReadingData replies in millisecs.
    pub start_reading_timeout_ms: u64,

    /// Overall deadline for one crashed-master recovery in millisecs;
    /// recovery masters reporting after it are told to cancel.
    pub recovery_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ConfigCoordinator {
    fn default() -> Self {
        ConfigCoordinator {
            start_reading_timeout_ms: 1000,
            recovery_timeout_ms: 30_000,
        }
    }
}

/// Operator commands fed into the coordinator's event loop.
#[derive(Debug, Clone)]
pub enum OpCommand {
    /// Assign a fresh tablet to a master.
    CreateTablet {
        range: TabletRange,
        owner: ServerId,
    },

    /// Declare a master crashed and start recovering its tablets.
    MasterCrashed { crashed: ServerId },

    /// Split the tablet containing `split_key_hash` on its owning master,
    /// so a narrower range can then be migrated on its own.
    SplitTablet {
        table_id: TableId,
        split_key_hash: u64,
    },

    /// Move a tablet range from its current owner to another master.
    MigrateTablet {
        range: TabletRange,
        new_owner: ServerId,
    },

    /// Split an indexlet at `split_key` and move the upper half.
    SplitAndMigrateIndexlet {
        range: IndexletRange,
        new_backing_table_id: TableId,
        split_key: Vec<u8>,
        new_owner: ServerId,
    },
}

/// Information about an enlisted server.
#[derive(Debug, Clone)]
struct ServerInfo {
    role: ServerRole,
    p2p_addr: SocketAddr,
    alive: bool,
}

/// One tablet in the cluster directory.
#[derive(Debug, Clone)]
struct TabletEntry {
    range: TabletRange,
    owner: ServerId,
    ctime: LogPosition,
    /// The coordinator never routes clients to a tablet being rebuilt.
    serving: bool,
}

/// Splits the directory entry of `owner` containing `split_key_hash` into
/// the two post-split tablets, both keeping the owner, ctime, and serving
/// flag. Returns `false` if `owner` has no such entry or the split point is
/// degenerate.
fn split_directory_entry(
    tablets: &mut Vec<TabletEntry>,
    owner: ServerId,
    table_id: TableId,
    split_key_hash: u64,
) -> bool {
    let Some(idx) = tablets.iter().position(|entry| {
        entry.owner == owner
            && entry.range.contains(table_id, split_key_hash)
            && entry.range.start_key_hash < split_key_hash
    }) else {
        return false;
    };
    let upper = TabletEntry {
        range: TabletRange::new(
            table_id,
            split_key_hash,
            tablets[idx].range.end_key_hash,
        ),
        ..tablets[idx].clone()
    };
    tablets[idx].range.end_key_hash = split_key_hash - 1;
    tablets.push(upper);
    true
}

/// Applies an ownership transfer to the directory: the transferred range
/// moves to `new_owner` (not serving until the destination takes it), and a
/// sub-range of a larger entry splits it, the remainder pieces staying with
/// `source`. Returns `false` when `source` owns no containing entry.
fn reassign_directory_entry(
    tablets: &mut Vec<TabletEntry>,
    source: ServerId,
    range: TabletRange,
    new_owner: ServerId,
    ctime: LogPosition,
) -> bool {
    let Some(idx) = tablets.iter().position(|entry| {
        entry.owner == source
            && entry.range.table_id == range.table_id
            && entry.range.start_key_hash <= range.start_key_hash
            && entry.range.end_key_hash >= range.end_key_hash
    }) else {
        return false;
    };
    let containing = tablets[idx].clone();
    if containing.range.start_key_hash < range.start_key_hash {
        tablets.push(TabletEntry {
            range: TabletRange::new(
                range.table_id,
                containing.range.start_key_hash,
                range.start_key_hash - 1,
            ),
            ..containing.clone()
        });
    }
    if containing.range.end_key_hash > range.end_key_hash {
        tablets.push(TabletEntry {
            range: TabletRange::new(
                range.table_id,
                range.end_key_hash + 1,
                containing.range.end_key_hash,
            ),
            ..containing.clone()
        });
    }
    tablets[idx] = TabletEntry {
        range,
        owner: new_owner,
        ctime,
        serving: false, // until the destination takes it
    };
    true
}

/// The fan-out state of one `StartReadingData` census.
#[derive(Debug)]
struct SegmentCensus {
    crashed: ServerId,
    partitions: Vec<RecoveryPartition>,
    responses: Vec<(ServerId, Vec<SegmentId>)>,
    waiting: Vec<ServerId>,
    started: Instant,
}

/// The standalone coordinator.
pub struct Coordinator {
    config: ConfigCoordinator,

    /// ServerReigner module.
    reigner: ServerReigner,

    /// Receiver side of the server ID assignment channel.
    rx_id_assign: mpsc::UnboundedReceiver<()>,

    /// Sender side of the server ID assignment result channel.
    tx_id_result: mpsc::UnboundedSender<ServerId>,

    /// Next server slot index to hand out.
    next_index: u32,

    /// Information of enlisted servers.
    servers: HashMap<ServerId, ServerInfo>,

    /// The cluster tablet directory.
    tablets: Vec<TabletEntry>,

    /// Monotonic cluster timestamp issuance.
    cluster_clock: u64,

    /// Receiver side of the operator command channel.
    rx_command: mpsc::UnboundedReceiver<OpCommand>,

    /// In-flight segment census, at most one at a time.
    census: Option<SegmentCensus>,

    /// Timer bounding the census fan-out.
    census_timer: Timer,

    /// Active recoveries with their start times.
    recoveries: HashMap<RecoveryId, (Recovery, Instant)>,

    /// Recovery ID allocator.
    next_recovery_id: RecoveryId,
}

impl Coordinator {
    /// Creates a new standalone coordinator listening for servers on
    /// `srv_addr`. Returns the coordinator and the operator command handle.
    pub async fn new_and_setup(
        srv_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<(Self, mpsc::UnboundedSender<OpCommand>), EmberError> {
        let config = parsed_config!(config_str => ConfigCoordinator;
                                    start_reading_timeout_ms,
                                    recovery_timeout_ms)?;

        let (tx_id_assign, rx_id_assign) = mpsc::unbounded_channel();
        let (tx_id_result, rx_id_result) = mpsc::unbounded_channel();
        let reigner =
            ServerReigner::new_and_setup(srv_addr, tx_id_assign, rx_id_result)
                .await?;
        let (tx_command, rx_command) = mpsc::unbounded_channel();

        Ok((
            Coordinator {
                config,
                reigner,
                rx_id_assign,
                tx_id_result,
                next_index: 1,
                servers: HashMap::new(),
                tablets: Vec::new(),
                cluster_clock: 0,
                rx_command,
                census: None,
                census_timer: Timer::new(),
                recoveries: HashMap::new(),
                next_recovery_id: 0,
            },
            tx_command,
        ))
    }

    /// Main event loop logic of the coordinator. Breaks out of the loop
    /// only upon catching termination signals to the process.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), EmberError> {
        loop {
            tokio::select! {
                // receiving server ID assignment request
                _ = self.rx_id_assign.recv() => {
                    let id = ServerId::new(self.next_index, 1);
                    self.next_index += 1;
                    self.tx_id_result.send(id)?;
                },

                // receiving server control message
                ctrl_msg = self.reigner.recv_ctrl() => {
                    let (server, msg) = ctrl_msg?;
                    if let Err(e) = self.handle_ctrl_msg(server, msg) {
                        pf_error!("c"; "error handling ctrl msg <- {}: {}",
                                       server, e);
                    }
                },

                // receiving operator command
                command = self.rx_command.recv() => {
                    let Some(command) = command else {
                        continue;
                    };
                    if let Err(e) = self.handle_command(command) {
                        pf_error!("c"; "error handling op command: {}", e);
                    }
                },

                // census fan-out deadline
                _ = self.census_timer.timeout() => {
                    if let Err(e) = self.close_census() {
                        pf_error!("c"; "error closing segment census: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("c"; "coordinator caught termination signal");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Issues a cluster timestamp strictly greater than any issued before.
    fn issue_timestamp(&mut self) -> u64 {
        self.cluster_clock += 1;
        self.cluster_clock
    }

    /// Live servers of one role.
    fn live_servers(&self, role: ServerRole) -> Vec<ServerId> {
        let mut servers: Vec<ServerId> = self
            .servers
            .iter()
            .filter(|(_, info)| info.alive && info.role == role)
            .map(|(&id, _)| id)
            .collect();
        servers.sort_unstable();
        servers
    }
}

// Coordinator server-initiated control message handlers
impl Coordinator {
    fn handle_ctrl_msg(
        &mut self,
        server: ServerId,
        msg: CtrlMsg,
    ) -> Result<(), EmberError> {
        match msg {
            CtrlMsg::NewServerJoin { id, role, p2p_addr } => {
                if id != server {
                    return logged_err!("c";
                                       "NewServerJoin with mismatch ID: \
                                        {} != {}", id, server);
                }
                self.handle_new_server_join(server, role, p2p_addr)?;
            }

            CtrlMsg::ClusterTimeRequest => {
                let timestamp = self.issue_timestamp();
                self.reigner.send_ctrl(
                    CtrlMsg::ClusterTimeReply { timestamp },
                    server,
                )?;
            }

            CtrlMsg::StartReadingDataReply {
                crashed,
                segment_ids,
                ..
            } => {
                self.handle_census_reply(server, crashed, segment_ids)?;
            }

            CtrlMsg::RecoverAck { recovery_id } => {
                pf_debug!("c"; "recovery {} acknowledged by {}",
                               recovery_id, server);
            }

            CtrlMsg::RecoveryMasterFinished {
                recovery_id,
                partition,
                head,
                success,
            } => {
                self.handle_recovery_master_finished(
                    server,
                    recovery_id,
                    partition,
                    head,
                    success,
                )?;
            }

            CtrlMsg::ReassignTabletOwnership {
                range,
                new_owner,
                ctime,
            } => {
                self.handle_reassign_ownership(
                    server, range, new_owner, ctime,
                )?;
            }

            CtrlMsg::TakeTabletOwnershipReply { range, status } => {
                if status.is_ok() {
                    self.mark_serving(&range, server);
                } else {
                    pf_error!("c";
                              "server {} failed to take tablet in table \
                               {}: {:?}", server, range.table_id, status);
                }
            }

            CtrlMsg::SplitTabletReply {
                table_id,
                split_key_hash,
                status,
            } => {
                if !status.is_ok() {
                    pf_error!("c";
                              "server {} failed to split tablet of table \
                               {}: {:?}", server, table_id, status);
                } else if split_directory_entry(
                    &mut self.tablets,
                    server,
                    table_id,
                    split_key_hash,
                ) {
                    pf_info!("c";
                             "split directory entry of table {} at {:#x} \
                              on {}", table_id, split_key_hash, server);
                } else {
                    pf_error!("c";
                              "no directory entry of {} to split in table \
                               {}", server, table_id);
                }
            }

            CtrlMsg::MigrateTabletReply { range, status } => {
                pf_info!("c"; "migration of tablet in table {} ended \
                               with {:?}", range.table_id, status);
            }

            CtrlMsg::SplitAndMigrateIndexletReply { status } => {
                pf_info!("c"; "indexlet split migration ended with {:?}",
                              status);
            }

            _ => {} // ignore all other types
        }
        Ok(())
    }

    /// Handler of NewServerJoin message.
    fn handle_new_server_join(
        &mut self,
        server: ServerId,
        role: ServerRole,
        p2p_addr: SocketAddr,
    ) -> Result<(), EmberError> {
        if self.servers.contains_key(&server) {
            return logged_err!("c"; "NewServerJoin got duplicate ID: {}",
                                    server);
        }

        // gather the list of all existing live servers
        let to_peers: HashMap<ServerId, (ServerRole, SocketAddr)> = self
            .servers
            .iter()
            .filter(|(_, info)| info.alive)
            .map(|(&id, info)| (id, (info.role, info.p2p_addr)))
            .collect();

        pf_info!("c"; "server {} joined as {:?}", server, role);
        self.servers.insert(
            server,
            ServerInfo {
                role,
                p2p_addr,
                alive: true,
            },
        );

        // tell it to connect to all other existing servers
        self.reigner
            .send_ctrl(CtrlMsg::ConnectToPeers { to_peers }, server)?;
        Ok(())
    }

    fn mark_serving(&mut self, range: &TabletRange, owner: ServerId) {
        for entry in &mut self.tablets {
            if entry.range == *range && entry.owner == owner {
                entry.serving = true;
                pf_debug!("c";
                          "tablet [{:#x},{:#x}] in table {} serving on {} \
                           (ctime {})",
                          entry.range.start_key_hash,
                          entry.range.end_key_hash, entry.range.table_id,
                          owner, entry.ctime);
            }
        }
    }
}

// Coordinator operator command handlers
impl Coordinator {
    fn handle_command(
        &mut self,
        command: OpCommand,
    ) -> Result<(), EmberError> {
        match command {
            OpCommand::CreateTablet { range, owner } => {
                self.tablets.push(TabletEntry {
                    range,
                    owner,
                    ctime: LogPosition::default(),
                    serving: false,
                });
                self.reigner.send_ctrl(
                    CtrlMsg::TakeTabletOwnership { range },
                    owner,
                )?;
            }

            OpCommand::MasterCrashed { crashed } => {
                self.begin_recovery(crashed)?;
            }

            OpCommand::SplitTablet {
                table_id,
                split_key_hash,
            } => {
                let Some(entry) = self
                    .tablets
                    .iter()
                    .find(|entry| {
                        entry.range.contains(table_id, split_key_hash)
                            && entry.range.start_key_hash < split_key_hash
                    })
                    .cloned()
                else {
                    return logged_err!("c";
                                       "no tablet to split at {:#x} in \
                                        table {}", split_key_hash, table_id);
                };
                self.reigner.send_ctrl(
                    CtrlMsg::SplitTablet {
                        table_id,
                        split_key_hash,
                    },
                    entry.owner,
                )?;
            }

            OpCommand::MigrateTablet { range, new_owner } => {
                let Some(entry) = self
                    .tablets
                    .iter()
                    .find(|entry| {
                        entry.range.table_id == range.table_id
                            && entry.range.start_key_hash
                                <= range.start_key_hash
                            && entry.range.end_key_hash >= range.end_key_hash
                    })
                    .cloned()
                else {
                    return logged_err!("c";
                                       "no owner known for tablet in \
                                        table {}", range.table_id);
                };
                if !entry.serving {
                    return logged_err!("c";
                                       "tablet in table {} is not serving; \
                                        refusing migration",
                                       range.table_id);
                }
                self.reigner.send_ctrl(
                    CtrlMsg::MigrateTablet { range, new_owner },
                    entry.owner,
                )?;
            }

            OpCommand::SplitAndMigrateIndexlet {
                range,
                new_backing_table_id,
                split_key,
                new_owner,
            } => {
                let Some(entry) = self
                    .tablets
                    .iter()
                    .find(|entry| {
                        entry.range.table_id == range.backing_table_id
                    })
                    .cloned()
                else {
                    return logged_err!("c";
                                       "no owner known for backing table \
                                        {}", range.backing_table_id);
                };
                self.reigner.send_ctrl(
                    CtrlMsg::SplitAndMigrateIndexlet {
                        range,
                        new_backing_table_id,
                        split_key,
                        new_owner,
                    },
                    entry.owner,
                )?;
            }
        }
        Ok(())
    }
}

// Coordinator crash recovery orchestration
impl Coordinator {
    /// Starts recovering a crashed master: partitions its tablet set (one
    /// recovery partition per tablet) and fans `StartReadingData` out to
    /// every live backup.
    fn begin_recovery(
        &mut self,
        crashed: ServerId,
    ) -> Result<(), EmberError> {
        if self.census.is_some() {
            return logged_err!("c";
                               "a segment census is already in flight");
        }
        let Some(info) = self.servers.get_mut(&crashed) else {
            return logged_err!("c"; "unknown crashed server {}", crashed);
        };
        info.alive = false;

        let crashed_tablets: Vec<(TabletRange, u64)> = self
            .tablets
            .iter()
            .filter(|entry| entry.owner == crashed)
            .enumerate()
            .map(|(i, entry)| (entry.range, i as u64))
            .collect();
        if crashed_tablets.is_empty() {
            pf_warn!("c"; "crashed master {} owned no tablets", crashed);
            return Ok(());
        }
        for entry in &mut self.tablets {
            if entry.owner == crashed {
                entry.serving = false;
            }
        }
        let partitions = partition_tablets(&crashed_tablets, &[])?;

        let backups = self.live_servers(ServerRole::Backup);
        pf_info!("c";
                 "master {} crashed; asking {} backups for its segments",
                 crashed, backups.len());
        for &backup in &backups {
            self.reigner
                .send_ctrl(CtrlMsg::StartReadingData { crashed }, backup)?;
        }
        self.census = Some(SegmentCensus {
            crashed,
            partitions,
            responses: Vec::new(),
            waiting: backups,
            started: Instant::now(),
        });
        self.census_timer.kickoff(Duration::from_millis(
            self.config.start_reading_timeout_ms,
        ))?;
        Ok(())
    }

    /// Collects one backup's census reply; closes the census early once
    /// every live backup has answered.
    fn handle_census_reply(
        &mut self,
        backup: ServerId,
        crashed: ServerId,
        segment_ids: Vec<SegmentId>,
    ) -> Result<(), EmberError> {
        let Some(census) = self.census.as_mut() else {
            pf_warn!("c"; "census reply from {} with no census open",
                          backup);
            return Ok(());
        };
        if census.crashed != crashed {
            pf_warn!("c"; "census reply for wrong crashed master {}",
                          crashed);
            return Ok(());
        }
        census.waiting.retain(|&b| b != backup);
        census.responses.push((backup, segment_ids));
        if census.waiting.is_empty() {
            self.census_timer.cancel()?;
            self.close_census()?;
        }
        Ok(())
    }

    /// Builds the replica map from whatever replies arrived in time and
    /// dispatches the recovery.
    fn close_census(&mut self) -> Result<(), EmberError> {
        let Some(census) = self.census.take() else {
            return Ok(());
        };
        if !census.waiting.is_empty() {
            pf_warn!("c";
                     "{} backups missed the census deadline ({} ms); \
                      recovering without them",
                     census.waiting.len(),
                     census.started.elapsed().as_millis());
        }

        let mut responses = census.responses;
        responses.sort_by_key(|(id, _)| *id);
        let map = ReplicaMap::build(&responses);
        if map.is_empty() {
            pf_error!("c";
                      "no backup holds any segment of crashed master {}; \
                       the cluster is now busted", census.crashed);
            return Ok(());
        }

        self.next_recovery_id += 1;
        let recovery_id = self.next_recovery_id;
        let mut recovery = Recovery::new(
            recovery_id,
            census.crashed,
            census.partitions,
            map.dispatch_list(),
        );

        let masters: Vec<ServerId> = self
            .live_servers(ServerRole::Master)
            .into_iter()
            .filter(|&m| m != census.crashed)
            .collect();
        let orders = recovery.start(&masters);
        if orders.is_empty() {
            pf_error!("c";
                      "no recovery master available for crashed master {}; \
                       the cluster is now busted", census.crashed);
            return Ok(());
        }
        for order in orders {
            self.send_recover_order(recovery_id, census.crashed, order)?;
        }
        self.recoveries
            .insert(recovery_id, (recovery, Instant::now()));
        Ok(())
    }

    fn send_recover_order(
        &mut self,
        recovery_id: RecoveryId,
        crashed: ServerId,
        order: RecoverOrder,
    ) -> Result<(), EmberError> {
        self.reigner.send_ctrl(
            CtrlMsg::Recover {
                recovery_id,
                crashed,
                partition: order.partition,
                replicas: order.replicas,
            },
            order.master,
        )
    }

    /// Tallies one recovery master's completion report, answers its cancel
    /// verdict, and finalizes the recovery when everything settled.
    fn handle_recovery_master_finished(
        &mut self,
        server: ServerId,
        recovery_id: RecoveryId,
        partition: RecoveryPartition,
        head: LogPosition,
        success: bool,
    ) -> Result<(), EmberError> {
        let Some((recovery, started)) = self.recoveries.get_mut(&recovery_id)
        else {
            // recovery unknown (e.g. timed out and reaped, or from before a
            // coordinator restart): the master must not serve
            pf_warn!("c"; "report for unknown recovery {}; cancelling",
                          recovery_id);
            self.reigner.send_ctrl(
                CtrlMsg::RecoveryMasterFinishedReply {
                    recovery_id,
                    cancel: true,
                },
                server,
            )?;
            return Ok(());
        };

        let deadline =
            Duration::from_millis(self.config.recovery_timeout_ms);
        let timed_out = started.elapsed() >= deadline;
        let finished = if timed_out {
            pf_warn!("c"; "recovery {} exceeded its deadline; cancelling \
                           report from {}", recovery_id, server);
            recovery.master_finished(server, false)
        } else {
            recovery.master_finished(server, success)
        };

        let cancel = finished.cancel || timed_out;
        self.reigner.send_ctrl(
            CtrlMsg::RecoveryMasterFinishedReply {
                recovery_id,
                cancel,
            },
            server,
        )?;

        if success && !cancel {
            // the reporting master now owns the partition's tablets
            for range in &partition.tablets {
                for entry in &mut self.tablets {
                    if entry.range == *range {
                        entry.owner = server;
                        entry.ctime = head;
                        entry.serving = true;
                    }
                }
            }
        }

        let crashed = self.recoveries[&recovery_id].0.crashed;
        if let Some(retry) = finished.retry {
            self.send_recover_order(recovery_id, crashed, retry)?;
        }
        if let Some(outcome) = finished.outcome {
            if outcome.fully_recovered() {
                pf_info!("c"; "recovery {} of master {} complete",
                              recovery_id, crashed);
            }
            self.recoveries.remove(&recovery_id);
        }
        Ok(())
    }

    /// Commits a migration's ownership transfer: updates the directory (a
    /// sub-range migration splits the source's entry), tells the
    /// destination to start serving, and releases the source.
    fn handle_reassign_ownership(
        &mut self,
        source: ServerId,
        range: TabletRange,
        new_owner: ServerId,
        ctime: LogPosition,
    ) -> Result<(), EmberError> {
        let known = reassign_directory_entry(
            &mut self.tablets,
            source,
            range,
            new_owner,
            ctime,
        );
        let status = if known {
            Status::Ok
        } else {
            Status::UnknownTablet
        };
        self.reigner.send_ctrl(
            CtrlMsg::ReassignTabletOwnershipReply { range, status },
            source,
        )?;
        if !known {
            pf_warn!("c";
                     "reassignment refused: {} owns no tablet covering \
                      [{:#x},{:#x}] in table {}",
                     source, range.start_key_hash, range.end_key_hash,
                     range.table_id);
            return Ok(());
        }
        // destination flips its Recovering tablet to Normal
        self.reigner
            .send_ctrl(CtrlMsg::TakeTabletOwnership { range }, new_owner)?;
        pf_info!("c"; "tablet [{:#x},{:#x}] in table {} reassigned {} -> {}",
                      range.start_key_hash, range.end_key_hash,
                      range.table_id, source, new_owner);
        Ok(())
    }
}

#[cfg(test)]
mod coordinator_tests {
    use super::*;

    fn entry(owner_index: u32, table: TableId, start: u64, end: u64) -> TabletEntry {
        TabletEntry {
            range: TabletRange::new(table, start, end),
            owner: ServerId::new(owner_index, 1),
            ctime: LogPosition::new(2, 64),
            serving: true,
        }
    }

    #[test]
    fn split_directory_entry_in_two() {
        let mut tablets = vec![entry(1, 7, 0, 99)];
        assert!(split_directory_entry(
            &mut tablets,
            ServerId::new(1, 1),
            7,
            50
        ));
        tablets.sort_by_key(|e| e.range.start_key_hash);
        assert_eq!(tablets.len(), 2);
        assert_eq!(tablets[0].range, TabletRange::new(7, 0, 49));
        assert_eq!(tablets[1].range, TabletRange::new(7, 50, 99));
        // both halves keep the owner, ctime, and serving flag
        for e in &tablets {
            assert_eq!(e.owner, ServerId::new(1, 1));
            assert_eq!(e.ctime, LogPosition::new(2, 64));
            assert!(e.serving);
        }

        // a degenerate split point or a non-owner changes nothing
        assert!(!split_directory_entry(
            &mut tablets,
            ServerId::new(1, 1),
            7,
            50
        ));
        assert!(!split_directory_entry(
            &mut tablets,
            ServerId::new(2, 1),
            7,
            25
        ));
        assert_eq!(tablets.len(), 2);
    }

    #[test]
    fn reassign_exact_directory_entry() {
        let mut tablets = vec![entry(1, 7, 0, 99)];
        assert!(reassign_directory_entry(
            &mut tablets,
            ServerId::new(1, 1),
            TabletRange::new(7, 0, 99),
            ServerId::new(2, 1),
            LogPosition::new(9, 0),
        ));
        assert_eq!(tablets.len(), 1);
        assert_eq!(tablets[0].owner, ServerId::new(2, 1));
        assert_eq!(tablets[0].ctime, LogPosition::new(9, 0));
        assert!(!tablets[0].serving); // until the destination takes it
    }

    #[test]
    fn reassign_sub_range_splits_directory_entry() {
        let mut tablets = vec![entry(1, 7, 0, 99)];
        assert!(reassign_directory_entry(
            &mut tablets,
            ServerId::new(1, 1),
            TabletRange::new(7, 40, 59),
            ServerId::new(2, 1),
            LogPosition::new(9, 0),
        ));
        tablets.sort_by_key(|e| e.range.start_key_hash);
        assert_eq!(tablets.len(), 3);
        assert_eq!(tablets[0].range, TabletRange::new(7, 0, 39));
        assert_eq!(tablets[0].owner, ServerId::new(1, 1));
        assert!(tablets[0].serving);
        assert_eq!(tablets[1].range, TabletRange::new(7, 40, 59));
        assert_eq!(tablets[1].owner, ServerId::new(2, 1));
        assert_eq!(tablets[1].ctime, LogPosition::new(9, 0));
        assert!(!tablets[1].serving);
        assert_eq!(tablets[2].range, TabletRange::new(7, 60, 99));
        assert_eq!(tablets[2].owner, ServerId::new(1, 1));
        assert!(tablets[2].serving);

        // a source that owns no containing entry is refused
        assert!(!reassign_directory_entry(
            &mut tablets,
            ServerId::new(3, 1),
            TabletRange::new(7, 0, 9),
            ServerId::new(2, 1),
            LogPosition::default(),
        ));
    }
}

// Unit tests for the orchestration pieces live in `recovery` (dispatcher,
// partitioner) and `replicamap`; the control link is tested in `reigner`.
