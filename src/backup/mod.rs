//! Backup server functionality modules: the replica store plus the event
//! loop answering the coordinator's segment census and masters' recovery
//! data fetches.

mod store;

pub use store::BackupStore;

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Duration;

use crate::coordinator::{CtrlMsg, ServerRole};
use crate::master::transport::TransportHub;
use crate::master::{ControlHub, ServerMsg, Status, TaskId};
use crate::utils::{EmberError, ServerId, Timer};

/// Configuration parameters struct.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ConfigBackup {
    /// Interval of the replica garbage-collection sweep in millisecs. 0
    /// disables the sweep.
    pub gc_interval_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ConfigBackup {
    fn default() -> Self {
        ConfigBackup {
            gc_interval_ms: 5000,
        }
    }
}

/// The backup server.
pub struct BackupServer {
    /// My server ID.
    me: ServerId,

    config: ConfigBackup,

    /// ControlHub to the coordinator.
    control: ControlHub,

    /// TransportHub for peer messages.
    transport: TransportHub<ServerMsg>,

    /// Stored segment replicas.
    store: BackupStore,

    /// Task ID allocator for GC queries.
    next_task: TaskId,

    /// Periodic GC sweep timer.
    gc_timer: Timer,
}

impl BackupServer {
    /// Creates a new backup server: enlists with the coordinator, announces
    /// itself, and stands up the peer transport.
    pub async fn new_and_setup(
        coordinator: SocketAddr,
        p2p_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, EmberError> {
        let config =
            parsed_config!(config_str => ConfigBackup; gc_interval_ms)?;

        let mut control = ControlHub::new_and_setup(coordinator).await?;
        let me = control.me;
        let transport = TransportHub::new_and_setup(me, p2p_addr).await?;
        control.send_ctrl(CtrlMsg::NewServerJoin {
            id: me,
            role: ServerRole::Backup,
            p2p_addr,
        })?;

        Ok(BackupServer {
            me,
            config,
            control,
            transport,
            store: BackupStore::new(me),
            next_task: 0,
            gc_timer: Timer::new(),
        })
    }

    /// This server's coordinator-assigned ID.
    pub fn me(&self) -> ServerId {
        self.me
    }

    /// Main event loop. Breaks out only upon a termination signal.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), EmberError> {
        if self.config.gc_interval_ms > 0 {
            self.gc_timer
                .kickoff(Duration::from_millis(self.config.gc_interval_ms))?;
        }

        loop {
            tokio::select! {
                ctrl = self.control.recv_ctrl() => {
                    let msg = ctrl?;
                    if let Err(e) = self.handle_ctrl_msg(msg).await {
                        pf_error!(self.me; "error handling ctrl msg: {}", e);
                    }
                },

                peer_msg = self.transport.recv_msg() => {
                    let (peer, msg) = peer_msg?;
                    if let Err(e) = self.handle_peer_msg(peer, msg) {
                        pf_error!(self.me;
                                  "error handling peer msg <- {}: {}",
                                  peer, e);
                    }
                },

                _ = self.gc_timer.timeout() => {
                    if let Err(e) = self.gc_sweep() {
                        pf_error!(self.me; "error during gc sweep: {}", e);
                    }
                    self.gc_timer.kickoff(Duration::from_millis(
                        self.config.gc_interval_ms,
                    ))?;
                },

                _ = rx_term.changed() => {
                    pf_warn!(self.me; "backup caught termination signal");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_ctrl_msg(
        &mut self,
        msg: CtrlMsg,
    ) -> Result<(), EmberError> {
        match msg {
            CtrlMsg::ConnectToPeers { to_peers } => {
                for (peer, (_role, addr)) in to_peers {
                    self.transport.connect_to_peer(peer, addr).await?;
                }
            }

            CtrlMsg::StartReadingData { crashed } => {
                let (segment_ids, primary_segment_ids) =
                    self.store.segment_ids_for(crashed);
                pf_info!(self.me;
                         "reporting {} segments held for crashed master {}",
                         segment_ids.len(), crashed);
                self.control.send_ctrl(CtrlMsg::StartReadingDataReply {
                    crashed,
                    segment_ids,
                    primary_segment_ids,
                })?;
            }

            _ => {} // ignore all other types
        }
        Ok(())
    }

    fn handle_peer_msg(
        &mut self,
        peer: ServerId,
        msg: ServerMsg,
    ) -> Result<(), EmberError> {
        match msg {
            ServerMsg::GetRecoveryData {
                task,
                recovery_id,
                crashed,
                segment_id,
                partition,
            } => {
                pf_debug!(self.me;
                          "getRecoveryData: recovery {}, master {}, \
                           segment {}", recovery_id, crashed, segment_id);
                let reply = match self.store.build_recovery_segment(
                    crashed,
                    segment_id,
                    &partition,
                ) {
                    Ok((bytes, certificate)) => {
                        ServerMsg::GetRecoveryDataReply {
                            task,
                            segment_id,
                            status: Status::Ok,
                            segment: Some((bytes.to_vec(), certificate)),
                        }
                    }
                    Err(_) => ServerMsg::GetRecoveryDataReply {
                        task,
                        segment_id,
                        status: Status::ObjectDoesntExist,
                        segment: None,
                    },
                };
                self.transport.send_msg(reply, peer)?;
            }

            ServerMsg::ReplicateSegment {
                task,
                master,
                segment_id,
                segment,
                certificate,
                primary,
            } => {
                // refuse bytes that do not verify; the master will surface
                // the failed sync
                let status = match crate::master::SegmentIter::new(
                    &segment,
                    &certificate,
                ) {
                    Ok(_) => {
                        self.store.install_replica(
                            master,
                            segment_id,
                            Bytes::from(segment),
                            certificate,
                            primary,
                        );
                        Status::Ok
                    }
                    Err(_) => Status::RequestFormatError,
                };
                self.transport.send_msg(
                    ServerMsg::ReplicateSegmentReply {
                        task,
                        segment_id,
                        status,
                    },
                    peer,
                )?;
            }

            ServerMsg::IsReplicaNeededReply {
                segment_id, needed, ..
            } => {
                if !needed {
                    pf_debug!(self.me;
                              "discarding obsolete replica of segment {} \
                               for master {}", segment_id, peer);
                    self.store.discard_replica(peer, segment_id);
                }
            }

            other => {
                pf_warn!(self.me;
                         "unexpected peer msg on backup: {:?}", other);
            }
        }
        Ok(())
    }

    /// Asks each replica's owning master whether it is still needed; the
    /// replies drive discards.
    fn gc_sweep(&mut self) -> Result<(), EmberError> {
        for (master, segment_id) in self.store.replica_ids() {
            self.next_task += 1;
            self.transport.send_msg(
                ServerMsg::IsReplicaNeeded {
                    task: self.next_task,
                    backup_id: self.me,
                    segment_id,
                },
                master,
            )?;
        }
        Ok(())
    }
}
