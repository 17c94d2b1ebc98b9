//! Coordinator server-facing controller module: accepts enlisting servers,
//! assigns their IDs, and exchanges control messages with them.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::master::{
    RecoveryPartition, ReplicaSource, Status, TabletRange,
};
use crate::master::objmgr::TableId;
use crate::master::tablets::IndexletRange;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry, EmberError,
    LogPosition, RecoveryId, SegmentId, ServerId,
};

/// Role a server enlists under.
#[derive(
    Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize,
)]
pub enum ServerRole {
    /// Keeps live data in RAM and serves client operations.
    Master,

    /// Holds replicated log segments on behalf of masters.
    Backup,
}

/// Control message from/to servers. Control traffic is bidirectional: some
/// initiated by the coordinator and some by servers.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CtrlMsg {
    /// Server -> Coordinator: new server up, announcing its role and its
    /// peer transport address.
    NewServerJoin {
        id: ServerId,
        role: ServerRole,
        p2p_addr: SocketAddr,
    },

    /// Coordinator -> Server: peers to proactively connect to, with their
    /// roles (masters pick their replication backups from these).
    ConnectToPeers {
        to_peers: HashMap<ServerId, (ServerRole, SocketAddr)>,
    },

    /// Coordinator -> Backup: which segments of `crashed` do you hold?
    StartReadingData { crashed: ServerId },

    /// Backup -> Coordinator: segment IDs held for `crashed`; primary
    /// replicas listed separately so they can be scheduled first.
    StartReadingDataReply {
        crashed: ServerId,
        segment_ids: Vec<SegmentId>,
        primary_segment_ids: Vec<SegmentId>,
    },

    /// Coordinator -> Master: recover one partition of a crashed master
    /// from the given replica list.
    Recover {
        recovery_id: RecoveryId,
        crashed: ServerId,
        partition: RecoveryPartition,
        replicas: Vec<ReplicaSource>,
    },

    /// Master -> Coordinator: synchronous acknowledgement of `Recover`;
    /// completion arrives later via `RecoveryMasterFinished`.
    RecoverAck { recovery_id: RecoveryId },

    /// Master -> Coordinator: request for the current cluster timestamp.
    ClusterTimeRequest,

    /// Coordinator -> Master: current cluster timestamp.
    ClusterTimeReply { timestamp: u64 },

    /// Master -> Coordinator: this recovery master finished its partition.
    /// `head` is the fencing log position to stamp on recovered tablets.
    RecoveryMasterFinished {
        recovery_id: RecoveryId,
        partition: RecoveryPartition,
        head: LogPosition,
        success: bool,
    },

    /// Coordinator -> Master: whether to abandon the recovered partition
    /// (the coordinator may have reassigned it elsewhere meanwhile).
    RecoveryMasterFinishedReply {
        recovery_id: RecoveryId,
        cancel: bool,
    },

    /// Coordinator -> Master: take ownership of a tablet (creation or the
    /// tail end of migration).
    TakeTabletOwnership { range: TabletRange },

    /// Master -> Coordinator: result of `TakeTabletOwnership`.
    TakeTabletOwnershipReply {
        range: TabletRange,
        status: Status,
    },

    /// Coordinator -> Master: drop ownership of a tablet.
    DropTabletOwnership { range: TabletRange },

    /// Master -> Coordinator: result of `DropTabletOwnership`.
    DropTabletOwnershipReply {
        range: TabletRange,
        status: Status,
    },

    /// Coordinator -> Master: split a Normal tablet in place, so a
    /// narrower range can be migrated on its own.
    SplitTablet {
        table_id: TableId,
        split_key_hash: u64,
    },

    /// Master -> Coordinator: result of `SplitTablet`, echoing the split
    /// parameters so the coordinator can update its tablet directory.
    SplitTabletReply {
        table_id: TableId,
        split_key_hash: u64,
        status: Status,
    },

    /// Source master -> Coordinator: commit the ownership transfer at the
    /// end of a migration. `ctime` is the destination's pre-migration log
    /// head.
    ReassignTabletOwnership {
        range: TabletRange,
        new_owner: ServerId,
        ctime: LogPosition,
    },

    /// Coordinator -> Source master: result of `ReassignTabletOwnership`.
    ReassignTabletOwnershipReply {
        range: TabletRange,
        status: Status,
    },

    /// Coordinator -> Master (operator-triggered): migrate a tablet range
    /// to `new_owner`.
    MigrateTablet {
        range: TabletRange,
        new_owner: ServerId,
    },

    /// Master -> Coordinator: terminal result of `MigrateTablet`.
    MigrateTabletReply {
        range: TabletRange,
        status: Status,
    },

    /// Coordinator -> Master (operator-triggered): split an indexlet at
    /// `split_key` and migrate the upper half to `new_owner`.
    SplitAndMigrateIndexlet {
        range: IndexletRange,
        new_backing_table_id: TableId,
        split_key: Vec<u8>,
        new_owner: ServerId,
    },

    /// Master -> Coordinator: terminal result of `SplitAndMigrateIndexlet`.
    SplitAndMigrateIndexletReply { status: Status },

    /// Server -> Coordinator: leave notification.
    Leave,

    /// Coordinator -> Server: dummy leave reply.
    LeaveReply,
}

/// The server-facing controller API module.
pub struct ServerReigner {
    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ServerId, CtrlMsg)>,

    /// Map from server ID -> sender side of the send channel, shared with
    /// the server acceptor task.
    tx_sends: flashmap::ReadHandle<ServerId, mpsc::UnboundedSender<CtrlMsg>>,

    /// Join handle of the server acceptor task.
    _server_acceptor_handle: JoinHandle<()>,

    /// Map from server ID -> server controller task join handles, shared
    /// with the server acceptor task.
    _server_controller_handles:
        flashmap::ReadHandle<ServerId, JoinHandle<()>>,
}

// ServerReigner public API implementation
impl ServerReigner {
    /// Creates a new server-facing controller module. Spawns the server
    /// acceptor task; ID assignment requests flow out through
    /// `tx_id_assign` and results back in through `rx_id_result`.
    pub async fn new_and_setup(
        srv_addr: SocketAddr,
        tx_id_assign: mpsc::UnboundedSender<()>,
        rx_id_result: mpsc::UnboundedReceiver<ServerId>,
    ) -> Result<Self, EmberError> {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let (tx_sends_write, tx_sends_read) =
            flashmap::new::<ServerId, mpsc::UnboundedSender<CtrlMsg>>();

        let (server_controller_handles_write, server_controller_handles_read) =
            flashmap::new::<ServerId, JoinHandle<()>>();

        let server_listener = tcp_bind_with_retry(srv_addr, 10).await?;
        let server_acceptor_handle = tokio::spawn(Self::server_acceptor_task(
            tx_id_assign,
            rx_id_result,
            tx_recv,
            server_listener,
            tx_sends_write,
            server_controller_handles_write,
        ));

        Ok(ServerReigner {
            rx_recv,
            tx_sends: tx_sends_read,
            _server_acceptor_handle: server_acceptor_handle,
            _server_controller_handles: server_controller_handles_read,
        })
    }

    /// Whether a server ID is currently connected to me.
    pub fn has_server(&self, server: ServerId) -> bool {
        let tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.contains_key(&server)
    }

    /// Waits for the next control event message from some server.
    pub async fn recv_ctrl(
        &mut self,
    ) -> Result<(ServerId, CtrlMsg), EmberError> {
        match self.rx_recv.recv().await {
            Some((id, msg)) => Ok((id, msg)),
            None => logged_err!("c"; "recv channel has been closed"),
        }
    }

    /// Sends a control message to specified server.
    pub fn send_ctrl(
        &mut self,
        msg: CtrlMsg,
        server: ServerId,
    ) -> Result<(), EmberError> {
        let tx_sends_guard = self.tx_sends.guard();
        match tx_sends_guard.get(&server) {
            Some(tx_send) => {
                tx_send.send(msg).map_err(EmberError::msg)?;
                Ok(())
            }
            None => {
                logged_err!("c"; "server ID {} not found among active \
                                  servers", server)
            }
        }
    }
}

// ServerReigner server_acceptor task implementation
impl ServerReigner {
    /// Accepts a new server connection.
    #[allow(clippy::too_many_arguments)]
    async fn accept_new_server(
        mut stream: TcpStream,
        addr: SocketAddr,
        tx_id_assign: &mpsc::UnboundedSender<()>,
        rx_id_result: &mut mpsc::UnboundedReceiver<ServerId>,
        tx_recv: mpsc::UnboundedSender<(ServerId, CtrlMsg)>,
        tx_sends: &mut flashmap::WriteHandle<
            ServerId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
        server_controller_handles: &mut flashmap::WriteHandle<
            ServerId,
            JoinHandle<()>,
        >,
        tx_exit: mpsc::UnboundedSender<ServerId>,
    ) -> Result<(), EmberError> {
        // ask the coordinator's main loop for a fresh server ID (a new
        // generation of some slot)
        tx_id_assign.send(())?;
        let id = rx_id_result.recv().await.ok_or(EmberError(
            "failed to get server ID assignment".into(),
        ))?;

        // send the server its assigned ID
        if let Err(e) = stream.write_u64(id.0).await {
            return logged_err!("c"; "error assigning new server ID: {}", e);
        }

        let mut tx_sends_guard = tx_sends.guard();
        if let Some(sender) = tx_sends_guard.get(&id) {
            if sender.is_closed() {
                // if this server ID has left before, garbage collect it now
                let mut server_controller_handles_guard =
                    server_controller_handles.guard();
                server_controller_handles_guard.remove(id);
                server_controller_handles_guard.publish();
                tx_sends_guard.remove(id);
            } else {
                return logged_err!("c"; "duplicate server ID listened: {}",
                                        id);
            }
        }
        pf_debug!("c"; "accepted new server {}", id);

        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);

        let server_controller_handle =
            tokio::spawn(Self::server_controller_task(
                id, addr, stream, tx_recv, rx_send, tx_exit,
            ));
        let mut server_controller_handles_guard =
            server_controller_handles.guard();
        server_controller_handles_guard.insert(id, server_controller_handle);

        server_controller_handles_guard.publish();
        tx_sends_guard.publish();
        Ok(())
    }

    /// Removes handles of a left server connection.
    fn remove_left_server(
        id: ServerId,
        tx_sends: &mut flashmap::WriteHandle<
            ServerId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
        server_controller_handles: &mut flashmap::WriteHandle<
            ServerId,
            JoinHandle<()>,
        >,
    ) -> Result<(), EmberError> {
        let mut tx_sends_guard = tx_sends.guard();
        if !tx_sends_guard.contains_key(&id) {
            return logged_err!("c"; "server {} not found among active ones",
                                    id);
        }
        tx_sends_guard.remove(id);

        let mut server_controller_handles_guard =
            server_controller_handles.guard();
        server_controller_handles_guard.remove(id);

        server_controller_handles_guard.publish();
        tx_sends_guard.publish();
        Ok(())
    }

    /// Server acceptor task function.
    async fn server_acceptor_task(
        tx_id_assign: mpsc::UnboundedSender<()>,
        mut rx_id_result: mpsc::UnboundedReceiver<ServerId>,
        tx_recv: mpsc::UnboundedSender<(ServerId, CtrlMsg)>,
        server_listener: TcpListener,
        mut tx_sends: flashmap::WriteHandle<
            ServerId,
            mpsc::UnboundedSender<CtrlMsg>,
        >,
        mut server_controller_handles: flashmap::WriteHandle<
            ServerId,
            JoinHandle<()>,
        >,
    ) {
        pf_debug!("c"; "server_acceptor task spawned");

        let local_addr = server_listener.local_addr().unwrap();
        pf_info!("c"; "accepting servers on '{}'", local_addr);

        // create an exit mpsc channel for getting notified about termination
        // of server controller tasks
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                // new server connection
                accepted = server_listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            pf_warn!("c"; "error accepting server \
                                           connection: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = Self::accept_new_server(
                        stream,
                        addr,
                        &tx_id_assign,
                        &mut rx_id_result,
                        tx_recv.clone(),
                        &mut tx_sends,
                        &mut server_controller_handles,
                        tx_exit.clone(),
                    ).await {
                        pf_error!("c"; "error accepting new server: {}", e);
                    }
                },

                // a server controller task exits
                id = rx_exit.recv() => {
                    let id = id.unwrap();
                    if let Err(e) = Self::remove_left_server(
                        id,
                        &mut tx_sends,
                        &mut server_controller_handles,
                    ) {
                        pf_error!("c"; "error removing left server {}: {}",
                                       id, e);
                    }
                },
            }
        }
    }

    /// Per-server controller task function: pumps messages in both
    /// directions over this server's control connection.
    async fn server_controller_task(
        id: ServerId,
        addr: SocketAddr,
        conn: TcpStream,
        tx_recv: mpsc::UnboundedSender<(ServerId, CtrlMsg)>,
        mut rx_send: mpsc::UnboundedReceiver<CtrlMsg>,
        tx_exit: mpsc::UnboundedSender<ServerId>,
    ) {
        pf_debug!("c"; "server_controller task for {} '{}' spawned",
                       id, addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a message to send to this server
                msg = rx_send.recv(), if !retrying => {
                    match msg {
                        Some(msg) => {
                            match Self::write_ctrl(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {},
                                Ok(false) => {
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!("c"; "error sending -> {}: {}",
                                                   id, e);
                                }
                            }
                        },
                        None => break,
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match Self::write_ctrl(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            retrying = false;
                        }
                        Ok(false) => {},
                        Err(e) => {
                            pf_error!("c"; "error retrying send -> {}: {}",
                                           id, e);
                        }
                    }
                },

                // receives control message from this server
                msg = Self::read_ctrl(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(CtrlMsg::Leave) => {
                            // server leaving, send dummy reply and break
                            if Self::write_ctrl(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&CtrlMsg::LeaveReply),
                            ).is_ok() {
                                pf_debug!("c"; "server {} has left", id);
                            }
                            break;
                        },

                        Ok(msg) => {
                            if let Err(e) = tx_recv.send((id, msg)) {
                                pf_error!("c"; "error sending to tx_recv \
                                                for {}: {}", id, e);
                            }
                        },

                        Err(_e) => {
                            break; // probably the server exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!("c"; "error sending exit signal for {}: {}", id, e);
        }
        pf_debug!("c"; "server_controller task for {} '{}' exited", id, addr);
    }

    /// Reads a control message from given TcpStream.
    async fn read_ctrl(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<CtrlMsg, EmberError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Writes a control message through given TcpStream.
    fn write_ctrl(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&CtrlMsg>,
    ) -> Result<bool, EmberError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }
}

#[cfg(test)]
mod reigner_tests {
    use super::*;
    use crate::master::ControlHub;

    #[tokio::test(flavor = "multi_thread", worker_threads = 3)]
    async fn api_enlist_send_recv() -> Result<(), EmberError> {
        let srv_addr: SocketAddr = "127.0.0.1:41900".parse()?;

        // coordinator side
        let (tx_id_assign, mut rx_id_assign) = mpsc::unbounded_channel();
        let (tx_id_result, rx_id_result) = mpsc::unbounded_channel();
        let mut reigner = ServerReigner::new_and_setup(
            srv_addr,
            tx_id_assign,
            rx_id_result,
        )
        .await?;

        // id assignment loop playing the coordinator main loop
        tokio::spawn(async move {
            let mut next_index = 1u32;
            while rx_id_assign.recv().await.is_some() {
                tx_id_result.send(ServerId::new(next_index, 1)).unwrap();
                next_index += 1;
            }
        });

        // server side
        let server = tokio::spawn(async move {
            let mut hub = ControlHub::new_and_setup(srv_addr).await?;
            assert_eq!(hub.me, ServerId::new(1, 1));
            hub.send_ctrl(CtrlMsg::NewServerJoin {
                id: hub.me,
                role: ServerRole::Backup,
                p2p_addr: "127.0.0.1:41901".parse()?,
            })?;
            // wait for the coordinator's question and answer it
            let msg = hub.recv_ctrl().await?;
            assert_eq!(
                msg,
                CtrlMsg::StartReadingData {
                    crashed: ServerId::new(9, 1)
                }
            );
            hub.send_ctrl(CtrlMsg::StartReadingDataReply {
                crashed: ServerId::new(9, 1),
                segment_ids: vec![88, 89],
                primary_segment_ids: vec![88],
            })?;
            Ok::<(), EmberError>(())
        });

        // coordinator receives the join
        let (id, msg) = reigner.recv_ctrl().await?;
        assert_eq!(id, ServerId::new(1, 1));
        assert!(matches!(msg, CtrlMsg::NewServerJoin { .. }));
        assert!(reigner.has_server(id));

        // asks the backup what it holds
        reigner.send_ctrl(
            CtrlMsg::StartReadingData {
                crashed: ServerId::new(9, 1),
            },
            id,
        )?;
        let (from, reply) = reigner.recv_ctrl().await?;
        assert_eq!(from, id);
        assert_eq!(
            reply,
            CtrlMsg::StartReadingDataReply {
                crashed: ServerId::new(9, 1),
                segment_ids: vec![88, 89],
                primary_segment_ids: vec![88],
            }
        );

        server.await.map_err(EmberError::msg)??;
        Ok(())
    }
}
