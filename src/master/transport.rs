//! Server-to-server TCP transport module.
//!
//! NOTE: In concept, all messages are sent through unstable communication
//! channels, and are retried if the sender did not receive an ACK in a
//! timely manner. Here, we use TCP to get the same effect of "every message
//! a sender wants to send will be retried until eventually delivered".

use std::fmt;
use std::net::SocketAddr;

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_bind_with_retry,
    tcp_connect_with_retry, EmberError, ServerId,
};

/// Peer-peer message wrapper type that includes leave notification variants.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
enum PeerMessage<Msg> {
    /// Normal server-to-server message.
    Msg { msg: Msg },

    /// Server leave notification.
    Leave,

    /// Reply to leave notification.
    LeaveReply,
}

/// Server-to-server TCP transport module.
pub(crate) struct TransportHub<Msg> {
    /// My server ID.
    me: ServerId,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<(ServerId, PeerMessage<Msg>)>,

    /// Map from peer ID -> sender side of the send channel, shared with the
    /// peer acceptor task.
    tx_sends:
        flashmap::ReadHandle<ServerId, mpsc::UnboundedSender<PeerMessage<Msg>>>,

    /// Join handle of the peer acceptor task.
    _peer_acceptor_handle: JoinHandle<()>,

    /// Sender side of the connect channel, used when proactively connecting
    /// to some peer.
    tx_connect: mpsc::UnboundedSender<(ServerId, SocketAddr)>,

    /// Receiver side of the connack channel.
    rx_connack: mpsc::UnboundedReceiver<ServerId>,

    /// Map from peer ID -> peer messenger task join handles, shared with the
    /// peer acceptor task.
    _peer_messenger_handles: flashmap::ReadHandle<ServerId, JoinHandle<()>>,
}

// TransportHub public API implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Creates a new server-to-server TCP transport hub. Spawns the peer
    /// acceptor task. Creates a recv channel for listening on peers'
    /// messages.
    pub(crate) async fn new_and_setup(
        me: ServerId,
        p2p_addr: SocketAddr,
    ) -> Result<Self, EmberError> {
        if !me.is_valid() {
            return logged_err!("t"; "invalid server ID {}", me);
        }

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let (tx_sends_write, tx_sends_read) = flashmap::new::<
            ServerId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >();

        let (peer_messenger_handles_write, peer_messenger_handles_read) =
            flashmap::new::<ServerId, JoinHandle<()>>();

        // the connect & connack channels notify the peer acceptor task to
        // proactively connect to some peer
        let (tx_connect, rx_connect) = mpsc::unbounded_channel();
        let (tx_connack, rx_connack) = mpsc::unbounded_channel();

        let peer_listener = tcp_bind_with_retry(p2p_addr, 10).await?;
        let peer_acceptor_handle = tokio::spawn(Self::peer_acceptor_task(
            me,
            tx_recv,
            peer_listener,
            tx_sends_write,
            peer_messenger_handles_write,
            rx_connect,
            tx_connack,
        ));

        Ok(TransportHub {
            me,
            rx_recv,
            tx_sends: tx_sends_read,
            _peer_acceptor_handle: peer_acceptor_handle,
            tx_connect,
            rx_connack,
            _peer_messenger_handles: peer_messenger_handles_read,
        })
    }

    /// Connects to a peer server proactively, spawning the corresponding
    /// messenger task.
    pub(crate) async fn connect_to_peer(
        &mut self,
        id: ServerId,
        peer_addr: SocketAddr,
    ) -> Result<(), EmberError> {
        self.tx_connect.send((id, peer_addr))?;
        match self.rx_connack.recv().await {
            Some(ack_id) if ack_id == id => Ok(()),
            Some(ack_id) => {
                logged_err!(self.me; "peer ID mismatch: expected {}, got {}",
                                     id, ack_id)
            }
            None => logged_err!(self.me; "connack channel closed"),
        }
    }

    /// IDs of currently connected peers.
    #[allow(dead_code)]
    pub(crate) fn current_peers(&self) -> Vec<ServerId> {
        let tx_sends_guard = self.tx_sends.guard();
        tx_sends_guard.keys().copied().collect()
    }

    /// Sends a message to a specified peer by sending to the send channel.
    /// Messages to unconnected peers are dropped silently (the peer may have
    /// just crashed; higher layers handle the missing reply).
    pub(crate) fn send_msg(
        &mut self,
        msg: Msg,
        peer: ServerId,
    ) -> Result<(), EmberError> {
        let tx_sends_guard = self.tx_sends.guard();
        if let Some(tx_send) = tx_sends_guard.get(&peer) {
            tx_send
                .send(PeerMessage::Msg { msg })
                .map_err(EmberError::msg)?;
        }
        Ok(())
    }

    /// Receives a message from some peer by receiving from the recv channel.
    /// Returns a pair of `(peer_id, msg)` on success.
    pub(crate) async fn recv_msg(
        &mut self,
    ) -> Result<(ServerId, Msg), EmberError> {
        loop {
            match self.rx_recv.recv().await {
                Some((id, PeerMessage::Msg { msg })) => return Ok((id, msg)),
                Some(_) => continue, // ignore leave traffic here
                None => {
                    return logged_err!(self.me;
                                       "recv channel has been closed")
                }
            }
        }
    }

    /// Broadcasts leave notifications to all connected peers.
    #[allow(dead_code)]
    pub(crate) async fn leave(&mut self) -> Result<(), EmberError> {
        let tx_sends_guard = self.tx_sends.guard();
        for &peer in tx_sends_guard.keys() {
            if peer == self.me {
                continue;
            }
            tx_sends_guard
                .get(&peer)
                .unwrap()
                .send(PeerMessage::Leave)
                .map_err(EmberError::msg)?;
        }
        Ok(())
    }
}

// TransportHub peer_acceptor task implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Connects to a peer proactively.
    async fn connect_new_peer(
        me: ServerId,
        id: ServerId,
        conn_addr: SocketAddr,
        tx_recv: mpsc::UnboundedSender<(ServerId, PeerMessage<Msg>)>,
        tx_sends: &mut flashmap::WriteHandle<
            ServerId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >,
        peer_messenger_handles: &mut flashmap::WriteHandle<
            ServerId,
            JoinHandle<()>,
        >,
        tx_exit: mpsc::UnboundedSender<ServerId>,
    ) -> Result<(), EmberError> {
        pf_debug!(me; "connecting to peer {} '{}'...", id, conn_addr);
        let mut stream = tcp_connect_with_retry(conn_addr, 10).await?;
        stream.write_u64(me.0).await?; // send my ID

        let mut peer_messenger_handles_guard = peer_messenger_handles.guard();
        if peer_messenger_handles_guard.contains_key(&id) {
            return logged_err!(me; "duplicate peer ID to connect: {}", id);
        }

        let mut tx_sends_guard = tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);

        let peer_messenger_handle = tokio::spawn(Self::peer_messenger_task(
            me, id, conn_addr, stream, rx_send, tx_recv, tx_exit,
        ));
        peer_messenger_handles_guard.insert(id, peer_messenger_handle);

        peer_messenger_handles_guard.publish();
        tx_sends_guard.publish();
        pf_debug!(me; "connected to peer {}", id);
        Ok(())
    }

    /// Accepts a new peer connection.
    async fn accept_new_peer(
        me: ServerId,
        mut stream: TcpStream,
        addr: SocketAddr,
        tx_recv: mpsc::UnboundedSender<(ServerId, PeerMessage<Msg>)>,
        tx_sends: &mut flashmap::WriteHandle<
            ServerId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >,
        peer_messenger_handles: &mut flashmap::WriteHandle<
            ServerId,
            JoinHandle<()>,
        >,
        tx_exit: mpsc::UnboundedSender<ServerId>,
    ) -> Result<(), EmberError> {
        let id = match stream.read_u64().await {
            Ok(raw) => ServerId(raw),
            Err(e) => {
                return logged_err!(me; "error receiving new peer ID: {}", e);
            }
        };

        let mut peer_messenger_handles_guard = peer_messenger_handles.guard();
        if peer_messenger_handles_guard.contains_key(&id) {
            return logged_err!(me; "duplicate peer ID listened: {}", id);
        }

        let mut tx_sends_guard = tx_sends.guard();
        let (tx_send, rx_send) = mpsc::unbounded_channel();
        tx_sends_guard.insert(id, tx_send);

        let peer_messenger_handle = tokio::spawn(Self::peer_messenger_task(
            me, id, addr, stream, rx_send, tx_recv, tx_exit,
        ));
        peer_messenger_handles_guard.insert(id, peer_messenger_handle);

        peer_messenger_handles_guard.publish();
        tx_sends_guard.publish();
        pf_debug!(me; "waited on peer {}", id);
        Ok(())
    }

    /// Removes handles of a left peer connection.
    fn remove_left_peer(
        me: ServerId,
        id: ServerId,
        tx_sends: &mut flashmap::WriteHandle<
            ServerId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >,
        peer_messenger_handles: &mut flashmap::WriteHandle<
            ServerId,
            JoinHandle<()>,
        >,
    ) -> Result<(), EmberError> {
        let mut tx_sends_guard = tx_sends.guard();
        if !tx_sends_guard.contains_key(&id) {
            return logged_err!(me; "peer {} not found among connected ones",
                                   id);
        }
        tx_sends_guard.remove(id);

        let mut peer_messenger_handles_guard = peer_messenger_handles.guard();
        peer_messenger_handles_guard.remove(id);

        peer_messenger_handles_guard.publish();
        tx_sends_guard.publish();
        Ok(())
    }

    /// Peer acceptor task function.
    async fn peer_acceptor_task(
        me: ServerId,
        tx_recv: mpsc::UnboundedSender<(ServerId, PeerMessage<Msg>)>,
        peer_listener: TcpListener,
        mut tx_sends: flashmap::WriteHandle<
            ServerId,
            mpsc::UnboundedSender<PeerMessage<Msg>>,
        >,
        mut peer_messenger_handles: flashmap::WriteHandle<
            ServerId,
            JoinHandle<()>,
        >,
        mut rx_connect: mpsc::UnboundedReceiver<(ServerId, SocketAddr)>,
        tx_connack: mpsc::UnboundedSender<ServerId>,
    ) {
        pf_debug!(me; "peer_acceptor task spawned");

        // create an exit mpsc channel for getting notified about termination
        // of peer messenger tasks
        let (tx_exit, mut rx_exit) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                // proactive connection request
                to_connect = rx_connect.recv() => {
                    let Some((peer, conn_addr)) = to_connect else {
                        pf_error!(me; "connect channel closed");
                        break;
                    };
                    if let Err(e) = Self::connect_new_peer(
                        me,
                        peer,
                        conn_addr,
                        tx_recv.clone(),
                        &mut tx_sends,
                        &mut peer_messenger_handles,
                        tx_exit.clone(),
                    ).await {
                        pf_error!(me; "error connecting to new peer: {}", e);
                    } else if let Err(e) = tx_connack.send(peer) {
                        pf_error!(me; "error sending to tx_connack: {}", e);
                    }
                },

                // new peer connection accepted
                accepted = peer_listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            pf_warn!(me; "error accepting peer connection: {}",
                                         e);
                            continue;
                        }
                    };
                    if let Err(e) = Self::accept_new_peer(
                        me,
                        stream,
                        addr,
                        tx_recv.clone(),
                        &mut tx_sends,
                        &mut peer_messenger_handles,
                        tx_exit.clone(),
                    ).await {
                        pf_error!(me; "error accepting new peer: {}", e);
                    }
                },

                // a peer messenger task exits
                id = rx_exit.recv() => {
                    let id = id.unwrap();
                    if let Err(e) = Self::remove_left_peer(
                        me,
                        id,
                        &mut tx_sends,
                        &mut peer_messenger_handles,
                    ) {
                        pf_error!(me; "error removing left peer {}: {}",
                                      id, e);
                    }
                },
            }
        }
    }
}

// TransportHub peer_messenger task implementation
impl<Msg> TransportHub<Msg>
where
    Msg: fmt::Debug
        + Clone
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    /// Writes a message through given TcpStream.
    fn write_msg(
        write_buf: &mut BytesMut,
        write_buf_cursor: &mut usize,
        conn_write: &OwnedWriteHalf,
        msg: Option<&PeerMessage<Msg>>,
    ) -> Result<bool, EmberError> {
        safe_tcp_write(write_buf, write_buf_cursor, conn_write, msg)
    }

    /// Reads a message from given TcpStream.
    async fn read_msg(
        read_buf: &mut BytesMut,
        conn_read: &mut OwnedReadHalf,
    ) -> Result<PeerMessage<Msg>, EmberError> {
        safe_tcp_read(read_buf, conn_read).await
    }

    /// Per-peer messenger task function.
    async fn peer_messenger_task(
        me: ServerId,
        id: ServerId,
        addr: SocketAddr,
        conn: TcpStream,
        mut rx_send: mpsc::UnboundedReceiver<PeerMessage<Msg>>,
        tx_recv: mpsc::UnboundedSender<(ServerId, PeerMessage<Msg>)>,
        tx_exit: mpsc::UnboundedSender<ServerId>,
    ) {
        pf_debug!(me; "peer_messenger task for {} '{}' spawned", id, addr);

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf = BytesMut::with_capacity(8 + 1024);
        let mut write_buf_cursor = 0;
        let mut retrying = false;

        loop {
            tokio::select! {
                // gets a message to send out
                msg = rx_send.recv(), if !retrying => {
                    match msg {
                        Some(PeerMessage::Leave) => {
                            // I decide to leave, notify peer
                            if Self::write_msg(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&PeerMessage::Leave),
                            ).is_ok() {
                                pf_debug!(me; "sent leave notification -> {}",
                                              id);
                            }
                        },

                        Some(PeerMessage::LeaveReply) => {
                            pf_error!(me; "proactively sending LeaveReply");
                        },

                        Some(msg @ PeerMessage::Msg { .. }) => {
                            match Self::write_msg(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&msg),
                            ) {
                                Ok(true) => {},
                                Ok(false) => {
                                    pf_debug!(me; "should start retrying msg \
                                                   send -> {}", id);
                                    retrying = true;
                                }
                                Err(_e) => {
                                    // peer likely went away; the exit path
                                    // below will clean up
                                }
                            }
                        },

                        None => break, // channel closed and no messages remain
                    }
                },

                // retrying last unsuccessful send
                _ = conn_write.writable(), if retrying => {
                    match Self::write_msg(
                        &mut write_buf,
                        &mut write_buf_cursor,
                        &conn_write,
                        None,
                    ) {
                        Ok(true) => {
                            pf_debug!(me; "finished retrying last msg send \
                                           -> {}", id);
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(me; "still should retry last msg send \
                                           -> {}", id);
                        }
                        Err(_e) => {}
                    }
                },

                // receives new message from peer
                msg = Self::read_msg(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(PeerMessage::Leave) => {
                            // peer leaving, send dummy reply and break
                            if Self::write_msg(
                                &mut write_buf,
                                &mut write_buf_cursor,
                                &conn_write,
                                Some(&PeerMessage::LeaveReply),
                            ).is_ok() {
                                pf_debug!(me; "peer {} has left", id);
                            }
                            break;
                        },

                        Ok(PeerMessage::LeaveReply) => {
                            // my leave notification is acked by peer, break
                            if let Err(e) = tx_recv.send(
                                (id, PeerMessage::LeaveReply),
                            ) {
                                pf_error!(me; "error sending to tx_recv for \
                                               {}: {}", id, e);
                            }
                            break;
                        }

                        Ok(msg @ PeerMessage::Msg { .. }) => {
                            if let Err(e) = tx_recv.send((id, msg)) {
                                pf_error!(me; "error sending to tx_recv for \
                                               {}: {}", id, e);
                            }
                        },

                        Err(_e) => {
                            break; // probably the peer exited ungracefully
                        }
                    }
                }
            }
        }

        if let Err(e) = tx_exit.send(id) {
            pf_error!(me; "error sending exit signal for {}: {}", id, e);
        }
        pf_debug!(me; "peer_messenger task for {} '{}' exited", id, addr);
    }
}
