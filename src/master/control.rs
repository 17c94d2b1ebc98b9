//! Coordinator control link module: every server (master or backup) keeps
//! one connection to the coordinator over which control messages flow in
//! both directions.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::coordinator::CtrlMsg;
use crate::utils::{
    safe_tcp_read, safe_tcp_write, tcp_connect_with_retry, EmberError,
    ServerId,
};

/// The coordinator control message handler module.
pub(crate) struct ControlHub {
    /// My assigned server ID.
    pub me: ServerId,

    /// Receiver side of the recv channel.
    rx_recv: mpsc::UnboundedReceiver<CtrlMsg>,

    /// Sender side of the send channel.
    tx_send: mpsc::UnboundedSender<CtrlMsg>,

    /// Control messenger task join handle.
    _control_messenger_handle: JoinHandle<()>,
}

// ControlHub public API implementation
impl ControlHub {
    /// Creates a new control message handler module. Connects to the
    /// coordinator and gets assigned my server ID (a fresh generation of my
    /// slot each time I enlist). Spawns the control messenger task.
    pub(crate) async fn new_and_setup(
        coordinator: SocketAddr,
    ) -> Result<Self, EmberError> {
        pf_debug!("s"; "connecting to coordinator '{}'...", coordinator);
        let mut stream = tcp_connect_with_retry(coordinator, 10).await?;
        let id = ServerId(stream.read_u64().await?); // receive assigned ID
        pf_info!(id; "enlisted with coordinator as server {}", id);

        let (tx_recv, rx_recv) = mpsc::unbounded_channel();
        let (tx_send, rx_send) = mpsc::unbounded_channel();

        let control_messenger_handle = tokio::spawn(
            Self::control_messenger_task(id, stream, tx_recv, rx_send),
        );

        Ok(ControlHub {
            me: id,
            rx_recv,
            tx_send,
            _control_messenger_handle: control_messenger_handle,
        })
    }

    /// Waits for the next control event message from the coordinator.
    pub(crate) async fn recv_ctrl(&mut self) -> Result<CtrlMsg, EmberError> {
        match self.rx_recv.recv().await {
            Some(msg) => Ok(msg),
            None => logged_err!(self.me; "recv channel has been closed"),
        }
    }

    /// Sends a control message to the coordinator.
    pub(crate) fn send_ctrl(&mut self, msg: CtrlMsg) -> Result<(), EmberError> {
        self.tx_send.send(msg)?;
        Ok(())
    }

    /// Sends a control message to the coordinator and waits blockingly for
    /// the first reply matching `expect`. Non-matching messages received in
    /// the meantime are discarded.
    #[allow(dead_code)]
    pub(crate) async fn do_sync_ctrl(
        &mut self,
        msg: CtrlMsg,
        expect: fn(&CtrlMsg) -> bool,
    ) -> Result<CtrlMsg, EmberError> {
        self.send_ctrl(msg)?;
        loop {
            let reply = self.recv_ctrl().await?;
            if expect(&reply) {
                return Ok(reply);
            }
        }
    }
}

// ControlHub control_messenger task implementation
impl ControlHub {
    /// Reads a coordinator control message from given TcpStream.
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

    /// Coordinator control message listener and sender task function.
    async fn control_messenger_task(
        me: ServerId,
        conn: TcpStream,
        tx_recv: mpsc::UnboundedSender<CtrlMsg>,
        mut rx_send: mpsc::UnboundedReceiver<CtrlMsg>,
    ) {
        pf_debug!(me; "control_messenger task spawned");

        let (mut conn_read, conn_write) = conn.into_split();
        let mut read_buf = BytesMut::new();
        let mut write_buf = BytesMut::new();
        let mut write_buf_cursor = 0;

        let mut retrying = false;
        loop {
            tokio::select! {
                // gets a message to send to the coordinator
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
                                    pf_debug!(me; "should start retrying \
                                                   ctrl send");
                                    retrying = true;
                                }
                                Err(e) => {
                                    pf_error!(me; "error sending ctrl: {}",
                                                  e);
                                }
                            }
                        },
                        None => break, // channel closed and no messages remain
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
                            pf_debug!(me; "finished retrying last ctrl send");
                            retrying = false;
                        }
                        Ok(false) => {
                            pf_debug!(me; "still should retry last ctrl send");
                        }
                        Err(e) => {
                            pf_error!(me; "error retrying last ctrl send: {}",
                                          e);
                        }
                    }
                },

                // receives control message from the coordinator
                msg = Self::read_ctrl(&mut read_buf, &mut conn_read) => {
                    match msg {
                        Ok(msg) => {
                            if let Err(e) = tx_recv.send(msg) {
                                pf_error!(me; "error sending to tx_recv: {}",
                                              e);
                            }
                        },

                        Err(_e) => {
                            break; // probably the coordinator went away
                        }
                    }
                }
            }
        }

        pf_debug!(me; "control_messenger task exited");
    }
}

// Unit tests are done together with `coordinator::reigner`.
