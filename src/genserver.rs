//! Common trait for runnable server roles (masters and backups), the seam
//! that server executables drive.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::backup::BackupServer;
use crate::master::MasterServer;
use crate::utils::{EmberError, ServerId};

/// A server process role: enlisted with the coordinator, connected to its
/// peers, and driven by one long-running event loop.
#[async_trait]
pub trait GenericServer {
    /// The server's coordinator-assigned ID.
    fn id(&self) -> ServerId;

    /// Runs the event loop until a termination signal arrives.
    async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), EmberError>;
}

#[async_trait]
impl GenericServer for MasterServer {
    fn id(&self) -> ServerId {
        self.me()
    }

    async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), EmberError> {
        MasterServer::run(self, rx_term).await
    }
}

#[async_trait]
impl GenericServer for BackupServer {
    fn id(&self) -> ServerId {
        self.me()
    }

    async fn run(
        &mut self,
        rx_term: watch::Receiver<bool>,
    ) -> Result<(), EmberError> {
        BackupServer::run(self, rx_term).await
    }
}
