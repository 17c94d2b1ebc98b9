//! Public interface to the emberstore recovery core library, linked by the
//! coordinator, master, and backup server executables.

#[macro_use]
pub mod utils;

pub mod backup;
pub mod coordinator;
pub mod master;

mod genserver;

pub use crate::genserver::GenericServer;
pub use crate::utils::{ClusterTime, EmberError, LogPosition, ServerId};
