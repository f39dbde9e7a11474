//! Primary/backup replication
//!
//! - `message`: framed peer messages
//! - `primary`: pushes commits to the backup and answers sync requests
//! - `backup`: applies pushed commits and syncs at startup
//! - `failover`: roles, the coordination file, heartbeat promotion

pub mod backup;
pub mod failover;
pub mod message;
pub mod primary;

pub use backup::{serve_primary, sync_from_primary};
pub use failover::{
    probe, ClusterState, CoordinationFile, CoordinationRecord, FailoverMonitor, Role,
};
pub use message::{read_message, write_message, PeerMessage, FRAME_MAGIC, FRAME_VERSION};
pub use primary::{serve_sync, BackupLink};
