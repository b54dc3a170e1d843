use crate::coord::watch::WatchChannel;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Node metadata as reported by the coordination store. Callers always
/// receive defensive copies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStat {
    pub version: i64,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    pub ephemeral_owner: u64,
    pub data_length: u32,
    pub num_children: u32,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("no such node: {0}")]
    NoNode(String),
    #[error("version mismatch on {0}")]
    BadVersion(String),
    #[error("connection to coordination store lost")]
    ConnectionLoss,
    #[error("operation interrupted")]
    OperationInterrupted,
    #[error("coordination session expired")]
    SessionExpired,
    #[error("coordination failure: {0}")]
    Other(String),
}

impl CoordError {
    /// Errors the retry loop treats as routine rather than noteworthy.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CoordError::ConnectionLoss | CoordError::OperationInterrupted
        )
    }
}

/// Session-based coordination client. `watch = true` arms a one-shot watch
/// on the path; events arrive through the session's `WatchChannel`.
pub trait CoordClient: Send + Sync {
    /// Probes a path, arming a watch whether or not the node exists.
    fn exists(&self, path: &str, watch: bool) -> Result<Option<NodeStat>, CoordError>;

    /// Reads data and stat. With `version_bound` set, fails `BadVersion`
    /// when the node's version no longer matches.
    fn get_data(
        &self,
        path: &str,
        watch: bool,
        version_bound: Option<i64>,
    ) -> Result<(Vec<u8>, NodeStat), CoordError>;

    fn get_children(&self, path: &str, watch: bool) -> Result<Vec<String>, CoordError>;
}

/// Builds a connected client whose session delivers node and session events
/// into the supplied channel. Injected so tests and embedders control the
/// transport.
pub trait CoordClientFactory: Send + Sync {
    fn connect(
        &self,
        connect: &str,
        session_timeout: Duration,
        channel: &Arc<WatchChannel>,
    ) -> Result<Arc<dyn CoordClient>, CoordError>;
}
