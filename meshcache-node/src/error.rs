use std::error::Error;
use std::io;

use meshcache_rpc::Status;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("{0}")]
    /// The node configuration is invalid.
    Config(#[from] ConfigError),

    #[error("{0}")]
    /// An IO error has occurred, typically binding the listen address.
    IO(#[from] io::Error),

    #[error("No owner could be reached within the deadline, last tried node {node_id:?}")]
    /// No owner of the key answered within the deadline after every attempt.
    Timeout { node_id: String },

    #[error("No live node owns the key.")]
    /// The ring is empty so no node can serve the request.
    NoOwnerAvailable,

    #[error("Write was acknowledged by {acks} of the {required} required owners.")]
    /// Fewer than the required number of owners acknowledged a write.
    ///
    /// Owners which did apply the write keep it.
    QuorumFailed { acks: usize, required: usize },

    #[error("Node {node_id:?} failed to handle request: {status}")]
    /// A remote owner rejected the request or the connection failed.
    Rpc { node_id: String, status: Status },

    #[error("Local store error: {0}")]
    /// The local store failed to execute the operation.
    Store(Box<dyn Error + Send + Sync + 'static>),
}

impl NodeError {
    /// Creates a node error from a failed peer call.
    pub(crate) fn from_status(node_id: impl Into<String>, status: Status) -> Self {
        let node_id = node_id.into();
        if status.is_timeout() {
            Self::Timeout { node_id }
        } else {
            Self::Rpc { node_id, status }
        }
    }
}
