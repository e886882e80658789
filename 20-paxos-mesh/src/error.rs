use std::io;

use thiserror::Error;

use crate::message::NodeUid;

/// Errors reported synchronously by the messaging layer.
///
/// Delivery failures after a message has been queued are never reported
/// here; they are logged and the message is lost.
#[derive(Debug, Error)]
pub enum NetError {
    /// Unicast to a member that is not in the session's peer table.
    #[error("no connection to node {0}")]
    Connection(NodeUid),

    /// Binding one of this node's own endpoints failed.
    #[error("transport unavailable at {addr}")]
    TransportUnavailable {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("peer table has no endpoints for local node {0}")]
    MissingLocalEndpoints(NodeUid),

    #[error("node is not connected")]
    NotConnected,

    #[error("node has been shut down")]
    Closed,

    /// Links did not finish their handshake within the requested wait.
    #[error("{pending} link(s) still settling")]
    NotReady { pending: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no state for data id {0:?}")]
    NotFound(String),

    /// The store was dropped before the write was flushed.
    #[error("store dropped before flush")]
    Abandoned,
}
