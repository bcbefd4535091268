//! The command-forwarder seam.
//!
//! On a CFT backup, write requests are handed to the forwarder for delivery
//! to the primary; the response comes back out of band and the local request
//! stays pending. Delivery is best effort: a failed forward surfaces as a
//! `500` to the client, which is expected to retry.

use crate::context::RpcContext;
use conclave_kv::{CallerId, NodeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("no channel to node {0}")]
    NoChannel(NodeId),

    #[error("forwarded frame could not be encoded")]
    Encoding,

    #[error("forwarding queue is full")]
    Backpressure,
}

/// Delivers commands to the current primary. Implementations own the
/// node-to-node transport; the frontend only decides *whether* to forward
/// and which caller certificate travels with the command.
pub trait Forwarder: Send + Sync {
    fn forward_command(
        &self,
        ctx: &RpcContext,
        primary: NodeId,
        active_nodes: &[NodeId],
        caller_id: CallerId,
        caller_cert: &[u8],
    ) -> Result<(), ForwardError>;
}
