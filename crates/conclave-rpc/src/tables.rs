//! Built-in table names and the records stored under them.
//!
//! Actor-specific tables (certs, client signatures) are named by the
//! endpoint registry that owns them; the names here are shared by every
//! frontend instance.

use conclave_kv::{CallerId, RequestId};
use serde::{Deserialize, Serialize};

/// Singleton service record, keyed by `0`.
pub const SERVICE: &str = "conclave.service";

/// Node records keyed by `NodeId`.
pub const NODES: &str = "conclave.nodes";

/// JWT signing keys keyed by `kid`.
pub const JWT_PUBLIC_SIGNING_KEYS: &str = "conclave.jwt.public_signing_keys";

/// Issuer per JWT signing key, keyed by `kid`.
pub const JWT_PUBLIC_SIGNING_KEY_ISSUER: &str = "conclave.jwt.public_signing_key_issuer";

/// Requests pending ordered BFT execution, keyed by `0`.
pub const AFT_REQUESTS: &str = "conclave.aft.requests";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceStatus {
    Opening,
    Open,
    Closed,
}

/// The service identity record the lifecycle gate waits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub cert: Vec<u8>,
    pub status: ServiceStatus,
}

/// Addressing information for a replica, used to build redirects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub pubhost: String,
    pub rpcport: u16,
}

/// A request logged for ordered BFT execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AftRequest {
    pub caller_id: CallerId,
    pub request_id: Option<RequestId>,
    pub caller_cert: Vec<u8>,
    pub request: Vec<u8>,
}
