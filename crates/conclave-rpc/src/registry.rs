//! The endpoint registry seam.
//!
//! Each actor frontend owns a registry mapping `(path, verb)` to a handler
//! plus the admission properties the frontend enforces before the handler
//! runs. The registry also resolves caller identities from certificates and
//! aggregates per-endpoint call counters.

use crate::context::{KeyDigest, RpcContext};
use conclave_kv::{CallerId, Consensus, ConsensusStats, KvError, KvStore, KvTx, TxHistory};
use http::{Method, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// When a backup must hand a request to the primary instead of executing
/// it locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForwardingRequired {
    /// Read-only endpoints any replica may serve.
    Never,
    /// Forward on the first use of a session; execution is local once the
    /// session is known to the primary.
    #[default]
    Sometimes,
    /// Writes that must originate on the primary.
    Always,
}

#[derive(Debug, Clone, Default)]
pub struct EndpointProperties {
    pub require_client_identity: bool,
    pub require_client_signature: bool,
    pub require_jwt_authentication: bool,
    pub forwarding_required: ForwardingRequired,
    /// Under BFT, execute on the receiving replica instead of distributing
    /// through the history.
    pub execute_locally: bool,
}

#[derive(Debug, Clone)]
pub struct EndpointDefinition {
    /// Request path, e.g. `/users/log`.
    pub method: String,
    pub verb: Method,
    pub properties: EndpointProperties,
}

/// Call counters for one endpoint. `calls` counts dispatches; `errors` and
/// `failures` count 4xx and 5xx terminal responses.
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    calls: AtomicU64,
    errors: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub calls: u64,
    pub errors: u64,
    pub failures: u64,
}

impl EndpointMetrics {
    pub fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            calls: self.calls.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Arguments handed to an endpoint handler: the request context, the open
/// transaction, and the authenticated caller.
pub struct EndpointContext<'a, T: KvTx> {
    pub ctx: &'a mut RpcContext,
    pub tx: &'a mut T,
    pub caller_id: CallerId,
}

/// Failure modes a handler may surface. Everything except a compaction
/// conflict becomes a terminal HTTP response.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// An error with an explicit status, e.g. a domain-level rejection.
    #[error("{msg}")]
    Rpc { status: StatusCode, msg: String },

    /// The request payload failed to parse at `pointer`.
    #[error("json parse error at {pointer}: {what}")]
    JsonParse { pointer: String, what: String },

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn rpc(status: StatusCode, msg: impl Into<String>) -> Self {
        Self::Rpc {
            status,
            msg: msg.into(),
        }
    }
}

/// Registry of endpoints for one actor. Implementations are expected to be
/// shared across worker threads.
pub trait EndpointRegistry<S: KvStore>: Send + Sync {
    /// Look up the endpoint matching the context's `(path, verb)`.
    fn find_endpoint(&self, tx: &mut S::Tx, ctx: &RpcContext) -> Option<Arc<EndpointDefinition>>;

    /// Verbs registered at a path, for `405` responses. Empty means the
    /// path itself is unknown.
    fn allowed_verbs(&self, tx: &mut S::Tx, method: &str) -> Vec<Method>;

    /// Resolve a session certificate to a caller id; `CallerId::INVALID`
    /// when unknown.
    fn caller_id(&self, tx: &mut S::Tx, caller_cert: &[u8]) -> CallerId;

    /// Resolve a signing-key digest to a caller id; `CallerId::INVALID`
    /// when unknown.
    fn caller_id_by_digest(&self, tx: &mut S::Tx, digest: &KeyDigest) -> CallerId;

    /// Whether this actor keeps a certificate table at all. When it does
    /// not, identity admission is skipped and certificates are always
    /// forwarded verbatim.
    fn has_certs(&self) -> bool;

    fn metrics(&self, endpoint: &EndpointDefinition) -> Arc<EndpointMetrics>;

    fn execute_endpoint(
        &self,
        endpoint: &EndpointDefinition,
        args: EndpointContext<'_, S::Tx>,
    ) -> Result<(), HandlerError>;

    /// Install handlers once the frontend opens.
    fn init_handlers(&self, store: &S);

    /// Periodic tick: metrics aggregation and signature-cadence countdown.
    fn tick(&self, elapsed: Duration, stats: ConsensusStats);

    fn set_consensus(&self, consensus: Option<Arc<dyn Consensus>>);

    fn set_history(&self, history: Option<Arc<dyn TxHistory>>);
}
