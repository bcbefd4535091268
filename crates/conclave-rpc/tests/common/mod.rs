//! Shared harness: a fault-injecting store wrapper plus scripted consensus,
//! forwarder, history, and registry implementations.

#![allow(dead_code)]

use conclave_kv::{
    CallerId, CommitOutcome, Consensus, ConsensusKind, ConsensusStats, FrameFormat, KvError,
    KvResult, KvStore, KvTx, NodeId, RequestId, Store, Tx, TxHistory, Version,
};
use conclave_rpc::context::KeyDigest;
use conclave_rpc::forwarding::{ForwardError, Forwarder};
use conclave_rpc::registry::{
    EndpointContext, EndpointDefinition, EndpointMetrics, EndpointProperties, EndpointRegistry,
    HandlerError,
};
use conclave_rpc::RpcContext;
use http::Method;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Commit outcome to inject ahead of the real store commit.
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Conflict,
    NoReplicate,
    Compacted,
    SerialiseFailure,
}

/// A `Store` whose commits can be scripted to fail. With an empty script it
/// behaves exactly like the wrapped store.
#[derive(Clone)]
pub struct FaultStore {
    pub store: Store,
    faults: Arc<Mutex<VecDeque<Fault>>>,
}

impl FaultStore {
    pub fn new() -> Self {
        Self {
            store: Store::new(),
            faults: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn push_fault(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    pub fn push_faults(&self, count: usize, fault: Fault) {
        let mut faults = self.faults.lock();
        for _ in 0..count {
            faults.push_back(fault);
        }
    }

    pub fn remaining_faults(&self) -> usize {
        self.faults.lock().len()
    }
}

impl KvStore for FaultStore {
    type Tx = FaultTx;

    fn create_tx(&self) -> FaultTx {
        FaultTx {
            inner: self.store.create_tx(),
            faults: Arc::clone(&self.faults),
        }
    }

    fn consensus(&self) -> Option<Arc<dyn Consensus>> {
        self.store.consensus()
    }

    fn history(&self) -> Option<Arc<dyn TxHistory>> {
        self.store.history()
    }
}

pub struct FaultTx {
    inner: Tx,
    faults: Arc<Mutex<VecDeque<Fault>>>,
}

impl KvTx for FaultTx {
    fn get<K: Serialize, V: DeserializeOwned>(
        &mut self,
        map: &str,
        key: &K,
    ) -> KvResult<Option<V>> {
        self.inner.get(map, key)
    }

    fn get_globally_committed<K: Serialize, V: DeserializeOwned>(
        &mut self,
        map: &str,
        key: &K,
    ) -> KvResult<Option<V>> {
        self.inner.get_globally_committed(map, key)
    }

    fn put<K: Serialize, V: Serialize>(&mut self, map: &str, key: &K, value: &V) -> KvResult<()> {
        self.inner.put(map, key, value)
    }

    fn remove<K: Serialize>(&mut self, map: &str, key: &K) -> KvResult<()> {
        self.inner.remove(map, key)
    }

    fn commit(&mut self) -> KvResult<CommitOutcome> {
        let fault = self.faults.lock().pop_front();
        match fault {
            None => self.inner.commit(),
            Some(Fault::Conflict) => {
                // Mimic a real conflict: the transaction is re-armed for
                // re-execution on a fresh snapshot.
                self.inner.reset();
                Ok(CommitOutcome::Conflict)
            }
            Some(Fault::NoReplicate) => Ok(CommitOutcome::NoReplicate),
            Some(Fault::Compacted) => Err(KvError::CompactedVersionConflict {
                snapshot: self.inner.read_version(),
                compacted: self.inner.read_version() + 1,
            }),
            Some(Fault::SerialiseFailure) => Err(KvError::Serialise(
                serde_json::from_str::<u64>("not json").unwrap_err(),
            )),
        }
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn commit_version(&self) -> Version {
        self.inner.commit_version()
    }

    fn commit_term(&self) -> u64 {
        self.inner.commit_term()
    }

    fn read_version(&self) -> Version {
        self.inner.read_version()
    }

    fn version(&self) -> Version {
        self.inner.version()
    }

    fn set_request_id(&mut self, id: RequestId) {
        self.inner.set_request_id(id);
    }

    fn request_id(&self) -> Option<RequestId> {
        self.inner.request_id()
    }
}

pub struct ScriptedConsensus {
    pub kind: ConsensusKind,
    pub primary_flag: AtomicBool,
    pub primary_id: Mutex<Option<NodeId>>,
    pub nodes: Vec<NodeId>,
    pub committed: AtomicU64,
    pub stats: Mutex<ConsensusStats>,
}

impl ScriptedConsensus {
    pub fn cft_primary() -> Self {
        Self::new(ConsensusKind::Cft, true, Some(0))
    }

    pub fn cft_backup(primary: Option<NodeId>) -> Self {
        Self::new(ConsensusKind::Cft, false, primary)
    }

    pub fn bft(is_primary: bool) -> Self {
        Self::new(ConsensusKind::Bft, is_primary, Some(0))
    }

    pub fn new(kind: ConsensusKind, is_primary: bool, primary: Option<NodeId>) -> Self {
        Self {
            kind,
            primary_flag: AtomicBool::new(is_primary),
            primary_id: Mutex::new(primary),
            nodes: vec![0, 1, 2],
            committed: AtomicU64::new(0),
            stats: Mutex::new(ConsensusStats::default()),
        }
    }
}

impl Consensus for ScriptedConsensus {
    fn kind(&self) -> ConsensusKind {
        self.kind
    }

    fn is_primary(&self) -> bool {
        self.primary_flag.load(Ordering::Relaxed)
    }

    fn primary(&self) -> Option<NodeId> {
        *self.primary_id.lock()
    }

    fn active_nodes(&self) -> Vec<NodeId> {
        self.nodes.clone()
    }

    fn committed_seqno(&self) -> Version {
        self.committed.load(Ordering::Relaxed)
    }

    fn statistics(&self) -> ConsensusStats {
        *self.stats.lock()
    }
}

#[derive(Debug, Clone)]
pub struct ForwardRecord {
    pub method: String,
    pub primary: NodeId,
    pub active_nodes: Vec<NodeId>,
    pub caller_id: CallerId,
    pub caller_cert: Vec<u8>,
}

pub struct RecordingForwarder {
    deliverable: AtomicBool,
    pub calls: Mutex<Vec<ForwardRecord>>,
}

impl RecordingForwarder {
    pub fn new() -> Self {
        Self {
            deliverable: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        let forwarder = Self::new();
        forwarder.deliverable.store(false, Ordering::Relaxed);
        forwarder
    }
}

impl Forwarder for RecordingForwarder {
    fn forward_command(
        &self,
        ctx: &RpcContext,
        primary: NodeId,
        active_nodes: &[NodeId],
        caller_id: CallerId,
        caller_cert: &[u8],
    ) -> Result<(), ForwardError> {
        self.calls.lock().push(ForwardRecord {
            method: ctx.method().to_string(),
            primary,
            active_nodes: active_nodes.to_vec(),
            caller_id,
            caller_cert: caller_cert.to_vec(),
        });
        if self.deliverable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(ForwardError::NoChannel(primary))
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddedRequest {
    pub id: RequestId,
    pub caller: CallerId,
    pub caller_cert: Vec<u8>,
    pub request: Vec<u8>,
    pub frame: FrameFormat,
}

pub struct RecordingHistory {
    accept: AtomicBool,
    pub added: Mutex<Vec<AddedRequest>>,
    pub signatures_emitted: AtomicU64,
    pub flushes: AtomicU64,
}

impl RecordingHistory {
    pub fn new() -> Self {
        Self {
            accept: AtomicBool::new(true),
            added: Mutex::new(Vec::new()),
            signatures_emitted: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn refusing() -> Self {
        let history = Self::new();
        history.accept.store(false, Ordering::Relaxed);
        history
    }
}

impl TxHistory for RecordingHistory {
    fn add_request(
        &self,
        id: RequestId,
        caller: CallerId,
        caller_cert: &[u8],
        request: &[u8],
        frame: FrameFormat,
    ) -> bool {
        self.added.lock().push(AddedRequest {
            id,
            caller,
            caller_cert: caller_cert.to_vec(),
            request: request.to_vec(),
            frame,
        });
        self.accept.load(Ordering::Relaxed)
    }

    fn try_emit_signature(&self) {
        self.signatures_emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_pending(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

type Handler =
    Box<dyn for<'a> Fn(EndpointContext<'a, FaultTx>) -> Result<(), HandlerError> + Send + Sync>;

struct RegisteredEndpoint {
    definition: Arc<EndpointDefinition>,
    handler: Handler,
    metrics: Arc<EndpointMetrics>,
}

/// Registry backed by a static endpoint list, built before sharing.
pub struct TestRegistry {
    endpoints: Vec<RegisteredEndpoint>,
    cert_ids: HashMap<Vec<u8>, CallerId>,
    digest_ids: HashMap<KeyDigest, CallerId>,
    has_certs: bool,
    pub init_calls: AtomicU64,
    pub ticks: Mutex<Vec<(Duration, ConsensusStats)>>,
    pub consensus_updates: AtomicU64,
    pub history_updates: AtomicU64,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            cert_ids: HashMap::new(),
            digest_ids: HashMap::new(),
            has_certs: false,
            init_calls: AtomicU64::new(0),
            ticks: Mutex::new(Vec::new()),
            consensus_updates: AtomicU64::new(0),
            history_updates: AtomicU64::new(0),
        }
    }

    pub fn with_certs(mut self) -> Self {
        self.has_certs = true;
        self
    }

    pub fn map_cert(mut self, cert: impl Into<Vec<u8>>, caller_id: CallerId) -> Self {
        self.cert_ids.insert(cert.into(), caller_id);
        self
    }

    pub fn map_digest(mut self, digest: KeyDigest, caller_id: CallerId) -> Self {
        self.digest_ids.insert(digest, caller_id);
        self
    }

    pub fn register(
        mut self,
        verb: Method,
        method: &str,
        properties: EndpointProperties,
        handler: impl for<'a> Fn(EndpointContext<'a, FaultTx>) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.endpoints.push(RegisteredEndpoint {
            definition: Arc::new(EndpointDefinition {
                method: method.to_string(),
                verb,
                properties,
            }),
            handler: Box::new(handler),
            metrics: Arc::new(EndpointMetrics::default()),
        });
        self
    }

    pub fn metrics_for(&self, verb: &Method, method: &str) -> Arc<EndpointMetrics> {
        self.endpoints
            .iter()
            .find(|e| e.definition.verb == *verb && e.definition.method == method)
            .map(|e| Arc::clone(&e.metrics))
            .unwrap_or_default()
    }
}

impl EndpointRegistry<FaultStore> for TestRegistry {
    fn find_endpoint(
        &self,
        _tx: &mut FaultTx,
        ctx: &RpcContext,
    ) -> Option<Arc<EndpointDefinition>> {
        self.endpoints
            .iter()
            .find(|e| e.definition.method == ctx.method() && e.definition.verb == *ctx.request_verb())
            .map(|e| Arc::clone(&e.definition))
    }

    fn allowed_verbs(&self, _tx: &mut FaultTx, method: &str) -> Vec<Method> {
        self.endpoints
            .iter()
            .filter(|e| e.definition.method == method)
            .map(|e| e.definition.verb.clone())
            .collect()
    }

    fn caller_id(&self, _tx: &mut FaultTx, caller_cert: &[u8]) -> CallerId {
        self.cert_ids
            .get(caller_cert)
            .copied()
            .unwrap_or(CallerId::INVALID)
    }

    fn caller_id_by_digest(&self, _tx: &mut FaultTx, digest: &KeyDigest) -> CallerId {
        self.digest_ids
            .get(digest)
            .copied()
            .unwrap_or(CallerId::INVALID)
    }

    fn has_certs(&self) -> bool {
        self.has_certs
    }

    fn metrics(&self, endpoint: &EndpointDefinition) -> Arc<EndpointMetrics> {
        self.metrics_for(&endpoint.verb, &endpoint.method)
    }

    fn execute_endpoint(
        &self,
        endpoint: &EndpointDefinition,
        args: EndpointContext<'_, FaultTx>,
    ) -> Result<(), HandlerError> {
        let registered = self
            .endpoints
            .iter()
            .find(|e| e.definition.method == endpoint.method && e.definition.verb == endpoint.verb)
            .ok_or_else(|| HandlerError::Other("endpoint has no handler".to_string()))?;
        (registered.handler)(args)
    }

    fn init_handlers(&self, _store: &FaultStore) {
        self.init_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn tick(&self, elapsed: Duration, stats: ConsensusStats) {
        self.ticks.lock().push((elapsed, stats));
    }

    fn set_consensus(&self, _consensus: Option<Arc<dyn Consensus>>) {
        self.consensus_updates.fetch_add(1, Ordering::Relaxed);
    }

    fn set_history(&self, _history: Option<Arc<dyn TxHistory>>) {
        self.history_updates.fetch_add(1, Ordering::Relaxed);
    }
}

/// Commit a single value into the store outside any frontend request.
pub fn seed<K: Serialize, V: Serialize>(store: &FaultStore, map: &str, key: &K, value: &V) {
    let mut tx = store.create_tx();
    tx.put(map, key, value).unwrap();
    assert_eq!(tx.commit().unwrap(), CommitOutcome::Ok);
}

/// An open frontend over a fresh fault store, with the given registry.
pub fn open_frontend(
    registry: TestRegistry,
) -> (
    Arc<conclave_rpc::RpcFrontend<FaultStore, TestRegistry>>,
    Arc<FaultStore>,
    Arc<TestRegistry>,
) {
    let store = Arc::new(FaultStore::new());
    let registry = Arc::new(registry);
    let frontend = Arc::new(conclave_rpc::RpcFrontend::new(
        Arc::clone(&store),
        Arc::clone(&registry),
    ));
    frontend.open(None);
    (frontend, store, registry)
}
