// Copyright [2026] [Conclave Contributors]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Conclave Contributors
// SPDX-License-Identifier: Apache-2.0

//! The frontend proper: admission, authentication, routing, and the
//! optimistic transaction driver.

use crate::auth::VerifierCache;
use crate::auth::REQUIRED_SIGNATURE_HEADERS;
use crate::context::{RpcContext, SignedRequest};
use crate::forwarding::Forwarder;
use crate::jwt::{self, Jwt};
use crate::registry::{
    EndpointContext, EndpointDefinition, EndpointMetrics, EndpointRegistry, ForwardingRequired,
    HandlerError,
};
use crate::tables::{self, AftRequest, NodeInfo, ServiceInfo, ServiceStatus};
use conclave_kv::{
    CallerId, CommitOutcome, Consensus, ConsensusKind, KvError, KvStore, KvTx, RequestId,
    TxHistory, Version, NO_VERSION,
};
use http::header::{ALLOW, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use http::StatusCode;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A commit is attempted at most this many times before the request fails
/// with `409 Conflict`.
pub const MAX_COMMIT_ATTEMPTS: usize = 30;

pub const DEFAULT_SIG_TX_INTERVAL: u64 = 5000;
pub const DEFAULT_SIG_MS_INTERVAL: Duration = Duration::from_millis(1000);

/// Abort primitive used when a committed write set cannot be serialised.
/// Continuing past that point risks silent divergence between replicas, so
/// the replica exits and external supervision restarts it. Tests substitute
/// a panicking fn and catch the unwind.
pub type AbortFn = fn(&str) -> !;

fn abort_process(reason: &str) -> ! {
    tracing::error!(reason, "aborting replica");
    std::process::abort()
}

/// Actor-specific admission hooks. `users`-style frontends resolve caller
/// certificates from their member/user tables; the defaults keep every
/// behaviour permissive.
pub trait FrontendPolicy<S: KvStore>: Send + Sync {
    fn invalid_caller_error_message(&self) -> String {
        "Could not find matching actor certificate".to_string()
    }

    /// Whether the original caller of a forwarded command is known to this
    /// actor. Returning false fails identity admission.
    fn lookup_forwarded_caller_cert(&self, _ctx: &RpcContext, _tx: &mut S::Tx) -> bool {
        true
    }

    /// Certificate for a caller id, used to rewrite the session identity
    /// when a signed request names a different caller.
    fn resolve_caller_id(&self, _caller_id: CallerId, _tx: &mut S::Tx) -> Option<Vec<u8>> {
        None
    }
}

pub struct DefaultPolicy;

impl<S: KvStore> FrontendPolicy<S> for DefaultPolicy {}

/// Faults in the forwarded/BFT entry protocols. These are not client
/// errors: each one indicates a misbehaving peer replica, and the caller is
/// expected to escalate (e.g. trigger a view change) rather than respond.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProcessError {
    #[error("frontend is not open")]
    FrontendClosed,

    #[error("forwarded command carries no forwarded session context")]
    MissingForwardedContext,

    #[error("forwarded command cannot be forwarded again")]
    ReforwardAttempt,
}

/// Result of executing a BFT-replicated command.
#[derive(Debug)]
pub struct BftResponse {
    pub result: Vec<u8>,
    pub version: Version,
}

struct OpenState {
    is_open: bool,
    service_identity: Option<Vec<u8>>,
}

struct SigCadence {
    tx_interval: u64,
    ms_interval: Duration,
    /// Countdown mirrored to the registry; the registry's tick drives it.
    ms_to_sig: Duration,
}

/// One frontend instance per logical actor. Worker threads share it and may
/// call `process`, `process_forwarded`, `process_bft` and `tick`
/// concurrently.
pub struct RpcFrontend<S: KvStore, R: EndpointRegistry<S>> {
    store: Arc<S>,
    registry: Arc<R>,
    policy: Box<dyn FrontendPolicy<S>>,
    /// Table client signatures are recorded into. `None` disables signature
    /// verification and recording for this actor.
    client_signatures_table: Option<String>,
    verifiers: VerifierCache,
    open_state: Mutex<OpenState>,
    consensus_cache: Mutex<Option<Arc<dyn Consensus>>>,
    history_cache: Mutex<Option<Arc<dyn TxHistory>>>,
    cmd_forwarder: Mutex<Option<Arc<dyn Forwarder>>>,
    cadence: Mutex<SigCadence>,
    tx_count: AtomicU64,
    request_storing_disabled: AtomicBool,
    abort_fn: AbortFn,
}

impl<S: KvStore, R: EndpointRegistry<S>> RpcFrontend<S, R> {
    pub fn new(store: Arc<S>, registry: Arc<R>) -> Self {
        Self {
            store,
            registry,
            policy: Box::new(DefaultPolicy),
            client_signatures_table: None,
            verifiers: VerifierCache::new(),
            open_state: Mutex::new(OpenState {
                is_open: false,
                service_identity: None,
            }),
            consensus_cache: Mutex::new(None),
            history_cache: Mutex::new(None),
            cmd_forwarder: Mutex::new(None),
            cadence: Mutex::new(SigCadence {
                tx_interval: DEFAULT_SIG_TX_INTERVAL,
                ms_interval: DEFAULT_SIG_MS_INTERVAL,
                ms_to_sig: DEFAULT_SIG_MS_INTERVAL,
            }),
            tx_count: AtomicU64::new(0),
            request_storing_disabled: AtomicBool::new(false),
            abort_fn: abort_process,
        }
    }

    /// Enable client-signature verification and record signatures into
    /// `table`.
    pub fn with_client_signatures(mut self, table: impl Into<String>) -> Self {
        self.client_signatures_table = Some(table.into());
        self
    }

    pub fn with_policy(mut self, policy: Box<dyn FrontendPolicy<S>>) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the abort primitive used on fatal serialisation failures.
    pub fn with_abort_fn(mut self, abort_fn: AbortFn) -> Self {
        self.abort_fn = abort_fn;
        self
    }

    /// Record client signatures without the request body.
    pub fn disable_request_storing(&self) {
        self.request_storing_disabled.store(true, Ordering::Relaxed);
    }

    pub fn set_sig_intervals(&self, tx_interval: u64, ms_interval: Duration) {
        let mut cadence = self.cadence.lock();
        cadence.tx_interval = tx_interval;
        cadence.ms_interval = ms_interval;
        cadence.ms_to_sig = ms_interval;
    }

    pub fn sig_tx_interval(&self) -> u64 {
        self.cadence.lock().tx_interval
    }

    pub fn sig_ms_interval(&self) -> Duration {
        self.cadence.lock().ms_interval
    }

    /// Remaining time until the next signature is due. The registry's tick
    /// owns the countdown; the frontend only mirrors the configuration.
    pub fn ms_to_sig(&self) -> Duration {
        self.cadence.lock().ms_to_sig
    }

    pub fn set_cmd_forwarder(&self, forwarder: Arc<dyn Forwarder>) {
        *self.cmd_forwarder.lock() = Some(forwarder);
    }

    /// Open the frontend. Without an identity the frontend opens
    /// immediately; with one it stays closed until `is_open` observes the
    /// service record carrying that identity with status `Open`.
    pub fn open(&self, identity: Option<Vec<u8>>) {
        let mut state = self.open_state.lock();
        match identity {
            Some(identity) => {
                state.service_identity = Some(identity);
            }
            None => {
                if !state.is_open {
                    state.is_open = true;
                    self.registry.init_handlers(self.store.as_ref());
                }
            }
        }
    }

    /// The gate is monotonic: once open it never closes.
    pub fn is_open(&self, tx: &mut S::Tx) -> bool {
        let mut state = self.open_state.lock();
        if !state.is_open {
            let service = tx
                .get_globally_committed::<_, ServiceInfo>(tables::SERVICE, &0u64)
                .ok()
                .flatten();
            if let Some(service) = service {
                if service.status == ServiceStatus::Open
                    && state.service_identity.as_deref() == Some(service.cert.as_slice())
                {
                    tracing::info!("service is open, now accepting user transactions");
                    state.is_open = true;
                    self.registry.init_handlers(self.store.as_ref());
                }
            }
        }
        state.is_open
    }

    /// Process a request. Returns `None` when the outcome is pending: the
    /// command was forwarded to the primary or handed to BFT distribution,
    /// and the response will be produced elsewhere.
    pub fn process(&self, ctx: &mut RpcContext) -> Option<Vec<u8>> {
        let consensus = self.update_consensus();

        let mut tx = self.store.create_tx();
        if !self.is_open(&mut tx) {
            ctx.set_response_status(StatusCode::NOT_FOUND);
            ctx.set_response_body("Frontend is not open.");
            return Some(ctx.serialise_response());
        }

        let caller_id = self.registry.caller_id(&mut tx, &ctx.session.caller_cert);
        let endpoint = self.registry.find_endpoint(&mut tx, ctx);

        let is_bft = consensus
            .as_ref()
            .map_or(false, |c| c.kind() == ConsensusKind::Bft);
        let executes_locally = endpoint
            .as_ref()
            .map_or(false, |e| e.properties.execute_locally);
        let should_bft_distribute = is_bft
            && !executes_locally
            && (ctx.execute_on_node || consensus.as_ref().map_or(false, |c| c.is_primary()));

        if should_bft_distribute {
            let history = self.update_history();
            let request_id = RequestId {
                caller: caller_id,
                client_session: ctx.session.client_session_id,
                index: ctx.request_index(),
            };
            return match history {
                Some(history) => {
                    if history.add_request(
                        request_id,
                        caller_id,
                        &self.cert_to_forward(ctx, None),
                        ctx.serialised_request(),
                        ctx.frame_format(),
                    ) {
                        tx.set_request_id(request_id);
                        None
                    } else {
                        tracing::warn!(
                            caller = %caller_id,
                            session = request_id.client_session,
                            index = request_id.index,
                            "history refused replicated request"
                        );
                        ctx.set_response_status(StatusCode::INTERNAL_SERVER_ERROR);
                        ctx.set_response_body("Could not process request.");
                        Some(ctx.serialise_response())
                    }
                }
                None => {
                    ctx.set_response_status(StatusCode::INTERNAL_SERVER_ERROR);
                    ctx.set_response_body("Consensus is not yet ready.");
                    Some(ctx.serialise_response())
                }
            };
        }

        self.process_command(ctx, &mut tx, caller_id, consensus.as_ref(), None)
    }

    /// Entry for commands forwarded by a backup. The forwarding replica has
    /// resolved and attached the original caller.
    pub fn process_forwarded(&self, ctx: &mut RpcContext) -> Result<Vec<u8>, ProcessError> {
        let original_caller = ctx
            .session
            .original_caller
            .ok_or(ProcessError::MissingForwardedContext)?;

        let consensus = self.update_consensus();
        let cft = consensus
            .as_ref()
            .map_or(true, |c| c.kind() == ConsensusKind::Cft);

        if cft {
            let mut tx = self.store.create_tx();
            match self.process_command(
                ctx,
                &mut tx,
                original_caller.caller_id,
                consensus.as_ref(),
                None,
            ) {
                Some(response) => Ok(response),
                // A forwarded command executes here or fails here.
                None => Err(ProcessError::ReforwardAttempt),
            }
        } else {
            self.process_bft(ctx).map(|r| r.result)
        }
    }

    /// Entry for BFT-replicated execution. A closed frontend here means the
    /// primary distributed a user transaction before the service opened,
    /// which only a malicious primary does; the caller should treat it as
    /// grounds for a view change.
    pub fn process_bft(&self, ctx: &mut RpcContext) -> Result<BftResponse, ProcessError> {
        let mut tx = self.store.create_tx();
        if !self.is_open(&mut tx) {
            return Err(ProcessError::FrontendClosed);
        }

        let consensus = self.update_consensus();
        let original_caller = ctx
            .session
            .original_caller
            .ok_or(ProcessError::MissingForwardedContext)?;

        let pre_exec = |tx: &mut S::Tx, ctx: &mut RpcContext| -> Result<(), HandlerError> {
            let caller_id = ctx
                .session
                .original_caller
                .map_or(CallerId::INVALID, |c| c.caller_id);
            let record = AftRequest {
                caller_id,
                request_id: tx.request_id(),
                caller_cert: ctx.session.caller_cert.clone(),
                request: ctx.serialised_request().to_vec(),
            };
            tx.put(tables::AFT_REQUESTS, &0u64, &record)?;
            Ok(())
        };

        let response = self.process_command(
            ctx,
            &mut tx,
            original_caller.caller_id,
            consensus.as_ref(),
            Some(&pre_exec),
        );
        let version = tx.version();
        match response {
            Some(result) => Ok(BftResponse { result, version }),
            None => Err(ProcessError::ReforwardAttempt),
        }
    }

    /// Flush history entries not yet folded into the merkle tree.
    pub fn update_merkle_tree(&self) {
        let history = self.history_cache.lock().clone();
        if let Some(history) = history {
            history.flush_pending();
        }
    }

    pub fn tick(&self, elapsed: Duration) {
        let consensus = self.update_consensus();

        let mut stats = consensus.map(|c| c.statistics()).unwrap_or_default();
        stats.tx_count = self.tx_count.load(Ordering::Relaxed);

        self.registry.tick(elapsed, stats);

        self.tx_count.store(0, Ordering::Relaxed);
    }

    fn update_consensus(&self) -> Option<Arc<dyn Consensus>> {
        let current = self.store.consensus();
        let mut cached = self.consensus_cache.lock();
        let changed = match (&*cached, &current) {
            (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
            (None, None) => false,
            _ => true,
        };
        if changed {
            *cached = current.clone();
            self.registry.set_consensus(current.clone());
        }
        current
    }

    fn update_history(&self) -> Option<Arc<dyn TxHistory>> {
        let current = self.store.history();
        *self.history_cache.lock() = current.clone();
        self.registry.set_history(current.clone());
        current
    }

    fn update_metrics(&self, ctx: &RpcContext, metrics: &EndpointMetrics) {
        match ctx.response_status().as_u16() / 100 {
            4 => metrics.record_error(),
            5 => metrics.record_failure(),
            _ => {}
        }
    }

    /// Only send the certificate when the receiving frontend cannot look it
    /// up from the caller id, to keep forwarded frames small.
    fn cert_to_forward(&self, ctx: &RpcContext, endpoint: Option<&EndpointDefinition>) -> Vec<u8> {
        if !self.registry.has_certs()
            || endpoint.map_or(false, |e| !e.properties.require_client_identity)
        {
            return ctx.session.caller_cert.clone();
        }
        Vec::new()
    }

    fn forward_or_redirect(
        &self,
        ctx: &mut RpcContext,
        endpoint: &EndpointDefinition,
        caller_id: CallerId,
        consensus: Option<&Arc<dyn Consensus>>,
    ) -> Option<Vec<u8>> {
        let metrics = self.registry.metrics(endpoint);
        let forwarder = self.cmd_forwarder.lock().clone();

        if let (Some(forwarder), None) = (forwarder, ctx.session.original_caller) {
            if let Some(consensus) = consensus {
                if let Some(primary) = consensus.primary() {
                    let cert = self.cert_to_forward(ctx, Some(endpoint));
                    match forwarder.forward_command(
                        ctx,
                        primary,
                        &consensus.active_nodes(),
                        caller_id,
                        &cert,
                    ) {
                        Ok(()) => {
                            tracing::trace!(primary, "command forwarded to primary");
                            return None;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, primary, "command forwarding failed");
                        }
                    }
                }
            }
            ctx.set_response_status(StatusCode::INTERNAL_SERVER_ERROR);
            ctx.set_response_body("RPC could not be forwarded to unknown primary.");
            self.update_metrics(ctx, &metrics);
            Some(ctx.serialise_response())
        } else {
            // No forwarder, or the command was already forwarded once:
            // point the client at the current primary instead.
            ctx.set_response_status(StatusCode::TEMPORARY_REDIRECT);
            if let Some(consensus) = consensus {
                if let Some(primary) = consensus.primary() {
                    let mut tx = self.store.create_tx();
                    match tx.get::<_, NodeInfo>(tables::NODES, &primary) {
                        Ok(Some(info)) => {
                            ctx.set_response_header(
                                LOCATION.as_str(),
                                format!("{}:{}", info.pubhost, info.rpcport),
                            );
                        }
                        Ok(None) => {}
                        Err(err) => {
                            tracing::debug!(error = %err, primary, "primary node record unavailable");
                        }
                    }
                }
            }
            self.update_metrics(ctx, &metrics);
            Some(ctx.serialise_response())
        }
    }

    fn record_client_signature(
        &self,
        tx: &mut S::Tx,
        caller_id: CallerId,
        signed: &SignedRequest,
    ) -> Result<(), KvError> {
        let Some(table) = &self.client_signatures_table else {
            return Ok(());
        };
        let recorded = if self.request_storing_disabled.load(Ordering::Relaxed) {
            SignedRequest {
                req: Vec::new(),
                ..signed.clone()
            }
        } else {
            signed.clone()
        };
        tx.put(table, &caller_id, &recorded)
    }

    fn verify_client_signature(
        &self,
        caller_cert: &[u8],
        caller_id: CallerId,
        signed: &SignedRequest,
    ) -> bool {
        if self.client_signatures_table.is_none() {
            return false;
        }
        let Ok(verifier) = self.verifiers.verifier_for(caller_id, caller_cert) else {
            return false;
        };
        verifier.verify_signed_request(signed)
    }

    fn set_response_unauthorized(&self, ctx: &mut RpcContext, msg: String) {
        ctx.set_response_status(StatusCode::UNAUTHORIZED);
        ctx.set_response_header(
            WWW_AUTHENTICATE.as_str(),
            format!(
                "Signature realm=\"Signed request access\", headers=\"{}\"",
                REQUIRED_SIGNATURE_HEADERS.join(" ")
            ),
        );
        ctx.set_response_body(msg);
    }

    fn set_response_unauthorized_jwt(&self, ctx: &mut RpcContext, msg: String) {
        ctx.set_response_status(StatusCode::UNAUTHORIZED);
        ctx.set_response_header(
            WWW_AUTHENTICATE.as_str(),
            "Bearer realm=\"JWT bearer token access\", error=\"invalid_token\"",
        );
        ctx.set_response_body(msg);
    }

    fn respond_handler_error(
        &self,
        ctx: &mut RpcContext,
        metrics: &EndpointMetrics,
        err: HandlerError,
    ) -> Vec<u8> {
        match err {
            HandlerError::Rpc { status, msg } => {
                ctx.set_response_status(status);
                ctx.set_response_body(msg);
            }
            HandlerError::JsonParse { pointer, what } => {
                ctx.set_response_status(StatusCode::BAD_REQUEST);
                ctx.set_response_body(format!("At {pointer}:\n\t{what}"));
            }
            HandlerError::Kv(err) => {
                ctx.set_response_status(StatusCode::INTERNAL_SERVER_ERROR);
                ctx.set_response_body(err.to_string());
            }
            HandlerError::Other(what) => {
                ctx.set_response_status(StatusCode::INTERNAL_SERVER_ERROR);
                ctx.set_response_body(what);
            }
        }
        self.update_metrics(ctx, metrics);
        ctx.serialise_response()
    }

    #[allow(clippy::too_many_lines)]
    fn process_command(
        &self,
        ctx: &mut RpcContext,
        tx: &mut S::Tx,
        mut caller_id: CallerId,
        consensus: Option<&Arc<dyn Consensus>>,
        pre_exec: Option<&dyn Fn(&mut S::Tx, &mut RpcContext) -> Result<(), HandlerError>>,
    ) -> Option<Vec<u8>> {
        let Some(endpoint) = self.registry.find_endpoint(tx, ctx) else {
            let allowed = self.registry.allowed_verbs(tx, ctx.method());
            if allowed.is_empty() {
                ctx.set_response_status(StatusCode::NOT_FOUND);
                ctx.set_response_header(CONTENT_TYPE.as_str(), "text/plain");
                ctx.set_response_body(format!("Unknown path: {}", ctx.method()));
            } else {
                let allow = allowed
                    .iter()
                    .map(|verb| verb.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                ctx.set_response_status(StatusCode::METHOD_NOT_ALLOWED);
                // The allowed list goes in both the Allow header (for
                // machines) and the body (for humans).
                ctx.set_response_header(ALLOW.as_str(), allow.clone());
                ctx.set_response_body(format!(
                    "Allowed methods for '{}' are: {}",
                    ctx.method(),
                    allow
                ));
            }
            return Some(ctx.serialise_response());
        };

        // Requests that could not be dispatched are not charged to any
        // endpoint.
        let metrics = self.registry.metrics(&endpoint);
        metrics.record_call();

        let signed_request = ctx.signed_request().cloned();

        // On signed requests the signing key decides the effective caller:
        // the session-level identity is kept only when the key digest does
        // not resolve. The substitution is tentative until the signature
        // verifies below.
        if let Some(signed) = &signed_request {
            let resolved = self.registry.caller_id_by_digest(tx, &signed.key_id);
            if resolved.is_valid() {
                tracing::trace!(
                    session_caller = %caller_id,
                    signed_caller = %resolved,
                    key_digest = %hex::encode(signed.key_id),
                    "caller id taken from signed request"
                );
                caller_id = resolved;
                if let Some(cert) = self.policy.resolve_caller_id(caller_id, tx) {
                    ctx.session.caller_cert = cert;
                }
            }
        }

        if endpoint.properties.require_client_identity && self.registry.has_certs() {
            let forwarded_caller_unknown = ctx.session.original_caller.is_some()
                && !self.policy.lookup_forwarded_caller_cert(ctx, tx);
            if forwarded_caller_unknown || !caller_id.is_valid() {
                ctx.set_response_status(StatusCode::FORBIDDEN);
                ctx.set_response_body(self.policy.invalid_caller_error_message());
                self.update_metrics(ctx, &metrics);
                return Some(ctx.serialise_response());
            }
        }

        let is_primary =
            consensus.map_or(true, |c| c.is_primary()) || ctx.is_create_request;

        if endpoint.properties.require_client_signature && signed_request.is_none() {
            self.set_response_unauthorized(ctx, format!("'{}' RPC must be signed", ctx.method()));
            self.update_metrics(ctx, &metrics);
            return Some(ctx.serialise_response());
        }

        let mut should_record_client_signature = false;
        if let Some(signed) = &signed_request {
            // Forwarded commands under CFT were already verified by the
            // forwarding replica; create requests precede any registered
            // identity.
            let forwarded_under_cft = consensus
                .map_or(false, |c| c.kind() == ConsensusKind::Cft)
                && ctx.session.original_caller.is_some();
            let must_verify = !ctx.is_create_request && !forwarded_under_cft;
            if must_verify
                && !self.verify_client_signature(&ctx.session.caller_cert, caller_id, signed)
            {
                self.set_response_unauthorized(
                    ctx,
                    "Failed to verify client signature".to_string(),
                );
                self.update_metrics(ctx, &metrics);
                return Some(ctx.serialise_response());
            }

            // Signed requests are recorded even on endpoints that do not
            // require them, but only where the record will replicate.
            if is_primary {
                should_record_client_signature = true;
            }
        }

        if endpoint.properties.require_jwt_authentication {
            let mut error_reason = None;
            let mut validated = None;
            match jwt::extract_token(ctx.request_headers()) {
                Err(reason) => error_reason = Some(reason),
                Ok(token) => {
                    let key = match tx
                        .get::<_, Vec<u8>>(tables::JWT_PUBLIC_SIGNING_KEYS, &token.header.kid)
                    {
                        Ok(key) => key,
                        Err(err) => {
                            return Some(self.respond_handler_error(ctx, &metrics, err.into()))
                        }
                    };
                    match key {
                        None => error_reason = Some("JWT signing key not found".to_string()),
                        Some(key) => {
                            if !jwt::validate_token_signature(&token, &key) {
                                error_reason = Some("JWT signature is invalid".to_string());
                            } else {
                                let issuer = match tx.get::<_, String>(
                                    tables::JWT_PUBLIC_SIGNING_KEY_ISSUER,
                                    &token.header.kid,
                                ) {
                                    Ok(issuer) => issuer,
                                    Err(err) => {
                                        return Some(
                                            self.respond_handler_error(ctx, &metrics, err.into()),
                                        )
                                    }
                                };
                                validated = Some(Jwt {
                                    key_issuer: issuer.unwrap_or_default(),
                                    header: token.header,
                                    payload: token.payload,
                                });
                            }
                        }
                    }
                }
            }
            if let Some(reason) = error_reason {
                self.set_response_unauthorized_jwt(
                    ctx,
                    format!("'{}' {}", ctx.method(), reason),
                );
                self.update_metrics(ctx, &metrics);
                return Some(ctx.serialise_response());
            }
            ctx.set_jwt(validated);
        }

        let history = self.update_history();

        if let Some(consensus) = consensus {
            if !is_primary && (consensus.kind() == ConsensusKind::Cft || !ctx.execute_on_node) {
                match endpoint.properties.forwarding_required {
                    ForwardingRequired::Never => {}
                    ForwardingRequired::Sometimes => {
                        let should_forward = match consensus.kind() {
                            ConsensusKind::Cft => !ctx.session.is_forwarding,
                            ConsensusKind::Bft => !endpoint.properties.execute_locally,
                        };
                        if should_forward {
                            ctx.session.is_forwarding = true;
                            return self.forward_or_redirect(
                                ctx,
                                &endpoint,
                                caller_id,
                                Some(consensus),
                            );
                        }
                    }
                    ForwardingRequired::Always => {
                        ctx.session.is_forwarding = true;
                        return self.forward_or_redirect(
                            ctx,
                            &endpoint,
                            caller_id,
                            Some(consensus),
                        );
                    }
                }
            }
        }

        self.tx_count.fetch_add(1, Ordering::Relaxed);

        let mut attempts = 0;
        while attempts < MAX_COMMIT_ATTEMPTS {
            attempts += 1;

            if let Some(pre_exec) = pre_exec {
                if let Err(err) = pre_exec(tx, ctx) {
                    return Some(self.respond_handler_error(ctx, &metrics, err));
                }
            }

            if should_record_client_signature {
                if let Some(signed) = &signed_request {
                    if let Err(err) = self.record_client_signature(tx, caller_id, signed) {
                        return Some(self.respond_handler_error(ctx, &metrics, err.into()));
                    }
                }
            }

            match self.registry.execute_endpoint(
                &endpoint,
                EndpointContext {
                    ctx: &mut *ctx,
                    tx: &mut *tx,
                    caller_id,
                },
            ) {
                Ok(()) => {}
                Err(HandlerError::Kv(KvError::CompactedVersionConflict { .. })) => {
                    tracing::debug!("transaction execution conflicted with compaction");
                    tx.reset();
                    continue;
                }
                Err(err) => return Some(self.respond_handler_error(ctx, &metrics, err)),
            }

            if !ctx.should_apply_writes() {
                self.update_metrics(ctx, &metrics);
                return Some(ctx.serialise_response());
            }

            match tx.commit() {
                Ok(CommitOutcome::Ok) => {
                    let mut commit_version = tx.commit_version();
                    if commit_version == NO_VERSION {
                        commit_version = tx.read_version();
                    }
                    if let Some(consensus) = consensus {
                        if commit_version != NO_VERSION {
                            ctx.set_seqno(commit_version);
                            ctx.set_view(tx.commit_term());
                        }
                        ctx.set_global_commit(consensus.committed_seqno());

                        if consensus.is_primary() {
                            if let Some(history) = &history {
                                history.try_emit_signature();
                            }
                        }
                    }
                    self.update_metrics(ctx, &metrics);
                    return Some(ctx.serialise_response());
                }
                Ok(CommitOutcome::Conflict) => continue,
                Ok(CommitOutcome::NoReplicate) => {
                    ctx.set_response_status(StatusCode::INTERNAL_SERVER_ERROR);
                    ctx.set_response_body("Transaction failed to replicate.");
                    self.update_metrics(ctx, &metrics);
                    return Some(ctx.serialise_response());
                }
                Err(KvError::CompactedVersionConflict { .. }) => {
                    tracing::debug!("commit conflicted with compaction");
                    tx.reset();
                    continue;
                }
                Err(KvError::Serialise(err)) => {
                    tracing::error!(error = %err, "failed to serialise committed write set");
                    (self.abort_fn)("kv serialisation failure");
                }
                Err(err) => {
                    ctx.set_response_status(StatusCode::INTERNAL_SERVER_ERROR);
                    ctx.set_response_body(err.to_string());
                    self.update_metrics(ctx, &metrics);
                    return Some(ctx.serialise_response());
                }
            }
        }

        ctx.set_response_status(StatusCode::CONFLICT);
        ctx.set_response_body(format!(
            "Transaction continued to conflict after {MAX_COMMIT_ATTEMPTS} attempts."
        ));
        self.update_metrics(ctx, &metrics);
        Some(ctx.serialise_response())
    }
}
