//! Per-request context: the parsed request handed in by the host, the
//! session it arrived on, and the response being assembled.
//!
//! The frontend never parses HTTP; the surrounding host builds an
//! `RpcContext` from whatever transport it terminates and consumes the
//! serialised response the frontend leaves behind.

use crate::jwt::Jwt;
use conclave_kv::{CallerId, FrameFormat, Version};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Digest computed over the request bytes before signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    Sha256,
}

/// SHA-256 digest of a signing key, used to look the signer up.
pub type KeyDigest = [u8; 32];

/// A request with a detached client signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    /// The signed request bytes. Stripped before recording when request
    /// storing is disabled.
    pub req: Vec<u8>,
    pub sig: Vec<u8>,
    pub md: DigestAlgorithm,
    pub key_id: KeyDigest,
}

/// Identity attached by the replica that forwarded a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedCaller {
    pub caller_id: CallerId,
}

/// Connection-scoped state. `original_caller` is only set on commands that
/// arrived through the forwarder.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub caller_cert: Vec<u8>,
    pub client_session_id: u64,
    pub original_caller: Option<ForwardedCaller>,
    pub is_forwarding: bool,
}

#[derive(Debug, Clone)]
struct ResponseParts {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Default for ResponseParts {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }
}

/// Context for one request. Constructed by the host, threaded through the
/// frontend, and mutated in place as the response takes shape.
#[derive(Debug)]
pub struct RpcContext {
    pub session: SessionContext,
    /// Create requests bootstrap the service and bypass role and signature
    /// admission.
    pub is_create_request: bool,
    /// Set by the BFT executor when this replica must execute rather than
    /// distribute.
    pub execute_on_node: bool,
    method: String,
    verb: Method,
    headers: BTreeMap<String, String>,
    serialised_request: Vec<u8>,
    signed_request: Option<SignedRequest>,
    frame_format: FrameFormat,
    request_index: u64,
    jwt: Option<Jwt>,
    apply_writes: bool,
    response: ResponseParts,
    seqno: Option<Version>,
    view: Option<u64>,
    global_commit: Option<Version>,
}

impl RpcContext {
    pub fn new(verb: Method, method: impl Into<String>) -> Self {
        Self {
            session: SessionContext::default(),
            is_create_request: false,
            execute_on_node: false,
            method: method.into(),
            verb,
            headers: BTreeMap::new(),
            serialised_request: Vec::new(),
            signed_request: None,
            frame_format: FrameFormat::Http,
            request_index: 0,
            jwt: None,
            apply_writes: true,
            response: ResponseParts::default(),
            seqno: None,
            view: None,
            global_commit: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.serialised_request = body.into();
        self
    }

    /// Header names are normalised to lowercase on insertion.
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_signed_request(mut self, signed: SignedRequest) -> Self {
        self.signed_request = Some(signed);
        self
    }

    pub fn with_frame_format(mut self, frame: FrameFormat) -> Self {
        self.frame_format = frame;
        self
    }

    pub fn with_request_index(mut self, index: u64) -> Self {
        self.request_index = index;
        self
    }

    /// The request path, e.g. `/users/log`.
    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn request_verb(&self) -> &Method {
        &self.verb
    }

    pub fn request_headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn serialised_request(&self) -> &[u8] {
        &self.serialised_request
    }

    pub fn signed_request(&self) -> Option<&SignedRequest> {
        self.signed_request.as_ref()
    }

    pub fn frame_format(&self) -> FrameFormat {
        self.frame_format
    }

    /// Position of this request on its client session.
    pub fn request_index(&self) -> u64 {
        self.request_index
    }

    pub fn set_jwt(&mut self, jwt: Option<Jwt>) {
        self.jwt = jwt;
    }

    /// Validated JWT claim, available to handlers on endpoints that require
    /// bearer authentication.
    pub fn jwt(&self) -> Option<&Jwt> {
        self.jwt.as_ref()
    }

    /// Handlers call this with `false` to produce a response without
    /// committing the transaction.
    pub fn set_apply_writes(&mut self, apply: bool) {
        self.apply_writes = apply;
    }

    pub fn should_apply_writes(&self) -> bool {
        self.apply_writes
    }

    pub fn set_response_status(&mut self, status: StatusCode) {
        self.response.status = status;
    }

    pub fn response_status(&self) -> StatusCode {
        self.response.status
    }

    pub fn set_response_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.response
            .headers
            .push((name.as_ref().to_ascii_lowercase(), value.into()));
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.response
            .headers
            .iter()
            .rev()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_response_body(&mut self, body: impl Into<Vec<u8>>) {
        self.response.body = body.into();
    }

    pub fn response_body(&self) -> &[u8] {
        &self.response.body
    }

    pub fn set_seqno(&mut self, seqno: Version) {
        self.seqno = Some(seqno);
    }

    pub fn seqno(&self) -> Option<Version> {
        self.seqno
    }

    pub fn set_view(&mut self, view: u64) {
        self.view = Some(view);
    }

    pub fn view(&self) -> Option<u64> {
        self.view
    }

    pub fn set_global_commit(&mut self, version: Version) {
        self.global_commit = Some(version);
    }

    pub fn global_commit(&self) -> Option<Version> {
        self.global_commit
    }

    /// Render the response. Commit coordinates travel as headers so clients
    /// can poll for durability.
    pub fn serialise_response(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.response.status.as_u16(),
            self.response.status.canonical_reason().unwrap_or("")
        );
        for (name, value) in &self.response.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        if let Some(seqno) = self.seqno {
            head.push_str(&format!("x-conclave-seqno: {seqno}\r\n"));
        }
        if let Some(view) = self.view {
            head.push_str(&format!("x-conclave-view: {view}\r\n"));
        }
        if let Some(global_commit) = self.global_commit {
            head.push_str(&format!("x-conclave-global-commit: {global_commit}\r\n"));
        }
        head.push_str(&format!("content-length: {}\r\n\r\n", self.response.body.len()));
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.response.body);
        out
    }
}
