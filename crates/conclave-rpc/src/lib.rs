#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! RPC frontend of the conclave transaction service.
//!
//! One frontend instance serves one logical actor (`users`, `members`,
//! `nodes`). It admits already-parsed requests, authenticates them, runs the
//! matched endpoint handler inside an optimistic KV transaction, and commits
//! through consensus — or forwards/redirects to the primary when this
//! replica may not commit.

pub mod auth;
pub mod context;
pub mod forwarding;
pub mod frontend;
pub mod jwt;
pub mod registry;
pub mod tables;

pub use crate::context::{
    DigestAlgorithm, ForwardedCaller, KeyDigest, RpcContext, SessionContext, SignedRequest,
};
pub use crate::forwarding::{ForwardError, Forwarder};
pub use crate::frontend::{
    BftResponse, DefaultPolicy, FrontendPolicy, ProcessError, RpcFrontend, MAX_COMMIT_ATTEMPTS,
};
pub use crate::jwt::Jwt;
pub use crate::registry::{
    EndpointContext, EndpointDefinition, EndpointMetrics, EndpointProperties, EndpointRegistry,
    ForwardingRequired, HandlerError,
};
