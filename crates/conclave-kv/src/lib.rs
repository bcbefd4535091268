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

//! conclave-kv
//!
//! The versioned key-value seam of the conclave transaction service.
//!
//! This crate defines the contracts the RPC frontend drives transactions
//! through:
//! - `KvStore` / `KvTx`: transaction creation, typed reads and writes over
//!   named maps, optimistic commit with a tagged outcome
//! - `Consensus`: replica role, primary identity, replication statistics
//! - `TxHistory`: request logging and merkle signature emission
//!
//! It also ships `Store`, an in-memory implementation with per-key
//! versioning, a global-commit floor, and compaction, so the service can be
//! exercised end-to-end without an external storage engine.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod consensus;
pub mod error;
pub mod store;
pub mod tx;

pub use crate::consensus::{Consensus, ConsensusKind, ConsensusStats, TxHistory};
pub use crate::error::{KvError, KvResult};
pub use crate::store::{Store, Tx};
pub use crate::tx::{CommitOutcome, KvStore, KvTx};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic store version. `NO_VERSION` marks "not committed".
pub type Version = u64;

pub const NO_VERSION: Version = 0;

/// Consensus term the commit landed in.
pub type Term = u64;

/// Identity of a replica in the consensus node set.
pub type NodeId = u64;

/// Opaque identity derived from a client certificate or a signing-key
/// digest. `INVALID` is the sentinel for "no known caller"; it is kept as a
/// sentinel rather than an `Option` because caller ids are KV keys and
/// history request-id components.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct CallerId(pub u64);

impl CallerId {
    pub const INVALID: CallerId = CallerId(u64::MAX);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Framing the serialised request arrived in. Carried opaquely into the
/// history so replicated requests can be re-parsed by the right codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameFormat {
    Http,
    Ws,
}

/// Identity of a replicated request: who sent it, on which session, and at
/// which position in that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub caller: CallerId,
    pub client_session: u64,
    pub index: u64,
}
