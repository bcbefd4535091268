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

use crate::error::KvResult;
use crate::{Consensus, RequestId, Term, TxHistory, Version};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Result of attempting to commit a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The write set was applied and replicated.
    Ok,
    /// Another transaction committed a conflicting write first. The
    /// transaction has been re-armed on a fresh snapshot; the caller may
    /// re-execute and commit again.
    Conflict,
    /// The consensus layer refused to replicate the write set.
    NoReplicate,
}

/// An optimistic transaction over named maps.
///
/// Reads record the observed version of each key; `commit` fails with
/// `CommitOutcome::Conflict` when any observed key has moved since. Keys and
/// values are serde-encoded, so any serialisable type can be stored.
pub trait KvTx {
    fn get<K: Serialize, V: DeserializeOwned>(
        &mut self,
        map: &str,
        key: &K,
    ) -> KvResult<Option<V>>;

    /// Read the newest value at or below the global commit floor. Does not
    /// participate in conflict detection.
    fn get_globally_committed<K: Serialize, V: DeserializeOwned>(
        &mut self,
        map: &str,
        key: &K,
    ) -> KvResult<Option<V>>;

    fn put<K: Serialize, V: Serialize>(&mut self, map: &str, key: &K, value: &V) -> KvResult<()>;

    fn remove<K: Serialize>(&mut self, map: &str, key: &K) -> KvResult<()>;

    fn commit(&mut self) -> KvResult<CommitOutcome>;

    /// Discard all reads and writes and re-snapshot at the current store
    /// version. Used after a compaction conflict.
    fn reset(&mut self);

    /// Version assigned by a successful commit, `NO_VERSION` for read-only
    /// or uncommitted transactions.
    fn commit_version(&self) -> Version;

    fn commit_term(&self) -> Term;

    /// Store version the transaction snapshot was taken at.
    fn read_version(&self) -> Version;

    /// Version this transaction executed at: the commit version once
    /// committed, `NO_VERSION` before.
    fn version(&self) -> Version;

    fn set_request_id(&mut self, id: RequestId);

    fn request_id(&self) -> Option<RequestId>;
}

/// A store the frontend can drive transactions through. The consensus and
/// history getters return thread-safe snapshots of shared slots; callers
/// refresh them on each entry rather than caching across requests.
pub trait KvStore: Send + Sync + 'static {
    type Tx: KvTx;

    fn create_tx(&self) -> Self::Tx;

    fn consensus(&self) -> Option<Arc<dyn Consensus>>;

    fn history(&self) -> Option<Arc<dyn TxHistory>>;
}
