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

use crate::{CallerId, FrameFormat, NodeId, RequestId, Version};

/// Fault model the consensus implementation tolerates. The frontend routes
/// requests differently under each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusKind {
    /// Crash fault tolerant (leader-based replication). Backups forward
    /// write requests to the primary.
    Cft,
    /// Byzantine fault tolerant. Requests are distributed through the
    /// history for ordered execution on every replica.
    Bft,
}

/// Aggregate counters reported by the consensus layer on each tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsensusStats {
    /// Transactions executed since the last tick. Overridden by the
    /// frontend with its own count before reaching the registry.
    pub tx_count: u64,
    pub msg_count: u64,
    pub time_spent_us: u64,
}

/// View of the consensus layer the frontend needs: role, primary identity,
/// and replication progress. Implementations must be safe to share across
/// worker threads.
pub trait Consensus: Send + Sync {
    fn kind(&self) -> ConsensusKind;

    fn is_primary(&self) -> bool;

    /// Current primary, if one is known.
    fn primary(&self) -> Option<NodeId>;

    fn active_nodes(&self) -> Vec<NodeId>;

    /// Highest globally committed version.
    fn committed_seqno(&self) -> Version;

    fn statistics(&self) -> ConsensusStats;

    /// Hand a serialised write set to replication. Returning false fails
    /// the commit with `CommitOutcome::NoReplicate`.
    fn replicate(&self, version: Version, frame: &[u8]) -> bool {
        let _ = (version, frame);
        true
    }
}

/// Transaction history: the merkle log of executed requests. The frontend
/// records BFT-distributed requests here and prompts signature emission
/// after primary commits.
pub trait TxHistory: Send + Sync {
    /// Log a request for ordered BFT execution. Returns false if the
    /// request could not be accepted.
    fn add_request(
        &self,
        id: RequestId,
        caller: CallerId,
        caller_cert: &[u8],
        request: &[u8],
        frame: FrameFormat,
    ) -> bool;

    /// Emit a signature over the merkle root if the signature cadence says
    /// one is due.
    fn try_emit_signature(&self);

    /// Flush entries that have not yet been folded into the tree.
    fn flush_pending(&self);
}
