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

use crate::error::{KvError, KvResult};
use crate::tx::{CommitOutcome, KvStore, KvTx};
use crate::{Consensus, RequestId, Term, TxHistory, Version, NO_VERSION};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct KeyWrite {
    version: Version,
    /// `None` records a deletion.
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct MapState {
    entries: BTreeMap<Vec<u8>, Vec<KeyWrite>>,
}

impl MapState {
    fn latest_at(&self, key: &[u8], at: Version) -> Option<&KeyWrite> {
        self.entries
            .get(key)?
            .iter()
            .rev()
            .find(|w| w.version <= at)
    }

    fn latest_version(&self, key: &[u8]) -> Version {
        self.entries
            .get(key)
            .and_then(|writes| writes.last())
            .map_or(NO_VERSION, |w| w.version)
    }
}

#[derive(Default)]
struct StoreState {
    maps: HashMap<String, MapState>,
    version: Version,
    term: Term,
    compacted: Version,
    global_commit: Version,
}

pub(crate) struct StoreInner {
    state: RwLock<StoreState>,
    consensus: RwLock<Option<Arc<dyn Consensus>>>,
    history: RwLock<Option<Arc<dyn TxHistory>>>,
}

/// In-memory versioned store. Every commit gets a fresh version; each key
/// keeps its write history back to the compaction floor so
/// globally-committed reads and snapshot reads stay answerable.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(StoreState::default()),
                consensus: RwLock::new(None),
                history: RwLock::new(None),
            }),
        }
    }

    pub fn set_consensus(&self, consensus: Option<Arc<dyn Consensus>>) {
        *self.inner.consensus.write() = consensus;
    }

    pub fn set_history(&self, history: Option<Arc<dyn TxHistory>>) {
        *self.inner.history.write() = history;
    }

    pub fn current_version(&self) -> Version {
        self.inner.state.read().version
    }

    pub fn current_term(&self) -> Term {
        self.inner.state.read().term
    }

    /// Record a view change. Subsequent commits carry the new term.
    pub fn set_term(&self, term: Term) {
        self.inner.state.write().term = term;
    }

    /// Advance the global commit floor, e.g. when consensus reports
    /// replication progress.
    pub fn set_global_commit(&self, version: Version) {
        let mut state = self.inner.state.write();
        state.global_commit = state.global_commit.max(version.min(state.version));
    }

    /// Advance the compaction floor and drop key history below it. Open
    /// transactions whose snapshot predates the floor fail their next read
    /// or commit with `CompactedVersionConflict`.
    pub fn compact(&self, version: Version) {
        let mut state = self.inner.state.write();
        let floor = version.min(state.version);
        if floor <= state.compacted {
            return;
        }
        tracing::debug!(floor, "compacting key history");
        state.compacted = floor;
        for map in state.maps.values_mut() {
            for writes in map.entries.values_mut() {
                // Keep the newest write at or below the floor as the base
                // value, plus everything above it.
                let base = writes.iter().rposition(|w| w.version <= floor);
                if let Some(base) = base {
                    writes.drain(..base);
                }
            }
        }
    }
}

impl KvStore for Store {
    type Tx = Tx;

    fn create_tx(&self) -> Tx {
        let snapshot = self.inner.state.read().version;
        Tx {
            store: Arc::clone(&self.inner),
            snapshot,
            reads: HashMap::new(),
            writes: BTreeMap::new(),
            committed: None,
            request_id: None,
        }
    }

    fn consensus(&self) -> Option<Arc<dyn Consensus>> {
        self.inner.consensus.read().clone()
    }

    fn history(&self) -> Option<Arc<dyn TxHistory>> {
        self.inner.history.read().clone()
    }
}

/// Transaction over a `Store`. See the `KvTx` contract for semantics.
pub struct Tx {
    store: Arc<StoreInner>,
    snapshot: Version,
    reads: HashMap<(String, Vec<u8>), Version>,
    writes: BTreeMap<(String, Vec<u8>), Option<Vec<u8>>>,
    committed: Option<(Version, Term)>,
    request_id: Option<RequestId>,
}

fn encode_key<K: Serialize>(map: &str, key: &K) -> KvResult<Vec<u8>> {
    serde_json::to_vec(key).map_err(|source| KvError::KeyEncoding {
        map: map.to_string(),
        source,
    })
}

fn decode_value<V: DeserializeOwned>(map: &str, raw: &[u8]) -> KvResult<V> {
    serde_json::from_slice(raw).map_err(|source| KvError::Deserialise {
        map: map.to_string(),
        source,
    })
}

impl Tx {
    fn check_not_compacted(&self, state: &StoreState) -> KvResult<()> {
        if self.snapshot < state.compacted {
            return Err(KvError::CompactedVersionConflict {
                snapshot: self.snapshot,
                compacted: state.compacted,
            });
        }
        Ok(())
    }
}

impl KvTx for Tx {
    fn get<K: Serialize, V: DeserializeOwned>(
        &mut self,
        map: &str,
        key: &K,
    ) -> KvResult<Option<V>> {
        if self.committed.is_some() {
            return Err(KvError::Committed);
        }
        let raw_key = encode_key(map, key)?;
        if let Some(pending) = self.writes.get(&(map.to_string(), raw_key.clone())) {
            return match pending {
                Some(raw) => Ok(Some(decode_value(map, raw)?)),
                None => Ok(None),
            };
        }
        let state = self.store.state.read();
        self.check_not_compacted(&state)?;
        let (observed, value) = match state.maps.get(map) {
            Some(m) => match m.latest_at(&raw_key, self.snapshot) {
                Some(w) => (w.version, w.value.clone()),
                None => (NO_VERSION, None),
            },
            None => (NO_VERSION, None),
        };
        drop(state);
        self.reads.insert((map.to_string(), raw_key), observed);
        match value {
            Some(raw) => Ok(Some(decode_value(map, &raw)?)),
            None => Ok(None),
        }
    }

    fn get_globally_committed<K: Serialize, V: DeserializeOwned>(
        &mut self,
        map: &str,
        key: &K,
    ) -> KvResult<Option<V>> {
        let raw_key = encode_key(map, key)?;
        let state = self.store.state.read();
        let value = state
            .maps
            .get(map)
            .and_then(|m| m.latest_at(&raw_key, state.global_commit))
            .and_then(|w| w.value.clone());
        drop(state);
        match value {
            Some(raw) => Ok(Some(decode_value(map, &raw)?)),
            None => Ok(None),
        }
    }

    fn put<K: Serialize, V: Serialize>(&mut self, map: &str, key: &K, value: &V) -> KvResult<()> {
        if self.committed.is_some() {
            return Err(KvError::Committed);
        }
        let raw_key = encode_key(map, key)?;
        let raw_value = serde_json::to_vec(value).map_err(KvError::Serialise)?;
        self.writes
            .insert((map.to_string(), raw_key), Some(raw_value));
        Ok(())
    }

    fn remove<K: Serialize>(&mut self, map: &str, key: &K) -> KvResult<()> {
        if self.committed.is_some() {
            return Err(KvError::Committed);
        }
        let raw_key = encode_key(map, key)?;
        self.writes.insert((map.to_string(), raw_key), None);
        Ok(())
    }

    fn commit(&mut self) -> KvResult<CommitOutcome> {
        if self.committed.is_some() {
            return Err(KvError::Committed);
        }

        if self.writes.is_empty() {
            let term = self.store.state.read().term;
            self.committed = Some((NO_VERSION, term));
            return Ok(CommitOutcome::Ok);
        }

        let consensus = self.store.consensus.read().clone();

        let mut state = self.store.state.write();
        self.check_not_compacted(&state)?;

        let conflicted = self
            .reads
            .iter()
            .any(|((map, key), observed)| {
                state
                    .maps
                    .get(map)
                    .map_or(NO_VERSION, |m| m.latest_version(key))
                    != *observed
            })
            || self.writes.keys().any(|(map, key)| {
                state
                    .maps
                    .get(map)
                    .map_or(NO_VERSION, |m| m.latest_version(key))
                    > self.snapshot
            });
        if conflicted {
            // Re-arm on a fresh snapshot so the caller can re-execute.
            self.snapshot = state.version;
            self.reads.clear();
            self.writes.clear();
            return Ok(CommitOutcome::Conflict);
        }

        let frame_entries: Vec<(&str, &[u8], Option<&[u8]>)> = self
            .writes
            .iter()
            .map(|((map, key), value)| (map.as_str(), key.as_slice(), value.as_deref()))
            .collect();
        let frame = serde_json::to_vec(&frame_entries).map_err(KvError::Serialise)?;

        let version = state.version + 1;
        if let Some(consensus) = consensus {
            if !consensus.replicate(version, &frame) {
                tracing::debug!(version, "consensus refused to replicate write set");
                return Ok(CommitOutcome::NoReplicate);
            }
        } else {
            // Standalone stores have no replication lag.
            state.global_commit = version;
        }

        state.version = version;
        for ((map, key), value) in std::mem::take(&mut self.writes) {
            state
                .maps
                .entry(map)
                .or_default()
                .entries
                .entry(key)
                .or_default()
                .push(KeyWrite {
                    version,
                    value,
                });
        }
        self.committed = Some((version, state.term));
        Ok(CommitOutcome::Ok)
    }

    fn reset(&mut self) {
        self.snapshot = self.store.state.read().version;
        self.reads.clear();
        self.writes.clear();
        self.committed = None;
    }

    fn commit_version(&self) -> Version {
        self.committed.map_or(NO_VERSION, |(v, _)| v)
    }

    fn commit_term(&self) -> Term {
        self.committed.map_or(0, |(_, t)| t)
    }

    fn read_version(&self) -> Version {
        self.snapshot
    }

    fn version(&self) -> Version {
        self.commit_version()
    }

    fn set_request_id(&mut self, id: RequestId) {
        self.request_id = Some(id);
    }

    fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CallerId, ConsensusKind, ConsensusStats};

    const ACCOUNTS: &str = "test.accounts";

    #[test]
    fn put_get_roundtrip_within_tx() {
        let store = Store::new();
        let mut tx = store.create_tx();
        tx.put(ACCOUNTS, &"alice", &5u64).unwrap();
        assert_eq!(tx.get::<_, u64>(ACCOUNTS, &"alice").unwrap(), Some(5));
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Ok);
        assert_eq!(tx.commit_version(), 1);

        let mut tx2 = store.create_tx();
        assert_eq!(tx2.get::<_, u64>(ACCOUNTS, &"alice").unwrap(), Some(5));
    }

    #[test]
    fn read_only_commit_has_no_version() {
        let store = Store::new();
        let mut tx = store.create_tx();
        assert_eq!(tx.get::<_, u64>(ACCOUNTS, &"alice").unwrap(), None);
        assert_eq!(tx.commit().unwrap(), CommitOutcome::Ok);
        assert_eq!(tx.commit_version(), NO_VERSION);
        assert_eq!(store.current_version(), 0);
    }

    #[test]
    fn overlapping_writes_conflict() {
        let store = Store::new();
        let mut a = store.create_tx();
        let mut b = store.create_tx();
        a.get::<_, u64>(ACCOUNTS, &"alice").unwrap();
        b.get::<_, u64>(ACCOUNTS, &"alice").unwrap();
        a.put(ACCOUNTS, &"alice", &1u64).unwrap();
        b.put(ACCOUNTS, &"alice", &2u64).unwrap();
        assert_eq!(a.commit().unwrap(), CommitOutcome::Ok);
        assert_eq!(b.commit().unwrap(), CommitOutcome::Conflict);

        // The losing tx was re-armed: re-execute and commit.
        let seen = b.get::<_, u64>(ACCOUNTS, &"alice").unwrap();
        assert_eq!(seen, Some(1));
        b.put(ACCOUNTS, &"alice", &2u64).unwrap();
        assert_eq!(b.commit().unwrap(), CommitOutcome::Ok);
    }

    #[test]
    fn disjoint_writes_do_not_conflict() {
        let store = Store::new();
        let mut a = store.create_tx();
        let mut b = store.create_tx();
        a.put(ACCOUNTS, &"alice", &1u64).unwrap();
        b.put(ACCOUNTS, &"bob", &2u64).unwrap();
        assert_eq!(a.commit().unwrap(), CommitOutcome::Ok);
        assert_eq!(b.commit().unwrap(), CommitOutcome::Ok);
    }

    #[test]
    fn stale_read_conflicts_even_without_write_overlap() {
        let store = Store::new();
        let mut seed = store.create_tx();
        seed.put(ACCOUNTS, &"alice", &1u64).unwrap();
        seed.commit().unwrap();

        let mut reader = store.create_tx();
        assert_eq!(reader.get::<_, u64>(ACCOUNTS, &"alice").unwrap(), Some(1));
        reader.put(ACCOUNTS, &"bob", &7u64).unwrap();

        let mut writer = store.create_tx();
        writer.put(ACCOUNTS, &"alice", &2u64).unwrap();
        writer.commit().unwrap();

        assert_eq!(reader.commit().unwrap(), CommitOutcome::Conflict);
    }

    #[test]
    fn snapshot_isolation_hides_later_commits() {
        let store = Store::new();
        let mut seed = store.create_tx();
        seed.put(ACCOUNTS, &"alice", &1u64).unwrap();
        seed.commit().unwrap();

        let mut old = store.create_tx();
        let mut writer = store.create_tx();
        writer.put(ACCOUNTS, &"alice", &2u64).unwrap();
        writer.commit().unwrap();

        assert_eq!(old.get::<_, u64>(ACCOUNTS, &"alice").unwrap(), Some(1));
    }

    #[test]
    fn globally_committed_read_lags_until_floor_advances() {
        let store = Store::new();
        let consensus: Arc<dyn Consensus> = Arc::new(FixedConsensus);
        store.set_consensus(Some(consensus));

        let mut tx = store.create_tx();
        tx.put(ACCOUNTS, &"alice", &1u64).unwrap();
        tx.commit().unwrap();

        let mut reader = store.create_tx();
        assert_eq!(
            reader
                .get_globally_committed::<_, u64>(ACCOUNTS, &"alice")
                .unwrap(),
            None
        );
        store.set_global_commit(1);
        assert_eq!(
            reader
                .get_globally_committed::<_, u64>(ACCOUNTS, &"alice")
                .unwrap(),
            Some(1)
        );
    }

    #[test]
    fn compaction_fails_stale_snapshots() {
        let store = Store::new();
        let mut stale = store.create_tx();

        let mut w = store.create_tx();
        w.put(ACCOUNTS, &"alice", &1u64).unwrap();
        w.commit().unwrap();
        store.compact(1);

        let err = stale.get::<_, u64>(ACCOUNTS, &"alice").unwrap_err();
        assert!(matches!(err, KvError::CompactedVersionConflict { .. }));

        stale.reset();
        assert_eq!(stale.get::<_, u64>(ACCOUNTS, &"alice").unwrap(), Some(1));
    }

    #[test]
    fn compaction_keeps_base_value() {
        let store = Store::new();
        for value in 1u64..=3 {
            let mut tx = store.create_tx();
            tx.put(ACCOUNTS, &"alice", &value).unwrap();
            tx.commit().unwrap();
        }
        store.compact(2);
        let mut tx = store.create_tx();
        assert_eq!(tx.get::<_, u64>(ACCOUNTS, &"alice").unwrap(), Some(3));
    }

    #[test]
    fn no_replicate_leaves_store_untouched() {
        let store = Store::new();
        store.set_consensus(Some(Arc::new(RefusingConsensus)));
        let mut tx = store.create_tx();
        tx.put(ACCOUNTS, &"alice", &1u64).unwrap();
        assert_eq!(tx.commit().unwrap(), CommitOutcome::NoReplicate);
        assert_eq!(store.current_version(), 0);
    }

    #[test]
    fn commit_term_tracks_view_changes() {
        let store = Store::new();
        store.set_term(4);
        let mut tx = store.create_tx();
        tx.put(ACCOUNTS, &"alice", &1u64).unwrap();
        tx.commit().unwrap();
        assert_eq!(tx.commit_term(), 4);
    }

    #[test]
    fn request_id_survives_reset() {
        let store = Store::new();
        let mut tx = store.create_tx();
        let id = RequestId {
            caller: CallerId(3),
            client_session: 9,
            index: 1,
        };
        tx.set_request_id(id);
        tx.reset();
        assert_eq!(tx.request_id(), Some(id));
    }

    proptest::proptest! {
        #[test]
        fn interleaved_increments_never_lose_updates(rounds in 1usize..12) {
            let store = Store::new();
            let increment = |tx: &mut Tx| {
                let current: u64 = tx.get(ACCOUNTS, &"counter").unwrap().unwrap_or(0);
                tx.put(ACCOUNTS, &"counter", &(current + 1)).unwrap();
            };
            for _ in 0..rounds {
                let mut a = store.create_tx();
                let mut b = store.create_tx();
                increment(&mut a);
                increment(&mut b);
                proptest::prop_assert_eq!(a.commit().unwrap(), CommitOutcome::Ok);
                loop {
                    increment(&mut b);
                    match b.commit().unwrap() {
                        CommitOutcome::Ok => break,
                        CommitOutcome::Conflict => continue,
                        CommitOutcome::NoReplicate => unreachable!(),
                    }
                }
            }
            let mut check = store.create_tx();
            let total: u64 = check.get(ACCOUNTS, &"counter").unwrap().unwrap_or(0);
            proptest::prop_assert_eq!(total, rounds as u64 * 2);
        }
    }

    struct FixedConsensus;

    impl Consensus for FixedConsensus {
        fn kind(&self) -> ConsensusKind {
            ConsensusKind::Cft
        }
        fn is_primary(&self) -> bool {
            true
        }
        fn primary(&self) -> Option<crate::NodeId> {
            Some(0)
        }
        fn active_nodes(&self) -> Vec<crate::NodeId> {
            vec![0]
        }
        fn committed_seqno(&self) -> Version {
            0
        }
        fn statistics(&self) -> ConsensusStats {
            ConsensusStats::default()
        }
    }

    struct RefusingConsensus;

    impl Consensus for RefusingConsensus {
        fn kind(&self) -> ConsensusKind {
            ConsensusKind::Cft
        }
        fn is_primary(&self) -> bool {
            true
        }
        fn primary(&self) -> Option<crate::NodeId> {
            Some(0)
        }
        fn active_nodes(&self) -> Vec<crate::NodeId> {
            vec![0]
        }
        fn committed_seqno(&self) -> Version {
            0
        }
        fn statistics(&self) -> ConsensusStats {
            ConsensusStats::default()
        }
        fn replicate(&self, _version: Version, _frame: &[u8]) -> bool {
            false
        }
    }
}
