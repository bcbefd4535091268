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

use crate::Version;
use thiserror::Error;

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error)]
pub enum KvError {
    /// The transaction's snapshot was overtaken by store compaction. The
    /// caller must reset the transaction and re-execute.
    #[error("transaction snapshot at version {snapshot} overtaken by compaction at {compacted}")]
    CompactedVersionConflict { snapshot: Version, compacted: Version },

    /// Serialising the committed write set failed. The committed state is
    /// ambiguous; callers must treat this as fatal.
    #[error("write set serialisation failed: {0}")]
    Serialise(serde_json::Error),

    #[error("value deserialisation failed in map {map}: {source}")]
    Deserialise {
        map: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("key serialisation failed in map {map}: {source}")]
    KeyEncoding {
        map: String,
        #[source]
        source: serde_json::Error,
    },

    /// The transaction has already committed and cannot accept further
    /// operations.
    #[error("transaction already committed")]
    Committed,
}
