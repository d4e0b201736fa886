// Copyright 2024 tison <wander4096@gmail.com>
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::Arc;

use serde::Serialize;

pub const NO_PRODUCER_ID: i64 = -1;
pub const NO_PRODUCER_EPOCH: i16 = -1;
pub const NO_SEQUENCE: i32 = -1;

/// One record batch extracted from a dump.
///
/// `file` and `line` locate the batch header in the source text; `messages`
/// is empty unless the dump was produced with per-record detail, in which
/// case its length always equals `count`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch {
    pub file: Arc<str>,
    pub line: u64,
    pub base_offset: i64,
    pub last_offset: i64,
    pub count: i32,
    pub base_sequence: i32,
    pub last_sequence: i32,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub partition_leader_epoch: i32,
    pub is_transactional: bool,
    pub is_control: bool,
    pub position: i64,
    pub create_time: i64,
    pub size: i32,
    pub magic: i8,
    pub compress_codec: CompressCodec,
    pub crc: u32,
    pub is_valid: bool,
    pub delete_horizon_ms: Option<i64>,
    pub messages: Vec<BaseMessage>,
}

impl Batch {
    pub fn session(&self) -> ProducerSession {
        ProducerSession {
            producer_id: self.producer_id,
            producer_epoch: self.producer_epoch,
        }
    }
}

/// One incarnation of a transactional producer. Identifies an in-flight
/// transaction on a data partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProducerSession {
    pub producer_id: i64,
    pub producer_epoch: i16,
}

impl Display for ProducerSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.producer_id, self.producer_epoch)
    }
}

// Sessions key the open-transaction map in the JSON summary, so they must
// serialize as plain strings.
impl Serialize for ProducerSession {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A parsed record line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BaseMessage {
    Data(DataMessage),
    Control(ControlMessage),
    TxnStateChange(TransactionStateChange),
    TxnStateDeletion(TransactionStateDeletion),
}

impl BaseMessage {
    /// The data-record fields every variant carries.
    pub fn base(&self) -> &DataMessage {
        match self {
            BaseMessage::Data(message) => message,
            BaseMessage::Control(message) => &message.base,
            BaseMessage::TxnStateChange(change) => &change.base,
            BaseMessage::TxnStateDeletion(deletion) => &deletion.base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataMessage {
    pub file: Arc<str>,
    pub line: u64,
    pub offset: i64,
    pub create_time: i64,
    pub key_size: i32,
    pub value_size: i32,
    pub sequence: i32,
    pub header_keys: String,
}

/// An end-of-transaction marker written by the transaction coordinator.
/// Appears only inside a batch with `isControl: true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlMessage {
    pub base: DataMessage,
    /// True for a COMMIT marker, false for an ABORT marker.
    pub commit: bool,
    pub coordinator_epoch: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionStateChange {
    pub base: DataMessage,
    pub transactional_id: String,
    pub producer_id: i64,
    pub producer_epoch: i16,
    pub state: TxnState,
    pub partitions: String,
    pub txn_last_update_timestamp: i64,
    pub txn_timeout_ms: i64,
}

/// A tombstone for a transactional id, recognized by its `<DELETE>` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionStateDeletion {
    pub base: DataMessage,
    pub transactional_id: String,
}

/// A transactional id's state in the coordinator's transaction-state log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TxnState {
    Empty,
    Ongoing,
    PrepareCommit,
    PrepareAbort,
    CompleteCommit,
    CompleteAbort,
    Dead,
}

impl TxnState {
    /// Whether a transition from `prior` into `self` is legal. A session's
    /// first observed state is always legal and never reaches this check.
    pub fn can_follow(self, prior: TxnState) -> bool {
        match self {
            TxnState::Empty => {
                matches!(prior, TxnState::CompleteCommit | TxnState::CompleteAbort)
            }
            TxnState::Ongoing => matches!(
                prior,
                TxnState::Empty | TxnState::CompleteCommit | TxnState::CompleteAbort
            ),
            TxnState::PrepareCommit => matches!(prior, TxnState::Ongoing),
            TxnState::PrepareAbort => matches!(prior, TxnState::Ongoing),
            TxnState::CompleteCommit => matches!(prior, TxnState::PrepareCommit),
            TxnState::CompleteAbort => matches!(prior, TxnState::PrepareAbort),
            TxnState::Dead => matches!(
                prior,
                TxnState::Empty | TxnState::CompleteCommit | TxnState::CompleteAbort
            ),
        }
    }

    pub(crate) fn parse(text: &str) -> Option<TxnState> {
        match text {
            "Empty" => Some(TxnState::Empty),
            "Ongoing" => Some(TxnState::Ongoing),
            "PrepareCommit" => Some(TxnState::PrepareCommit),
            "PrepareAbort" => Some(TxnState::PrepareAbort),
            "CompleteCommit" => Some(TxnState::CompleteCommit),
            "CompleteAbort" => Some(TxnState::CompleteAbort),
            "Dead" => Some(TxnState::Dead),
            _ => None,
        }
    }
}

/// Compression codec recorded in a batch header. Old dumps spell the codec
/// in uppercase and new dumps in lowercase; both parse to the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CompressCodec {
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl CompressCodec {
    pub(crate) fn parse(text: &str) -> Option<CompressCodec> {
        match text.to_ascii_lowercase().as_str() {
            "none" => Some(CompressCodec::None),
            "gzip" => Some(CompressCodec::Gzip),
            "snappy" => Some(CompressCodec::Snappy),
            "lz4" => Some(CompressCodec::Lz4),
            "zstd" => Some(CompressCodec::Zstd),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txn_state_transitions() {
        let all = [
            TxnState::Empty,
            TxnState::Ongoing,
            TxnState::PrepareCommit,
            TxnState::PrepareAbort,
            TxnState::CompleteCommit,
            TxnState::CompleteAbort,
            TxnState::Dead,
        ];

        // the happy commit cycle
        assert!(TxnState::Ongoing.can_follow(TxnState::Empty));
        assert!(TxnState::PrepareCommit.can_follow(TxnState::Ongoing));
        assert!(TxnState::CompleteCommit.can_follow(TxnState::PrepareCommit));
        assert!(TxnState::Ongoing.can_follow(TxnState::CompleteCommit));

        // the abort cycle
        assert!(TxnState::PrepareAbort.can_follow(TxnState::Ongoing));
        assert!(TxnState::CompleteAbort.can_follow(TxnState::PrepareAbort));
        assert!(TxnState::Ongoing.can_follow(TxnState::CompleteAbort));

        // prepare states never follow a completed state directly
        for state in [TxnState::CompleteCommit, TxnState::CompleteAbort] {
            assert!(!TxnState::PrepareCommit.can_follow(state));
            assert!(!TxnState::PrepareAbort.can_follow(state));
        }

        // nothing follows Dead
        for state in all {
            assert!(!state.can_follow(TxnState::Dead));
        }

        // a completed state only follows its own prepare state
        assert!(!TxnState::CompleteCommit.can_follow(TxnState::PrepareAbort));
        assert!(!TxnState::CompleteAbort.can_follow(TxnState::PrepareCommit));
    }

    #[test]
    fn test_parse_compress_codec() {
        assert_eq!(CompressCodec::parse("none"), Some(CompressCodec::None));
        assert_eq!(CompressCodec::parse("NONE"), Some(CompressCodec::None));
        assert_eq!(CompressCodec::parse("GZIP"), Some(CompressCodec::Gzip));
        assert_eq!(CompressCodec::parse("ZSTD"), Some(CompressCodec::Zstd));
        assert_eq!(CompressCodec::parse("producer"), None);
    }

    #[test]
    fn test_display_producer_session() {
        let session = ProducerSession {
            producer_id: 1000,
            producer_epoch: 3,
        };
        assert_eq!(session.to_string(), "1000/3");
    }
}
