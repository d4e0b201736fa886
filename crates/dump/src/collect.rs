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

use std::collections::BTreeMap;

use serde::Serialize;

use crate::batch::BaseMessage;
use crate::batch::Batch;
use crate::batch::ControlMessage;
use crate::batch::ProducerSession;
use crate::error::err_illegal;
use crate::DumpError;

/// Running count/min/max/sum over an accepted series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub count: u64,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub sum: i64,
}

impl Stats {
    pub fn accept(&mut self, value: i64) {
        self.count += 1;
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
        self.sum += value;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }
}

/// The first data batch seen for a producer session, and how many data
/// batches the session's transaction has accumulated so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirstBatchInTxn {
    pub batch: Batch,
    pub batch_count: u64,
}

/// A commit or abort marker for a session with no preceding data batches in
/// this segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmptyTransaction {
    pub batch: Batch,
    pub record: ControlMessage,
}

/// Transactional summary of one segment's batch stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionalInfo {
    pub first_batch: Option<Batch>,
    pub last_batch: Option<Batch>,
    /// Sessions whose transactions never closed within this segment.
    pub open_transactions: BTreeMap<ProducerSession, FirstBatchInTxn>,
    pub empty_transactions: Vec<EmptyTransaction>,
    pub committed: u64,
    pub aborted: u64,
    /// Data batches per completed transaction.
    pub txn_size_stats: Stats,
    /// Milliseconds between a transaction's first data batch and its marker.
    pub txn_duration_stats: Stats,
}

/// Folds a batch stream into its [`TransactionalInfo`].
///
/// The fold is inherently serial: sessions may span any split point, so
/// there is deliberately no way to combine two partial summaries.
pub fn collect_transactional_info<I>(batches: I) -> error_stack::Result<TransactionalInfo, DumpError>
where
    I: IntoIterator<Item = error_stack::Result<Batch, DumpError>>,
{
    let mut info = TransactionalInfo::default();
    for batch in batches {
        let batch = batch?;
        if info.first_batch.is_none() {
            info.first_batch = Some(batch.clone());
        }

        if batch.is_transactional {
            if batch.is_control {
                if batch.count != 1 {
                    return Err(err_illegal(
                        &batch.file,
                        batch.line,
                        format!("control batch with record count {}", batch.count),
                    ));
                }
                // the session is closed by the marker record below
            } else {
                info.open_transactions
                    .entry(batch.session())
                    .and_modify(|first| first.batch_count += 1)
                    .or_insert_with(|| FirstBatchInTxn {
                        batch: batch.clone(),
                        batch_count: 1,
                    });
            }
        }

        for message in &batch.messages {
            let BaseMessage::Control(control) = message else {
                continue;
            };
            if control.commit {
                info.committed += 1;
            } else {
                info.aborted += 1;
            }
            match info.open_transactions.remove(&batch.session()) {
                Some(first) => {
                    info.txn_size_stats.accept(first.batch_count as i64);
                    info.txn_duration_stats
                        .accept(batch.create_time - first.batch.create_time);
                }
                None => info.empty_transactions.push(EmptyTransaction {
                    batch: batch.clone(),
                    record: control.clone(),
                }),
            }
        }

        info.last_batch = Some(batch);
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use insta::assert_compact_debug_snapshot;

    use super::*;
    use crate::batch::CompressCodec;
    use crate::batch::DataMessage;
    use crate::batch::NO_PRODUCER_EPOCH;
    use crate::batch::NO_PRODUCER_ID;
    use crate::batch::NO_SEQUENCE;

    fn batch(base_offset: i64, create_time: i64) -> Batch {
        Batch {
            file: Arc::from("test-dump"),
            line: 3,
            base_offset,
            last_offset: base_offset,
            count: 1,
            base_sequence: NO_SEQUENCE,
            last_sequence: NO_SEQUENCE,
            producer_id: NO_PRODUCER_ID,
            producer_epoch: NO_PRODUCER_EPOCH,
            partition_leader_epoch: 0,
            is_transactional: false,
            is_control: false,
            position: base_offset * 100,
            create_time,
            size: 100,
            magic: 2,
            compress_codec: CompressCodec::None,
            crc: 0,
            is_valid: true,
            delete_horizon_ms: None,
            messages: Vec::new(),
        }
    }

    fn txn_batch(base_offset: i64, create_time: i64) -> Batch {
        let mut batch = batch(base_offset, create_time);
        batch.is_transactional = true;
        batch.producer_id = 1000;
        batch.producer_epoch = 0;
        batch
    }

    fn control_batch(base_offset: i64, create_time: i64, commit: bool) -> Batch {
        let mut batch = txn_batch(base_offset, create_time);
        batch.is_control = true;
        batch.messages = vec![BaseMessage::Control(ControlMessage {
            base: DataMessage {
                file: batch.file.clone(),
                line: batch.line + 1,
                offset: base_offset,
                create_time,
                key_size: 4,
                value_size: 6,
                sequence: NO_SEQUENCE,
                header_keys: String::new(),
            },
            commit,
            coordinator_epoch: 0,
        })];
        batch
    }

    #[test]
    fn test_stats_accept() {
        let mut stats = Stats::default();
        assert_eq!(stats.mean(), None);
        stats.accept(4);
        stats.accept(-2);
        stats.accept(1);
        assert_compact_debug_snapshot!(stats, @"Stats { count: 3, min: Some(-2), max: Some(4), sum: 3 }");
        assert_eq!(stats.mean(), Some(1.0));
    }

    #[test]
    fn test_collect_non_transactional_stream() {
        let batches = [Ok(batch(0, 100)), Ok(batch(1, 200)), Ok(batch(2, 300))];
        let info = collect_transactional_info(batches).unwrap();
        assert_eq!(info.first_batch.as_ref().unwrap().base_offset, 0);
        assert_eq!(info.last_batch.as_ref().unwrap().base_offset, 2);
        assert_eq!(info.committed, 0);
        assert_eq!(info.aborted, 0);
        assert!(info.open_transactions.is_empty());
        assert!(info.empty_transactions.is_empty());
        assert_eq!(info.txn_size_stats, Stats::default());
        assert_eq!(info.txn_duration_stats, Stats::default());
    }

    #[test]
    fn test_collect_committed_transaction() {
        let batches = [
            Ok(txn_batch(0, 1000)),
            Ok(txn_batch(1, 1200)),
            Ok(control_batch(2, 1400, true)),
        ];
        let info = collect_transactional_info(batches).unwrap();
        assert_eq!(info.committed, 1);
        assert_eq!(info.aborted, 0);
        assert!(info.open_transactions.is_empty());
        assert!(info.empty_transactions.is_empty());
        assert_compact_debug_snapshot!(info.txn_size_stats, @"Stats { count: 1, min: Some(2), max: Some(2), sum: 2 }");
        assert_compact_debug_snapshot!(info.txn_duration_stats, @"Stats { count: 1, min: Some(400), max: Some(400), sum: 400 }");
    }

    #[test]
    fn test_collect_aborted_and_open_transactions() {
        let mut other_session = txn_batch(3, 1300);
        other_session.producer_id = 2000;
        let batches = [
            Ok(txn_batch(0, 1000)),
            Ok(control_batch(1, 1100, false)),
            Ok(other_session),
        ];
        let info = collect_transactional_info(batches).unwrap();
        assert_eq!(info.committed, 0);
        assert_eq!(info.aborted, 1);
        assert_eq!(info.open_transactions.len(), 1);
        let (session, first) = info.open_transactions.iter().next().unwrap();
        assert_eq!(session.producer_id, 2000);
        assert_eq!(first.batch.base_offset, 3);
        assert_eq!(first.batch_count, 1);
    }

    #[test]
    fn test_collect_empty_transaction() {
        let batches = [Ok(batch(0, 900)), Ok(control_batch(1, 1000, true))];
        let info = collect_transactional_info(batches).unwrap();
        assert_eq!(info.committed, 1);
        assert_eq!(info.empty_transactions.len(), 1);
        assert_eq!(info.empty_transactions[0].batch.base_offset, 1);
        assert!(info.empty_transactions[0].record.commit);
        // an empty transaction contributes no size or duration sample
        assert_eq!(info.txn_size_stats.count, 0);
        assert_eq!(info.txn_duration_stats.count, 0);
    }

    #[test]
    fn test_summary_serializes_to_json() {
        let info = collect_transactional_info([Ok(txn_batch(0, 1000))]).unwrap();
        let doc = serde_json::to_value(&info).unwrap();
        assert_eq!(doc["open_transactions"]["1000/0"]["batch_count"], 1);
        assert_eq!(doc["first_batch"]["base_offset"], 0);
    }

    #[test]
    fn test_collect_rejects_control_batch_with_bad_count() {
        let mut bad = control_batch(1, 1000, true);
        bad.count = 2;
        bad.last_offset = 2;
        let err = collect_transactional_info([Ok(bad)]).unwrap_err();
        let DumpError::IllegalState(message) = err.current_context() else {
            panic!("expected an invariant violation, got {err:?}");
        };
        assert!(message.contains("control batch with record count 2"));
    }

    #[test]
    fn test_collect_propagates_stream_errors() {
        let batches = [
            Ok(batch(0, 100)),
            Err(crate::error::err_illegal("test-dump", 4, "boom")),
        ];
        let err = collect_transactional_info(batches).unwrap_err();
        assert!(matches!(err.current_context(), DumpError::IllegalState(_)));
    }
}
