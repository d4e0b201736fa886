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

use std::collections::HashMap;
use std::io::BufRead;

use crate::batch::BaseMessage;
use crate::batch::Batch;
use crate::batch::ProducerSession;
use crate::batch::TxnState;
use crate::error::err_illegal;
use crate::segment::Segment;
use crate::segment::SegmentKind;
use crate::DumpError;

type BatchResult = error_stack::Result<Batch, DumpError>;

/// Chains the validators appropriate for the segment's kind over its batch
/// stream. Consumes the segment; the stream stays lazy and single-pass.
pub fn validated_batches<R: BufRead>(segment: Segment<R>) -> impl Iterator<Item = BatchResult> {
    let kind = segment.kind();
    let batches = segment.batches();
    assert_legal_transitions(
        kind,
        assert_leader_epoch_monotonic(assert_batch_position_monotonic(assert_batches_valid(
            batches,
        ))),
    )
}

pub fn assert_batches_valid<I>(inner: I) -> AssertBatchesValid<I>
where
    I: Iterator<Item = BatchResult>,
{
    AssertBatchesValid { inner, fused: false }
}

/// Asserts every batch passed the dump tool's checksum validation
/// (`isvalid: true`).
#[derive(Debug)]
pub struct AssertBatchesValid<I> {
    inner: I,
    fused: bool,
}

impl<I> Iterator for AssertBatchesValid<I>
where
    I: Iterator<Item = BatchResult>,
{
    type Item = BatchResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        let result = self.inner.next()?.and_then(|batch| {
            if batch.is_valid {
                Ok(batch)
            } else {
                Err(err_illegal(
                    &batch.file,
                    batch.line,
                    format!("the batch at offset {} is not valid", batch.base_offset),
                ))
            }
        });
        self.fused = result.is_err();
        Some(result)
    }
}

pub fn assert_batch_position_monotonic<I>(inner: I) -> AssertBatchPositionMonotonic<I>
where
    I: Iterator<Item = BatchResult>,
{
    AssertBatchPositionMonotonic {
        inner,
        prev: None,
        fused: false,
    }
}

/// Asserts consecutive batches advance through the segment: each batch must
/// begin at or after the previous batch's end position, and its offsets must
/// lie past the previous batch's last offset.
#[derive(Debug)]
pub struct AssertBatchPositionMonotonic<I> {
    inner: I,
    prev: Option<PrevBatch>,
    fused: bool,
}

#[derive(Debug, Clone, Copy)]
struct PrevBatch {
    position: i64,
    size: i32,
    last_offset: i64,
}

impl<I> AssertBatchPositionMonotonic<I> {
    fn check(&mut self, batch: Batch) -> BatchResult {
        if let Some(prev) = self.prev {
            let end = prev.position + prev.size as i64;
            if batch.position < end {
                return Err(err_illegal(
                    &batch.file,
                    batch.line,
                    format!(
                        "the batch at position {} begins before the previous batch ends at {end}",
                        batch.position
                    ),
                ));
            }
            if batch.base_offset <= prev.last_offset {
                return Err(err_illegal(
                    &batch.file,
                    batch.line,
                    format!(
                        "the batch at offset {} does not advance past the previous \
                         batch's last offset {}",
                        batch.base_offset, prev.last_offset
                    ),
                ));
            }
        }
        self.prev = Some(PrevBatch {
            position: batch.position,
            size: batch.size,
            last_offset: batch.last_offset,
        });
        Ok(batch)
    }
}

impl<I> Iterator for AssertBatchPositionMonotonic<I>
where
    I: Iterator<Item = BatchResult>,
{
    type Item = BatchResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        let result = self.inner.next()?.and_then(|batch| self.check(batch));
        self.fused = result.is_err();
        Some(result)
    }
}

pub fn assert_leader_epoch_monotonic<I>(inner: I) -> AssertLeaderEpochMonotonic<I>
where
    I: Iterator<Item = BatchResult>,
{
    AssertLeaderEpochMonotonic {
        inner,
        prev_epoch: None,
        fused: false,
    }
}

/// Asserts the partition leader epoch never regresses between consecutive
/// batches.
#[derive(Debug)]
pub struct AssertLeaderEpochMonotonic<I> {
    inner: I,
    prev_epoch: Option<i32>,
    fused: bool,
}

impl<I> AssertLeaderEpochMonotonic<I> {
    fn check(&mut self, batch: Batch) -> BatchResult {
        if let Some(prev) = self.prev_epoch {
            if batch.partition_leader_epoch < prev {
                return Err(err_illegal(
                    &batch.file,
                    batch.line,
                    format!(
                        "partition leader epoch regressed from {prev} to {}",
                        batch.partition_leader_epoch
                    ),
                ));
            }
        }
        self.prev_epoch = Some(batch.partition_leader_epoch);
        Ok(batch)
    }
}

impl<I> Iterator for AssertLeaderEpochMonotonic<I>
where
    I: Iterator<Item = BatchResult>,
{
    type Item = BatchResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        let result = self.inner.next()?.and_then(|batch| self.check(batch));
        self.fused = result.is_err();
        Some(result)
    }
}

pub fn assert_legal_transitions<I>(kind: SegmentKind, inner: I) -> AssertLegalTransitions<I>
where
    I: Iterator<Item = BatchResult>,
{
    AssertLegalTransitions {
        inner,
        enabled: kind == SegmentKind::TransactionState,
        states: HashMap::new(),
        fused: false,
    }
}

/// Validates the per-session transaction state machine of a transaction
/// state segment. A pass-through for every other segment kind.
#[derive(Debug)]
pub struct AssertLegalTransitions<I> {
    inner: I,
    enabled: bool,
    states: HashMap<ProducerSession, TxnState>,
    fused: bool,
}

impl<I> AssertLegalTransitions<I> {
    fn check(&mut self, batch: Batch) -> BatchResult {
        if batch.is_transactional {
            return Err(err_illegal(
                &batch.file,
                batch.line,
                "a transaction state segment must not contain transactional batches",
            ));
        }
        for message in &batch.messages {
            let BaseMessage::TxnStateChange(change) = message else {
                continue;
            };
            let session = ProducerSession {
                producer_id: change.producer_id,
                producer_epoch: change.producer_epoch,
            };
            if let Some(prior) = self.states.insert(session, change.state) {
                if !change.state.can_follow(prior) {
                    return Err(err_illegal(
                        &change.base.file,
                        change.base.line,
                        format!(
                            "illegal transaction state transition {prior:?} -> {:?} for {}",
                            change.state, change.transactional_id
                        ),
                    ));
                }
            }
        }
        Ok(batch)
    }
}

impl<I> Iterator for AssertLegalTransitions<I>
where
    I: Iterator<Item = BatchResult>,
{
    type Item = BatchResult;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        let result = self.inner.next()?;
        let result = if self.enabled {
            result.and_then(|batch| self.check(batch))
        } else {
            result
        };
        self.fused = result.is_err();
        Some(result)
    }
}
