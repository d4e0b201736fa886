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

use std::collections::VecDeque;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use error_stack::Report;
use serde::Serialize;

use crate::batch::BaseMessage;
use crate::batch::Batch;
use crate::batch::NO_PRODUCER_EPOCH;
use crate::batch::NO_PRODUCER_ID;
use crate::error::err_illegal;
use crate::error::err_unexpected;
use crate::parse;
use crate::DumpError;

/// Kind of log segment a dump was taken from, derived from the dumped
/// file's parent directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SegmentKind {
    Data,
    TransactionState,
    ConsumerOffsets,
}

/// A parsed dump. The batch stream is lazy and single-pass; the underlying
/// line source is released when the stream is dropped or exhausted.
#[derive(Debug)]
pub struct Segment<R> {
    name: Arc<str>,
    kind: SegmentKind,
    topic: Option<String>,
    deep_iteration: bool,
    batches: Batches<R>,
}

impl<R> Segment<R> {
    /// Label used in error messages, usually the dump file path.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    /// Topic this segment belongs to, when the dumped path carries one.
    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// True iff the dump was produced with per-record detail.
    pub fn deep_iteration(&self) -> bool {
        self.deep_iteration
    }

    /// The batch stream. Single-pass: consumes the segment.
    pub fn batches(self) -> Batches<R> {
        self.batches
    }
}

/// Parses the dump preamble out of `reader` and returns the segment whose
/// batches can then be streamed. `label` names the input in error messages.
pub fn read_segment<R: BufRead>(
    label: impl Into<String>,
    reader: R,
) -> error_stack::Result<Segment<R>, DumpError> {
    let name: Arc<str> = Arc::from(label.into());
    let mut lines = LineReader::new(name.clone(), reader);

    let (line_no, text) = lines
        .next_line()?
        .ok_or_else(|| err_unexpected(&name, 1, "missing the 'Dumping <path>' preamble"))?;
    let path = parse::parse_dumping_line(&text)
        .ok_or_else(|| {
            err_unexpected(&name, line_no, format!("expected 'Dumping <path>', got: {text}"))
        })?
        .to_string();

    let (line_no, text) = lines
        .next_line()?
        .ok_or_else(|| err_unexpected(&name, 2, "missing the starting offset line"))?;
    let starting_offset = parse::parse_starting_offset(&text).ok_or_else(|| {
        err_unexpected(&name, line_no, format!("expected a starting offset line, got: {text}"))
    })?;

    check_file_offset(&name, line_no, &path, starting_offset)?;
    let (kind, topic) = classify(&name, &path);

    let deep_iteration = lines.peek_deep_iteration()?;

    Ok(Segment {
        name: name.clone(),
        kind,
        topic,
        deep_iteration,
        batches: Batches {
            file: name,
            kind,
            deep_iteration,
            lines,
            done: false,
        },
    })
}

/// Convenience over [`read_segment`] that opens `path` and labels the
/// segment with it. The file handle is owned by the returned segment.
pub fn read_segment_file(
    path: impl AsRef<Path>,
) -> error_stack::Result<Segment<BufReader<File>>, DumpError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|err| {
        Report::new(DumpError::UnexpectedFileContent(format!(
            "failed to open dump file {}",
            path.display()
        )))
        .attach_printable(err)
    })?;
    read_segment(path.display().to_string(), BufReader::new(file))
}

// The dump file name carries the segment's base offset; a disagreement with
// the declared starting offset means the dump is not what it claims to be.
fn check_file_offset(
    file: &str,
    line_no: u64,
    path: &str,
    starting_offset: i64,
) -> error_stack::Result<(), DumpError> {
    let stem = Path::new(path).file_stem().and_then(|stem| stem.to_str());
    let file_offset = stem.and_then(|stem| stem.parse::<i64>().ok()).ok_or_else(|| {
        err_unexpected(
            file,
            line_no,
            format!("cannot derive a base offset from dump file name {path}"),
        )
    })?;
    if file_offset != starting_offset {
        return Err(err_unexpected(
            file,
            line_no,
            format!(
                "dump file name {path} declares offset {file_offset} \
                 but the dump starts at offset {starting_offset}"
            ),
        ));
    }
    Ok(())
}

fn classify(file: &str, path: &str) -> (SegmentKind, Option<String>) {
    let dir = Path::new(path)
        .parent()
        .and_then(|parent| parent.file_name())
        .and_then(|dir| dir.to_str());
    let Some(dir) = dir else {
        log::warn!("cannot tell the segment kind of {path} in {file}; assuming a data segment");
        return (SegmentKind::Data, None);
    };
    match parse::topic_of_dir(dir) {
        Some(topic) => {
            let kind = match topic.as_str() {
                "__transaction_state" => SegmentKind::TransactionState,
                "__consumer_offsets" => SegmentKind::ConsumerOffsets,
                _ => SegmentKind::Data,
            };
            (kind, Some(topic))
        }
        None => (SegmentKind::Data, None),
    }
}

#[derive(Debug)]
struct LineReader<R> {
    file: Arc<str>,
    reader: R,
    next_line_no: u64,
    pushback: VecDeque<(u64, String)>,
}

impl<R: BufRead> LineReader<R> {
    fn new(file: Arc<str>, reader: R) -> LineReader<R> {
        LineReader {
            file,
            reader,
            next_line_no: 1,
            pushback: VecDeque::new(),
        }
    }

    fn next_line(&mut self) -> error_stack::Result<Option<(u64, String)>, DumpError> {
        if let Some(entry) = self.pushback.pop_front() {
            return Ok(Some(entry));
        }
        let mut buf = String::new();
        let read = self.reader.read_line(&mut buf).map_err(|err| {
            err_unexpected(&self.file, self.next_line_no, "failed to read the next line")
                .attach_printable(err)
        })?;
        if read == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        let line_no = self.next_line_no;
        self.next_line_no += 1;
        Ok(Some((line_no, buf)))
    }

    fn last_line_no(&self) -> u64 {
        self.next_line_no.saturating_sub(1)
    }

    // Deep iteration is not flagged anywhere in the dump; it shows in
    // whether the line after the first batch header is a record line. The
    // peeked lines are handed back to the folding stage.
    fn peek_deep_iteration(&mut self) -> error_stack::Result<bool, DumpError> {
        let first = self.next_line()?;
        let second = self.next_line()?;
        let deep = matches!(&second, Some((_, text)) if parse::is_record_line(text));
        if let Some(entry) = second {
            self.pushback.push_front(entry);
        }
        if let Some(entry) = first {
            self.pushback.push_front(entry);
        }
        Ok(deep)
    }
}

/// Lazy, single-pass stream of [`Batch`] values parsed out of a dump.
///
/// Each advance consumes exactly the lines of one batch. The stream fuses
/// after the first failure: a dump is not recoverable past a malformed line.
#[derive(Debug)]
pub struct Batches<R> {
    file: Arc<str>,
    kind: SegmentKind,
    deep_iteration: bool,
    lines: LineReader<R>,
    done: bool,
}

impl<R: BufRead> Iterator for Batches<R> {
    type Item = error_stack::Result<Batch, DumpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<R: BufRead> Batches<R> {
    fn advance(&mut self) -> error_stack::Result<Option<Batch>, DumpError> {
        let Some((line_no, text)) = self.lines.next_line()? else {
            return Ok(None);
        };
        let mut batch = parse::parse_batch_header(&self.file, line_no, &text).ok_or_else(|| {
            err_unexpected(
                &self.file,
                line_no,
                format!("this doesn't look like a batch header: {text}"),
            )
        })??;
        self.check_batch(&batch)?;

        if !self.deep_iteration {
            return Ok(Some(batch));
        }

        // The sign of `expect` picks the record parser: the batch header
        // decides whether its records are data or control records, never
        // the record line itself.
        let mut expect = if batch.is_control { -batch.count } else { batch.count };
        let mut messages = Vec::with_capacity(batch.count as usize);
        while expect != 0 {
            let Some((record_line_no, text)) = self.lines.next_line()? else {
                return Err(err_unexpected(
                    &self.file,
                    self.lines.last_line_no(),
                    format!("the dump ended inside the batch at offset {}", batch.base_offset),
                ));
            };
            if expect > 0 {
                messages.push(self.parse_record(record_line_no, &text, batch.count)?);
                expect -= 1;
            } else {
                let control = parse::parse_control_record(&self.file, record_line_no, &text)
                    .ok_or_else(|| {
                        err_illegal(
                            &self.file,
                            record_line_no,
                            format!(
                                "Expected {} control records in batch, \
                                 but this doesn't look like a control record",
                                batch.count
                            ),
                        )
                    })??;
                messages.push(BaseMessage::Control(control));
                expect += 1;
            }
        }
        batch.messages = messages;
        Ok(Some(batch))
    }

    fn parse_record(
        &self,
        line_no: u64,
        text: &str,
        count: i32,
    ) -> error_stack::Result<BaseMessage, DumpError> {
        let parsed = match self.kind {
            SegmentKind::TransactionState => {
                parse::parse_transaction_state_record(&self.file, line_no, text)
            }
            _ => parse::parse_data_record(&self.file, line_no, text)
                .map(|result| result.map(BaseMessage::Data)),
        };
        match parsed {
            Some(result) => result,
            None => Err(err_illegal(
                &self.file,
                line_no,
                format!(
                    "Expected {count} data records in batch, \
                     but this doesn't look like a data record"
                ),
            )),
        }
    }

    fn check_batch(&self, batch: &Batch) -> error_stack::Result<(), DumpError> {
        if batch.count < 1 {
            return Err(err_illegal(
                &batch.file,
                batch.line,
                format!("batch record count must be at least 1, but is {}", batch.count),
            ));
        }
        if batch.last_offset < batch.base_offset {
            return Err(err_illegal(
                &batch.file,
                batch.line,
                format!(
                    "batch last offset {} is before its base offset {}",
                    batch.last_offset, batch.base_offset
                ),
            ));
        }
        if batch.is_control && batch.count != 1 {
            return Err(err_illegal(
                &batch.file,
                batch.line,
                format!("control batch with record count {}", batch.count),
            ));
        }
        match self.kind {
            SegmentKind::TransactionState => {
                if batch.producer_id != NO_PRODUCER_ID || batch.producer_epoch != NO_PRODUCER_EPOCH
                {
                    return Err(err_unexpected(
                        &batch.file,
                        batch.line,
                        format!(
                            "a transaction state segment batch must not carry \
                             a producer session, but found {}",
                            batch.session()
                        ),
                    ));
                }
            }
            _ => {
                if batch.is_transactional
                    && (batch.producer_id == NO_PRODUCER_ID
                        || batch.producer_epoch == NO_PRODUCER_EPOCH)
                {
                    return Err(err_illegal(
                        &batch.file,
                        batch.line,
                        "a transactional batch must carry a producer session",
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(input: &str) -> Segment<&[u8]> {
        read_segment("test-dump", input.as_bytes()).unwrap()
    }

    #[test]
    fn test_preamble_must_open_the_dump() {
        let err = read_segment("test-dump", &b"nonsense\n"[..]).unwrap_err();
        assert!(matches!(err.current_context(), DumpError::UnexpectedFileContent(_)));

        let err = read_segment("test-dump", &b""[..]).unwrap_err();
        assert!(matches!(err.current_context(), DumpError::UnexpectedFileContent(_)));

        let input = "Dumping ./00000000000000000000.log\nno offset here\n";
        let err = read_segment("test-dump", input.as_bytes()).unwrap_err();
        assert!(matches!(err.current_context(), DumpError::UnexpectedFileContent(_)));
    }

    #[test]
    fn test_file_name_must_agree_with_starting_offset() {
        let input = "Dumping ./00000000000000000100.log\nStarting offset: 0\n";
        let err = read_segment("test-dump", input.as_bytes()).unwrap_err();
        let DumpError::UnexpectedFileContent(message) = err.current_context() else {
            panic!("expected malformed input, got {err:?}");
        };
        assert!(message.contains("declares offset 100"));

        let input = "Dumping ./segment.log\nStarting offset: 0\n";
        let err = read_segment("test-dump", input.as_bytes()).unwrap_err();
        assert!(matches!(err.current_context(), DumpError::UnexpectedFileContent(_)));
    }

    #[test]
    fn test_classify_segment_kinds() {
        let prefix = "/tmp/kafka-logs";
        for (dir, kind, topic) in [
            ("my-topic-0", SegmentKind::Data, Some("my-topic")),
            ("__transaction_state-4", SegmentKind::TransactionState, Some("__transaction_state")),
            ("__consumer_offsets-21", SegmentKind::ConsumerOffsets, Some("__consumer_offsets")),
        ] {
            let input =
                format!("Dumping {prefix}/{dir}/00000000000000000000.log\nStarting offset: 0\n");
            let segment = read_segment("test-dump", input.as_bytes()).unwrap();
            assert_eq!(segment.kind(), kind);
            assert_eq!(segment.topic(), topic);
        }

        // a bare file name leaves nothing to classify by
        let input = "Dumping 00000000000000000000.log\nStarting offset: 0\n";
        let segment = read_segment("test-dump", input.as_bytes()).unwrap();
        assert_eq!(segment.kind(), SegmentKind::Data);
        assert_eq!(segment.topic(), None);
    }

    #[test]
    fn test_empty_dump_has_no_batches() {
        let input = "Dumping ./00000000000000000000.log\nStarting offset: 0\n";
        let segment = segment(input);
        assert!(!segment.deep_iteration());
        assert_eq!(segment.batches().count(), 0);
    }

    #[test]
    fn test_dump_ending_inside_a_batch() {
        let input = "Dumping ./00000000000000000000.log\n\
                     Starting offset: 0\n\
                     baseOffset: 0 lastOffset: 1 count: 2 baseSequence: -1 lastSequence: -1 \
                     producerId: -1 producerEpoch: -1 partitionLeaderEpoch: 0 \
                     isTransactional: false isControl: false position: 0 CreateTime: 100 \
                     size: 89 magic: 2 compresscodec: none crc: 1 isvalid: true\n\
                     | offset: 0 CreateTime: 100 keySize: -1 valueSize: 7 sequence: -1 \
                     headerKeys: []\n";
        let results: Vec<_> = segment(input).batches().collect();
        assert_eq!(results.len(), 1);
        let err = results[0].as_ref().unwrap_err();
        let DumpError::UnexpectedFileContent(message) = err.current_context() else {
            panic!("expected malformed input, got {err:?}");
        };
        assert!(message.contains("ended inside the batch"));
    }

    #[test]
    fn test_record_line_where_header_expected() {
        // a header-only dump must contain nothing but batch headers
        let input = "Dumping ./00000000000000000000.log\n\
                     Starting offset: 0\n\
                     baseOffset: 0 lastOffset: 0 count: 1 baseSequence: -1 lastSequence: -1 \
                     producerId: -1 producerEpoch: -1 partitionLeaderEpoch: 0 \
                     isTransactional: false isControl: false position: 0 CreateTime: 100 \
                     size: 89 magic: 2 compresscodec: none crc: 1 isvalid: true\n\
                     baseOffset: 1 lastOffset: 1 count: 1 baseSequence: -1 lastSequence: -1 \
                     producerId: -1 producerEpoch: -1 partitionLeaderEpoch: 0 \
                     isTransactional: false isControl: false position: 89 CreateTime: 100 \
                     size: 89 magic: 2 compresscodec: none crc: 1 isvalid: true\n\
                     | offset: 1 CreateTime: 100 keySize: -1 valueSize: 7 sequence: -1 \
                     headerKeys: []\n";
        let results: Vec<_> = segment(input).batches().collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        let err = results[2].as_ref().unwrap_err();
        let DumpError::UnexpectedFileContent(message) = err.current_context() else {
            panic!("expected malformed input, got {err:?}");
        };
        assert!(message.contains("doesn't look like a batch header"));
    }

    #[test]
    fn test_stream_fuses_after_an_error() {
        let input = "Dumping ./00000000000000000000.log\n\
                     Starting offset: 0\n\
                     junk\n\
                     more junk\n";
        let mut batches = segment(input).batches();
        assert!(batches.next().unwrap().is_err());
        assert!(batches.next().is_none());
    }
}
