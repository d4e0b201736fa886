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

use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::LazyLock;

use error_stack::Report;
use regex::Captures;
use regex::Regex;

use crate::batch::Batch;
use crate::batch::BaseMessage;
use crate::batch::CompressCodec;
use crate::batch::ControlMessage;
use crate::batch::DataMessage;
use crate::batch::TransactionStateChange;
use crate::batch::TransactionStateDeletion;
use crate::batch::TxnState;
use crate::error::err_unexpected;
use crate::DumpError;

static DUMPING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Dumping (?P<path>.+)$").expect("dumping pattern"));

// Newer dump tools write `Log starting offset`, older ones `Starting offset`.
static STARTING_OFFSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:Log starting|Starting) offset: (?P<offset>\d+)$").expect("offset pattern")
});

static TOPIC_PARTITION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<topic>.+)-\d+$").expect("topic partition pattern"));

static BATCH_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^baseOffset: (?P<base_offset>-?\d+)",
        r" lastOffset: (?P<last_offset>-?\d+)",
        r" count: (?P<count>-?\d+)",
        r" baseSequence: (?P<base_sequence>-?\d+)",
        r" lastSequence: (?P<last_sequence>-?\d+)",
        r" producerId: (?P<producer_id>-?\d+)",
        r" producerEpoch: (?P<producer_epoch>-?\d+)",
        r" partitionLeaderEpoch: (?P<partition_leader_epoch>-?\d+)",
        r" isTransactional: (?P<is_transactional>true|false)",
        r" isControl: (?P<is_control>true|false)",
        r"(?: deleteHorizonMs: (?P<delete_horizon_ms>OptionalLong\.empty|-?\d+))?",
        r" position: (?P<position>-?\d+)",
        r" [Cc]reateTime: (?P<create_time>-?\d+)",
        r" size: (?P<size>-?\d+)",
        r" magic: (?P<magic>-?\d+)",
        r" compresscodec: (?P<compress_codec>[A-Za-z0-9]+)",
        r" crc: (?P<crc>\d+)",
        r" isvalid: (?P<is_valid>true|false)$",
    ))
    .expect("batch header pattern")
});

// Key spellings changed over dump tool generations; both are accepted,
// even mixed within one dump.
const RECORD_FIELDS: &str = concat!(
    r"^\| offset: (?P<offset>-?\d+)",
    r" [Cc]reateTime: (?P<create_time>-?\d+)",
    r" key[Ss]ize: (?P<key_size>-?\d+)",
    r" value[Ss]ize: (?P<value_size>-?\d+)",
    r" sequence: (?P<sequence>-?\d+)",
    r" header[Kk]eys: \[(?P<header_keys>.*?)\]",
);

static DATA_RECORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"{RECORD_FIELDS}(?: payload: .*)?$")).expect("data record pattern")
});

static CONTROL_RECORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        concat!(
            r"{}",
            r" endTxnMarker: (?P<end_txn_marker>COMMIT|ABORT)",
            r" coordinatorEpoch: (?P<coordinator_epoch>-?\d+)$",
        ),
        RECORD_FIELDS
    ))
    .expect("control record pattern")
});

static TXN_STATE_RECORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        concat!(
            r"{}",
            r" key: transaction_metadata::transactionalId=(?P<transactional_id>\S+)",
            r" payload: (?P<payload>.*)$",
        ),
        RECORD_FIELDS
    ))
    .expect("transaction state record pattern")
});

static TXN_STATE_PAYLOAD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^producerId:(?P<producer_id>-?\d+)",
        r",producerEpoch:(?P<producer_epoch>-?\d+)",
        r",state=(?P<state>[A-Za-z]+)",
        r",partitions=\[(?P<partitions>.*?)\]",
        r",txnLastUpdateTimestamp=(?P<txn_last_update_timestamp>-?\d+)",
        r",txnTimeoutMs=(?P<txn_timeout_ms>-?\d+)$",
    ))
    .expect("transaction metadata payload pattern")
});

pub(crate) fn is_record_line(text: &str) -> bool {
    text.starts_with("| ")
}

pub(crate) fn parse_dumping_line(text: &str) -> Option<&str> {
    DUMPING
        .captures(text)
        .map(|caps| caps.name("path").expect("mandatory group").as_str())
}

pub(crate) fn parse_starting_offset(text: &str) -> Option<i64> {
    STARTING_OFFSET
        .captures(text)
        .and_then(|caps| caps["offset"].parse().ok())
}

/// Topic name of a `<topic>-<partition>` directory, partition suffix
/// stripped.
pub(crate) fn topic_of_dir(dir: &str) -> Option<String> {
    TOPIC_PARTITION
        .captures(dir)
        .map(|caps| caps["topic"].to_string())
}

/// `None` means the line does not look like a batch header at all; the
/// caller owns that error. `Some(Err(..))` means the line matched but a
/// field does not parse.
pub(crate) fn parse_batch_header(
    file: &Arc<str>,
    line_no: u64,
    text: &str,
) -> Option<Result<Batch, Report<DumpError>>> {
    let caps = BATCH_HEADER.captures(text)?;
    Some(batch_from_captures(file, line_no, &caps))
}

fn batch_from_captures(
    file: &Arc<str>,
    line_no: u64,
    caps: &Captures,
) -> Result<Batch, Report<DumpError>> {
    let codec_text = &caps["compress_codec"];
    let compress_codec = CompressCodec::parse(codec_text).ok_or_else(|| {
        err_unexpected(file, line_no, format!("unknown compression codec {codec_text}"))
    })?;

    let delete_horizon_ms = match caps.name("delete_horizon_ms") {
        Some(value) if value.as_str() != "OptionalLong.empty" => {
            Some(int(file, line_no, "deleteHorizonMs", value.as_str())?)
        }
        _ => None,
    };

    Ok(Batch {
        file: file.clone(),
        line: line_no,
        base_offset: int(file, line_no, "baseOffset", &caps["base_offset"])?,
        last_offset: int(file, line_no, "lastOffset", &caps["last_offset"])?,
        count: int(file, line_no, "count", &caps["count"])?,
        base_sequence: int(file, line_no, "baseSequence", &caps["base_sequence"])?,
        last_sequence: int(file, line_no, "lastSequence", &caps["last_sequence"])?,
        producer_id: int(file, line_no, "producerId", &caps["producer_id"])?,
        producer_epoch: int(file, line_no, "producerEpoch", &caps["producer_epoch"])?,
        partition_leader_epoch: int(
            file,
            line_no,
            "partitionLeaderEpoch",
            &caps["partition_leader_epoch"],
        )?,
        is_transactional: &caps["is_transactional"] == "true",
        is_control: &caps["is_control"] == "true",
        position: int(file, line_no, "position", &caps["position"])?,
        create_time: int(file, line_no, "CreateTime", &caps["create_time"])?,
        size: int(file, line_no, "size", &caps["size"])?,
        magic: int(file, line_no, "magic", &caps["magic"])?,
        compress_codec,
        crc: int(file, line_no, "crc", &caps["crc"])?,
        is_valid: &caps["is_valid"] == "true",
        delete_horizon_ms,
        messages: Vec::new(),
    })
}

pub(crate) fn parse_data_record(
    file: &Arc<str>,
    line_no: u64,
    text: &str,
) -> Option<Result<DataMessage, Report<DumpError>>> {
    let caps = DATA_RECORD.captures(text)?;
    Some(data_from_captures(file, line_no, &caps))
}

fn data_from_captures(
    file: &Arc<str>,
    line_no: u64,
    caps: &Captures,
) -> Result<DataMessage, Report<DumpError>> {
    Ok(DataMessage {
        file: file.clone(),
        line: line_no,
        offset: int(file, line_no, "offset", &caps["offset"])?,
        create_time: int(file, line_no, "CreateTime", &caps["create_time"])?,
        key_size: int(file, line_no, "keySize", &caps["key_size"])?,
        value_size: int(file, line_no, "valueSize", &caps["value_size"])?,
        sequence: int(file, line_no, "sequence", &caps["sequence"])?,
        header_keys: caps["header_keys"].to_string(),
    })
}

pub(crate) fn parse_control_record(
    file: &Arc<str>,
    line_no: u64,
    text: &str,
) -> Option<Result<ControlMessage, Report<DumpError>>> {
    let caps = CONTROL_RECORD.captures(text)?;
    Some(control_from_captures(file, line_no, &caps))
}

fn control_from_captures(
    file: &Arc<str>,
    line_no: u64,
    caps: &Captures,
) -> Result<ControlMessage, Report<DumpError>> {
    Ok(ControlMessage {
        base: data_from_captures(file, line_no, caps)?,
        commit: &caps["end_txn_marker"] == "COMMIT",
        coordinator_epoch: int(file, line_no, "coordinatorEpoch", &caps["coordinator_epoch"])?,
    })
}

pub(crate) fn parse_transaction_state_record(
    file: &Arc<str>,
    line_no: u64,
    text: &str,
) -> Option<Result<BaseMessage, Report<DumpError>>> {
    let caps = TXN_STATE_RECORD.captures(text)?;
    Some(txn_state_from_captures(file, line_no, &caps))
}

fn txn_state_from_captures(
    file: &Arc<str>,
    line_no: u64,
    caps: &Captures,
) -> Result<BaseMessage, Report<DumpError>> {
    let base = data_from_captures(file, line_no, caps)?;
    let transactional_id = caps["transactional_id"].to_string();

    let payload = &caps["payload"];
    if payload == "<DELETE>" {
        return Ok(BaseMessage::TxnStateDeletion(TransactionStateDeletion {
            base,
            transactional_id,
        }));
    }

    let payload_caps = TXN_STATE_PAYLOAD.captures(payload).ok_or_else(|| {
        err_unexpected(
            file,
            line_no,
            format!("malformed transaction metadata payload: {payload}"),
        )
    })?;
    let state_text = &payload_caps["state"];
    let state = TxnState::parse(state_text).ok_or_else(|| {
        err_unexpected(file, line_no, format!("unknown transaction state {state_text}"))
    })?;

    Ok(BaseMessage::TxnStateChange(TransactionStateChange {
        base,
        transactional_id,
        producer_id: int(file, line_no, "producerId", &payload_caps["producer_id"])?,
        producer_epoch: int(file, line_no, "producerEpoch", &payload_caps["producer_epoch"])?,
        state,
        partitions: payload_caps["partitions"].to_string(),
        txn_last_update_timestamp: int(
            file,
            line_no,
            "txnLastUpdateTimestamp",
            &payload_caps["txn_last_update_timestamp"],
        )?,
        txn_timeout_ms: int(file, line_no, "txnTimeoutMs", &payload_caps["txn_timeout_ms"])?,
    }))
}

fn int<T>(file: &str, line_no: u64, name: &str, text: &str) -> Result<T, Report<DumpError>>
where
    T: FromStr,
    T::Err: Display,
{
    text.parse().map_err(|err| {
        err_unexpected(file, line_no, format!("cannot parse {name} value {text}: {err}"))
    })
}
