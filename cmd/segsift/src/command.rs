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

use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use error_stack::ResultExt;
use segsift_dump::collect_transactional_info;
use segsift_dump::read_segment_file;
use segsift_dump::validated_batches;
use segsift_dump::SegmentKind;
use segsift_dump::Stats;
use segsift_dump::TransactionalInfo;
use segsift_telemetry::LogConfig;

use crate::Error;

#[derive(Debug, Parser)]
#[command(name = "segsift", version)]
pub struct Command {
    /// Log filter directives; the RUST_LOG environment variable overrides
    /// this flag.
    #[arg(long, global = true, default_value = "info")]
    log_filter: String,

    #[command(subcommand)]
    cmd: SubCommand,
}

impl Command {
    pub fn run(self) -> error_stack::Result<(), Error> {
        segsift_telemetry::init(&LogConfig {
            filter: self.log_filter,
        });

        match self.cmd {
            SubCommand::TxnSummary(cmd) => cmd.run(),
            SubCommand::Cat(cmd) => cmd.run(),
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// Summarize transactional activity in the given segment dumps.
    #[command(name = "txn-summary")]
    TxnSummary(CommandTxnSummary),
    /// Parse, validate, and print every batch in the given segment dumps.
    #[command()]
    Cat(CommandCat),
}

#[derive(Debug, Parser)]
pub struct CommandTxnSummary {
    /// Segment dump files produced by the broker's dump tool.
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Print each summary as JSON instead of the human-readable report.
    #[arg(long)]
    json: bool,
}

impl CommandTxnSummary {
    pub fn run(self) -> error_stack::Result<(), Error> {
        let mut files = self.files;
        files.sort();

        for file in files {
            let make_error = || Error(format!("failed to summarize {}", file.display()));
            let segment = read_segment_file(&file).change_context_lazy(make_error)?;
            let name = segment.name().to_string();
            let kind = segment.kind();
            let info = collect_transactional_info(validated_batches(segment))
                .change_context_lazy(make_error)?;
            if self.json {
                let doc = serde_json::to_string_pretty(&info).change_context_lazy(make_error)?;
                println!("{doc}");
            } else {
                print_summary(&name, kind, &info);
            }
        }

        Ok(())
    }
}

#[derive(Debug, Parser)]
pub struct CommandCat {
    /// Segment dump files produced by the broker's dump tool.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

impl CommandCat {
    pub fn run(self) -> error_stack::Result<(), Error> {
        let mut files = self.files;
        files.sort();

        for file in files {
            let make_error = || Error(format!("failed to dump {}", file.display()));
            let segment = read_segment_file(&file).change_context_lazy(make_error)?;
            println!("{}: {:?} segment", segment.name(), segment.kind());
            for batch in validated_batches(segment) {
                let batch = batch.change_context_lazy(make_error)?;
                println!("{batch:?}");
            }
        }

        Ok(())
    }
}

fn print_summary(name: &str, kind: SegmentKind, info: &TransactionalInfo) {
    println!("{name}: {kind:?} segment");
    match (&info.first_batch, &info.last_batch) {
        (Some(first), Some(last)) => {
            println!("  first batch: offset {} (line {})", first.base_offset, first.line);
            println!("  last batch: offset {} (line {})", last.base_offset, last.line);
        }
        _ => println!("  no batches"),
    }
    println!("  committed: {} aborted: {}", info.committed, info.aborted);
    println!("  txn size (data batches): {}", render_stats(&info.txn_size_stats));
    println!("  txn duration (ms): {}", render_stats(&info.txn_duration_stats));
    println!("  empty transactions: {}", info.empty_transactions.len());
    for empty in &info.empty_transactions {
        let marker = if empty.record.commit { "COMMIT" } else { "ABORT" };
        println!(
            "    {marker} for session {} at offset {} (line {})",
            empty.batch.session(),
            empty.batch.base_offset,
            empty.record.base.line,
        );
    }
    println!("  open transactions: {}", info.open_transactions.len());
    for (session, first) in &info.open_transactions {
        println!(
            "    session {session} open since offset {} (line {}), {} data batches",
            first.batch.base_offset, first.batch.line, first.batch_count,
        );
    }
}

fn render_stats(stats: &Stats) -> String {
    match (stats.min, stats.max, stats.mean()) {
        (Some(min), Some(max), Some(mean)) => {
            format!("count={} min={min} max={max} mean={mean:.1}", stats.count)
        }
        _ => "none".to_string(),
    }
}
