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

use error_stack::Report;

/// Failure categories for a segment dump stream.
///
/// Both categories are fatal to the stream that observed them: the dump is
/// not recoverable past the offending line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DumpError {
    /// The input text does not follow the dump format.
    #[error("unexpected file content: {0}")]
    UnexpectedFileContent(String),
    /// The input parses but violates an on-log invariant.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

pub(crate) fn err_unexpected(file: &str, line: u64, message: impl Display) -> Report<DumpError> {
    Report::new(DumpError::UnexpectedFileContent(message.to_string()))
        .attach_printable(format!("at {file}:{line}"))
}

pub(crate) fn err_illegal(file: &str, line: u64, message: impl Display) -> Report<DumpError> {
    Report::new(DumpError::IllegalState(message.to_string()))
        .attach_printable(format!("at {file}:{line}"))
}
