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

use logforth::append;
use logforth::filter::env_filter::EnvFilterBuilder;
use logforth::filter::EnvFilter;
use logforth::layout;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".to_string(),
        }
    }
}

/// Routes everything the `log` facade emits to stderr, filtered by the
/// configured directives.
pub fn init(config: &LogConfig) {
    logforth::builder()
        .dispatch(|d| {
            d.filter(log_filter(config)).append(
                append::Stderr::default().with_layout(layout::TextLayout::default()),
            )
        })
        .apply();
}

// RUST_LOG wins over the configured filter, so an operator can crank up
// verbosity without touching the command line.
fn log_filter(config: &LogConfig) -> EnvFilter {
    let directives = std::env::var("RUST_LOG").unwrap_or_else(|_| config.filter.clone());
    let builder = EnvFilterBuilder::new()
        .try_parse(&directives)
        .unwrap_or_else(|_| panic!("malformed log filter directives: {directives}"));
    EnvFilter::new(builder)
}
