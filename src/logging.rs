// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
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

//! Logging setup for the agent.
//!
//! Every component logs through `tracing`. This module installs the global
//! subscriber once at startup:
//!
//! ```toml
//! [logging]
//! level = "info"
//! json_format = false
//! ```
//!
//! `RUST_LOG`, when set, takes precedence over the configured level. Output
//! goes to stderr so `status --json` and `config show` keep stdout clean.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{AgentError, Result};

/// Build the filter from `RUST_LOG` or the configured level.
pub fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| AgentError::config(format!("Invalid log level '{}': {e}", config.level)))
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the level is invalid or a subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    let installed = if config.json_format {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| AgentError::config(format!("Failed to initialize logging: {e}")))
}
