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

//! Telling the consuming service that new material is on disk.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{AgentError, Result};

/// Notifies a dependent service after publication.
#[async_trait]
pub trait ReloadNotifier: Send + Sync {
    /// Signal that certificate material changed.
    async fn notify(&self) -> Result<()>;
}

/// Does nothing. Used when no reload command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReloader;

#[async_trait]
impl ReloadNotifier for NoopReloader {
    async fn notify(&self) -> Result<()> {
        debug!("No reload command configured");
        Ok(())
    }
}

/// Runs a command (argv, no shell) and requires a zero exit status.
#[derive(Debug, Clone)]
pub struct CommandReloader {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandReloader {
    /// Create a reloader for `argv`, which must not be empty.
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            return Err(AgentError::config("reload command must not be empty"));
        }
        Ok(Self { argv, timeout })
    }

    /// The command line.
    pub fn argv(&self) -> &[String] {
        &self.argv
    }
}

#[async_trait]
impl ReloadNotifier for CommandReloader {
    async fn notify(&self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| AgentError::reload("empty reload command"))?;

        debug!(program = %program, "Running reload command");

        let mut command = Command::new(program);
        command.args(args).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                AgentError::reload(format!(
                    "'{}' did not finish within {} seconds",
                    program,
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| AgentError::reload(format!("Cannot run '{program}': {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::reload(format!(
                "'{}' exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        info!(program = %program, "Reload command succeeded");
        Ok(())
    }
}
