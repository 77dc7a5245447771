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

//! Operator-requested renewal via a sentinel file.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{AgentError, Result};

/// A force-renewal request is pending while the sentinel file exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForceTrigger {
    path: PathBuf,
}

impl ForceTrigger {
    /// Watch the sentinel at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Sentinel path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a renewal has been requested.
    pub fn is_requested(&self) -> bool {
        self.path.exists()
    }

    /// Clear the request. A missing sentinel is not an error.
    pub fn consume(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Force-renewal trigger consumed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AgentError::publish(format!(
                "Cannot remove trigger {}: {e}",
                self.path.display()
            ))),
        }
    }
}
